//! Directory polling receiver. A matching file is claimed by renaming it,
//! handed to the agent, and finally renamed to `<name>.accepted` or
//! `<name>.exception` (with the failure written to `<name>.exception.details`).

use crate::domain::{MessageOrigin, ReceivedMessage, FILE_NAME_KEY};
use crate::transport::runtime::{sleep_with_shutdown, ReceiverControl};
use crate::transport::{MessageHandler, ProcessingReply, Receiver, ReceiverKind, TransportError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PROCESSING_SUFFIX: &str = ".processing";
pub const ACCEPTED_SUFFIX: &str = ".accepted";
pub const EXCEPTION_SUFFIX: &str = ".exception";
pub const DETAILS_SUFFIX: &str = ".exception.details";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_BATCH_SIZE: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSystemOptions {
    pub directory: PathBuf,
    pub pattern: String,
    pub poll_interval: Duration,
    pub content_type: String,
    pub batch_size: usize,
}

impl FileSystemOptions {
    pub fn new(directory: impl Into<PathBuf>, content_type: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            pattern: "*".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            content_type: content_type.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

pub struct FileSystemReceiver {
    options: FileSystemOptions,
    control: ReceiverControl,
}

impl FileSystemReceiver {
    pub fn new(options: FileSystemOptions) -> Self {
        Self {
            options,
            control: ReceiverControl::new(),
        }
    }

    pub fn options(&self) -> &FileSystemOptions {
        &self.options
    }

    /// Candidate files, oldest name first. Files carrying one of our own
    /// suffixes are never picked up again.
    async fn pending_files(&self) -> Result<Vec<PathBuf>, TransportError> {
        let mut entries = tokio::fs::read_dir(&self.options.directory).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if is_own_artifact(name) || !glob_match(&self.options.pattern, name) {
                continue;
            }
            if entry.file_type().await.map(|ty| ty.is_file()).unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        files.truncate(self.options.batch_size.max(1));
        Ok(files)
    }

    async fn process_file(&self, handler: &dyn MessageHandler, path: PathBuf) {
        let claimed = with_suffix(&path, PROCESSING_SUFFIX);
        // Another poller may have won the rename.
        if tokio::fs::rename(&path, &claimed).await.is_err() {
            return;
        }

        let content = match tokio::fs::read(&claimed).await {
            Ok(content) => content,
            Err(err) => {
                crate::as4_event!(
                    warn,
                    "file_read_failed",
                    agent = handler.name(),
                    path = path.display(),
                    error = err
                );
                finish(&claimed, &path, Err(format!("failed to read file: {err}"))).await;
                return;
            }
        };

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let message = ReceivedMessage::new(content, self.options.content_type.clone())
            .with_origin(MessageOrigin::File { path: path.clone() })
            .with_property(FILE_NAME_KEY, file_name);

        let reply = handler.handle(message).await;
        finish(&claimed, &path, outcome_of(&reply)).await;
    }
}

fn outcome_of(reply: &ProcessingReply) -> Result<(), String> {
    match reply.error() {
        None => Ok(()),
        Some(error) => Err(format!(
            "{} ({}, {}): {}",
            reply.outcome,
            error.category,
            error.error_code(),
            error.description
        )),
    }
}

async fn finish(claimed: &Path, original: &Path, outcome: Result<(), String>) {
    let result = match &outcome {
        Ok(()) => tokio::fs::rename(claimed, with_suffix(original, ACCEPTED_SUFFIX)).await,
        Err(details) => {
            let renamed = tokio::fs::rename(claimed, with_suffix(original, EXCEPTION_SUFFIX)).await;
            match renamed {
                Ok(()) => {
                    tokio::fs::write(with_suffix(original, DETAILS_SUFFIX), details.as_bytes())
                        .await
                }
                Err(err) => Err(err),
            }
        }
    };
    if let Err(err) = result {
        tracing::error!(
            path = %original.display(),
            error = %err,
            "failed to record file outcome"
        );
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn is_own_artifact(name: &str) -> bool {
    [PROCESSING_SUFFIX, ACCEPTED_SUFFIX, EXCEPTION_SUFFIX, DETAILS_SUFFIX]
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// `*` matches any run of characters, `?` a single one.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            n = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|ch| *ch == '*')
}

#[async_trait]
impl Receiver for FileSystemReceiver {
    fn kind(&self) -> ReceiverKind {
        ReceiverKind::FileSystem
    }

    async fn start_receiving(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let token = self.control.begin(&shutdown);
        tokio::fs::create_dir_all(&self.options.directory).await?;
        crate::as4_event!(
            info,
            "receiver_started",
            agent = handler.name(),
            directory = self.options.directory.display(),
            pattern = self.options.pattern
        );

        while !token.is_cancelled() {
            match self.pending_files().await {
                Ok(files) => {
                    for path in files {
                        if token.is_cancelled() {
                            break;
                        }
                        self.process_file(handler.as_ref(), path).await;
                    }
                }
                Err(err) => {
                    crate::as4_event!(
                        warn,
                        "directory_scan_failed",
                        agent = handler.name(),
                        directory = self.options.directory.display(),
                        error = err
                    );
                }
            }
            if sleep_with_shutdown(self.options.poll_interval, &token).await {
                break;
            }
        }
        Ok(())
    }

    fn stop_receiving(&self) {
        self.control.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_supports_stars_and_single_characters() {
        assert!(glob_match("*.json", "submit-1.json"));
        assert!(!glob_match("*.json", "submit-1.xml"));
        assert!(glob_match("msg-??.xml", "msg-01.xml"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("a*b", "acbd"));
    }

    #[test]
    fn outcome_artifacts_are_never_rescanned() {
        assert!(is_own_artifact("order.json.accepted"));
        assert!(is_own_artifact("order.json.exception.details"));
        assert!(!is_own_artifact("order.json"));
    }
}
