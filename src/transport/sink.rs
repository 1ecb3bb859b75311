//! Business-side outputs. Deliver and notify envelopes go to a sink picked by
//! the PMode method's `type`; the method's parameters configure it.

use crate::model::{Attachment, DeliverMessageEnvelope, NotifyMessageEnvelope};
use crate::pmode::Method;
use crate::transport::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(feature = "http-out")]
use std::time::Duration;
use thiserror::Error;

pub const FILE_METHOD: &str = "FILE";
pub const HTTP_METHOD: &str = "HTTP";
pub const LOCATION_PARAMETER: &str = "location";
pub const TIMEOUT_PARAMETER: &str = "timeout";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no {kind} sink registered for method `{method}`")]
    UnknownMethod { kind: &'static str, method: String },
    #[error("method `{method}` requires parameter `{parameter}`")]
    MissingParameter {
        method: String,
        parameter: &'static str,
    },
    #[error("invalid parameter `{parameter}` for method `{method}`: {reason}")]
    InvalidParameter {
        method: String,
        parameter: &'static str,
        reason: String,
    },
    #[error("failed to write `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait DeliverSender: Send + Sync {
    async fn deliver(
        &self,
        envelope: &DeliverMessageEnvelope,
        method: &Method,
    ) -> Result<(), SinkError>;
}

#[async_trait]
pub trait NotifySender: Send + Sync {
    async fn notify(
        &self,
        envelope: &NotifyMessageEnvelope,
        method: &Method,
    ) -> Result<(), SinkError>;
}

/// Sinks keyed by upper-cased method type.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    deliver: HashMap<String, Arc<dyn DeliverSender>>,
    notify: HashMap<String, Arc<dyn NotifySender>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `FILE`, plus `HTTP` when an outbound transport is compiled in.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let file = Arc::new(FileSink);
        registry.register_deliver(FILE_METHOD, file.clone());
        registry.register_notify(FILE_METHOD, file);
        #[cfg(feature = "http-out")]
        {
            let http = Arc::new(HttpSink::new());
            registry.register_deliver(HTTP_METHOD, http.clone());
            registry.register_notify(HTTP_METHOD, http);
        }
        registry
    }

    pub fn register_deliver(&mut self, method_type: &str, sender: Arc<dyn DeliverSender>) {
        self.deliver.insert(method_type.to_ascii_uppercase(), sender);
    }

    pub fn register_notify(&mut self, method_type: &str, sender: Arc<dyn NotifySender>) {
        self.notify.insert(method_type.to_ascii_uppercase(), sender);
    }

    pub fn deliver_sender(&self, method: &Method) -> Result<Arc<dyn DeliverSender>, SinkError> {
        self.deliver
            .get(&method.method_type.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| SinkError::UnknownMethod {
                kind: "deliver",
                method: method.method_type.clone(),
            })
    }

    pub fn notify_sender(&self, method: &Method) -> Result<Arc<dyn NotifySender>, SinkError> {
        self.notify
            .get(&method.method_type.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| SinkError::UnknownMethod {
                kind: "notify",
                method: method.method_type.clone(),
            })
    }

    pub fn deliver_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.deliver.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn notify_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.notify.keys().cloned().collect();
        methods.sort();
        methods
    }
}

fn required_parameter<'a>(method: &'a Method, parameter: &'static str) -> Result<&'a str, SinkError> {
    method
        .parameter(parameter)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| SinkError::MissingParameter {
            method: method.method_type.clone(),
            parameter,
        })
}

/// Keeps ids usable as file names on every platform.
pub fn file_safe(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '@') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type.split(';').next().unwrap_or_default().trim() {
        "application/xml" | "text/xml" => "xml",
        "application/json" => "json",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
}

/// Writes to a temporary sibling first so readers never see a partial file.
async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), SinkError> {
    let mut temporary = path.as_os_str().to_owned();
    temporary.push(".partial");
    let temporary = PathBuf::from(temporary);
    tokio::fs::write(&temporary, contents)
        .await
        .map_err(|source| SinkError::Io {
            path: temporary.clone(),
            source,
        })?;
    tokio::fs::rename(&temporary, path)
        .await
        .map_err(|source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn ensure_directory(directory: &Path) -> Result<(), SinkError> {
    tokio::fs::create_dir_all(directory)
        .await
        .map_err(|source| SinkError::Io {
            path: directory.to_path_buf(),
            source,
        })
}

/// Drops envelopes into the directory named by the `location` parameter.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSink;

impl FileSink {
    fn attachment_path(directory: &Path, message_id: &str, attachment: &Attachment) -> PathBuf {
        directory.join(format!(
            "{}_{}.{}",
            file_safe(message_id),
            file_safe(&attachment.content_id),
            extension_for(&attachment.content_type)
        ))
    }
}

#[async_trait]
impl DeliverSender for FileSink {
    async fn deliver(
        &self,
        envelope: &DeliverMessageEnvelope,
        method: &Method,
    ) -> Result<(), SinkError> {
        let directory = PathBuf::from(required_parameter(method, LOCATION_PARAMETER)?);
        ensure_directory(&directory).await?;
        let message_id = &envelope.message_info.message_id;

        for attachment in &envelope.attachments {
            let path = Self::attachment_path(&directory, message_id, attachment);
            write_atomically(&path, &attachment.content).await?;
        }
        // The envelope goes last: its presence means the attachments are complete.
        let path = directory.join(format!("{}.json", file_safe(message_id)));
        write_atomically(&path, &envelope.content).await?;
        tracing::debug!(path = %path.display(), "deliver envelope written");
        Ok(())
    }
}

#[async_trait]
impl NotifySender for FileSink {
    async fn notify(
        &self,
        envelope: &NotifyMessageEnvelope,
        method: &Method,
    ) -> Result<(), SinkError> {
        let directory = PathBuf::from(required_parameter(method, LOCATION_PARAMETER)?);
        ensure_directory(&directory).await?;
        let path = directory.join(format!(
            "{}.{}.json",
            file_safe(&envelope.message_info.message_id),
            envelope.status
        ));
        write_atomically(&path, &envelope.content).await?;
        tracing::debug!(path = %path.display(), "notify envelope written");
        Ok(())
    }
}

/// POSTs envelopes to the URL in the `location` parameter.
#[cfg(feature = "http-out")]
#[derive(Clone, Debug, Default)]
pub struct HttpSink {
    client: reqwest::Client,
}

#[cfg(feature = "http-out")]
impl HttpSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn timeout(method: &Method) -> Result<Duration, SinkError> {
        match method.parameter(TIMEOUT_PARAMETER) {
            None => Ok(crate::transport::sender::DEFAULT_SEND_TIMEOUT),
            Some(raw) => humantime::parse_duration(raw.trim()).map_err(|err| {
                SinkError::InvalidParameter {
                    method: method.method_type.clone(),
                    parameter: TIMEOUT_PARAMETER,
                    reason: err.to_string(),
                }
            }),
        }
    }
}

#[cfg(feature = "http-out")]
#[derive(serde::Serialize)]
struct HttpAttachment<'a> {
    content_id: &'a str,
    content_type: &'a str,
    content: String,
}

#[cfg(feature = "http-out")]
#[async_trait]
impl DeliverSender for HttpSink {
    async fn deliver(
        &self,
        envelope: &DeliverMessageEnvelope,
        method: &Method,
    ) -> Result<(), SinkError> {
        use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
        use base64::Engine as _;

        let url = required_parameter(method, LOCATION_PARAMETER)?;
        let message: serde_json::Value = serde_json::from_slice(&envelope.content)?;
        let attachments: Vec<HttpAttachment<'_>> = envelope
            .attachments
            .iter()
            .map(|attachment| HttpAttachment {
                content_id: &attachment.content_id,
                content_type: &attachment.content_type,
                content: BASE64_STANDARD.encode(&attachment.content),
            })
            .collect();
        let body = serde_json::to_vec(&serde_json::json!({
            "message": message,
            "attachments": attachments,
        }))?;
        crate::transport::http_client::post(
            &self.client,
            url,
            body,
            "application/json",
            Self::timeout(method)?,
        )
        .await?;
        Ok(())
    }
}

#[cfg(feature = "http-out")]
#[async_trait]
impl NotifySender for HttpSink {
    async fn notify(
        &self,
        envelope: &NotifyMessageEnvelope,
        method: &Method,
    ) -> Result<(), SinkError> {
        let url = required_parameter(method, LOCATION_PARAMETER)?;
        crate::transport::http_client::post(
            &self.client,
            url,
            envelope.content.clone(),
            &envelope.content_type,
            Self::timeout(method)?,
        )
        .await?;
        Ok(())
    }
}
