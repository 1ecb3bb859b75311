//! Processing modes: typed configuration, directory loading, the snapshot store
//! read by every agent, matching of receiving PModes and validation.

pub mod resolver;
pub mod store;
pub mod types;
pub mod validation;
pub mod watcher;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use resolver::{resolve_receiving_pmode, PModeResolutionError};
pub use store::{PModeSnapshot, PModeStore};
pub use types::{
    DecryptionSettings, DeliverSettings, EncryptionSettings, MessageHandling, MessagePackaging,
    Method, NotifyHandling, PModeCollaboration, PartyInfo, PullConfiguration, PushConfiguration,
    ReceiptHandling, ReceivePackaging, ReceiveSecurity, ReceivingPMode, ReplyHandling,
    ReplyPattern, RetryReliability, SecurityRequirement, SendReliability, SendSecurity,
    SendingPMode, SigningSettings, DEFAULT_BACKOFF_FACTOR,
};
pub use validation::{validate_receiving_pmode, validate_sending_pmode, PModeValidationError};
pub use watcher::PModeWatcher;

pub const SENDING_DIR: &str = "send";
pub const RECEIVING_DIR: &str = "receive";

#[derive(Debug, Error)]
pub enum PModeLoadError {
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("`{path}`: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: PModeValidationError,
    },
    #[error("`{path}` redeclares pmode id `{id}`")]
    Duplicate { path: PathBuf, id: String },
}

/// Outcome of loading a PMode directory: what made it in, what was rejected.
#[derive(Debug, Default)]
pub struct PModeLoadReport {
    pub snapshot: PModeSnapshot,
    pub rejected: Vec<PModeLoadError>,
    pub warnings: Vec<String>,
}

impl PModeLoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.warnings.is_empty()
    }
}

pub fn parse_sending_pmode(contents: &str) -> Result<SendingPMode, serde_yaml::Error> {
    serde_yaml::from_str(contents)
}

pub fn parse_receiving_pmode(contents: &str) -> Result<ReceivingPMode, serde_yaml::Error> {
    serde_yaml::from_str(contents)
}

/// Loads `<root>/send/*.yaml` and `<root>/receive/*.yaml`. Invalid files are
/// reported and left out; only an unreadable root is an error.
pub fn load_directory(root: &Path) -> Result<PModeLoadReport, PModeLoadError> {
    fs::metadata(root).map_err(|source| PModeLoadError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut rejected = Vec::new();
    let mut sending = Vec::new();
    let mut seen = HashSet::new();
    for path in yaml_files(&root.join(SENDING_DIR), &mut rejected) {
        let Some(pmode) = read_and_parse(&path, parse_sending_pmode, &mut rejected) else {
            continue;
        };
        if let Err(source) = validate_sending_pmode(&pmode) {
            rejected.push(PModeLoadError::Invalid { path, source });
        } else if !seen.insert(pmode.id.clone()) {
            rejected.push(PModeLoadError::Duplicate { path, id: pmode.id });
        } else {
            sending.push(pmode);
        }
    }

    let mut receiving = Vec::new();
    let mut seen = HashSet::new();
    for path in yaml_files(&root.join(RECEIVING_DIR), &mut rejected) {
        let Some(pmode) = read_and_parse(&path, parse_receiving_pmode, &mut rejected) else {
            continue;
        };
        if let Err(source) = validate_receiving_pmode(&pmode) {
            rejected.push(PModeLoadError::Invalid { path, source });
        } else if !seen.insert(pmode.id.clone()) {
            rejected.push(PModeLoadError::Duplicate { path, id: pmode.id });
        } else {
            receiving.push(pmode);
        }
    }

    let mut warnings = Vec::new();
    let refs: Vec<&ReceivingPMode> = receiving.iter().collect();
    validation::collect_ambiguous_receiving_pmodes(&refs, &mut warnings);

    Ok(PModeLoadReport {
        snapshot: PModeSnapshot::new(sending, receiving),
        rejected,
        warnings,
    })
}

fn yaml_files(dir: &Path, rejected: &mut Vec<PModeLoadError>) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(source) => {
            rejected.push(PModeLoadError::Io {
                path: dir.to_path_buf(),
                source,
            });
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    files.sort();
    files
}

fn read_and_parse<T>(
    path: &Path,
    parse: fn(&str) -> Result<T, serde_yaml::Error>,
    rejected: &mut Vec<PModeLoadError>,
) -> Option<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(source) => {
            rejected.push(PModeLoadError::Io {
                path: path.to_path_buf(),
                source,
            });
            return None;
        }
    };
    match parse(&contents) {
        Ok(pmode) => Some(pmode),
        Err(source) => {
            rejected.push(PModeLoadError::Parse {
                path: path.to_path_buf(),
                source,
            });
            None
        }
    }
}
