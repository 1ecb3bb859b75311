#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Canonical property keys set by receivers and read by transformers.
pub const REMOTE_ADDR_KEY: &str = "remote_addr";
pub const FILE_NAME_KEY: &str = "file_name";
pub const CLAIM_TOKEN_KEY: &str = "claim_token";

/// Raw input handed from a receiver to a transformer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub content: Vec<u8>,
    pub content_type: String,
    pub origin: MessageOrigin,
    pub properties: BTreeMap<String, String>,
}

/// Where a received message came from. Datastore-backed origins carry the key
/// of the record the transformer has to load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOrigin {
    Transport,
    File { path: PathBuf },
    OutMessage { ebms_message_id: String },
    InMessage { ebms_message_id: String },
    Exception { id: String },
    RetryRecord { key: String },
    PullSchedule { pmode_id: String },
}

impl Display for MessageOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageOrigin::Transport => f.write_str("transport"),
            MessageOrigin::File { path } => write!(f, "file:{}", path.display()),
            MessageOrigin::OutMessage { ebms_message_id } => write!(f, "out:{ebms_message_id}"),
            MessageOrigin::InMessage { ebms_message_id } => write!(f, "in:{ebms_message_id}"),
            MessageOrigin::Exception { id } => write!(f, "exception:{id}"),
            MessageOrigin::RetryRecord { key } => write!(f, "retry:{key}"),
            MessageOrigin::PullSchedule { pmode_id } => write!(f, "pull:{pmode_id}"),
        }
    }
}

impl ReceivedMessage {
    pub fn new(content: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: content_type.into(),
            origin: MessageOrigin::Transport,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_origin(mut self, origin: MessageOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|value| value.as_str())
    }
}
