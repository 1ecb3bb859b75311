use crate::model::base64_bytes;
use crate::model::error_code::{ErrorCode, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Ordered set of message units plus the attachments their payload infos reference.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct As4Message {
    pub units: Vec<MessageUnit>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub security: SecurityHeader,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageUnit {
    User(UserMessage),
    Receipt(Receipt),
    Error(ErrorSignal),
    PullRequest(PullRequest),
}

impl MessageUnit {
    pub fn info(&self) -> &MessageInfo {
        match self {
            MessageUnit::User(unit) => &unit.info,
            MessageUnit::Receipt(unit) => &unit.info,
            MessageUnit::Error(unit) => &unit.info,
            MessageUnit::PullRequest(unit) => &unit.info,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.info().message_id
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, MessageUnit::Receipt(_) | MessageUnit::Error(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_to_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MessageInfo {
    pub fn new(message_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            ref_to_message_id: None,
            timestamp,
        }
    }

    pub fn referencing(mut self, ref_to_message_id: impl Into<String>) -> Self {
        self.ref_to_message_id = Some(ref_to_message_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub info: MessageInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpc: Option<String>,
    pub from: Party,
    pub to: Party,
    pub collaboration: CollaborationInfo,
    #[serde(default)]
    pub message_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub payload_info: Vec<PartInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub party_ids: Vec<PartyId>,
}

impl Party {
    pub fn new(role: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            party_ids: vec![PartyId {
                id: id.into(),
                party_type: None,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_empty() && self.party_ids.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId {
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub party_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationInfo {
    #[serde(default)]
    pub agreement: AgreementReference,
    pub service: Service,
    pub action: String,
    #[serde(default)]
    pub conversation_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmode_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub value: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

impl Service {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            service_type: None,
        }
    }
}

/// Payload reference; `href` is `cid:<content-id>` for attachments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub href: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl PartInfo {
    pub fn content_id(&self) -> Option<&str> {
        self.href.strip_prefix("cid:")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub info: MessageInfo,
    /// Signature references of the acknowledged message (non-repudiation of receipt).
    #[serde(default)]
    pub non_repudiation: Vec<Reference>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignal {
    pub info: MessageInfo,
    pub errors: Vec<ErrorDetail>,
}

impl ErrorSignal {
    pub fn is_empty_channel_warning(&self) -> bool {
        !self.errors.is_empty()
            && self
                .errors
                .iter()
                .all(|detail| detail.code == ErrorCode::EmptyMessagePartitionChannel)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_to_message_id: Option<String>,
    pub short_description: String,
    #[serde(default)]
    pub detail: String,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            severity: code.severity(),
            ref_to_message_id: None,
            short_description: code.short_description().to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub info: MessageInfo,
    pub mpc: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_id: String,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub key_id: String,
    pub references: Vec<Reference>,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub uri: String,
    pub digest: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub key_id: String,
    /// Nonce per encrypted attachment, keyed by content id.
    pub parts: BTreeMap<String, String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BundleError {
    #[error("message contains no message units")]
    Empty,
    #[error("a PullRequest must be the only message unit in a message")]
    PullRequestNotAlone,
    #[error("message id `{0}` occurs more than once in the message")]
    DuplicateMessageId(String),
    #[error("user message `{message_id}` references missing attachment `{href}`")]
    MissingAttachment { message_id: String, href: String },
}

impl As4Message {
    pub fn new(units: Vec<MessageUnit>) -> Self {
        Self {
            units,
            attachments: Vec::new(),
            security: SecurityHeader::default(),
        }
    }

    pub fn single(unit: MessageUnit) -> Self {
        Self::new(vec![unit])
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &UserMessage> {
        self.units.iter().filter_map(|unit| match unit {
            MessageUnit::User(user) => Some(user),
            _ => None,
        })
    }

    pub fn receipts(&self) -> impl Iterator<Item = &Receipt> {
        self.units.iter().filter_map(|unit| match unit {
            MessageUnit::Receipt(receipt) => Some(receipt),
            _ => None,
        })
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorSignal> {
        self.units.iter().filter_map(|unit| match unit {
            MessageUnit::Error(error) => Some(error),
            _ => None,
        })
    }

    pub fn signals(&self) -> impl Iterator<Item = &MessageUnit> {
        self.units.iter().filter(|unit| unit.is_signal())
    }

    pub fn pull_request(&self) -> Option<&PullRequest> {
        self.units.iter().find_map(|unit| match unit {
            MessageUnit::PullRequest(pull) => Some(pull),
            _ => None,
        })
    }

    pub fn first_user_message(&self) -> Option<&UserMessage> {
        self.user_messages().next()
    }

    pub fn has_user_messages(&self) -> bool {
        self.first_user_message().is_some()
    }

    pub fn has_signals(&self) -> bool {
        self.signals().next().is_some()
    }

    pub fn is_pull_request(&self) -> bool {
        self.pull_request().is_some()
    }

    /// Id of the first unit; the key used when the whole bundle is logged or persisted.
    pub fn primary_message_id(&self) -> Option<&str> {
        self.units.first().map(MessageUnit::message_id)
    }

    pub fn is_signed(&self) -> bool {
        self.security.signature.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.security.encryption.is_some()
    }

    pub fn is_compressed(&self) -> bool {
        self.attachments
            .iter()
            .any(|attachment| attachment.properties.contains_key(COMPRESSION_TYPE_PROPERTY))
    }

    pub fn attachment(&self, content_id: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|attachment| attachment.content_id == content_id)
    }

    /// Attachments referenced by a single user message's payload infos.
    pub fn attachments_for(&self, user: &UserMessage) -> Vec<Attachment> {
        user.payload_info
            .iter()
            .filter_map(PartInfo::content_id)
            .filter_map(|cid| self.attachment(cid).cloned())
            .collect()
    }

    pub fn validate_bundle(&self) -> Result<(), BundleError> {
        if self.units.is_empty() {
            return Err(BundleError::Empty);
        }
        if self.is_pull_request() && self.units.len() > 1 {
            return Err(BundleError::PullRequestNotAlone);
        }

        let mut seen = HashSet::new();
        for unit in &self.units {
            if !seen.insert(unit.message_id()) {
                return Err(BundleError::DuplicateMessageId(unit.message_id().to_string()));
            }
        }

        for user in self.user_messages() {
            for part in &user.payload_info {
                if let Some(cid) = part.content_id() {
                    if self.attachment(cid).is_none() {
                        return Err(BundleError::MissingAttachment {
                            message_id: user.info.message_id.clone(),
                            href: part.href.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

pub const COMPRESSION_TYPE_PROPERTY: &str = "CompressionType";
pub const DEFAULT_MPC: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/defaultMPC";
pub const MIME_TYPE_PROPERTY: &str = "MimeType";
