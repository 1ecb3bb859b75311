//! In-memory AS4 model: wire message units, business-facing submit/deliver/notify
//! messages, and the persisted In/Out records with their status lifecycles.

pub mod entities;
pub mod envelope;
pub mod error_code;
pub mod message;
pub mod status;
pub mod submit;

pub use entities::{Direction, ExceptionRecord, InMessage, MessageType, OutMessage};
pub use envelope::{
    DeliverMessage, DeliverMessageEnvelope, DeliverPayload, EntityType, NotifyMessage, NotifyMessageEnvelope,
    NotifyStatus,
};
pub use error_code::{ErrorCode, Severity};
pub use message::{
    AgreementReference, As4Message, Attachment, BundleError, CollaborationInfo, EncryptionInfo,
    ErrorDetail, ErrorSignal, MessageInfo, MessageUnit, PartInfo, Party, PartyId, PullRequest,
    Receipt, Reference, SecurityHeader, Service, SignatureInfo, UserMessage,
    COMPRESSION_TYPE_PROPERTY, DEFAULT_MPC, MIME_TYPE_PROPERTY,
};
pub use status::{InStatus, Mep, Operation, OutStatus, StatusTransitionError};
pub use submit::{SubmitCollaboration, SubmitMessage, SubmitMessageInfo, SubmitParties, SubmitPayload};

/// Generates an ebMS message id in `<uuid>@<host>` form.
pub fn new_message_id() -> String {
    format!("{}@as4.engine", uuid::Uuid::new_v4())
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
