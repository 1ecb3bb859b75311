use crate::model::message::{Attachment, CollaborationInfo, MessageInfo, Party};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Business-facing view of a received user message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverMessage {
    pub message_info: MessageInfo,
    pub pmode_id: Option<String>,
    pub from: Party,
    pub to: Party,
    pub collaboration: CollaborationInfo,
    pub message_properties: BTreeMap<String, String>,
    pub payloads: Vec<DeliverPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverPayload {
    pub id: String,
    pub mime_type: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyStatus {
    Delivered,
    Error,
    Exception,
}

impl Display for NotifyStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NotifyStatus::Delivered => "delivered",
            NotifyStatus::Error => "error",
            NotifyStatus::Exception => "exception",
        })
    }
}

/// Which persisted entity a notification was raised for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    InMessage,
    OutMessage,
    InException,
    OutException,
}

/// Business-facing signal/exception notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyMessage {
    pub message_info: MessageInfo,
    pub status: NotifyStatus,
    pub pmode_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliverMessageEnvelope {
    pub message_info: MessageInfo,
    pub content: Vec<u8>,
    pub content_type: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyMessageEnvelope {
    pub message_info: MessageInfo,
    pub status: NotifyStatus,
    pub content: Vec<u8>,
    pub content_type: String,
    pub entity_type: EntityType,
}
