use crate::model::error_code::ErrorCode;
use crate::model::status::{InStatus, Mep, Operation, OutStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Direction::In => "in",
            Direction::Out => "out",
        })
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(format!("unknown direction `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserMessage,
    Receipt,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UserMessage => "user_message",
            MessageType::Receipt => "receipt",
            MessageType::Error => "error",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user_message" => Ok(MessageType::UserMessage),
            "receipt" => Ok(MessageType::Receipt),
            "error" => Ok(MessageType::Error),
            other => Err(format!("unknown message type `{other}`")),
        }
    }
}

/// One row per received ebMS message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InMessage {
    pub ebms_message_id: String,
    pub ref_to_message_id: Option<String>,
    pub message_type: MessageType,
    pub pmode_id: Option<String>,
    pub mpc: Option<String>,
    pub status: InStatus,
    pub operation: Operation,
    pub content_type: String,
    pub body: Vec<u8>,
    pub insertion_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

/// One row per sent ebMS message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutMessage {
    pub ebms_message_id: String,
    pub ref_to_message_id: Option<String>,
    pub message_type: MessageType,
    pub pmode_id: Option<String>,
    pub mep: Mep,
    pub mpc: Option<String>,
    pub status: OutStatus,
    pub operation: Operation,
    pub content_type: String,
    pub body: Vec<u8>,
    pub insertion_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

/// Persisted trace of a failed run, kept for notification and audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: String,
    pub direction: Direction,
    pub ebms_ref_to_message_id: Option<String>,
    pub pmode_id: Option<String>,
    pub code: Option<ErrorCode>,
    pub exception: String,
    pub message_body: Option<Vec<u8>>,
    pub operation: Operation,
    pub insertion_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

impl InMessage {
    pub fn new(
        ebms_message_id: impl Into<String>,
        message_type: MessageType,
        content_type: impl Into<String>,
        body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ebms_message_id: ebms_message_id.into(),
            ref_to_message_id: None,
            message_type,
            pmode_id: None,
            mpc: None,
            status: InStatus::Received,
            operation: Operation::ToBeProcessed,
            content_type: content_type.into(),
            body,
            insertion_time: now,
            modification_time: now,
        }
    }
}

impl OutMessage {
    pub fn new(
        ebms_message_id: impl Into<String>,
        message_type: MessageType,
        content_type: impl Into<String>,
        body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ebms_message_id: ebms_message_id.into(),
            ref_to_message_id: None,
            message_type,
            pmode_id: None,
            mep: Mep::Push,
            mpc: None,
            status: OutStatus::Submitted,
            operation: Operation::ToBeSent,
            content_type: content_type.into(),
            body,
            insertion_time: now,
            modification_time: now,
        }
    }
}

impl ExceptionRecord {
    pub fn new(direction: Direction, exception: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            ebms_ref_to_message_id: None,
            pmode_id: None,
            code: None,
            exception: exception.into(),
            message_body: None,
            operation: Operation::NotApplicable,
            insertion_time: now,
            modification_time: now,
        }
    }
}
