use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("status of `{message_id}` cannot move from {from} to {to}")]
pub struct StatusTransitionError {
    pub message_id: String,
    pub from: String,
    pub to: String,
}

/// Lifecycle of a received message. Only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InStatus {
    Received,
    Delivered,
    Notified,
    Exception,
}

impl InStatus {
    pub fn can_transition_to(self, next: InStatus) -> bool {
        use InStatus::*;
        self == next
            || matches!(
                (self, next),
                (Received, Delivered) | (Received, Notified) | (Received, Exception)
            )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, InStatus::Received)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InStatus::Received => "received",
            InStatus::Delivered => "delivered",
            InStatus::Notified => "notified",
            InStatus::Exception => "exception",
        }
    }
}

/// Lifecycle of an outbound message. Only moves forward; `Sent -> Sent` covers resends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutStatus {
    Submitted,
    Sent,
    Ack,
    Nack,
    Exception,
}

impl OutStatus {
    pub fn can_transition_to(self, next: OutStatus) -> bool {
        use OutStatus::*;
        self == next
            || matches!(
                (self, next),
                (Submitted, Sent)
                    | (Submitted, Exception)
                    | (Sent, Ack)
                    | (Sent, Nack)
                    | (Sent, Exception)
            )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutStatus::Ack | OutStatus::Nack | OutStatus::Exception)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutStatus::Submitted => "submitted",
            OutStatus::Sent => "sent",
            OutStatus::Ack => "ack",
            OutStatus::Nack => "nack",
            OutStatus::Exception => "exception",
        }
    }
}

/// What a datastore-driven agent is expected to do next with a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    NotApplicable,
    ToBeProcessed,
    ToBeSent,
    Sending,
    ToBeDelivered,
    Delivering,
    Delivered,
    ToBeNotified,
    Notifying,
    Notified,
    ToBeRetried,
    DeadLettered,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::NotApplicable => "not_applicable",
            Operation::ToBeProcessed => "to_be_processed",
            Operation::ToBeSent => "to_be_sent",
            Operation::Sending => "sending",
            Operation::ToBeDelivered => "to_be_delivered",
            Operation::Delivering => "delivering",
            Operation::Delivered => "delivered",
            Operation::ToBeNotified => "to_be_notified",
            Operation::Notifying => "notifying",
            Operation::Notified => "notified",
            Operation::ToBeRetried => "to_be_retried",
            Operation::DeadLettered => "dead_lettered",
        }
    }
}

/// Message exchange pattern binding of an outbound message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mep {
    #[default]
    Push,
    Pull,
}

impl Mep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mep::Push => "push",
            Mep::Pull => "pull",
        }
    }
}

macro_rules! impl_text_enum {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|candidate: &$ty| candidate.as_str() == value)
                    .ok_or_else(|| format!("unknown {} `{value}`", stringify!($ty)))
            }
        }
    };
}

impl_text_enum!(
    InStatus,
    [
        InStatus::Received,
        InStatus::Delivered,
        InStatus::Notified,
        InStatus::Exception,
    ]
);
impl_text_enum!(
    OutStatus,
    [
        OutStatus::Submitted,
        OutStatus::Sent,
        OutStatus::Ack,
        OutStatus::Nack,
        OutStatus::Exception,
    ]
);
impl_text_enum!(
    Operation,
    [
        Operation::NotApplicable,
        Operation::ToBeProcessed,
        Operation::ToBeSent,
        Operation::Sending,
        Operation::ToBeDelivered,
        Operation::Delivering,
        Operation::Delivered,
        Operation::ToBeNotified,
        Operation::Notifying,
        Operation::Notified,
        Operation::ToBeRetried,
        Operation::DeadLettered,
    ]
);
impl_text_enum!(Mep, [Mep::Push, Mep::Pull]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_status_never_moves_backwards() {
        assert!(InStatus::Received.can_transition_to(InStatus::Delivered));
        assert!(!InStatus::Delivered.can_transition_to(InStatus::Received));
        assert!(!InStatus::Delivered.can_transition_to(InStatus::Exception));
        assert!(InStatus::Delivered.can_transition_to(InStatus::Delivered));
    }

    #[test]
    fn out_status_requires_a_send_before_acknowledgement() {
        assert!(!OutStatus::Submitted.can_transition_to(OutStatus::Ack));
        assert!(OutStatus::Sent.can_transition_to(OutStatus::Ack));
        assert!(OutStatus::Sent.can_transition_to(OutStatus::Sent));
        assert!(!OutStatus::Exception.can_transition_to(OutStatus::Ack));
    }

    #[test]
    fn text_round_trips_through_from_str() {
        assert_eq!(
            "to_be_delivered".parse::<Operation>(),
            Ok(Operation::ToBeDelivered)
        );
        assert!("bogus".parse::<OutStatus>().is_err());
    }
}
