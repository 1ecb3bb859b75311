use crate::domain::ReceivedMessage;
use crate::model::{
    As4Message, DeliverMessage, ExceptionRecord, InMessage, NotifyMessage, OutMessage,
    SubmitMessage,
};
use crate::pipeline::failure::ProcessingError;
use crate::pmode::{ReceivingPMode, SendingPMode};
use crate::reliability::RetryRecord;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("{kind} pmode already resolved as `{current}`, refusing `{requested}`")]
    PModeAlreadyResolved {
        kind: &'static str,
        current: String,
        requested: String,
    },
    #[error("context holds no {0}")]
    Missing(&'static str),
}

/// Business-facing message carried by a run. Only one can be present.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum BusinessPayload {
    #[default]
    None,
    Submit(SubmitMessage),
    Deliver(DeliverMessage),
    Notify(NotifyMessage),
}

/// Persisted record a datastore-driven run was started for.
#[derive(Clone, Debug, PartialEq)]
pub enum ContextEntity {
    In(InMessage),
    Out(OutMessage),
    Exception(ExceptionRecord),
    Retry(RetryRecord),
}

/// Encoded synchronous reply handed back to the receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyContent {
    pub content: Vec<u8>,
    pub content_type: String,
}

/// Unit of work threaded through a pipeline run.
#[derive(Clone, Debug, Default)]
pub struct MessagingContext {
    received: Option<ReceivedMessage>,
    payload: BusinessPayload,
    sending_pmode: Option<Arc<SendingPMode>>,
    receiving_pmode: Option<Arc<ReceivingPMode>>,
    error: Option<ProcessingError>,
    /// Message being processed: the received bundle or the one about to be sent.
    pub as4_message: Option<As4Message>,
    /// Reply composed for `as4_message`: a receipt, an error or a pulled
    /// user message.
    pub response: Option<As4Message>,
    /// Message we sent, kept once the partner's answer replaced it as
    /// `as4_message`.
    pub outbound: Option<As4Message>,
    pub reply: Option<ReplyContent>,
    pub entity: Option<ContextEntity>,
    /// User message ids that were already stored before this run.
    pub duplicates: BTreeSet<String>,
    /// Set when the message arrived through a pull exchange, which has no
    /// synchronous back channel.
    pub pulled: bool,
    pub metadata: BTreeMap<String, String>,
}

impl MessagingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_received(received: ReceivedMessage) -> Self {
        Self {
            received: Some(received),
            ..Self::default()
        }
    }

    pub fn from_message(message: As4Message) -> Self {
        Self {
            as4_message: Some(message),
            ..Self::default()
        }
    }

    pub fn from_submit(received: ReceivedMessage, submit: SubmitMessage) -> Self {
        Self {
            received: Some(received),
            payload: BusinessPayload::Submit(submit),
            ..Self::default()
        }
    }

    pub fn with_entity(mut self, entity: ContextEntity) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn received(&self) -> Option<&ReceivedMessage> {
        self.received.as_ref()
    }

    pub fn set_received(&mut self, received: ReceivedMessage) {
        self.received = Some(received);
    }

    pub fn payload(&self) -> &BusinessPayload {
        &self.payload
    }

    /// Replaces the business payload; the previous one is dropped.
    pub fn set_payload(&mut self, payload: BusinessPayload) {
        self.payload = payload;
    }

    pub fn submit_message(&self) -> Option<&SubmitMessage> {
        match &self.payload {
            BusinessPayload::Submit(submit) => Some(submit),
            _ => None,
        }
    }

    pub fn deliver_message(&self) -> Option<&DeliverMessage> {
        match &self.payload {
            BusinessPayload::Deliver(deliver) => Some(deliver),
            _ => None,
        }
    }

    pub fn notify_message(&self) -> Option<&NotifyMessage> {
        match &self.payload {
            BusinessPayload::Notify(notify) => Some(notify),
            _ => None,
        }
    }

    pub fn sending_pmode(&self) -> Option<&Arc<SendingPMode>> {
        self.sending_pmode.as_ref()
    }

    pub fn receiving_pmode(&self) -> Option<&Arc<ReceivingPMode>> {
        self.receiving_pmode.as_ref()
    }

    /// PModes are fixed for the rest of a run once resolved; re-setting the
    /// same id is a no-op.
    pub fn set_sending_pmode(&mut self, pmode: Arc<SendingPMode>) -> Result<(), ContextError> {
        if let Some(current) = &self.sending_pmode {
            if current.id != pmode.id {
                return Err(ContextError::PModeAlreadyResolved {
                    kind: "sending",
                    current: current.id.clone(),
                    requested: pmode.id.clone(),
                });
            }
            return Ok(());
        }
        self.sending_pmode = Some(pmode);
        Ok(())
    }

    pub fn set_receiving_pmode(&mut self, pmode: Arc<ReceivingPMode>) -> Result<(), ContextError> {
        if let Some(current) = &self.receiving_pmode {
            if current.id != pmode.id {
                return Err(ContextError::PModeAlreadyResolved {
                    kind: "receiving",
                    current: current.id.clone(),
                    requested: pmode.id.clone(),
                });
            }
            return Ok(());
        }
        self.receiving_pmode = Some(pmode);
        Ok(())
    }

    pub fn error(&self) -> Option<&ProcessingError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Keeps the first error; later failures during error handling do not
    /// overwrite what originally went wrong.
    pub fn set_error(&mut self, error: ProcessingError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Message the next sign/encrypt/compress step applies to.
    pub fn outgoing(&self) -> Option<&As4Message> {
        self.response.as_ref().or(self.as4_message.as_ref())
    }

    pub fn outgoing_mut(&mut self) -> Option<&mut As4Message> {
        match self.response {
            Some(ref mut response) => Some(response),
            None => self.as4_message.as_mut(),
        }
    }

    pub fn require_message(&self) -> Result<&As4Message, ContextError> {
        self.as4_message.as_ref().ok_or(ContextError::Missing("AS4 message"))
    }

    pub fn require_sending_pmode(&self) -> Result<&Arc<SendingPMode>, ContextError> {
        self.sending_pmode
            .as_ref()
            .ok_or(ContextError::Missing("sending pmode"))
    }

    pub fn require_receiving_pmode(&self) -> Result<&Arc<ReceivingPMode>, ContextError> {
        self.receiving_pmode
            .as_ref()
            .ok_or(ContextError::Missing("receiving pmode"))
    }

    /// Id used to correlate logs and exception records for this run.
    pub fn message_id(&self) -> Option<&str> {
        if let Some(id) = self.as4_message.as_ref().and_then(As4Message::primary_message_id) {
            return Some(id);
        }
        if let Some(submit) = self.submit_message() {
            if let Some(id) = submit.message_info.message_id.as_deref() {
                return Some(id);
            }
        }
        match &self.entity {
            Some(ContextEntity::In(row)) => Some(&row.ebms_message_id),
            Some(ContextEntity::Out(row)) => Some(&row.ebms_message_id),
            Some(ContextEntity::Exception(row)) => row.ebms_ref_to_message_id.as_deref(),
            Some(ContextEntity::Retry(row)) => Some(&row.subject),
            None => None,
        }
    }

    /// PMode id from whichever side has been resolved.
    pub fn pmode_id(&self) -> Option<&str> {
        self.receiving_pmode
            .as_ref()
            .map(|pmode| pmode.id.as_str())
            .or_else(|| self.sending_pmode.as_ref().map(|pmode| pmode.id.as_str()))
    }

    pub fn is_duplicate(&self, message_id: &str) -> bool {
        self.duplicates.contains(message_id)
    }
}
