//! Receivers that feed agents, the handler contract between them, and the
//! outbound collaborators (message sender, deliver/notify sinks).

use crate::domain::ReceivedMessage;
use crate::model::As4Message;
use crate::pipeline::context::ReplyContent;
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::runner::PipelineOutcome;
use crate::store::RepositoryError;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod datastore;
pub mod file_system;
#[cfg(feature = "http-out")]
pub mod http_client;
#[cfg(feature = "http-in")]
pub mod http_server;
pub mod interval_pull;
pub mod queue;
pub mod runtime;
pub mod sender;
pub mod sink;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request to `{url}` failed: {reason}")]
    Request { url: String, reason: String },
    #[error("`{url}` answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("request to `{url}` timed out")]
    Timeout { url: String },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("failed to bind `{address}`: {reason}")]
    Bind { address: String, reason: String },
    #[error("queue `{0}` is closed")]
    QueueClosed(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReceiverKind {
    Queue,
    FileSystem,
    Datastore,
    IntervalPull,
    Http,
}

impl Display for ReceiverKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverKind::Queue => f.write_str("queue"),
            ReceiverKind::FileSystem => f.write_str("file_system"),
            ReceiverKind::Datastore => f.write_str("datastore"),
            ReceiverKind::IntervalPull => f.write_str("interval_pull"),
            ReceiverKind::Http => f.write_str("http"),
        }
    }
}

/// Message-unit counts of what came back from (or arrived on) an exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeSummary {
    pub user_messages: usize,
    pub receipts: usize,
    pub errors: usize,
}

impl ExchangeSummary {
    pub fn of(message: &As4Message) -> Self {
        Self {
            user_messages: message.user_messages().count(),
            receipts: message.receipts().count(),
            errors: message.errors().count(),
        }
    }

    /// A user message or a receipt came back; an empty-channel warning does not count.
    pub fn is_exchange(&self) -> bool {
        self.user_messages > 0 || self.receipts > 0
    }
}

/// What a handler tells its receiver about one message.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessingReply {
    pub outcome: PipelineOutcome,
    pub response: Option<ReplyContent>,
    pub summary: ExchangeSummary,
}

impl ProcessingReply {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn error(&self) -> Option<&ProcessingError> {
        self.outcome.error()
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: ReceivedMessage) -> ProcessingReply;
}

#[async_trait]
pub trait Receiver: Send + Sync {
    fn kind(&self) -> ReceiverKind;

    /// Feeds messages to `handler` until `shutdown` fires or
    /// [`Receiver::stop_receiving`] is called.
    async fn start_receiving(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError>;

    /// Idempotent, and safe to call when the receiver never started.
    fn stop_receiving(&self);
}
