//! Step contract, guard conditions and the built-in steps.

pub mod compression;
pub mod deliver;
pub mod notify;
pub mod persistence;
pub mod pmode;
pub mod pull;
pub mod retry;
pub mod security;
pub mod send;
pub mod signals;
pub mod submit;

use crate::app_context::AppContext;
use crate::codec::CodecError;
use crate::pipeline::context::{ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::reliability::ReliabilityError;
use crate::store::RepositoryError;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// What the pipeline does after a step returns.
#[derive(Clone, Debug, PartialEq)]
pub enum StepResult {
    Continue,
    /// Ends the run successfully; remaining steps are skipped.
    Stop,
    /// Ends the run and diverts the context to the error steps.
    Failed(ProcessingError),
}

/// Faults a step did not anticipate. Caught at the pipeline boundary and
/// treated as fatal to the message, never to the agent.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Reliability(#[from] ReliabilityError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl StepError {
    pub fn msg(message: impl Into<String>) -> Self {
        StepError::Message(message.into())
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError>;
}

/// Guard evaluated against the context before a step runs.
pub type Condition = fn(&MessagingContext) -> bool;

/// Runs `inner` only when the named condition holds (or fails, if negated).
pub struct ConditionalStep {
    condition_name: String,
    condition: Condition,
    negate: bool,
    inner: Arc<dyn Step>,
}

impl ConditionalStep {
    pub fn new(
        condition_name: impl Into<String>,
        condition: Condition,
        negate: bool,
        inner: Arc<dyn Step>,
    ) -> Self {
        Self {
            condition_name: condition_name.into(),
            condition,
            negate,
            inner,
        }
    }
}

#[async_trait]
impl Step for ConditionalStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        if (self.condition)(context) == self.negate {
            tracing::trace!(
                step = self.inner.name(),
                condition = %self.condition_name,
                negate = self.negate,
                "condition not met; skipping step"
            );
            return Ok(StepResult::Continue);
        }
        self.inner.execute(context, app).await
    }
}

pub mod conditions {
    use super::MessagingContext;

    /// Replies to a received message are signed per the receiving PMode's
    /// reply handling; everything else per the sending PMode.
    pub fn signing_enabled(context: &MessagingContext) -> bool {
        if context.response.is_some() {
            if let Some(pmode) = context.receiving_pmode() {
                return pmode.reply_handling.response_signing.enabled;
            }
        }
        context
            .sending_pmode()
            .is_some_and(|pmode| pmode.security.signing.enabled)
    }

    pub fn encryption_enabled(context: &MessagingContext) -> bool {
        context
            .sending_pmode()
            .is_some_and(|pmode| pmode.security.encryption.enabled)
            && context
                .outgoing()
                .is_some_and(|message| !message.attachments.is_empty())
    }

    pub fn compression_enabled(context: &MessagingContext) -> bool {
        context
            .sending_pmode()
            .is_some_and(|pmode| pmode.message_packaging.use_compression)
    }

    pub fn message_signed(context: &MessagingContext) -> bool {
        context
            .as4_message
            .as_ref()
            .is_some_and(|message| message.is_signed())
    }

    pub fn message_encrypted(context: &MessagingContext) -> bool {
        context
            .as4_message
            .as_ref()
            .is_some_and(|message| message.is_encrypted())
    }

    pub fn has_user_messages(context: &MessagingContext) -> bool {
        context
            .as4_message
            .as_ref()
            .is_some_and(|message| message.has_user_messages())
    }

    pub fn has_signals(context: &MessagingContext) -> bool {
        context
            .as4_message
            .as_ref()
            .is_some_and(|message| message.has_signals())
    }
}
