//! Turns what a receiver picked up into the context a pipeline runs on.
//! Datastore-driven transformers load the record named by the message
//! origin; the others decode the received bytes.

pub mod message;
pub mod record;

use crate::app_context::AppContext;
use crate::codec::CodecError;
use crate::domain::ReceivedMessage;
use crate::model::ErrorCode;
use crate::pipeline::context::{ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::store::RepositoryError;
use async_trait::async_trait;
use thiserror::Error;

pub use message::{As4Transformer, PullRequestTransformer, SubmitTransformer};
pub use record::{
    DeliverTransformer, NotifyTransformer, OutMessageTransformer, RetryTransformer,
};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("transformer `{transformer}` cannot handle messages from {origin}")]
    UnexpectedOrigin {
        transformer: &'static str,
        origin: String,
    },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Invalid(String),
}

impl TransformError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransformError::Codec(CodecError::InvalidBundle(_)) => ErrorCode::ValueInconsistent,
            TransformError::Codec(_) | TransformError::Json(_) => ErrorCode::ValueNotRecognized,
            TransformError::NotFound { .. } => ErrorCode::ValueNotRecognized,
            _ => ErrorCode::Other,
        }
    }

    pub fn into_processing_error(self) -> ProcessingError {
        let code = self.error_code();
        ProcessingError::transform(self.to_string()).with_code(code)
    }
}

#[async_trait]
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    async fn transform(
        &self,
        received: ReceivedMessage,
        app: &AppContext,
    ) -> Result<MessagingContext, TransformError>;
}
