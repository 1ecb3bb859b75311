use crate::app_context::AppContext;
use crate::compression::{compress_attachments, decompress_attachments};
use crate::model::ErrorCode;
use crate::pipeline::context::MessagingContext;
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::{Step, StepError, StepResult};
use async_trait::async_trait;

pub struct CompressAttachments;

#[async_trait]
impl Step for CompressAttachments {
    fn name(&self) -> &str {
        "compress_attachments"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(message) = context.outgoing_mut() else {
            return Ok(StepResult::Continue);
        };
        match compress_attachments(message) {
            Ok(count) => {
                tracing::debug!(attachments = count, "attachments compressed");
                Ok(StepResult::Continue)
            }
            Err(err) => Ok(StepResult::Failed(ProcessingError::unexpected(
                err.to_string(),
            ))),
        }
    }
}

/// Restores compressed attachments of a received message.
pub struct DecompressAttachments;

#[async_trait]
impl Step for DecompressAttachments {
    fn name(&self) -> &str {
        "decompress_attachments"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(message) = context.as4_message.as_mut() else {
            return Ok(StepResult::Continue);
        };
        match decompress_attachments(message) {
            Ok(count) => {
                tracing::debug!(attachments = count, "attachments decompressed");
                Ok(StepResult::Continue)
            }
            Err(err) => {
                let mut error = ProcessingError::transform(err.to_string())
                    .with_code(ErrorCode::DecompressionFailure);
                if let Some(id) = message.primary_message_id() {
                    error = error.referencing(id);
                }
                Ok(StepResult::Failed(error))
            }
        }
    }
}
