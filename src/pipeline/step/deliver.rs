use crate::app_context::AppContext;
use crate::model::{DeliverMessageEnvelope, InStatus, Operation};
use crate::pipeline::context::{ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::retry::{acknowledge, load_or_create, register_failure};
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::reliability::{RetryDecision, RetryType};
use crate::store::InMessageUpdate;
use crate::telemetry::runtime_counters;
use crate::transport::sink::SinkError;
use async_trait::async_trait;

pub const DELIVER_CONTENT_TYPE: &str = "application/json";

/// Hands a received user message to the business application through the
/// receiving PMode's deliver method.
pub struct SendDeliverMessage;

#[async_trait]
impl Step for SendDeliverMessage {
    fn name(&self) -> &str {
        "send_deliver_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let deliver = context
            .deliver_message()
            .ok_or(ContextError::Missing("deliver message"))?;
        let message_id = deliver.message_info.message_id.clone();
        let pmode = context.require_receiving_pmode()?.clone();
        let Some(method) = pmode.deliver_method().cloned() else {
            return Ok(StepResult::Failed(
                ProcessingError::configuration(format!(
                    "receiving pmode `{}` has no deliver method",
                    pmode.id
                ))
                .referencing(message_id),
            ));
        };

        let attachments = context
            .as4_message
            .as_ref()
            .and_then(|message| {
                message
                    .user_messages()
                    .find(|user| user.info.message_id == message_id)
                    .map(|user| message.attachments_for(user))
            })
            .unwrap_or_default();
        let envelope = DeliverMessageEnvelope {
            message_info: deliver.message_info.clone(),
            content: serde_json::to_vec(deliver)?,
            content_type: DELIVER_CONTENT_TYPE.to_string(),
            attachments,
        };

        let sink = match app.sinks().deliver_sender(&method) {
            Ok(sink) => sink,
            Err(err) => {
                return Ok(StepResult::Failed(
                    ProcessingError::configuration(err.to_string()).referencing(message_id),
                ))
            }
        };

        match sink.deliver(&envelope, &method).await {
            Ok(()) => {
                app.repository()
                    .update_in_message(
                        &message_id,
                        InMessageUpdate::status(InStatus::Delivered)
                            .with_operation(Operation::Delivered),
                        app.now(),
                    )
                    .await?;
                acknowledge(app, RetryType::Delivery, &message_id).await?;
                runtime_counters().inc_messages_delivered();
                tracing::info!(message_id = %message_id, method = %method.method_type, "message delivered");
                Ok(StepResult::Continue)
            }
            Err(err) => {
                tracing::warn!(message_id = %message_id, method = %method.method_type, error = %err, "delivery failed");
                let reliability = &pmode.message_handling.deliver.reliability;
                if !reliability.enabled || is_permanent(&err) {
                    return Ok(StepResult::Failed(
                        ProcessingError::delivery(err.to_string()).referencing(message_id),
                    ));
                }
                let mut record = load_or_create(
                    app,
                    RetryType::Delivery,
                    &message_id,
                    reliability,
                    Some(&pmode.id),
                )
                .await?;
                match register_failure(app, &mut record, &err.to_string()).await? {
                    RetryDecision::Scheduled { .. } => {
                        app.repository()
                            .update_in_message(
                                &message_id,
                                InMessageUpdate::operation(Operation::ToBeRetried),
                                app.now(),
                            )
                            .await?;
                        Ok(StepResult::Stop)
                    }
                    RetryDecision::Exhausted => Ok(StepResult::Failed(
                        ProcessingError::delivery(format!(
                            "giving up after {} attempts: {err}",
                            record.retry_count
                        ))
                        .referencing(message_id),
                    )),
                }
            }
        }
    }
}

/// Misconfigured methods fail the same way on every attempt.
pub(crate) fn is_permanent(err: &SinkError) -> bool {
    matches!(
        err,
        SinkError::UnknownMethod { .. }
            | SinkError::MissingParameter { .. }
            | SinkError::InvalidParameter { .. }
            | SinkError::Serialize(_)
    )
}
