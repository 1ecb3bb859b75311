use crate::app_context::AppContext;
use crate::model::{Direction, EntityType, InStatus, MessageType, NotifyMessageEnvelope, Operation};
use crate::pipeline::context::{ContextEntity, ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::deliver::is_permanent;
use crate::pipeline::step::retry::{acknowledge, load_or_create, register_failure};
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::pmode::{Method, RetryReliability};
use crate::reliability::{RetryDecision, RetryType};
use crate::store::InMessageUpdate;
use crate::telemetry::runtime_counters;
use async_trait::async_trait;

pub const NOTIFY_CONTENT_TYPE: &str = "application/json";

/// What a notification run is about, and how the PMode wants it handled.
struct NotifyTarget {
    subject: String,
    entity_type: EntityType,
    pmode_id: Option<String>,
    method: Option<Method>,
    reliability: RetryReliability,
}

fn resolve_target(context: &MessagingContext) -> Result<NotifyTarget, StepError> {
    match &context.entity {
        Some(ContextEntity::In(row)) => {
            let pmode = context.require_sending_pmode()?;
            let (method, reliability) = match row.message_type {
                MessageType::Receipt => (
                    pmode.receipt_handling.target().cloned(),
                    pmode.receipt_handling.reliability.clone(),
                ),
                _ => (
                    pmode.error_handling.target().cloned(),
                    pmode.error_handling.reliability.clone(),
                ),
            };
            Ok(NotifyTarget {
                subject: row.ebms_message_id.clone(),
                entity_type: EntityType::InMessage,
                pmode_id: Some(pmode.id.clone()),
                method,
                reliability,
            })
        }
        Some(ContextEntity::Exception(record)) => {
            let (handling, pmode_id, entity_type) = match record.direction {
                Direction::Out => {
                    let pmode = context.require_sending_pmode()?;
                    (&pmode.exception_handling, pmode.id.clone(), EntityType::OutException)
                }
                Direction::In => {
                    let pmode = context.require_receiving_pmode()?;
                    (&pmode.exception_handling, pmode.id.clone(), EntityType::InException)
                }
            };
            Ok(NotifyTarget {
                subject: record.id.clone(),
                entity_type,
                pmode_id: Some(pmode_id),
                method: handling.target().cloned(),
                reliability: handling.reliability.clone(),
            })
        }
        _ => Err(ContextError::Missing("signal or exception to notify about").into()),
    }
}

/// Tells the business application about a receipt, an error or an
/// exception, through the notify method the PMode names.
pub struct SendNotifyMessage;

#[async_trait]
impl Step for SendNotifyMessage {
    fn name(&self) -> &str {
        "send_notify_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let notify = context
            .notify_message()
            .ok_or(ContextError::Missing("notify message"))?;
        let target = resolve_target(context)?;

        let Some(method) = target.method.clone() else {
            tracing::debug!(subject = %target.subject, "pmode does not ask for this notification");
            settle(app, &target, Operation::NotApplicable).await?;
            return Ok(StepResult::Stop);
        };

        let envelope = NotifyMessageEnvelope {
            message_info: notify.message_info.clone(),
            status: notify.status,
            content: serde_json::to_vec(notify)?,
            content_type: NOTIFY_CONTENT_TYPE.to_string(),
            entity_type: target.entity_type,
        };

        let outcome = match app.sinks().notify_sender(&method) {
            Ok(sink) => sink.notify(&envelope, &method).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                settle(app, &target, Operation::Notified).await?;
                acknowledge(app, RetryType::Notification, &target.subject).await?;
                runtime_counters().inc_notifications_sent();
                tracing::info!(
                    subject = %target.subject,
                    status = %envelope.status,
                    method = %method.method_type,
                    "notification sent"
                );
                Ok(StepResult::Continue)
            }
            Err(err) => {
                tracing::warn!(subject = %target.subject, method = %method.method_type, error = %err, "notification failed");
                if !target.reliability.enabled || is_permanent(&err) {
                    return Ok(StepResult::Failed(
                        ProcessingError::notification(err.to_string())
                            .referencing(target.subject.clone()),
                    ));
                }
                let mut record = load_or_create(
                    app,
                    RetryType::Notification,
                    &target.subject,
                    &target.reliability,
                    target.pmode_id.as_deref(),
                )
                .await?;
                match register_failure(app, &mut record, &err.to_string()).await? {
                    RetryDecision::Scheduled { .. } => {
                        settle(app, &target, Operation::ToBeRetried).await?;
                        Ok(StepResult::Stop)
                    }
                    RetryDecision::Exhausted => Ok(StepResult::Failed(
                        ProcessingError::notification(format!(
                            "giving up after {} attempts: {err}",
                            record.retry_count
                        ))
                        .referencing(target.subject.clone()),
                    )),
                }
            }
        }
    }
}

async fn settle(
    app: &AppContext,
    target: &NotifyTarget,
    operation: Operation,
) -> Result<(), StepError> {
    let now = app.now();
    match target.entity_type {
        EntityType::InException | EntityType::OutException => {
            app.repository()
                .update_exception_operation(&target.subject, operation, now)
                .await?;
        }
        _ => {
            let mut update = InMessageUpdate::operation(operation);
            if operation == Operation::Notified {
                update.status = Some(InStatus::Notified);
            }
            app.repository()
                .update_in_message(&target.subject, update, now)
                .await?;
        }
    }
    Ok(())
}
