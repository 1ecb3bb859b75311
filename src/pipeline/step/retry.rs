//! Reception awareness bookkeeping shared by the send, deliver and notify
//! steps, and the step that acts on a retry record once it is due.

use crate::app_context::AppContext;
use crate::model::{ErrorCode, Operation};
use crate::pipeline::context::{ContextEntity, ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::pmode::RetryReliability;
use crate::reliability::{record_key, ReliabilityState, RetryDecision, RetryRecord, RetryType};
use crate::store::{InMessageUpdate, OutMessageUpdate};
use crate::telemetry::runtime_counters;
use async_trait::async_trait;

/// Stored record for `subject`, or a fresh one built from `reliability`.
pub(crate) async fn load_or_create(
    app: &AppContext,
    retry_type: RetryType,
    subject: &str,
    reliability: &RetryReliability,
    pmode_id: Option<&str>,
) -> Result<RetryRecord, StepError> {
    if let Some(record) = app
        .repository()
        .get_retry(&record_key(retry_type, subject))
        .await?
    {
        return Ok(record);
    }
    let mut record = RetryRecord::new(subject, retry_type, &reliability.policy(), app.now());
    if let Some(pmode_id) = pmode_id {
        record = record.with_pmode(pmode_id);
    }
    Ok(record)
}

/// Closes the record for `subject` if one is still open.
pub(crate) async fn acknowledge(
    app: &AppContext,
    retry_type: RetryType,
    subject: &str,
) -> Result<(), StepError> {
    let Some(mut record) = app
        .repository()
        .get_retry(&record_key(retry_type, subject))
        .await?
    else {
        return Ok(());
    };
    if record.state.is_terminal() {
        return Ok(());
    }
    record.acknowledge(app.now())?;
    app.repository().upsert_retry(record).await?;
    tracing::debug!(retry_type = %retry_type, subject = %subject, "retry record acknowledged");
    Ok(())
}

/// Counts a failed attempt and persists the outcome.
pub(crate) async fn register_failure(
    app: &AppContext,
    record: &mut RetryRecord,
    reason: &str,
) -> Result<RetryDecision, StepError> {
    let decision = record.register_failure(app.now(), reason)?;
    app.repository().upsert_retry(record.clone()).await?;
    match decision {
        RetryDecision::Scheduled { due, interval } => {
            runtime_counters().inc_retries_scheduled();
            tracing::info!(
                retry_type = %record.retry_type,
                subject = %record.subject,
                attempt = record.retry_count,
                max_retries = record.max_retries,
                interval_ms = interval.as_millis() as u64,
                due = %due,
                "retry scheduled"
            );
        }
        RetryDecision::Exhausted => {
            runtime_counters().inc_retries_exhausted();
            tracing::warn!(
                retry_type = %record.retry_type,
                subject = %record.subject,
                attempts = record.retry_count,
                reason = %reason,
                "retries exhausted"
            );
        }
    }
    Ok(decision)
}

/// Acts on a due retry record: an unanswered send is counted as a failure,
/// a scheduled retry is handed back to the agent that owns it.
pub struct HandleDueRetry;

#[async_trait]
impl Step for HandleDueRetry {
    fn name(&self) -> &str {
        "handle_due_retry"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(ContextEntity::Retry(loaded)) = &context.entity else {
            return Err(ContextError::Missing("retry record").into());
        };
        let now = app.now();
        let Some(mut record) = app.repository().get_retry(&loaded.key()).await? else {
            return Ok(StepResult::Stop);
        };
        if !record.is_due(now) {
            tracing::debug!(key = %record.key(), state = record.state.as_str(), "retry no longer due");
            return Ok(StepResult::Stop);
        }

        let result = match record.retry_type {
            RetryType::Send => retry_send(app, &mut record).await?,
            RetryType::Delivery => retry_delivery(app, &mut record).await?,
            RetryType::Notification => retry_notification(app, &mut record).await?,
        };
        context.entity = Some(ContextEntity::Retry(record));
        Ok(result)
    }
}

async fn retry_send(app: &AppContext, record: &mut RetryRecord) -> Result<StepResult, StepError> {
    let now = app.now();
    let repository = app.repository();
    let message = repository.get_out_message(&record.subject).await?;
    let settled = message
        .as_ref()
        .map_or(true, |message| message.status.is_terminal());
    if settled {
        record.acknowledge(now)?;
        repository.upsert_retry(record.clone()).await?;
        return Ok(StepResult::Stop);
    }

    match record.state {
        ReliabilityState::Sent => {
            let reason = format!(
                "no receipt within {}",
                humantime::format_duration(record.current_interval)
            );
            match register_failure(app, record, &reason).await? {
                RetryDecision::Scheduled { .. } => {
                    repository
                        .update_out_message(
                            &record.subject,
                            OutMessageUpdate::operation(Operation::ToBeRetried),
                            now,
                        )
                        .await?;
                    Ok(StepResult::Continue)
                }
                RetryDecision::Exhausted => Ok(StepResult::Failed(
                    ProcessingError::transport(format!(
                        "no receipt for `{}` after {} attempts",
                        record.subject, record.retry_count
                    ))
                    .with_code(ErrorCode::MissingReceipt)
                    .referencing(record.subject.clone()),
                )),
            }
        }
        ReliabilityState::RetryScheduled => {
            record.reinject(now)?;
            repository.upsert_retry(record.clone()).await?;
            repository
                .update_out_message(
                    &record.subject,
                    OutMessageUpdate::operation(Operation::ToBeSent),
                    now,
                )
                .await?;
            tracing::info!(message_id = %record.subject, attempt = record.retry_count, "message re-queued for sending");
            Ok(StepResult::Continue)
        }
        _ => Ok(StepResult::Stop),
    }
}

async fn retry_delivery(
    app: &AppContext,
    record: &mut RetryRecord,
) -> Result<StepResult, StepError> {
    if record.state != ReliabilityState::RetryScheduled {
        return Ok(StepResult::Stop);
    }
    let now = app.now();
    let repository = app.repository();
    if repository.get_in_message(&record.subject).await?.is_none() {
        record.acknowledge(now)?;
        repository.upsert_retry(record.clone()).await?;
        return Ok(StepResult::Stop);
    }
    record.reinject(now)?;
    repository.upsert_retry(record.clone()).await?;
    repository
        .update_in_message(
            &record.subject,
            InMessageUpdate::operation(Operation::ToBeDelivered),
            now,
        )
        .await?;
    Ok(StepResult::Continue)
}

async fn retry_notification(
    app: &AppContext,
    record: &mut RetryRecord,
) -> Result<StepResult, StepError> {
    if record.state != ReliabilityState::RetryScheduled {
        return Ok(StepResult::Stop);
    }
    let now = app.now();
    let repository = app.repository();
    record.reinject(now)?;
    repository.upsert_retry(record.clone()).await?;

    if repository.get_exception(&record.subject).await?.is_some() {
        repository
            .update_exception_operation(&record.subject, Operation::ToBeNotified, now)
            .await?;
    } else if repository.get_in_message(&record.subject).await?.is_some() {
        repository
            .update_in_message(
                &record.subject,
                InMessageUpdate::operation(Operation::ToBeNotified),
                now,
            )
            .await?;
    } else {
        record.acknowledge(now)?;
        repository.upsert_retry(record.clone()).await?;
        return Ok(StepResult::Stop);
    }
    Ok(StepResult::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{MessageType, OutMessage, OutStatus};
    use crate::reliability::RetryPolicy;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            factor: 2.0,
        }
    }

    async fn sent_message(app: &AppContext, id: &str) {
        let mut row = OutMessage::new(id, MessageType::UserMessage, "application/as4+json", Vec::new(), app.now());
        row.status = OutStatus::Sent;
        row.operation = Operation::NotApplicable;
        app.repository().insert_out_message(row).await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_send_is_rescheduled_then_requeued() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let app = AppContext::builder().clock(clock.clone()).build();
        sent_message(&app, "m-1").await;

        let mut record = RetryRecord::new("m-1", RetryType::Send, &policy(), app.now());
        record.mark_sent(app.now()).unwrap();
        app.repository().upsert_retry(record.clone()).await.unwrap();

        let mut context = MessagingContext::new().with_entity(ContextEntity::Retry(record.clone()));
        assert_eq!(
            HandleDueRetry.execute(&mut context, &app).await.unwrap(),
            StepResult::Stop,
            "not due yet"
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            HandleDueRetry.execute(&mut context, &app).await.unwrap(),
            StepResult::Continue
        );
        let stored = app.repository().get_retry(&record.key()).await.unwrap().unwrap();
        assert_eq!(stored.state, ReliabilityState::RetryScheduled);
        let out = app.repository().get_out_message("m-1").await.unwrap().unwrap();
        assert_eq!(out.operation, Operation::ToBeRetried);

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            HandleDueRetry.execute(&mut context, &app).await.unwrap(),
            StepResult::Stop,
            "second wait is twice the first"
        );
        clock.advance(Duration::from_secs(1));
        HandleDueRetry.execute(&mut context, &app).await.unwrap();
        let out = app.repository().get_out_message("m-1").await.unwrap().unwrap();
        assert_eq!(out.operation, Operation::ToBeSent);
        let stored = app.repository().get_retry(&record.key()).await.unwrap().unwrap();
        assert_eq!(stored.state, ReliabilityState::Pending);
    }

    #[tokio::test]
    async fn last_missing_receipt_fails_with_the_missing_receipt_code() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let app = AppContext::builder().clock(clock.clone()).build();
        sent_message(&app, "m-2").await;

        let mut record = RetryRecord::new("m-2", RetryType::Send, &policy(), app.now());
        record.retry_count = 1;
        record.mark_sent(app.now()).unwrap();
        app.repository().upsert_retry(record.clone()).await.unwrap();
        clock.advance(Duration::from_secs(5));

        let mut context = MessagingContext::new().with_entity(ContextEntity::Retry(record.clone()));
        let result = HandleDueRetry.execute(&mut context, &app).await.unwrap();
        assert!(matches!(
            result,
            StepResult::Failed(ref error) if error.error_code() == ErrorCode::MissingReceipt
        ));
        let stored = app.repository().get_retry(&record.key()).await.unwrap().unwrap();
        assert_eq!(stored.state, ReliabilityState::Exhausted);
    }

    #[tokio::test]
    async fn acknowledged_message_closes_its_record() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let app = AppContext::builder().clock(clock.clone()).build();
        sent_message(&app, "m-3").await;
        app.repository()
            .update_out_message("m-3", OutMessageUpdate::status(OutStatus::Ack), app.now())
            .await
            .unwrap();

        let mut record = RetryRecord::new("m-3", RetryType::Send, &policy(), app.now());
        record.mark_sent(app.now()).unwrap();
        app.repository().upsert_retry(record.clone()).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let mut context = MessagingContext::new().with_entity(ContextEntity::Retry(record.clone()));
        assert_eq!(
            HandleDueRetry.execute(&mut context, &app).await.unwrap(),
            StepResult::Stop
        );
        let stored = app.repository().get_retry(&record.key()).await.unwrap().unwrap();
        assert_eq!(stored.state, ReliabilityState::Ack);
    }
}
