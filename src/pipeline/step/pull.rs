//! Both ends of the pull exchange: answering a partner's pull request with a
//! queued message, and taking in what our own pull request brought back.

use crate::app_context::AppContext;
use crate::model::{
    new_message_id, As4Message, ErrorCode, ErrorDetail, ErrorSignal, MessageInfo, MessageUnit,
    Operation, OutStatus,
};
use crate::pipeline::context::{ContextEntity, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::persistence::save_user_messages;
use crate::pipeline::step::retry::load_or_create;
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::reliability::{ReliabilityState, RetryType};
use crate::store::{OutMessageFilter, OutMessageUpdate};
use crate::telemetry::runtime_counters;
use async_trait::async_trait;

/// Stores user messages returned for our pull request. An empty partition
/// ends the run quietly.
pub struct ProcessPullResponse;

#[async_trait]
impl Step for ProcessPullResponse {
    fn name(&self) -> &str {
        "process_pull_response"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(message) = context.as4_message.as_ref() else {
            tracing::debug!("pull request answered without content");
            return Ok(StepResult::Stop);
        };
        let only_empty_channel = !message.has_user_messages()
            && message.receipts().next().is_none()
            && message.errors().all(ErrorSignal::is_empty_channel_warning);
        if only_empty_channel {
            tracing::debug!("partner has nothing on the requested partition");
            return Ok(StepResult::Stop);
        }

        if message.has_user_messages() {
            context.pulled = true;
            save_user_messages(context, app).await?;
        }
        Ok(StepResult::Continue)
    }
}

/// Answers a partner's pull request with the oldest message queued on the
/// requested partition, or with an empty-partition warning.
pub struct SelectPulledMessage;

#[async_trait]
impl Step for SelectPulledMessage {
    fn name(&self) -> &str {
        "select_pulled_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(pull) = context
            .as4_message
            .as_ref()
            .and_then(As4Message::pull_request)
            .cloned()
        else {
            return Ok(StepResult::Failed(ProcessingError::transform(
                "expected a pull request",
            )));
        };

        let now = app.now();
        let repository = app.repository();
        let claimed = repository
            .claim_out_messages(
                Operation::ToBeSent,
                Operation::Sending,
                &OutMessageFilter::pull(pull.mpc.clone()),
                1,
                now,
            )
            .await?;

        let Some(row) = claimed.into_iter().next() else {
            tracing::debug!(mpc = %pull.mpc, pull_request = %pull.info.message_id, "no message waiting on partition");
            let mut detail = ErrorDetail::new(
                ErrorCode::EmptyMessagePartitionChannel,
                format!("no message waiting on `{}`", pull.mpc),
            );
            detail.ref_to_message_id = Some(pull.info.message_id.clone());
            context.response = Some(As4Message::single(MessageUnit::Error(ErrorSignal {
                info: MessageInfo::new(new_message_id(), now).referencing(pull.info.message_id),
                errors: vec![detail],
            })));
            return Ok(StepResult::Continue);
        };

        context.entity = Some(ContextEntity::Out(row.clone()));
        let message = match app.codecs().decode(&row.content_type, &row.body) {
            Ok(message) => message,
            Err(err) => {
                return Ok(StepResult::Failed(
                    ProcessingError::transform(format!("stored message is unreadable: {err}"))
                        .referencing(row.ebms_message_id),
                ))
            }
        };
        let Some(pmode) = row
            .pmode_id
            .as_deref()
            .and_then(|id| app.pmodes().get_sending_pmode(id))
        else {
            return Ok(StepResult::Failed(
                ProcessingError::configuration(format!(
                    "sending pmode `{}` of the pulled message is not loaded",
                    row.pmode_id.as_deref().unwrap_or_default()
                ))
                .referencing(row.ebms_message_id),
            ));
        };

        repository
            .update_out_message(
                &row.ebms_message_id,
                OutMessageUpdate::status(OutStatus::Sent).with_operation(Operation::NotApplicable),
                now,
            )
            .await?;

        let reliability = pmode.reception_awareness();
        if reliability.enabled && message.has_user_messages() {
            let mut record = load_or_create(
                app,
                RetryType::Send,
                &row.ebms_message_id,
                reliability,
                Some(&pmode.id),
            )
            .await?;
            if matches!(
                record.state,
                ReliabilityState::Pending | ReliabilityState::Sent
            ) {
                record.mark_sent(now)?;
                repository.upsert_retry(record).await?;
            }
        }

        runtime_counters().inc_messages_sent();
        tracing::info!(
            message_id = %row.ebms_message_id,
            mpc = %pull.mpc,
            pull_request = %pull.info.message_id,
            "message handed out for pull"
        );
        context.set_sending_pmode(pmode)?;
        context.response = Some(message);
        Ok(StepResult::Continue)
    }
}
