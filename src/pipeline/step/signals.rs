//! Receipts and errors: settling our out messages when the partner's signals
//! arrive, and composing the signal we owe the partner for what we received.

use crate::app_context::AppContext;
use crate::domain::MessageOrigin;
use crate::model::{
    new_message_id, As4Message, ErrorDetail, ErrorSignal, InMessage, MessageInfo, MessageType,
    MessageUnit, Operation, OutMessage, OutStatus, Receipt, Reference,
};
use crate::pipeline::context::{MessagingContext, ReplyContent};
use crate::pipeline::step::retry::acknowledge;
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::pmode::{ReplyPattern, SendingPMode};
use crate::reliability::RetryType;
use crate::security::{compute_references, nrr_references};
use crate::store::{InsertOutcome, OutMessageUpdate};
use crate::telemetry::runtime_counters;
use async_trait::async_trait;
use std::sync::Arc;

/// Stores every receipt and error of the message and settles the out
/// message each one refers to.
pub struct ProcessSignals;

#[async_trait]
impl Step for ProcessSignals {
    fn name(&self) -> &str {
        "process_signals"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(message) = context.as4_message.clone() else {
            return Ok(StepResult::Continue);
        };
        for unit in message.signals() {
            if let MessageUnit::Error(error) = unit {
                if error.is_empty_channel_warning() {
                    continue;
                }
            }
            process_signal(context, app, unit).await?;
        }
        Ok(StepResult::Continue)
    }
}

async fn process_signal(
    context: &mut MessagingContext,
    app: &AppContext,
    unit: &MessageUnit,
) -> Result<(), StepError> {
    let info = unit.info();
    let signal_id = info.message_id.clone();
    let now = app.now();
    let repository = app.repository();

    let original = match info.ref_to_message_id.as_deref() {
        Some(reference) => repository.get_out_message(reference).await?,
        None => None,
    };
    let pmode = original
        .as_ref()
        .and_then(|row| row.pmode_id.as_deref())
        .and_then(|id| app.pmodes().get_sending_pmode(id))
        .or_else(|| context.sending_pmode().cloned());

    let (message_type, accepted) = match unit {
        MessageUnit::Receipt(receipt) => {
            let accepted = match (&original, &pmode) {
                (Some(row), Some(pmode)) if pmode.receipt_handling.verify_nrr => {
                    receipt_is_valid(app, context, row, receipt)?
                }
                _ => true,
            };
            (MessageType::Receipt, accepted)
        }
        _ => (MessageType::Error, false),
    };

    let target = pmode
        .as_ref()
        .is_some_and(|pmode| notify_target(pmode, accepted));
    let (body, content_type) = app.codecs().encode(&As4Message::single(unit.clone()))?;
    let mut row = InMessage::new(signal_id.clone(), message_type, content_type, body, now);
    row.ref_to_message_id = info.ref_to_message_id.clone();
    row.pmode_id = pmode.as_ref().map(|pmode| pmode.id.clone());
    row.operation = if target {
        Operation::ToBeNotified
    } else {
        Operation::NotApplicable
    };

    if let InsertOutcome::Existing(_) = repository.insert_in_message(row).await? {
        runtime_counters().inc_duplicates_detected();
        tracing::info!(message_id = %signal_id, "duplicate signal ignored");
        context.duplicates.insert(signal_id);
        return Ok(());
    }
    runtime_counters().inc_messages_received();

    let Some(original) = original else {
        tracing::warn!(
            message_id = %signal_id,
            ref_to_message_id = info.ref_to_message_id.as_deref().unwrap_or("<none>"),
            "signal refers to no known out message"
        );
        return Ok(());
    };

    let status = if accepted { OutStatus::Ack } else { OutStatus::Nack };
    if original.status.can_transition_to(status) && original.status != status {
        repository
            .update_out_message(
                &original.ebms_message_id,
                OutMessageUpdate::status(status),
                now,
            )
            .await?;
    }
    acknowledge(app, RetryType::Send, &original.ebms_message_id).await?;

    if !accepted {
        tracing::warn!(
            message_id = %original.ebms_message_id,
            signal_id = %signal_id,
            kind = message_type.as_str(),
            "partner did not accept the message"
        );
    } else {
        tracing::info!(
            message_id = %original.ebms_message_id,
            signal_id = %signal_id,
            "receipt received"
        );
    }
    Ok(())
}

fn notify_target(pmode: &SendingPMode, accepted: bool) -> bool {
    if accepted {
        pmode.receipt_handling.target().is_some()
    } else {
        pmode.error_handling.target().is_some()
    }
}

/// A non-repudiation receipt must echo the digest of every unit we sent.
/// Units are compared rather than attachments, which compression and
/// encryption rewrite on the way out.
fn receipt_is_valid(
    app: &AppContext,
    context: &MessagingContext,
    original: &OutMessage,
    receipt: &Receipt,
) -> Result<bool, StepError> {
    let sent = match &context.outbound {
        Some(outbound)
            if outbound.primary_message_id() == Some(original.ebms_message_id.as_str()) =>
        {
            outbound.clone()
        }
        _ => app
            .codecs()
            .decode(&original.content_type, &original.body)?,
    };
    let expected: Vec<Reference> = compute_references(&sent)
        .into_iter()
        .filter(|reference| reference.uri.starts_with("#unit-"))
        .collect();
    let valid = !expected.is_empty()
        && expected
            .iter()
            .all(|reference| receipt.non_repudiation.contains(reference));
    if !valid {
        tracing::warn!(
            message_id = %original.ebms_message_id,
            "receipt does not carry the expected non-repudiation references"
        );
    }
    Ok(valid)
}

/// One receipt per received user message, duplicates included.
pub struct CreateReceipt;

#[async_trait]
impl Step for CreateReceipt {
    fn name(&self) -> &str {
        "create_receipt"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let message = context.require_message()?;
        if !message.has_user_messages() {
            return Ok(StepResult::Continue);
        }
        let use_nrr = context
            .receiving_pmode()
            .is_some_and(|pmode| pmode.reply_handling.use_nrr_format);
        let references = if use_nrr {
            nrr_references(message)
        } else {
            Vec::new()
        };

        let now = app.now();
        let receipts = message
            .user_messages()
            .map(|user| {
                MessageUnit::Receipt(Receipt {
                    info: MessageInfo::new(new_message_id(), now)
                        .referencing(user.info.message_id.clone()),
                    non_repudiation: references.clone(),
                })
            })
            .collect();
        context.response = Some(As4Message::new(receipts));
        Ok(StepResult::Continue)
    }
}

/// Turns the run's failure into an Error signal for the partner. Nothing is
/// produced when there is no partner message to refer to.
pub struct CreateError;

#[async_trait]
impl Step for CreateError {
    fn name(&self) -> &str {
        "create_error"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(error) = context.error().cloned() else {
            return Ok(StepResult::Continue);
        };
        let Some(message) = context.as4_message.as_ref() else {
            return Ok(StepResult::Continue);
        };
        let own_pull_request = matches!(
            context.received().map(|received| &received.origin),
            Some(MessageOrigin::PullSchedule { .. })
        ) && !context.pulled;

        let reference = message
            .first_user_message()
            .map(|user| user.info.message_id.clone())
            .or_else(|| {
                message
                    .pull_request()
                    .filter(|_| !own_pull_request)
                    .map(|pull| pull.info.message_id.clone())
            });
        let Some(reference) = reference else {
            return Ok(StepResult::Continue);
        };

        let mut detail = ErrorDetail::new(error.error_code(), error.description.clone());
        detail.ref_to_message_id = Some(error.ref_message_id.clone().unwrap_or(reference.clone()));
        let signal = ErrorSignal {
            info: MessageInfo::new(new_message_id(), app.now()).referencing(reference),
            errors: vec![detail],
        };
        context.response = Some(As4Message::single(MessageUnit::Error(signal)));
        Ok(StepResult::Continue)
    }
}

/// Hands the composed signal back to the partner: on the open connection
/// for the response pattern, or as a stored out message for the Send agent
/// when the PMode asks for a callback or there is no connection to answer on.
pub struct SendSignalResponse;

#[async_trait]
impl Step for SendSignalResponse {
    fn name(&self) -> &str {
        "send_signal_response"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(response) = context.response.as_ref() else {
            return Ok(StepResult::Continue);
        };

        let reply_handling = context
            .receiving_pmode()
            .map(|pmode| pmode.reply_handling.clone())
            .unwrap_or_default();
        let asynchronous =
            context.pulled || reply_handling.reply_pattern == ReplyPattern::Callback;

        if asynchronous {
            let callback = reply_handling
                .sending_pmode
                .as_deref()
                .and_then(|id| app.pmodes().get_sending_pmode(id));
            match callback {
                Some(callback) => {
                    store_callback(app, response, &callback).await?;
                    return Ok(StepResult::Continue);
                }
                None => tracing::warn!(
                    sending_pmode = reply_handling.sending_pmode.as_deref().unwrap_or("<none>"),
                    "no sending pmode for the callback reply; answering synchronously"
                ),
            }
        }

        let (content, content_type) = app.codecs().encode(response)?;
        context.reply = Some(ReplyContent {
            content,
            content_type,
        });
        Ok(StepResult::Continue)
    }
}

async fn store_callback(
    app: &AppContext,
    response: &As4Message,
    callback: &Arc<SendingPMode>,
) -> Result<(), StepError> {
    let Some(first) = response.units.first() else {
        return Ok(());
    };
    let message_type = match first {
        MessageUnit::Error(_) => MessageType::Error,
        _ => MessageType::Receipt,
    };
    let (body, content_type) = app.codecs().encode(response)?;
    let mut row = OutMessage::new(
        first.message_id(),
        message_type,
        content_type,
        body,
        app.now(),
    );
    row.ref_to_message_id = first.info().ref_to_message_id.clone();
    row.pmode_id = Some(callback.id.clone());
    row.mep = callback.mep_binding;
    row.mpc = callback.message_packaging.mpc.clone();
    if !app.repository().insert_out_message(row).await?.is_inserted() {
        tracing::debug!(message_id = %first.message_id(), "callback signal already queued");
    }
    Ok(())
}
