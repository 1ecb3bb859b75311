//! What happens to a message once its run failed. Handlers record the
//! failure and settle the affected records; they never fail themselves.

use crate::agent::AgentKind;
use crate::app_context::AppContext;
use crate::domain::MessageOrigin;
use crate::model::{Direction, ExceptionRecord, InStatus, Operation, OutStatus};
use crate::pipeline::context::{ContextEntity, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::reliability::RetryType;
use crate::store::{InMessageUpdate, OutMessageUpdate, RepositoryError};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionHandler {
    /// Failures of messages we send: submissions, pushes, pulled replies.
    Outbound,
    /// Failures of messages we received or deliver.
    Inbound,
    /// A notification could not be handed over; nothing is left to tell.
    NotifyFailure,
    /// Picks one of the above from the type of the retry record.
    Retry,
}

impl ExceptionHandler {
    pub fn for_kind(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Submit | AgentKind::Send | AgentKind::PullSend => ExceptionHandler::Outbound,
            AgentKind::Receive | AgentKind::PullReceive | AgentKind::Deliver => {
                ExceptionHandler::Inbound
            }
            AgentKind::Notify => ExceptionHandler::NotifyFailure,
            AgentKind::ReceptionAwareness => ExceptionHandler::Retry,
        }
    }

    pub async fn handle(&self, context: &MessagingContext, error: &ProcessingError, app: &AppContext) {
        if is_own_pull_failure(context) {
            tracing::debug!(error = %error, "pull request got no usable answer");
            return;
        }
        let handler = match self {
            ExceptionHandler::Retry => match &context.entity {
                Some(ContextEntity::Retry(record)) => match record.retry_type {
                    RetryType::Send => ExceptionHandler::Outbound,
                    RetryType::Delivery => ExceptionHandler::Inbound,
                    RetryType::Notification => ExceptionHandler::NotifyFailure,
                },
                _ => ExceptionHandler::Outbound,
            },
            other => *other,
        };
        let result = match handler {
            ExceptionHandler::Inbound => handle_inbound(context, error, app).await,
            ExceptionHandler::NotifyFailure => handle_notify_failure(context, error, app).await,
            _ => handle_outbound(context, error, app).await,
        };
        if let Err(err) = result {
            tracing::error!(
                error = %err,
                failure = %error,
                "failed to record exception"
            );
        }
    }
}

/// A pull request we fired that failed before anything was pulled. Those
/// recur every interval and are not message exceptions.
fn is_own_pull_failure(context: &MessagingContext) -> bool {
    matches!(
        context.received().map(|received| &received.origin),
        Some(MessageOrigin::PullSchedule { .. })
    ) && !context.pulled
}

fn raw_body(context: &MessagingContext) -> Option<Vec<u8>> {
    if let Some(received) = context.received().filter(|received| !received.content.is_empty()) {
        return Some(received.content.clone());
    }
    match &context.entity {
        Some(ContextEntity::In(row)) => Some(row.body.clone()),
        Some(ContextEntity::Out(row)) => Some(row.body.clone()),
        _ => None,
    }
}

fn exception_record(
    direction: Direction,
    context: &MessagingContext,
    error: &ProcessingError,
    subject: Option<String>,
    pmode_id: Option<String>,
    notify: bool,
    app: &AppContext,
) -> ExceptionRecord {
    let mut record = ExceptionRecord::new(direction, error.description.clone(), app.now());
    record.ebms_ref_to_message_id = subject;
    record.pmode_id = pmode_id;
    record.code = Some(error.error_code());
    record.message_body = raw_body(context);
    record.operation = if notify {
        Operation::ToBeNotified
    } else {
        Operation::NotApplicable
    };
    record
}

async fn handle_outbound(
    context: &MessagingContext,
    error: &ProcessingError,
    app: &AppContext,
) -> Result<(), RepositoryError> {
    let (subject, settle) = match &context.entity {
        Some(ContextEntity::Out(row)) => (Some(row.ebms_message_id.clone()), true),
        Some(ContextEntity::Retry(record)) if record.retry_type == RetryType::Send => {
            (Some(record.subject.clone()), true)
        }
        _ => (
            error
                .ref_message_id
                .clone()
                .or_else(|| context.message_id().map(str::to_string)),
            false,
        ),
    };

    let pmode = match context.sending_pmode() {
        Some(pmode) => Some(Arc::clone(pmode)),
        None => stored_pmode_id(context)
            .and_then(|id| app.pmodes().get_sending_pmode(&id)),
    };
    let notify = pmode
        .as_ref()
        .is_some_and(|pmode| pmode.exception_handling.target().is_some());
    let record = exception_record(
        Direction::Out,
        context,
        error,
        subject.clone(),
        pmode.as_ref().map(|pmode| pmode.id.clone()).or_else(|| stored_pmode_id(context)),
        notify,
        app,
    );
    let record_id = record.id.clone();
    app.repository().insert_exception(record).await?;

    if let (true, Some(subject)) = (settle, subject.as_deref()) {
        if let Some(row) = app.repository().get_out_message(subject).await? {
            if row.status != OutStatus::Exception && row.status.can_transition_to(OutStatus::Exception) {
                app.repository()
                    .update_out_message(
                        subject,
                        OutMessageUpdate::status(OutStatus::Exception)
                            .with_operation(Operation::NotApplicable),
                        app.now(),
                    )
                    .await?;
            }
        }
    }

    tracing::warn!(
        exception_id = %record_id,
        message_id = subject.as_deref().unwrap_or("-"),
        category = %error.category,
        code = %error.error_code(),
        notify = notify,
        "outbound exception recorded"
    );
    Ok(())
}

async fn handle_inbound(
    context: &MessagingContext,
    error: &ProcessingError,
    app: &AppContext,
) -> Result<(), RepositoryError> {
    let mut affected: Vec<String> = match &context.entity {
        Some(ContextEntity::In(row)) => vec![row.ebms_message_id.clone()],
        Some(ContextEntity::Retry(record)) if record.retry_type == RetryType::Delivery => {
            vec![record.subject.clone()]
        }
        _ => context
            .as4_message
            .iter()
            .flat_map(|message| message.user_messages())
            .map(|user| user.info.message_id.clone())
            .filter(|id| !context.is_duplicate(id))
            .collect(),
    };
    affected.dedup();
    let subject = error
        .ref_message_id
        .clone()
        .or_else(|| affected.first().cloned());

    let pmode = match context.receiving_pmode() {
        Some(pmode) => Some(Arc::clone(pmode)),
        None => stored_pmode_id(context).and_then(|id| app.pmodes().snapshot().receiving_pmode(&id)),
    };
    let notify = pmode
        .as_ref()
        .is_some_and(|pmode| pmode.exception_handling.target().is_some());
    let record = exception_record(
        Direction::In,
        context,
        error,
        subject.clone(),
        pmode.as_ref().map(|pmode| pmode.id.clone()).or_else(|| stored_pmode_id(context)),
        notify,
        app,
    );
    let record_id = record.id.clone();
    app.repository().insert_exception(record).await?;

    for id in &affected {
        let Some(row) = app.repository().get_in_message(id).await? else {
            continue;
        };
        if row.status == InStatus::Exception || !row.status.can_transition_to(InStatus::Exception) {
            continue;
        }
        app.repository()
            .update_in_message(
                id,
                InMessageUpdate::status(InStatus::Exception).with_operation(Operation::NotApplicable),
                app.now(),
            )
            .await?;
    }

    tracing::warn!(
        exception_id = %record_id,
        message_id = subject.as_deref().unwrap_or("-"),
        category = %error.category,
        code = %error.error_code(),
        notify = notify,
        "inbound exception recorded"
    );
    Ok(())
}

async fn handle_notify_failure(
    context: &MessagingContext,
    error: &ProcessingError,
    app: &AppContext,
) -> Result<(), RepositoryError> {
    let now = app.now();
    let repository = app.repository();
    match &context.entity {
        Some(ContextEntity::In(row)) => {
            repository
                .update_in_message(
                    &row.ebms_message_id,
                    InMessageUpdate::operation(Operation::DeadLettered),
                    now,
                )
                .await?;
        }
        Some(ContextEntity::Exception(record)) => {
            repository
                .update_exception_operation(&record.id, Operation::DeadLettered, now)
                .await?;
        }
        Some(ContextEntity::Retry(record)) => {
            if repository.get_exception(&record.subject).await?.is_some() {
                repository
                    .update_exception_operation(&record.subject, Operation::DeadLettered, now)
                    .await?;
            } else if repository.get_in_message(&record.subject).await?.is_some() {
                repository
                    .update_in_message(
                        &record.subject,
                        InMessageUpdate::operation(Operation::DeadLettered),
                        now,
                    )
                    .await?;
            }
        }
        _ => {}
    }
    tracing::error!(
        subject = error.ref_message_id.as_deref().unwrap_or("-"),
        error = %error.description,
        "notification abandoned"
    );
    Ok(())
}

fn stored_pmode_id(context: &MessagingContext) -> Option<String> {
    match &context.entity {
        Some(ContextEntity::In(row)) => row.pmode_id.clone(),
        Some(ContextEntity::Out(row)) => row.pmode_id.clone(),
        Some(ContextEntity::Exception(record)) => record.pmode_id.clone(),
        Some(ContextEntity::Retry(record)) => record.pmode_id.clone(),
        None => None,
    }
}
