//! Insert-if-absent of received user messages (duplicate elimination) and the
//! follow-up update once the message has been processed.

use crate::app_context::AppContext;
use crate::model::{InMessage, MessageType, Operation};
use crate::pipeline::context::MessagingContext;
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::store::{InMessageUpdate, InsertOutcome};
use crate::telemetry::runtime_counters;
use async_trait::async_trait;

/// Stores every user message of the received bundle. Ids that were already
/// stored are recorded as duplicates on the context; they still get a receipt
/// but are never handed to the business application again.
pub struct SaveReceivedMessage;

#[async_trait]
impl Step for SaveReceivedMessage {
    fn name(&self) -> &str {
        "save_received_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        save_user_messages(context, app).await?;
        Ok(StepResult::Continue)
    }
}

pub(crate) async fn save_user_messages(
    context: &mut MessagingContext,
    app: &AppContext,
) -> Result<(), StepError> {
    let message = context.require_message()?;
    if !message.has_user_messages() {
        return Ok(());
    }

    let (body, content_type) = match context.received() {
        Some(received) if !received.content.is_empty() && !context.pulled => {
            (received.content.clone(), received.content_type.clone())
        }
        _ => app.codecs().encode(message)?,
    };

    let now = app.now();
    let mut duplicates = Vec::new();
    for user in message.user_messages() {
        let mut row = InMessage::new(
            user.info.message_id.clone(),
            MessageType::UserMessage,
            content_type.clone(),
            body.clone(),
            now,
        );
        row.ref_to_message_id = user.info.ref_to_message_id.clone();
        row.mpc = user.mpc.clone();

        match app.repository().insert_in_message(row).await? {
            InsertOutcome::Inserted => {
                runtime_counters().inc_messages_received();
                tracing::debug!(message_id = %user.info.message_id, "user message stored");
            }
            InsertOutcome::Existing(existing) => {
                runtime_counters().inc_duplicates_detected();
                tracing::info!(
                    message_id = %user.info.message_id,
                    status = %existing.status,
                    "duplicate user message; it will not be delivered again"
                );
                duplicates.push(user.info.message_id.clone());
            }
        }
    }
    context.duplicates.extend(duplicates);
    Ok(())
}

/// Records the resolved PMode and the processed message body, and queues
/// first-time user messages for delivery when the PMode delivers at all.
pub struct UpdateReceivedMessage;

#[async_trait]
impl Step for UpdateReceivedMessage {
    fn name(&self) -> &str {
        "update_received_message"
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
        let pmode = context.receiving_pmode();
        let operation = if pmode.and_then(|pmode| pmode.deliver_method()).is_some() {
            Operation::ToBeDelivered
        } else {
            Operation::NotApplicable
        };
        let (body, content_type) = app.codecs().encode(message)?;

        let now = app.now();
        for user in message.user_messages() {
            let id = &user.info.message_id;
            if context.is_duplicate(id) {
                continue;
            }
            let mut update = InMessageUpdate::operation(operation)
                .with_body(content_type.clone(), body.clone());
            update.pmode_id = pmode.map(|pmode| pmode.id.clone());
            app.repository().update_in_message(id, update, now).await?;
            tracing::debug!(message_id = %id, operation = %operation, "received message updated");
        }
        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReceivedMessage;
    use crate::model::{
        As4Message, CollaborationInfo, MessageInfo, MessageUnit, Party, Service, UserMessage,
    };
    use crate::pmode::{Method, ReceivingPMode};
    use chrono::Utc;
    use std::sync::Arc;

    fn received(id: &str, app: &AppContext) -> MessagingContext {
        let message = As4Message::single(MessageUnit::User(UserMessage {
            info: MessageInfo::new(id, Utc::now()),
            mpc: None,
            from: Party::new("sender", "org:a"),
            to: Party::new("receiver", "org:b"),
            collaboration: CollaborationInfo {
                service: Service::new("urn:svc"),
                action: "Deliver".into(),
                ..CollaborationInfo::default()
            },
            message_properties: Default::default(),
            payload_info: Vec::new(),
        }));
        let (content, content_type) = app.codecs().encode(&message).unwrap();
        let mut context =
            MessagingContext::from_received(ReceivedMessage::new(content, content_type));
        context.as4_message = Some(message);
        context
    }

    #[tokio::test]
    async fn second_copy_is_flagged_as_duplicate() {
        let app = AppContext::builder().build();
        let mut first = received("m-1", &app);
        SaveReceivedMessage.execute(&mut first, &app).await.unwrap();
        assert!(first.duplicates.is_empty());

        let mut second = received("m-1", &app);
        SaveReceivedMessage.execute(&mut second, &app).await.unwrap();
        assert!(second.is_duplicate("m-1"));
    }

    #[tokio::test]
    async fn update_queues_delivery_only_for_first_copies() {
        let app = AppContext::builder().build();
        let mut pmode = ReceivingPMode::new("rp-1");
        pmode.message_handling.deliver.enabled = true;
        pmode.message_handling.deliver.method = Some(Method::new("FILE"));
        let pmode = Arc::new(pmode);

        let mut first = received("m-1", &app);
        first.set_receiving_pmode(pmode.clone()).unwrap();
        SaveReceivedMessage.execute(&mut first, &app).await.unwrap();
        UpdateReceivedMessage.execute(&mut first, &app).await.unwrap();

        let row = app.repository().get_in_message("m-1").await.unwrap().unwrap();
        assert_eq!(row.operation, Operation::ToBeDelivered);
        assert_eq!(row.pmode_id.as_deref(), Some("rp-1"));

        app.repository()
            .update_in_message(
                "m-1",
                InMessageUpdate::operation(Operation::Delivered),
                app.now(),
            )
            .await
            .unwrap();
        let mut second = received("m-1", &app);
        second.set_receiving_pmode(pmode).unwrap();
        SaveReceivedMessage.execute(&mut second, &app).await.unwrap();
        UpdateReceivedMessage.execute(&mut second, &app).await.unwrap();
        let row = app.repository().get_in_message("m-1").await.unwrap().unwrap();
        assert_eq!(row.operation, Operation::Delivered);
    }
}
