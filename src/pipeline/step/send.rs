//! Pushes the outgoing message to the partner and picks up whatever signal
//! the partner answers with on the same connection.

use crate::app_context::AppContext;
use crate::model::{Operation, OutStatus};
use crate::pipeline::context::{ContextEntity, ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::retry::{load_or_create, register_failure};
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::reliability::{ReliabilityState, RetryDecision, RetryRecord, RetryType};
use crate::store::OutMessageUpdate;
use crate::telemetry::runtime_counters;
use crate::transport::sender::DEFAULT_SEND_TIMEOUT;
use async_trait::async_trait;

pub struct SendMessage;

#[async_trait]
impl Step for SendMessage {
    fn name(&self) -> &str {
        "send_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let pmode = context.require_sending_pmode()?.clone();
        let Some(url) = pmode.push_url().map(str::to_string) else {
            return Ok(StepResult::Failed(ProcessingError::configuration(format!(
                "sending pmode `{}` has no push url",
                pmode.id
            ))));
        };
        let message = context
            .outgoing()
            .ok_or(ContextError::Missing("message to send"))?;
        let message_id = message.primary_message_id().unwrap_or_default().to_string();
        let (content, content_type) = app.codecs().encode(message)?;

        let reliability = pmode.reception_awareness();
        let mut tracked: Option<RetryRecord> = None;
        if reliability.enabled && message.has_user_messages() {
            let mut record =
                load_or_create(app, RetryType::Send, &message_id, reliability, Some(&pmode.id))
                    .await?;
            if matches!(
                record.state,
                ReliabilityState::Pending | ReliabilityState::Sent
            ) {
                record.mark_sent(app.now())?;
                app.repository().upsert_retry(record.clone()).await?;
            }
            tracked = Some(record);
        }

        let timeout = pmode
            .push_configuration
            .as_ref()
            .and_then(|push| push.timeout)
            .unwrap_or(DEFAULT_SEND_TIMEOUT);
        tracing::debug!(message_id = %message_id, url = %url, bytes = content.len(), "sending message");

        let response = match app.sender().send(&url, content, &content_type, timeout).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(message_id = %message_id, url = %url, error = %err, "send failed");
                let Some(mut record) = tracked else {
                    return Ok(StepResult::Failed(
                        ProcessingError::transport(err.to_string()).referencing(message_id),
                    ));
                };
                return match register_failure(app, &mut record, &err.to_string()).await? {
                    RetryDecision::Scheduled { .. } => {
                        app.repository()
                            .update_out_message(
                                &message_id,
                                OutMessageUpdate::operation(Operation::ToBeRetried),
                                app.now(),
                            )
                            .await?;
                        Ok(StepResult::Stop)
                    }
                    RetryDecision::Exhausted => Ok(StepResult::Failed(
                        ProcessingError::transport(format!(
                            "giving up after {} attempts: {err}",
                            record.retry_count
                        ))
                        .referencing(message_id),
                    )),
                };
            }
        };

        if let Some(ContextEntity::Out(row)) = &context.entity {
            app.repository()
                .update_out_message(
                    &row.ebms_message_id,
                    OutMessageUpdate::status(OutStatus::Sent).with_operation(Operation::NotApplicable),
                    app.now(),
                )
                .await?;
        }
        runtime_counters().inc_messages_sent();
        tracing::info!(message_id = %message_id, url = %url, status = response.status, "message sent");

        let reply = if response.has_content() {
            let reply_type = response.content_type.as_deref().unwrap_or(&content_type);
            match app.codecs().decode(reply_type, &response.content) {
                Ok(reply) => Some(reply),
                Err(err) => {
                    tracing::warn!(
                        message_id = %message_id,
                        error = %err,
                        "partner reply could not be decoded; ignoring it"
                    );
                    None
                }
            }
        } else {
            None
        };

        let sent = if context.response.is_some() {
            context.response.take()
        } else {
            context.as4_message.take()
        };
        context.outbound = sent;
        context.as4_message = reply;
        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        As4Message, CollaborationInfo, MessageInfo, MessageType, MessageUnit, OutMessage, Party,
        Receipt, Service, UserMessage,
    };
    use crate::pipeline::failure::FailureCategory;
    use crate::pmode::{PushConfiguration, SendingPMode};
    use crate::transport::sender::{MessageSender, SenderResponse};
    use crate::transport::TransportError;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct ScriptedSender {
        replies: Mutex<Vec<Result<SenderResponse, TransportError>>>,
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        async fn send(
            &self,
            url: &str,
            _content: Vec<u8>,
            _content_type: &str,
            _timeout: Duration,
        ) -> Result<SenderResponse, TransportError> {
            self.replies.lock().unwrap().pop().unwrap_or_else(|| {
                Err(TransportError::Unavailable(url.to_string()))
            })
        }
    }

    fn pmode() -> Arc<SendingPMode> {
        let mut pmode = SendingPMode::new("pm-1");
        pmode.push_configuration = Some(PushConfiguration {
            url: "http://partner.test/as4".into(),
            timeout: None,
        });
        pmode.reliability.reception_awareness.enabled = true;
        pmode.reliability.reception_awareness.retry_count = 3;
        pmode.reliability.reception_awareness.retry_interval = Duration::from_secs(1);
        Arc::new(pmode)
    }

    async fn context(app: &AppContext) -> MessagingContext {
        let message = As4Message::single(MessageUnit::User(UserMessage {
            info: MessageInfo::new("m-1", Utc::now()),
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
        let (body, content_type) = app.codecs().encode(&message).unwrap();
        let mut row = OutMessage::new("m-1", MessageType::UserMessage, content_type, body, app.now());
        row.pmode_id = Some("pm-1".into());
        app.repository().insert_out_message(row.clone()).await.unwrap();

        let mut context = MessagingContext::from_message(message).with_entity(ContextEntity::Out(row));
        context.set_sending_pmode(pmode()).unwrap();
        context
    }

    #[tokio::test]
    async fn reply_replaces_the_sent_message() {
        let probe = AppContext::builder().build();
        let receipt = As4Message::single(MessageUnit::Receipt(Receipt {
            info: MessageInfo::new("r-1", Utc::now()).referencing("m-1"),
            non_repudiation: Vec::new(),
        }));
        let (content, content_type) = probe.codecs().encode(&receipt).unwrap();
        let app = AppContext::builder()
            .sender(Arc::new(ScriptedSender {
                replies: Mutex::new(vec![Ok(SenderResponse {
                    status: 200,
                    content,
                    content_type: Some(content_type),
                })]),
            }))
            .build();
        let mut context = context(&app).await;

        assert_eq!(
            SendMessage.execute(&mut context, &app).await.unwrap(),
            StepResult::Continue
        );
        assert_eq!(context.as4_message, Some(receipt));
        assert_eq!(
            context.outbound.as_ref().and_then(|sent| sent.primary_message_id()),
            Some("m-1")
        );
        let row = app.repository().get_out_message("m-1").await.unwrap().unwrap();
        assert_eq!(row.status, OutStatus::Sent);
        let record = app.repository().get_retry("send:m-1").await.unwrap().unwrap();
        assert_eq!(record.state, ReliabilityState::Sent);
    }

    #[tokio::test]
    async fn transport_failure_schedules_a_retry() {
        let app = AppContext::builder()
            .sender(Arc::new(ScriptedSender {
                replies: Mutex::new(Vec::new()),
            }))
            .build();
        let mut context = context(&app).await;

        assert_eq!(
            SendMessage.execute(&mut context, &app).await.unwrap(),
            StepResult::Stop
        );
        let row = app.repository().get_out_message("m-1").await.unwrap().unwrap();
        assert_eq!(row.operation, Operation::ToBeRetried);
        assert_eq!(row.status, OutStatus::Submitted);
        let record = app.repository().get_retry("send:m-1").await.unwrap().unwrap();
        assert_eq!(record.state, ReliabilityState::RetryScheduled);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn missing_push_url_is_a_configuration_failure() {
        let app = AppContext::builder().build();
        let mut context = MessagingContext::new();
        context.set_sending_pmode(Arc::new(SendingPMode::new("bare"))).unwrap();
        let result = SendMessage.execute(&mut context, &app).await.unwrap();
        assert!(matches!(
            result,
            StepResult::Failed(ref error) if error.category == FailureCategory::Configuration
        ));
    }
}
