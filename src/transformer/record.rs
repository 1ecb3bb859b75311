use crate::app_context::AppContext;
use crate::domain::{MessageOrigin, ReceivedMessage};
use crate::model::{
    As4Message, DeliverMessage, DeliverPayload, Direction, ExceptionRecord, InMessage,
    MessageInfo, MessageUnit, NotifyMessage, NotifyStatus, MIME_TYPE_PROPERTY,
};
use crate::pipeline::context::{BusinessPayload, ContextEntity, MessagingContext};
use crate::pmode::{ReceivingPMode, SendingPMode};
use crate::reliability::RetryType;
use crate::transformer::{TransformError, Transformer};
use async_trait::async_trait;
use std::sync::Arc;

fn unexpected(transformer: &'static str, received: &ReceivedMessage) -> TransformError {
    TransformError::UnexpectedOrigin {
        transformer,
        origin: received.origin.to_string(),
    }
}

fn sending_pmode_of(
    app: &AppContext,
    pmode_id: Option<&str>,
) -> Result<Arc<SendingPMode>, TransformError> {
    let id = pmode_id.unwrap_or_default();
    app.pmodes()
        .get_sending_pmode(id)
        .ok_or_else(|| TransformError::NotFound {
            entity: "sending pmode",
            id: id.to_string(),
        })
}

fn receiving_pmode_of(
    app: &AppContext,
    pmode_id: Option<&str>,
) -> Result<Arc<ReceivingPMode>, TransformError> {
    let id = pmode_id.unwrap_or_default();
    app.pmodes()
        .snapshot()
        .receiving_pmode(id)
        .ok_or_else(|| TransformError::NotFound {
            entity: "receiving pmode",
            id: id.to_string(),
        })
}

async fn load_in_message(
    app: &AppContext,
    ebms_message_id: &str,
) -> Result<InMessage, TransformError> {
    app.repository()
        .get_in_message(ebms_message_id)
        .await?
        .ok_or_else(|| TransformError::NotFound {
            entity: "in message",
            id: ebms_message_id.to_string(),
        })
}

/// Loads a claimed out message together with its sending PMode.
pub struct OutMessageTransformer;

#[async_trait]
impl Transformer for OutMessageTransformer {
    fn name(&self) -> &str {
        "out_message"
    }

    async fn transform(
        &self,
        received: ReceivedMessage,
        app: &AppContext,
    ) -> Result<MessagingContext, TransformError> {
        let MessageOrigin::OutMessage { ebms_message_id } = &received.origin else {
            return Err(unexpected("out_message", &received));
        };
        let row = app
            .repository()
            .get_out_message(ebms_message_id)
            .await?
            .ok_or_else(|| TransformError::NotFound {
                entity: "out message",
                id: ebms_message_id.clone(),
            })?;
        let message = app.codecs().decode(&row.content_type, &row.body)?;
        let pmode = sending_pmode_of(app, row.pmode_id.as_deref())?;

        let mut context = MessagingContext::from_received(received).with_entity(ContextEntity::Out(row));
        context.as4_message = Some(message);
        context.set_sending_pmode(pmode)?;
        Ok(context)
    }
}

/// Builds the business-facing view of a stored user message.
pub struct DeliverTransformer;

#[async_trait]
impl Transformer for DeliverTransformer {
    fn name(&self) -> &str {
        "deliver"
    }

    async fn transform(
        &self,
        received: ReceivedMessage,
        app: &AppContext,
    ) -> Result<MessagingContext, TransformError> {
        let MessageOrigin::InMessage { ebms_message_id } = &received.origin else {
            return Err(unexpected("deliver", &received));
        };
        let row = load_in_message(app, ebms_message_id).await?;
        let message = app.codecs().decode(&row.content_type, &row.body)?;
        let deliver = deliver_message(&message, &row)?;
        let pmode = receiving_pmode_of(app, row.pmode_id.as_deref())?;

        let mut context = MessagingContext::from_received(received).with_entity(ContextEntity::In(row));
        context.as4_message = Some(message);
        context.set_payload(BusinessPayload::Deliver(deliver));
        context.set_receiving_pmode(pmode)?;
        Ok(context)
    }
}

fn deliver_message(message: &As4Message, row: &InMessage) -> Result<DeliverMessage, TransformError> {
    let user = message
        .user_messages()
        .find(|user| user.info.message_id == row.ebms_message_id)
        .ok_or_else(|| {
            TransformError::Invalid(format!(
                "stored message `{}` holds no such user message",
                row.ebms_message_id
            ))
        })?;
    let payloads = user
        .payload_info
        .iter()
        .map(|part| {
            let id = part.content_id().unwrap_or(&part.href).to_string();
            let mime_type = part
                .properties
                .get(MIME_TYPE_PROPERTY)
                .cloned()
                .or_else(|| message.attachment(&id).map(|a| a.content_type.clone()))
                .unwrap_or_else(|| "application/octet-stream".to_string());
            DeliverPayload {
                id,
                mime_type,
                properties: part.properties.clone(),
            }
        })
        .collect();
    Ok(DeliverMessage {
        message_info: user.info.clone(),
        pmode_id: row.pmode_id.clone(),
        from: user.from.clone(),
        to: user.to.clone(),
        collaboration: user.collaboration.clone(),
        message_properties: user.message_properties.clone(),
        payloads,
    })
}

/// Notifications are raised for stored signals and for exception records.
pub struct NotifyTransformer;

#[async_trait]
impl Transformer for NotifyTransformer {
    fn name(&self) -> &str {
        "notify"
    }

    async fn transform(
        &self,
        received: ReceivedMessage,
        app: &AppContext,
    ) -> Result<MessagingContext, TransformError> {
        match &received.origin {
            MessageOrigin::InMessage { ebms_message_id } => {
                let row = load_in_message(app, ebms_message_id).await?;
                let message = app.codecs().decode(&row.content_type, &row.body)?;
                let notify = signal_notification(&message, &row)?;
                let pmode = sending_pmode_of(app, row.pmode_id.as_deref())?;

                let mut context =
                    MessagingContext::from_received(received).with_entity(ContextEntity::In(row));
                context.as4_message = Some(message);
                context.set_payload(BusinessPayload::Notify(notify));
                context.set_sending_pmode(pmode)?;
                Ok(context)
            }
            MessageOrigin::Exception { id } => {
                let record = app
                    .repository()
                    .get_exception(id)
                    .await?
                    .ok_or_else(|| TransformError::NotFound {
                        entity: "exception",
                        id: id.clone(),
                    })?;
                let notify = exception_notification(&record);
                let mut context = MessagingContext::from_received(received);
                match record.direction {
                    Direction::Out => {
                        context.set_sending_pmode(sending_pmode_of(app, record.pmode_id.as_deref())?)?
                    }
                    Direction::In => context
                        .set_receiving_pmode(receiving_pmode_of(app, record.pmode_id.as_deref())?)?,
                }
                context.set_payload(BusinessPayload::Notify(notify));
                Ok(context.with_entity(ContextEntity::Exception(record)))
            }
            _ => Err(unexpected("notify", &received)),
        }
    }
}

fn signal_notification(message: &As4Message, row: &InMessage) -> Result<NotifyMessage, TransformError> {
    let unit = message
        .units
        .iter()
        .find(|unit| unit.message_id() == row.ebms_message_id)
        .ok_or_else(|| {
            TransformError::Invalid(format!(
                "stored signal `{}` holds no such unit",
                row.ebms_message_id
            ))
        })?;
    let (status, description) = match unit {
        MessageUnit::Receipt(_) => (NotifyStatus::Delivered, None),
        MessageUnit::Error(error) => {
            let description = error
                .errors
                .iter()
                .map(|detail| format!("{}: {}", detail.code, detail.detail))
                .collect::<Vec<_>>()
                .join("; ");
            (NotifyStatus::Error, Some(description))
        }
        _ => {
            return Err(TransformError::Invalid(format!(
                "`{}` is not a signal",
                row.ebms_message_id
            )))
        }
    };
    Ok(NotifyMessage {
        message_info: unit.info().clone(),
        status,
        pmode_id: row.pmode_id.clone(),
        description,
    })
}

fn exception_notification(record: &ExceptionRecord) -> NotifyMessage {
    let message_id = record
        .ebms_ref_to_message_id
        .clone()
        .unwrap_or_else(|| record.id.clone());
    NotifyMessage {
        message_info: MessageInfo::new(message_id, record.insertion_time),
        status: NotifyStatus::Exception,
        pmode_id: record.pmode_id.clone(),
        description: Some(record.exception.clone()),
    }
}

/// Loads a due retry record. The PMode is attached when it still exists so
/// that the exception raised for an exhausted record can be notified.
pub struct RetryTransformer;

#[async_trait]
impl Transformer for RetryTransformer {
    fn name(&self) -> &str {
        "retry"
    }

    async fn transform(
        &self,
        received: ReceivedMessage,
        app: &AppContext,
    ) -> Result<MessagingContext, TransformError> {
        let MessageOrigin::RetryRecord { key } = &received.origin else {
            return Err(unexpected("retry", &received));
        };
        let record = app
            .repository()
            .get_retry(key)
            .await?
            .ok_or_else(|| TransformError::NotFound {
                entity: "retry record",
                id: key.clone(),
            })?;

        let mut context = MessagingContext::from_received(received);
        let pmode_id = record.pmode_id.as_deref();
        match record.retry_type {
            RetryType::Send => {
                if let Ok(pmode) = sending_pmode_of(app, pmode_id) {
                    context.set_sending_pmode(pmode)?;
                }
            }
            RetryType::Delivery => {
                if let Ok(pmode) = receiving_pmode_of(app, pmode_id) {
                    context.set_receiving_pmode(pmode)?;
                }
            }
            RetryType::Notification => {}
        }
        Ok(context.with_entity(ContextEntity::Retry(record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Attachment, CollaborationInfo, ErrorCode, ErrorDetail, ErrorSignal, MessageType, PartInfo,
        Party, Service, UserMessage,
    };
    use crate::pmode::{PModeSnapshot, PModeStore};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn app() -> Arc<AppContext> {
        AppContext::builder()
            .pmodes(Arc::new(PModeStore::new(PModeSnapshot::new(
                vec![SendingPMode::new("pm-1")],
                vec![ReceivingPMode::new("rp-1")],
            ))))
            .build()
    }

    #[tokio::test]
    async fn deliver_message_lists_payloads_with_their_mime_types() {
        let app = app();
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
            message_properties: BTreeMap::new(),
            payload_info: vec![PartInfo {
                href: "cid:doc".into(),
                properties: BTreeMap::new(),
            }],
        }))
        .with_attachments(vec![Attachment {
            content_id: "doc".into(),
            content_type: "application/xml".into(),
            content: b"<doc/>".to_vec(),
            properties: BTreeMap::new(),
        }]);
        let (body, content_type) = app.codecs().encode(&message).unwrap();
        let mut row = InMessage::new("m-1", MessageType::UserMessage, content_type, body, app.now());
        row.pmode_id = Some("rp-1".into());
        app.repository().insert_in_message(row).await.unwrap();

        let received = ReceivedMessage::new(Vec::new(), "application/as4+json").with_origin(
            MessageOrigin::InMessage {
                ebms_message_id: "m-1".into(),
            },
        );
        let context = DeliverTransformer.transform(received, &app).await.unwrap();
        let deliver = context.deliver_message().unwrap();
        assert_eq!(deliver.payloads.len(), 1);
        assert_eq!(deliver.payloads[0].id, "doc");
        assert_eq!(deliver.payloads[0].mime_type, "application/xml");
        assert_eq!(context.receiving_pmode().unwrap().id, "rp-1");
    }

    #[tokio::test]
    async fn error_signal_becomes_an_error_notification() {
        let app = app();
        let signal = As4Message::single(MessageUnit::Error(ErrorSignal {
            info: MessageInfo::new("e-1", Utc::now()).referencing("m-1"),
            errors: vec![ErrorDetail::new(ErrorCode::DeliveryFailure, "backend down")],
        }));
        let (body, content_type) = app.codecs().encode(&signal).unwrap();
        let mut row = InMessage::new("e-1", MessageType::Error, content_type, body, app.now());
        row.pmode_id = Some("pm-1".into());
        app.repository().insert_in_message(row).await.unwrap();

        let received = ReceivedMessage::new(Vec::new(), "application/as4+json").with_origin(
            MessageOrigin::InMessage {
                ebms_message_id: "e-1".into(),
            },
        );
        let context = NotifyTransformer.transform(received, &app).await.unwrap();
        let notify = context.notify_message().unwrap();
        assert_eq!(notify.status, NotifyStatus::Error);
        assert_eq!(notify.message_info.ref_to_message_id.as_deref(), Some("m-1"));
        assert!(notify.description.as_deref().unwrap().contains("backend down"));
    }

    #[tokio::test]
    async fn wrong_origin_is_reported() {
        let app = app();
        let received = ReceivedMessage::new(Vec::new(), "application/as4+json");
        let err = OutMessageTransformer.transform(received, &app).await.unwrap_err();
        assert!(matches!(err, TransformError::UnexpectedOrigin { .. }));
    }
}
