//! Submit side: turning a business submit message into a stored user message.

use crate::app_context::AppContext;
use crate::model::{
    new_message_id, AgreementReference, As4Message, Attachment, CollaborationInfo, ErrorCode,
    MessageInfo, MessageType, MessageUnit, OutMessage, PartInfo, SubmitMessage, SubmitPayload,
    UserMessage, MIME_TYPE_PROPERTY,
};
use crate::pipeline::context::{ContextEntity, ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::pmode::SendingPMode;
use crate::store::InsertOutcome;
use crate::telemetry::runtime_counters;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use std::path::PathBuf;

const DEFAULT_CONVERSATION_ID: &str = "1";
const FILE_SCHEME: &str = "file://";

pub struct CreateUserMessage;

#[async_trait]
impl Step for CreateUserMessage {
    fn name(&self) -> &str {
        "create_user_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let submit = context
            .submit_message()
            .ok_or(ContextError::Missing("submit message"))?
            .clone();
        let pmode = context.require_sending_pmode()?.clone();
        let message_id = submit
            .message_info
            .message_id
            .clone()
            .unwrap_or_else(new_message_id);

        let user = match build_user_message(&submit, &pmode, &message_id, app) {
            Ok(user) => user,
            Err(error) => return Ok(StepResult::Failed(error.referencing(message_id))),
        };

        let mut attachments = Vec::with_capacity(submit.payloads.len());
        for payload in &submit.payloads {
            match load_payload(payload).await {
                Ok(attachment) => attachments.push(attachment),
                Err(error) => return Ok(StepResult::Failed(error.referencing(message_id))),
            }
        }

        tracing::debug!(
            message_id = %message_id,
            pmode = %pmode.id,
            payloads = attachments.len(),
            "user message created"
        );
        context.as4_message =
            Some(As4Message::single(MessageUnit::User(user)).with_attachments(attachments));
        Ok(StepResult::Continue)
    }
}

fn build_user_message(
    submit: &SubmitMessage,
    pmode: &SendingPMode,
    message_id: &str,
    app: &AppContext,
) -> Result<UserMessage, ProcessingError> {
    let packaging = &pmode.message_packaging;
    let missing = |what: &str| {
        ProcessingError::configuration(format!(
            "neither the submit message nor pmode `{}` provides the {what}",
            pmode.id
        ))
        .with_code(ErrorCode::ValueNotRecognized)
    };

    let from = submit
        .parties
        .from
        .clone()
        .or_else(|| packaging.party_info.from.clone())
        .ok_or_else(|| missing("from party"))?;
    let to = submit
        .parties
        .to
        .clone()
        .or_else(|| packaging.party_info.to.clone())
        .ok_or_else(|| missing("to party"))?;
    let service = submit
        .collaboration
        .service
        .clone()
        .or_else(|| packaging.collaboration.service.clone())
        .ok_or_else(|| missing("service"))?;
    let action = submit
        .collaboration
        .action
        .clone()
        .or_else(|| packaging.collaboration.action.clone())
        .ok_or_else(|| missing("action"))?;

    let mut message_properties = packaging.message_properties.clone();
    message_properties.extend(submit.message_properties.clone());

    let mut info = MessageInfo::new(message_id, app.now());
    info.ref_to_message_id = submit.message_info.ref_to_message_id.clone();

    let payload_info = submit
        .payloads
        .iter()
        .map(|payload| {
            let mut properties = payload.properties.clone();
            properties.insert(MIME_TYPE_PROPERTY.to_string(), payload.mime_type.clone());
            PartInfo {
                href: format!("cid:{}", payload.id),
                properties,
            }
        })
        .collect();

    Ok(UserMessage {
        info,
        mpc: submit
            .message_info
            .mpc
            .clone()
            .or_else(|| packaging.mpc.clone()),
        from,
        to,
        collaboration: CollaborationInfo {
            agreement: AgreementReference {
                value: submit
                    .collaboration
                    .agreement
                    .clone()
                    .or_else(|| packaging.collaboration.agreement.clone()),
                pmode_id: Some(pmode.id.clone()),
            },
            service,
            action,
            conversation_id: submit
                .collaboration
                .conversation_id
                .clone()
                .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string()),
        },
        message_properties,
        payload_info,
    })
}

/// Inline base64 content wins over a location; locations must be `file://`.
async fn load_payload(payload: &SubmitPayload) -> Result<Attachment, ProcessingError> {
    let payload_error = |detail: String| {
        ProcessingError::transform(format!("payload `{}`: {detail}", payload.id))
            .with_code(ErrorCode::ExternalPayloadError)
    };

    let content = match (&payload.content, &payload.location) {
        (Some(encoded), _) => BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|err| payload_error(format!("invalid base64 content: {err}")))?,
        (None, Some(location)) => {
            let Some(path) = location.strip_prefix(FILE_SCHEME) else {
                return Err(payload_error(format!(
                    "unsupported location `{location}`, only file:// is retrievable"
                )));
            };
            let path = PathBuf::from(path);
            tokio::fs::read(&path)
                .await
                .map_err(|err| payload_error(format!("cannot read `{}`: {err}", path.display())))?
        }
        (None, None) => return Err(payload_error("no content and no location".to_string())),
    };

    let mut properties = payload.properties.clone();
    properties.insert(MIME_TYPE_PROPERTY.to_string(), payload.mime_type.clone());
    Ok(Attachment {
        content_id: payload.id.clone(),
        content_type: payload.mime_type.clone(),
        content,
        properties,
    })
}

/// Persists the created message as an OutMessage waiting to be sent.
///
/// A message id already stored under another PMode is rejected; the same
/// submission arriving twice is acknowledged and dropped.
pub struct StoreOutMessage;

#[async_trait]
impl Step for StoreOutMessage {
    fn name(&self) -> &str {
        "store_out_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let pmode = context.require_sending_pmode()?.clone();
        let message = context.require_message()?;
        let user = message
            .first_user_message()
            .ok_or(ContextError::Missing("user message"))?;
        let message_id = user.info.message_id.clone();
        let (body, content_type) = app.codecs().encode(message)?;

        let mut row = OutMessage::new(
            message_id.clone(),
            MessageType::UserMessage,
            content_type,
            body,
            app.now(),
        );
        row.ref_to_message_id = user.info.ref_to_message_id.clone();
        row.pmode_id = Some(pmode.id.clone());
        row.mep = pmode.mep_binding;
        row.mpc = user.mpc.clone();

        match app.repository().insert_out_message(row.clone()).await? {
            InsertOutcome::Inserted => {
                runtime_counters().inc_messages_submitted();
                tracing::info!(
                    message_id = %message_id,
                    pmode = %pmode.id,
                    mep = %row.mep,
                    "out message stored"
                );
                context.entity = Some(ContextEntity::Out(row));
                Ok(StepResult::Continue)
            }
            InsertOutcome::Existing(existing) => {
                runtime_counters().inc_duplicates_detected();
                if existing.pmode_id.as_deref() != Some(pmode.id.as_str()) {
                    return Ok(StepResult::Failed(
                        ProcessingError::duplicate(format!(
                            "message `{message_id}` was already submitted with pmode `{}`",
                            existing.pmode_id.as_deref().unwrap_or("<none>")
                        ))
                        .with_code(ErrorCode::ValueInconsistent)
                        .referencing(message_id),
                    ));
                }
                tracing::info!(message_id = %message_id, "duplicate submission ignored");
                Ok(StepResult::Stop)
            }
        }
    }
}
