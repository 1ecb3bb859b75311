use crate::app_context::AppContext;
use crate::domain::{MessageOrigin, ReceivedMessage};
use crate::model::{
    new_message_id, As4Message, MessageInfo, MessageUnit, PullRequest, SubmitMessage, DEFAULT_MPC,
};
use crate::pipeline::context::MessagingContext;
use crate::transformer::{TransformError, Transformer};
use async_trait::async_trait;

/// Business submit messages arrive as JSON.
pub struct SubmitTransformer;

#[async_trait]
impl Transformer for SubmitTransformer {
    fn name(&self) -> &str {
        "submit"
    }

    async fn transform(
        &self,
        received: ReceivedMessage,
        _app: &AppContext,
    ) -> Result<MessagingContext, TransformError> {
        let submit: SubmitMessage = serde_json::from_slice(&received.content)?;
        if submit.collaboration.pmode_id.trim().is_empty() {
            return Err(TransformError::Invalid(
                "submit message names no pmode".to_string(),
            ));
        }
        Ok(MessagingContext::from_submit(received, submit))
    }
}

/// Decodes an AS4 message with the codec registered for its content type.
pub struct As4Transformer;

#[async_trait]
impl Transformer for As4Transformer {
    fn name(&self) -> &str {
        "as4"
    }

    async fn transform(
        &self,
        received: ReceivedMessage,
        app: &AppContext,
    ) -> Result<MessagingContext, TransformError> {
        let message = app
            .codecs()
            .decode(&received.content_type, &received.content)?;
        let mut context = MessagingContext::from_received(received);
        context.as4_message = Some(message);
        Ok(context)
    }
}

/// Builds the pull request a pull schedule fired for.
pub struct PullRequestTransformer;

#[async_trait]
impl Transformer for PullRequestTransformer {
    fn name(&self) -> &str {
        "pull_request"
    }

    async fn transform(
        &self,
        received: ReceivedMessage,
        app: &AppContext,
    ) -> Result<MessagingContext, TransformError> {
        let MessageOrigin::PullSchedule { pmode_id } = &received.origin else {
            return Err(TransformError::UnexpectedOrigin {
                transformer: "pull_request",
                origin: received.origin.to_string(),
            });
        };
        let pmode = app
            .pmodes()
            .get_sending_pmode(pmode_id)
            .ok_or_else(|| TransformError::NotFound {
                entity: "sending pmode",
                id: pmode_id.clone(),
            })?;
        let mpc = pmode
            .message_packaging
            .mpc
            .clone()
            .unwrap_or_else(|| DEFAULT_MPC.to_string());

        let pull = As4Message::single(MessageUnit::PullRequest(PullRequest {
            info: MessageInfo::new(new_message_id(), app.now()),
            mpc,
        }));
        let mut context = MessagingContext::from_received(received);
        context.as4_message = Some(pull);
        context.set_sending_pmode(pmode)?;
        Ok(context)
    }
}
