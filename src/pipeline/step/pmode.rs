//! PMode lookup on the sending side, PMode matching on the receiving side, and
//! the structural checks every received bundle has to pass.

use crate::app_context::AppContext;
use crate::model::{ErrorCode, Party, Service, SubmitMessage};
use crate::pipeline::context::{ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::pmode::{resolve_receiving_pmode, SendingPMode};
use async_trait::async_trait;
use std::sync::Arc;

/// Looks up the sending PMode a submit message names and enforces its
/// override rules.
pub struct RetrieveSendingPMode;

#[async_trait]
impl Step for RetrieveSendingPMode {
    fn name(&self) -> &str {
        "retrieve_sending_pmode"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let submit = context
            .submit_message()
            .ok_or(ContextError::Missing("submit message"))?;
        let pmode_id = submit.collaboration.pmode_id.trim();
        if pmode_id.is_empty() {
            return Ok(StepResult::Failed(
                ProcessingError::configuration("submit message names no pmode")
                    .with_code(ErrorCode::ProcessingModeMismatch),
            ));
        }

        let Some(pmode) = app.pmodes().get_sending_pmode(pmode_id) else {
            return Ok(StepResult::Failed(
                ProcessingError::configuration(format!("no sending pmode `{pmode_id}`"))
                    .with_code(ErrorCode::ProcessingModeMismatch),
            ));
        };

        if !pmode.allow_override {
            let overridden = overridden_fields(submit, &pmode);
            if !overridden.is_empty() {
                let mut error = ProcessingError::configuration(format!(
                    "submit message overrides {} but pmode `{}` does not allow override",
                    overridden.join(", "),
                    pmode.id
                ))
                .with_code(ErrorCode::ProcessingModeMismatch);
                if let Some(id) = submit.message_info.message_id.as_deref() {
                    error = error.referencing(id);
                }
                return Ok(StepResult::Failed(error));
            }
        }

        context.set_sending_pmode(pmode)?;
        Ok(StepResult::Continue)
    }
}

/// Values the submit message sets that differ from what the PMode fixes.
/// A value only one side provides is a fill-in, not an override.
pub fn overridden_fields(submit: &SubmitMessage, pmode: &SendingPMode) -> Vec<&'static str> {
    let packaging = &pmode.message_packaging;
    let mut fields = Vec::new();

    if conflicts::<Party>(submit.parties.from.as_ref(), packaging.party_info.from.as_ref()) {
        fields.push("from party");
    }
    if conflicts::<Party>(submit.parties.to.as_ref(), packaging.party_info.to.as_ref()) {
        fields.push("to party");
    }
    if conflicts::<Service>(
        submit.collaboration.service.as_ref(),
        packaging.collaboration.service.as_ref(),
    ) {
        fields.push("service");
    }
    if conflicts::<String>(
        submit.collaboration.action.as_ref(),
        packaging.collaboration.action.as_ref(),
    ) {
        fields.push("action");
    }
    if conflicts::<String>(
        submit.collaboration.agreement.as_ref(),
        packaging.collaboration.agreement.as_ref(),
    ) {
        fields.push("agreement");
    }
    if conflicts::<String>(submit.message_info.mpc.as_ref(), packaging.mpc.as_ref()) {
        fields.push("mpc");
    }
    fields
}

fn conflicts<T: PartialEq>(submitted: Option<&T>, configured: Option<&T>) -> bool {
    matches!((submitted, configured), (Some(left), Some(right)) if left != right)
}

/// Matches every user message of a received bundle against the receiving
/// PModes. All units of one bundle must land on the same PMode.
pub struct DetermineReceivingPModes;

#[async_trait]
impl Step for DetermineReceivingPModes {
    fn name(&self) -> &str {
        "determine_pmodes"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let message = context.require_message()?;
        let snapshot = app.pmodes().snapshot();

        let mut resolved: Option<Arc<crate::pmode::ReceivingPMode>> = None;
        for user in message.user_messages() {
            let pmode = match resolve_receiving_pmode(snapshot.receiving_pmodes(), user) {
                Ok(pmode) => pmode,
                Err(err) => {
                    return Ok(StepResult::Failed(
                        ProcessingError::configuration(err.to_string())
                            .with_code(ErrorCode::ProcessingModeMismatch)
                            .referencing(user.info.message_id.clone()),
                    ));
                }
            };
            match &resolved {
                Some(current) if current.id != pmode.id => {
                    return Ok(StepResult::Failed(
                        ProcessingError::transform(format!(
                            "user messages of one bundle match different pmodes (`{}`, `{}`)",
                            current.id, pmode.id
                        ))
                        .with_code(ErrorCode::ValueInconsistent)
                        .referencing(user.info.message_id.clone()),
                    ));
                }
                Some(_) => {}
                None => resolved = Some(pmode),
            }
        }

        if let Some(pmode) = resolved {
            tracing::debug!(pmode = %pmode.id, "receiving pmode resolved");
            context.set_receiving_pmode(pmode)?;
        }
        Ok(StepResult::Continue)
    }
}

/// Bundle rules plus the header fields every user message must carry. All
/// violations are reported together.
pub struct ValidateMessage;

#[async_trait]
impl Step for ValidateMessage {
    fn name(&self) -> &str {
        "validate_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let message = context.require_message()?;
        if let Err(err) = message.validate_bundle() {
            let mut error =
                ProcessingError::transform(err.to_string()).with_code(ErrorCode::ValueInconsistent);
            if let Some(id) = message.primary_message_id() {
                error = error.referencing(id);
            }
            return Ok(StepResult::Failed(error));
        }

        let mut violations = Vec::new();
        for user in message.user_messages() {
            let id = &user.info.message_id;
            if user.from.party_ids.is_empty() {
                violations.push(format!("`{id}`: from party has no party id"));
            }
            if user.to.party_ids.is_empty() {
                violations.push(format!("`{id}`: to party has no party id"));
            }
            if user.collaboration.service.value.trim().is_empty() {
                violations.push(format!("`{id}`: service is empty"));
            }
            if user.collaboration.action.trim().is_empty() {
                violations.push(format!("`{id}`: action is empty"));
            }
        }

        if violations.is_empty() {
            return Ok(StepResult::Continue);
        }
        let mut error = ProcessingError::transform(violations.join("; "))
            .with_code(ErrorCode::ValueNotRecognized);
        if let Some(id) = message.primary_message_id() {
            error = error.referencing(id);
        }
        Ok(StepResult::Failed(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        As4Message, CollaborationInfo, MessageInfo, MessageUnit, PartInfo, UserMessage,
    };
    use crate::pmode::{PModeSnapshot, PModeStore, ReceivingPMode};
    use chrono::Utc;

    fn app_with(sending: Vec<SendingPMode>, receiving: Vec<ReceivingPMode>) -> Arc<AppContext> {
        AppContext::builder()
            .pmodes(Arc::new(PModeStore::new(PModeSnapshot::new(sending, receiving))))
            .build()
    }

    fn user(id: &str, action: &str) -> UserMessage {
        UserMessage {
            info: MessageInfo::new(id, Utc::now()),
            mpc: None,
            from: Party::new("sender", "org:a"),
            to: Party::new("receiver", "org:b"),
            collaboration: CollaborationInfo {
                service: Service::new("urn:svc"),
                action: action.into(),
                ..CollaborationInfo::default()
            },
            message_properties: Default::default(),
            payload_info: Vec::new(),
        }
    }

    fn receiving(id: &str, action: &str) -> ReceivingPMode {
        let mut pmode = ReceivingPMode::new(id);
        pmode.message_packaging.collaboration.action = Some(action.into());
        pmode
    }

    #[tokio::test]
    async fn unknown_sending_pmode_is_a_configuration_failure() {
        let app = app_with(Vec::new(), Vec::new());
        let mut context = MessagingContext::new();
        context.set_payload(crate::pipeline::context::BusinessPayload::Submit(
            SubmitMessage::for_pmode("missing"),
        ));
        let result = RetrieveSendingPMode.execute(&mut context, &app).await.unwrap();
        let StepResult::Failed(error) = result else {
            panic!("expected a failure, got {result:?}");
        };
        assert_eq!(error.category, crate::pipeline::failure::FailureCategory::Configuration);
    }

    #[tokio::test]
    async fn override_is_rejected_unless_the_pmode_allows_it() {
        let mut pmode = SendingPMode::new("pm-1");
        pmode.message_packaging.collaboration.action = Some("Deliver".into());
        let app = app_with(vec![pmode.clone()], Vec::new());

        let mut submit = SubmitMessage::for_pmode("pm-1").with_message_id("m-1");
        submit.collaboration.action = Some("Other".into());
        let mut context = MessagingContext::new();
        context.set_payload(crate::pipeline::context::BusinessPayload::Submit(submit.clone()));
        let result = RetrieveSendingPMode.execute(&mut context, &app).await.unwrap();
        assert!(
            matches!(result, StepResult::Failed(ref error) if error.description.contains("action")),
            "{result:?}"
        );

        pmode.allow_override = true;
        let app = app_with(vec![pmode], Vec::new());
        let mut context = MessagingContext::new();
        context.set_payload(crate::pipeline::context::BusinessPayload::Submit(submit));
        let result = RetrieveSendingPMode.execute(&mut context, &app).await.unwrap();
        assert_eq!(result, StepResult::Continue);
        assert_eq!(context.pmode_id(), Some("pm-1"));
    }

    #[test]
    fn filling_in_a_missing_value_is_not_an_override() {
        let pmode = SendingPMode::new("pm-1");
        let mut submit = SubmitMessage::for_pmode("pm-1");
        submit.collaboration.action = Some("Deliver".into());
        submit.parties.from = Some(Party::new("sender", "org:a"));
        assert!(overridden_fields(&submit, &pmode).is_empty());
    }

    #[tokio::test]
    async fn ambiguous_receiving_match_fails_instead_of_picking_one() {
        let app = app_with(
            Vec::new(),
            vec![receiving("rp-1", "Deliver"), receiving("rp-2", "Deliver")],
        );
        let mut context =
            MessagingContext::from_message(As4Message::single(MessageUnit::User(user("m-1", "Deliver"))));
        let result = DetermineReceivingPModes
            .execute(&mut context, &app)
            .await
            .unwrap();
        let StepResult::Failed(error) = result else {
            panic!("expected a failure, got {result:?}");
        };
        assert_eq!(error.error_code(), ErrorCode::ProcessingModeMismatch);
        assert!(context.receiving_pmode().is_none());
    }

    #[tokio::test]
    async fn all_units_must_resolve_to_the_same_pmode() {
        let app = app_with(
            Vec::new(),
            vec![receiving("rp-1", "Deliver"), receiving("rp-2", "Cancel")],
        );
        let mut context = MessagingContext::from_message(As4Message::new(vec![
            MessageUnit::User(user("m-1", "Deliver")),
            MessageUnit::User(user("m-2", "Cancel")),
        ]));
        let result = DetermineReceivingPModes
            .execute(&mut context, &app)
            .await
            .unwrap();
        assert!(matches!(
            result,
            StepResult::Failed(ref error) if error.error_code() == ErrorCode::ValueInconsistent
        ));
    }

    #[tokio::test]
    async fn validation_reports_every_violation() {
        let app = app_with(Vec::new(), Vec::new());
        let mut broken = user("m-1", "");
        broken.to = Party::default();
        let mut context = MessagingContext::from_message(As4Message::single(MessageUnit::User(broken)));
        let result = ValidateMessage.execute(&mut context, &app).await.unwrap();
        let StepResult::Failed(error) = result else {
            panic!("expected a failure, got {result:?}");
        };
        assert!(error.description.contains("to party"));
        assert!(error.description.contains("action is empty"));
        assert_eq!(error.ref_message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn missing_attachment_breaks_the_bundle() {
        let app = app_with(Vec::new(), Vec::new());
        let mut with_part = user("m-1", "Deliver");
        with_part.payload_info.push(PartInfo {
            href: "cid:absent".into(),
            properties: Default::default(),
        });
        let mut context =
            MessagingContext::from_message(As4Message::single(MessageUnit::User(with_part)));
        let result = ValidateMessage.execute(&mut context, &app).await.unwrap();
        assert!(matches!(
            result,
            StepResult::Failed(ref error) if error.error_code() == ErrorCode::ValueInconsistent
        ));
    }
}
