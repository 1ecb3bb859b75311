//! Signing and encryption on the way out; decryption and signature
//! verification on the way in, under the receiving PMode's policy.

use crate::app_context::AppContext;
use crate::model::ErrorCode;
use crate::pipeline::context::{ContextError, MessagingContext};
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::{Step, StepError, StepResult};
use crate::pmode::SecurityRequirement;
use async_trait::async_trait;

pub struct SignMessage;

#[async_trait]
impl Step for SignMessage {
    fn name(&self) -> &str {
        "sign_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let key_id = match (&context.response, context.receiving_pmode()) {
            (Some(_), Some(pmode)) => pmode.reply_handling.response_signing.key_id.clone(),
            _ => context
                .sending_pmode()
                .and_then(|pmode| pmode.security.signing.key_id.clone()),
        };
        let Some(key_id) = key_id else {
            return Ok(StepResult::Failed(ProcessingError::configuration(
                "signing is enabled but no signing key id is configured",
            )));
        };

        let message = context
            .outgoing_mut()
            .ok_or(ContextError::Missing("message to sign"))?;
        match app.security().sign(message, &key_id) {
            Ok(()) => Ok(StepResult::Continue),
            Err(err) => Ok(StepResult::Failed(ProcessingError::security(
                err.error_code(),
                err.to_string(),
            ))),
        }
    }
}

pub struct EncryptMessage;

#[async_trait]
impl Step for EncryptMessage {
    fn name(&self) -> &str {
        "encrypt_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let Some(key_id) = context
            .sending_pmode()
            .and_then(|pmode| pmode.security.encryption.key_id.clone())
        else {
            return Ok(StepResult::Failed(ProcessingError::configuration(
                "encryption is enabled but no encryption key id is configured",
            )));
        };

        let message = context
            .outgoing_mut()
            .ok_or(ContextError::Missing("message to encrypt"))?;
        match app.security().encrypt(message, &key_id) {
            Ok(()) => Ok(StepResult::Continue),
            Err(err) => Ok(StepResult::Failed(ProcessingError::security(
                err.error_code(),
                err.to_string(),
            ))),
        }
    }
}

/// Outcome of checking a security feature against what the PMode demands.
#[derive(Debug, PartialEq, Eq)]
enum PolicyCheck {
    Apply,
    Skip,
    Violation(&'static str),
}

fn check_policy(requirement: SecurityRequirement, present: bool) -> PolicyCheck {
    match (requirement, present) {
        (SecurityRequirement::Ignored, _) => PolicyCheck::Skip,
        (SecurityRequirement::Required, false) => PolicyCheck::Violation("required but absent"),
        (SecurityRequirement::NotAllowed, true) => PolicyCheck::Violation("present but not allowed"),
        (_, true) => PolicyCheck::Apply,
        (_, false) => PolicyCheck::Skip,
    }
}

pub struct DecryptMessage;

#[async_trait]
impl Step for DecryptMessage {
    fn name(&self) -> &str {
        "decrypt_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let (requirement, key_id) = context
            .receiving_pmode()
            .map(|pmode| {
                (
                    pmode.security.decryption.encryption,
                    pmode.security.decryption.key_id.clone(),
                )
            })
            .unwrap_or_default();
        let message = context
            .as4_message
            .as_mut()
            .ok_or(ContextError::Missing("AS4 message"))?;
        let message_id = message.primary_message_id().unwrap_or_default().to_string();

        match check_policy(requirement, message.is_encrypted()) {
            PolicyCheck::Skip => Ok(StepResult::Continue),
            PolicyCheck::Violation(reason) => Ok(StepResult::Failed(
                ProcessingError::security(
                    ErrorCode::PolicyNoncompliance,
                    format!("encryption {reason}"),
                )
                .referencing(message_id),
            )),
            PolicyCheck::Apply => match app.security().decrypt(message, key_id.as_deref()) {
                Ok(()) => Ok(StepResult::Continue),
                Err(err) => Ok(StepResult::Failed(
                    ProcessingError::security(err.error_code(), err.to_string())
                        .referencing(message_id),
                )),
            },
        }
    }
}

pub struct VerifySignature;

#[async_trait]
impl Step for VerifySignature {
    fn name(&self) -> &str {
        "verify_signature"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let requirement = context
            .receiving_pmode()
            .map(|pmode| pmode.security.signature_verification)
            .unwrap_or_default();
        let message = context.require_message()?;
        let message_id = message.primary_message_id().unwrap_or_default().to_string();

        match check_policy(requirement, message.is_signed()) {
            PolicyCheck::Skip => Ok(StepResult::Continue),
            PolicyCheck::Violation(reason) => Ok(StepResult::Failed(
                ProcessingError::security(
                    ErrorCode::PolicyNoncompliance,
                    format!("signature {reason}"),
                )
                .referencing(message_id),
            )),
            PolicyCheck::Apply => match app.security().verify(message) {
                Ok(()) => Ok(StepResult::Continue),
                Err(err) => Ok(StepResult::Failed(
                    ProcessingError::security(err.error_code(), err.to_string())
                        .referencing(message_id),
                )),
            },
        }
    }
}
