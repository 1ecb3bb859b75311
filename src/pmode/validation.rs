//! Field-by-field PMode checks. Every violation is collected before failing.

use crate::model::Mep;
use crate::pmode::types::{
    Method, NotifyHandling, ReceivingPMode, RetryReliability, ReplyPattern, SecurityRequirement,
    SendingPMode,
};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("pmode `{pmode_id}` is invalid:\n{rendered}")]
pub struct PModeValidationError {
    pub pmode_id: String,
    pub violations: Vec<String>,
    rendered: String,
}

impl PModeValidationError {
    pub fn new(pmode_id: impl Into<String>, violations: Vec<String>) -> Self {
        let rendered = violations
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            pmode_id: pmode_id.into(),
            violations,
            rendered,
        }
    }
}

pub fn validate_sending_pmode(pmode: &SendingPMode) -> Result<(), PModeValidationError> {
    let mut errors = Vec::new();
    collect_sending_violations(pmode, &mut errors);
    finish(&pmode.id, errors)
}

pub fn validate_receiving_pmode(pmode: &ReceivingPMode) -> Result<(), PModeValidationError> {
    let mut errors = Vec::new();
    collect_receiving_violations(pmode, &mut errors);
    finish(&pmode.id, errors)
}

fn finish(pmode_id: &str, errors: Vec<String>) -> Result<(), PModeValidationError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(PModeValidationError::new(pmode_id, errors))
    }
}

pub fn collect_sending_violations(pmode: &SendingPMode, errors: &mut Vec<String>) {
    if pmode.id.trim().is_empty() {
        errors.push("id must be a non-empty string".to_string());
    }

    match pmode.mep_binding {
        Mep::Push => {
            if pmode.push_url().is_none() {
                errors.push("push binding requires push_configuration.url".to_string());
            }
            if pmode.pull_configuration.is_some() {
                errors.push("pull_configuration is only valid with mep_binding `pull`".to_string());
            }
        }
        Mep::Pull => {
            if blank(pmode.message_packaging.mpc.as_deref()) {
                errors.push("pull binding requires message_packaging.mpc".to_string());
            }
            if pmode.pull_configuration.is_some() && pmode.push_url().is_none() {
                errors.push(
                    "pull_configuration requires push_configuration.url to post pull requests to"
                        .to_string(),
                );
            }
        }
    }

    if let Some(config) = &pmode.push_configuration {
        if !blank(Some(&config.url)) && !looks_like_url(&config.url) {
            errors.push(format!(
                "push_configuration.url `{}` must start with http:// or https://",
                config.url
            ));
        }
        if config.timeout.is_some_and(|timeout| timeout.is_zero()) {
            errors.push("push_configuration.timeout must be greater than zero".to_string());
        }
    }

    if let Some(pull) = &pmode.pull_configuration {
        if pull.min_interval.is_zero() {
            errors.push("pull_configuration.min_interval must be greater than zero".to_string());
        }
        if pull.max_interval < pull.min_interval {
            errors.push(
                "pull_configuration.max_interval must not be smaller than min_interval".to_string(),
            );
        }
        check_factor("pull_configuration.factor", pull.factor, errors);
    }

    let signing = &pmode.security.signing;
    if signing.enabled && blank(signing.key_id.as_deref()) {
        errors.push("security.signing is enabled but has no key_id".to_string());
    }
    let encryption = &pmode.security.encryption;
    if encryption.enabled && blank(encryption.key_id.as_deref()) {
        errors.push("security.encryption is enabled but has no key_id".to_string());
    }

    if let Some(party) = &pmode.message_packaging.party_info.from {
        if party.party_ids.iter().any(|id| id.id.trim().is_empty()) {
            errors.push("message_packaging.party_info.from has an empty party id".to_string());
        }
    }
    if let Some(party) = &pmode.message_packaging.party_info.to {
        if party.party_ids.iter().any(|id| id.id.trim().is_empty()) {
            errors.push("message_packaging.party_info.to has an empty party id".to_string());
        }
    }

    check_reliability(
        "reliability.reception_awareness",
        pmode.reception_awareness(),
        errors,
    );

    let receipts = &pmode.receipt_handling;
    check_notify_target(
        "receipt_handling",
        receipts.notify_message_producer,
        receipts.notify_method.as_ref(),
        errors,
    );
    check_reliability("receipt_handling.reliability", &receipts.reliability, errors);
    check_notify_handling("error_handling", &pmode.error_handling, errors);
    check_notify_handling("exception_handling", &pmode.exception_handling, errors);
}

pub fn collect_receiving_violations(pmode: &ReceivingPMode, errors: &mut Vec<String>) {
    if pmode.id.trim().is_empty() {
        errors.push("id must be a non-empty string".to_string());
    }

    let decryption = &pmode.security.decryption;
    if decryption.encryption == SecurityRequirement::Required && blank(decryption.key_id.as_deref())
    {
        errors.push("security.decryption requires encryption but has no key_id".to_string());
    }

    let reply = &pmode.reply_handling;
    if reply.reply_pattern == ReplyPattern::Callback && blank(reply.sending_pmode.as_deref()) {
        errors.push("reply_handling.reply_pattern `callback` requires sending_pmode".to_string());
    }
    if reply.response_signing.enabled && blank(reply.response_signing.key_id.as_deref()) {
        errors.push("reply_handling.response_signing is enabled but has no key_id".to_string());
    }

    let deliver = &pmode.message_handling.deliver;
    if deliver.enabled {
        match &deliver.method {
            None => errors.push("message_handling.deliver is enabled but has no method".to_string()),
            Some(method) => check_method("message_handling.deliver.method", method, errors),
        }
    }
    check_reliability(
        "message_handling.deliver.reliability",
        &deliver.reliability,
        errors,
    );
    check_notify_handling("exception_handling", &pmode.exception_handling, errors);
}

/// Receiving PModes with identical criteria can never be told apart at match time.
pub fn collect_ambiguous_receiving_pmodes(
    pmodes: &[&ReceivingPMode],
    errors: &mut Vec<String>,
) {
    let mut ids = HashSet::new();
    for pmode in pmodes {
        if !ids.insert(pmode.id.as_str()) {
            errors.push(format!("receiving pmode id `{}` is declared more than once", pmode.id));
        }
    }

    for (index, left) in pmodes.iter().enumerate() {
        for right in &pmodes[index + 1..] {
            if !is_catch_all(left) && left.message_packaging == right.message_packaging {
                errors.push(format!(
                    "receiving pmodes `{}` and `{}` declare identical matching criteria",
                    left.id, right.id
                ));
            }
        }
    }
}

fn is_catch_all(pmode: &ReceivingPMode) -> bool {
    let packaging = &pmode.message_packaging;
    packaging.mpc.is_none()
        && packaging.party_info.from.is_none()
        && packaging.party_info.to.is_none()
        && packaging.collaboration.agreement.is_none()
        && packaging.collaboration.service.is_none()
        && packaging.collaboration.action.is_none()
}

fn check_notify_handling(section: &str, handling: &NotifyHandling, errors: &mut Vec<String>) {
    check_notify_target(
        section,
        handling.notify_message_producer,
        handling.notify_method.as_ref(),
        errors,
    );
    check_reliability(&format!("{section}.reliability"), &handling.reliability, errors);
}

fn check_notify_target(
    section: &str,
    notify: bool,
    method: Option<&Method>,
    errors: &mut Vec<String>,
) {
    match (notify, method) {
        (true, None) => errors.push(format!(
            "{section}.notify_message_producer is set but no notify_method is configured"
        )),
        (_, Some(method)) => check_method(&format!("{section}.notify_method"), method, errors),
        (false, None) => {}
    }
}

fn check_method(section: &str, method: &Method, errors: &mut Vec<String>) {
    if method.method_type.trim().is_empty() {
        errors.push(format!("{section}.type must be a non-empty string"));
    }
    if method
        .parameter("location")
        .is_some_and(|location| location.trim().is_empty())
    {
        errors.push(format!("{section}.parameters.location must not be empty"));
    }
}

fn check_reliability(section: &str, reliability: &RetryReliability, errors: &mut Vec<String>) {
    if !reliability.enabled {
        return;
    }
    if reliability.retry_count == 0 {
        errors.push(format!("{section}.retry_count must be at least 1 when enabled"));
    }
    if reliability.retry_interval.is_zero() {
        errors.push(format!("{section}.retry_interval must be greater than zero"));
    }
    if let Some(max) = reliability.max_retry_interval {
        if max < reliability.retry_interval {
            errors.push(format!(
                "{section}.max_retry_interval must not be smaller than retry_interval"
            ));
        }
    }
    check_factor(&format!("{section}.factor"), reliability.factor, errors);
}

fn check_factor(section: &str, factor: f64, errors: &mut Vec<String>) {
    if !factor.is_finite() || factor < 1.0 {
        errors.push(format!("{section} must be a finite number >= 1.0"));
    }
}

fn blank(value: Option<&str>) -> bool {
    value.map_or(true, |text| text.trim().is_empty())
}

fn looks_like_url(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmode::types::{PushConfiguration, SigningSettings};
    use std::time::Duration;

    #[test]
    fn sending_violations_are_aggregated() {
        let mut pmode = SendingPMode::new("");
        pmode.security.signing = SigningSettings {
            enabled: true,
            key_id: None,
        };
        pmode.reliability.reception_awareness = RetryReliability {
            enabled: true,
            retry_count: 0,
            retry_interval: Duration::from_secs(5),
            max_retry_interval: Some(Duration::from_secs(1)),
            factor: 1.75,
        };

        let err = validate_sending_pmode(&pmode).unwrap_err();
        assert_eq!(err.violations.len(), 5, "{err}");
        let rendered = err.to_string();
        assert!(rendered.contains("id must be a non-empty string"));
        assert!(rendered.contains("push binding requires push_configuration.url"));
        assert!(rendered.contains("security.signing is enabled but has no key_id"));
        assert!(rendered.contains("retry_count must be at least 1"));
        assert!(rendered.contains("max_retry_interval must not be smaller"));
    }

    #[test]
    fn complete_push_pmode_is_valid() {
        let mut pmode = SendingPMode::new("push");
        pmode.push_configuration = Some(PushConfiguration {
            url: "https://partner.example/msh".into(),
            timeout: Some(Duration::from_secs(30)),
        });
        assert!(validate_sending_pmode(&pmode).is_ok());
    }

    #[test]
    fn pull_binding_requires_an_mpc() {
        let mut pmode = SendingPMode::new("pull");
        pmode.mep_binding = Mep::Pull;
        let err = validate_sending_pmode(&pmode).unwrap_err();
        assert_eq!(
            err.violations,
            vec!["pull binding requires message_packaging.mpc".to_string()]
        );
    }

    #[test]
    fn identical_receiving_criteria_are_reported() {
        let mut left = ReceivingPMode::new("left");
        left.message_packaging.collaboration.action = Some("StoreMessage".into());
        let mut right = left.clone();
        right.id = "right".into();

        let mut errors = Vec::new();
        collect_ambiguous_receiving_pmodes(&[&left, &right], &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("`left` and `right`"));
    }
}
