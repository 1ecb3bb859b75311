use crate::model::ErrorCode;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Classification of a failed step; decides retry and reporting behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    Configuration,
    Transform,
    Security,
    Transport,
    Duplicate,
    Delivery,
    Notification,
    Unexpected,
}

impl FailureCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureCategory::Transport | FailureCategory::Delivery | FailureCategory::Notification
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Configuration => "configuration",
            FailureCategory::Transform => "transform",
            FailureCategory::Security => "security",
            FailureCategory::Transport => "transport",
            FailureCategory::Duplicate => "duplicate",
            FailureCategory::Delivery => "delivery",
            FailureCategory::Notification => "notification",
            FailureCategory::Unexpected => "unexpected",
        }
    }

    fn default_code(self) -> ErrorCode {
        match self {
            FailureCategory::Configuration => ErrorCode::ProcessingModeMismatch,
            FailureCategory::Transform => ErrorCode::ValueNotRecognized,
            FailureCategory::Security => ErrorCode::PolicyNoncompliance,
            FailureCategory::Duplicate => ErrorCode::ValueInconsistent,
            FailureCategory::Delivery => ErrorCode::DeliveryFailure,
            FailureCategory::Transport
            | FailureCategory::Notification
            | FailureCategory::Unexpected => ErrorCode::Other,
        }
    }
}

impl Display for FailureCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, expected failure carried on the messaging context.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{category} failure: {description}")]
pub struct ProcessingError {
    pub category: FailureCategory,
    pub code: Option<ErrorCode>,
    pub description: String,
    pub ref_message_id: Option<String>,
}

impl ProcessingError {
    pub fn new(category: FailureCategory, description: impl Into<String>) -> Self {
        Self {
            category,
            code: None,
            description: description.into(),
            ref_message_id: None,
        }
    }

    pub fn configuration(description: impl Into<String>) -> Self {
        Self::new(FailureCategory::Configuration, description)
    }

    pub fn transform(description: impl Into<String>) -> Self {
        Self::new(FailureCategory::Transform, description)
    }

    pub fn security(code: ErrorCode, description: impl Into<String>) -> Self {
        Self::new(FailureCategory::Security, description).with_code(code)
    }

    pub fn transport(description: impl Into<String>) -> Self {
        Self::new(FailureCategory::Transport, description)
    }

    pub fn duplicate(description: impl Into<String>) -> Self {
        Self::new(FailureCategory::Duplicate, description)
    }

    pub fn delivery(description: impl Into<String>) -> Self {
        Self::new(FailureCategory::Delivery, description).with_code(ErrorCode::DeliveryFailure)
    }

    pub fn notification(description: impl Into<String>) -> Self {
        Self::new(FailureCategory::Notification, description)
    }

    pub fn unexpected(description: impl Into<String>) -> Self {
        Self::new(FailureCategory::Unexpected, description)
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn referencing(mut self, message_id: impl Into<String>) -> Self {
        self.ref_message_id = Some(message_id.into());
        self
    }

    /// Code reported in an Error signal: the explicit one or the category default.
    pub fn error_code(&self) -> ErrorCode {
        self.code.unwrap_or_else(|| self.category.default_code())
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}
