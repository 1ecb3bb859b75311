use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "failure")]
    Failure,
}

/// ebMS3/AS4 error codes the engine raises or interprets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "EBMS:0001")]
    ValueNotRecognized,
    #[serde(rename = "EBMS:0002")]
    FeatureNotSupported,
    #[serde(rename = "EBMS:0003")]
    ValueInconsistent,
    #[serde(rename = "EBMS:0004")]
    Other,
    #[serde(rename = "EBMS:0006")]
    EmptyMessagePartitionChannel,
    #[serde(rename = "EBMS:0010")]
    ProcessingModeMismatch,
    #[serde(rename = "EBMS:0011")]
    ExternalPayloadError,
    #[serde(rename = "EBMS:0101")]
    FailedAuthentication,
    #[serde(rename = "EBMS:0102")]
    FailedDecryption,
    #[serde(rename = "EBMS:0103")]
    PolicyNoncompliance,
    #[serde(rename = "EBMS:0202")]
    DeliveryFailure,
    #[serde(rename = "EBMS:0301")]
    MissingReceipt,
    #[serde(rename = "EBMS:0302")]
    InvalidReceipt,
    #[serde(rename = "EBMS:0303")]
    DecompressionFailure,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::ValueNotRecognized => "EBMS:0001",
            ErrorCode::FeatureNotSupported => "EBMS:0002",
            ErrorCode::ValueInconsistent => "EBMS:0003",
            ErrorCode::Other => "EBMS:0004",
            ErrorCode::EmptyMessagePartitionChannel => "EBMS:0006",
            ErrorCode::ProcessingModeMismatch => "EBMS:0010",
            ErrorCode::ExternalPayloadError => "EBMS:0011",
            ErrorCode::FailedAuthentication => "EBMS:0101",
            ErrorCode::FailedDecryption => "EBMS:0102",
            ErrorCode::PolicyNoncompliance => "EBMS:0103",
            ErrorCode::DeliveryFailure => "EBMS:0202",
            ErrorCode::MissingReceipt => "EBMS:0301",
            ErrorCode::InvalidReceipt => "EBMS:0302",
            ErrorCode::DecompressionFailure => "EBMS:0303",
        }
    }

    pub fn short_description(&self) -> &'static str {
        match self {
            ErrorCode::ValueNotRecognized => "ValueNotRecognized",
            ErrorCode::FeatureNotSupported => "FeatureNotSupported",
            ErrorCode::ValueInconsistent => "ValueInconsistent",
            ErrorCode::Other => "Other",
            ErrorCode::EmptyMessagePartitionChannel => "EmptyMessagePartitionChannel",
            ErrorCode::ProcessingModeMismatch => "ProcessingModeMismatch",
            ErrorCode::ExternalPayloadError => "ExternalPayloadError",
            ErrorCode::FailedAuthentication => "FailedAuthentication",
            ErrorCode::FailedDecryption => "FailedDecryption",
            ErrorCode::PolicyNoncompliance => "PolicyNoncompliance",
            ErrorCode::DeliveryFailure => "DeliveryFailure",
            ErrorCode::MissingReceipt => "MissingReceipt",
            ErrorCode::InvalidReceipt => "InvalidReceipt",
            ErrorCode::DecompressionFailure => "DecompressionFailure",
        }
    }

    /// An empty pull channel is the only condition reported as a warning.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorCode::EmptyMessagePartitionChannel => Severity::Warning,
            _ => Severity::Failure,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        const ALL: [ErrorCode; 14] = [
            ErrorCode::ValueNotRecognized,
            ErrorCode::FeatureNotSupported,
            ErrorCode::ValueInconsistent,
            ErrorCode::Other,
            ErrorCode::EmptyMessagePartitionChannel,
            ErrorCode::ProcessingModeMismatch,
            ErrorCode::ExternalPayloadError,
            ErrorCode::FailedAuthentication,
            ErrorCode::FailedDecryption,
            ErrorCode::PolicyNoncompliance,
            ErrorCode::DeliveryFailure,
            ErrorCode::MissingReceipt,
            ErrorCode::InvalidReceipt,
            ErrorCode::DecompressionFailure,
        ];
        let trimmed = code.trim();
        ALL.into_iter()
            .find(|candidate| candidate.code().eq_ignore_ascii_case(trimmed))
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_parse_back_from_their_wire_form() {
        assert_eq!(
            ErrorCode::from_code("ebms:0101"),
            Some(ErrorCode::FailedAuthentication)
        );
        assert_eq!(ErrorCode::from_code("EBMS:9999"), None);
    }

    #[test]
    fn only_empty_mpc_is_a_warning() {
        assert_eq!(
            ErrorCode::EmptyMessagePartitionChannel.severity(),
            Severity::Warning
        );
        assert_eq!(ErrorCode::FailedDecryption.severity(), Severity::Failure);
    }

    #[test]
    fn serde_uses_ebms_code() {
        let json = serde_json::to_string(&ErrorCode::DecompressionFailure).unwrap();
        assert_eq!(json, "\"EBMS:0303\"");
    }
}
