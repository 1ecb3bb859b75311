use crate::model::message::{Party, Service};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Business-side request to send a document to a trading partner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitMessage {
    #[serde(default)]
    pub message_info: SubmitMessageInfo,
    pub collaboration: SubmitCollaboration,
    #[serde(default)]
    pub parties: SubmitParties,
    #[serde(default)]
    pub message_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub payloads: Vec<SubmitPayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitMessageInfo {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub ref_to_message_id: Option<String>,
    #[serde(default)]
    pub mpc: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitCollaboration {
    pub pmode_id: String,
    #[serde(default)]
    pub agreement: Option<String>,
    #[serde(default)]
    pub service: Option<Service>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitParties {
    #[serde(default)]
    pub from: Option<Party>,
    #[serde(default)]
    pub to: Option<Party>,
}

/// A payload is either inline (base64 `content`) or fetched from `location`
/// (`file://` paths only).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitPayload {
    pub id: String,
    pub mime_type: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl SubmitMessage {
    pub fn for_pmode(pmode_id: impl Into<String>) -> Self {
        Self {
            collaboration: SubmitCollaboration {
                pmode_id: pmode_id.into(),
                ..SubmitCollaboration::default()
            },
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_info.message_id = Some(message_id.into());
        self
    }

    pub fn with_payload(mut self, payload: SubmitPayload) -> Self {
        self.payloads.push(payload);
        self
    }
}
