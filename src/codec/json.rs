use crate::codec::{CodecError, MessageCodec};
use crate::model::As4Message;

pub const AS4_JSON_CONTENT_TYPE: &str = "application/as4+json";

/// JSON rendering of the message model, attachments inlined as base64.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn content_type(&self) -> &str {
        AS4_JSON_CONTENT_TYPE
    }

    fn encode(&self, message: &As4Message) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, content: &[u8]) -> Result<As4Message, CodecError> {
        let message: As4Message =
            serde_json::from_slice(content).map_err(|err| CodecError::Malformed(err.to_string()))?;
        message.validate_bundle()?;
        Ok(message)
    }
}
