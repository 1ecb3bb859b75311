#![forbid(unsafe_code)]

//! Wire codecs keyed by content type. The engine only ever handles the
//! in-memory [`As4Message`]; everything about bytes on the wire lives here.

mod json;

use crate::model::{As4Message, BundleError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use json::{JsonCodec, AS4_JSON_CONTENT_TYPE};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no codec registered for content type `{0}`")]
    UnsupportedContentType(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid message bundle: {0}")]
    InvalidBundle(#[from] BundleError),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

pub trait MessageCodec: Send + Sync {
    fn content_type(&self) -> &str;

    fn encode(&self, message: &As4Message) -> Result<Vec<u8>, CodecError>;

    /// Decodes and checks the bundle rules before handing the message out.
    fn decode(&self, content: &[u8]) -> Result<As4Message, CodecError>;
}

/// Codecs by normalized content type, plus the one used for outbound traffic.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn MessageCodec>>,
    default: String,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
            default: AS4_JSON_CONTENT_TYPE.to_string(),
        };
        registry.register(JsonCodec);
        registry
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C>(&mut self, codec: C)
    where
        C: MessageCodec + 'static,
    {
        let key = normalize_content_type(codec.content_type());
        self.codecs.insert(key, Arc::new(codec));
    }

    pub fn set_default(&mut self, content_type: &str) -> Result<(), CodecError> {
        let key = normalize_content_type(content_type);
        if !self.codecs.contains_key(&key) {
            return Err(CodecError::UnsupportedContentType(content_type.to_string()));
        }
        self.default = key;
        Ok(())
    }

    pub fn get(&self, content_type: &str) -> Result<Arc<dyn MessageCodec>, CodecError> {
        self.codecs
            .get(&normalize_content_type(content_type))
            .cloned()
            .ok_or_else(|| CodecError::UnsupportedContentType(content_type.to_string()))
    }

    pub fn decode(&self, content_type: &str, content: &[u8]) -> Result<As4Message, CodecError> {
        self.get(content_type)?.decode(content)
    }

    /// Encodes with the default codec, returning the bytes and their content type.
    pub fn encode(&self, message: &As4Message) -> Result<(Vec<u8>, String), CodecError> {
        let codec = self.get(&self.default)?;
        let bytes = codec.encode(message)?;
        Ok((bytes, codec.content_type().to_string()))
    }

    pub fn content_types(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.codecs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Strips parameters and lowercases: `Application/AS4+json; charset=utf-8`
/// becomes `application/as4+json`.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
