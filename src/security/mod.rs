//! Message-level security: signing and verification over unit and attachment
//! digests, and attachment encryption. Steps only see pass/fail outcomes
//! mapped to ebMS error codes.

mod keyring;

use crate::model::{As4Message, ErrorCode, Reference};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;

pub use keyring::{KeyringFile, KeyringSecurityProvider};

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("no key `{0}` in keyring")]
    UnknownKey(String),
    #[error("no key id configured for {0}")]
    MissingKeyId(&'static str),
    #[error("message carries no signature")]
    MissingSignature,
    #[error("digest of `{uri}` does not match the signed reference")]
    DigestMismatch { uri: String },
    #[error("signed references do not cover the message: {0}")]
    ReferenceSetMismatch(String),
    #[error("signature is invalid: {0}")]
    InvalidSignature(String),
    #[error("message carries no encryption header")]
    MissingEncryptionInfo,
    #[error("message is encrypted with key `{actual}`, expected `{expected}`")]
    KeyMismatch { expected: String, actual: String },
    #[error("failed to decrypt attachment `{content_id}`: {reason}")]
    DecryptionFailed { content_id: String, reason: String },
    #[error("failed to encrypt attachment `{content_id}`: {reason}")]
    EncryptionFailed { content_id: String, reason: String },
    #[error("invalid key material for `{key_id}`: {reason}")]
    KeyMaterial { key_id: String, reason: String },
    #[error("failed to load keyring `{path}`: {reason}")]
    Keyring { path: PathBuf, reason: String },
}

impl SecurityError {
    /// ebMS code reported to the partner when this failure happens on receive.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SecurityError::MissingEncryptionInfo
            | SecurityError::KeyMismatch { .. }
            | SecurityError::DecryptionFailed { .. } => ErrorCode::FailedDecryption,
            SecurityError::MissingSignature
            | SecurityError::DigestMismatch { .. }
            | SecurityError::ReferenceSetMismatch(_)
            | SecurityError::InvalidSignature(_) => ErrorCode::FailedAuthentication,
            _ => ErrorCode::Other,
        }
    }
}

pub trait SecurityProvider: Send + Sync {
    /// Signs every unit and attachment with the key `key_id`.
    fn sign(&self, message: &mut As4Message, key_id: &str) -> Result<(), SecurityError>;

    /// Recomputes the digests and checks them and the signature value.
    fn verify(&self, message: &As4Message) -> Result<(), SecurityError>;

    fn encrypt(&self, message: &mut As4Message, key_id: &str) -> Result<(), SecurityError>;

    /// Decrypts in place and drops the encryption header. When `key_id` is
    /// given, the message must have been encrypted with that key.
    fn decrypt(&self, message: &mut As4Message, key_id: Option<&str>) -> Result<(), SecurityError>;
}

pub fn unit_reference_uri(message_id: &str) -> String {
    format!("#unit-{message_id}")
}

pub fn attachment_reference_uri(content_id: &str) -> String {
    format!("cid:{content_id}")
}

/// SHA-256 references over all units and attachments, in message order.
pub fn compute_references(message: &As4Message) -> Vec<Reference> {
    let mut references = Vec::with_capacity(message.units.len() + message.attachments.len());
    for unit in &message.units {
        // Serializing the model types cannot fail: no maps with non-string keys.
        let canonical = serde_json::to_vec(unit).unwrap_or_default();
        references.push(Reference {
            uri: unit_reference_uri(unit.message_id()),
            digest: digest(&canonical),
        });
    }
    for attachment in &message.attachments {
        references.push(Reference {
            uri: attachment_reference_uri(&attachment.content_id),
            digest: digest(&attachment.content),
        });
    }
    references
}

/// References a receipt must echo for non-repudiation of `message`.
pub fn nrr_references(message: &As4Message) -> Vec<Reference> {
    match &message.security.signature {
        Some(signature) => signature.references.clone(),
        None => compute_references(message),
    }
}

pub(crate) fn digest(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(Sha256::digest(bytes))
}

pub(crate) fn signing_input(references: &[Reference]) -> Vec<u8> {
    let mut input = String::new();
    for reference in references {
        input.push_str(&reference.uri);
        input.push('=');
        input.push_str(&reference.digest);
        input.push('\n');
    }
    input.into_bytes()
}
