use crate::model::{As4Message, EncryptionInfo, SignatureInfo};
use crate::security::{compute_references, signing_input, SecurityError, SecurityProvider};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

const NONCE_LEN: usize = 24;

/// On-disk keyring: base64 32-byte values keyed by the ids PModes reference.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyringFile {
    /// Ed25519 seeds. The matching verifying key is derived under the same id.
    #[serde(default)]
    pub signing_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub verifying_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub encryption_keys: BTreeMap<String, String>,
}

/// [`SecurityProvider`] backed by an in-memory keyring: ed25519 signatures
/// over the reference list, XChaCha20-Poly1305 for attachment bodies.
#[derive(Default)]
pub struct KeyringSecurityProvider {
    signing: HashMap<String, SigningKey>,
    verifying: HashMap<String, VerifyingKey>,
    encryption: HashMap<String, [u8; 32]>,
}

impl KeyringSecurityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, SecurityError> {
        let contents = std::fs::read_to_string(path).map_err(|err| SecurityError::Keyring {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let file: KeyringFile =
            serde_yaml::from_str(&contents).map_err(|err| SecurityError::Keyring {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        Self::from_keyring(&file)
    }

    pub fn from_keyring(file: &KeyringFile) -> Result<Self, SecurityError> {
        let mut provider = Self::new();
        for (key_id, seed) in &file.signing_keys {
            provider = provider.with_signing_seed(key_id, decode_key(key_id, seed)?);
        }
        for (key_id, public) in &file.verifying_keys {
            let key = VerifyingKey::from_bytes(&decode_key(key_id, public)?).map_err(|err| {
                SecurityError::KeyMaterial {
                    key_id: key_id.clone(),
                    reason: err.to_string(),
                }
            })?;
            provider.verifying.insert(key_id.clone(), key);
        }
        for (key_id, secret) in &file.encryption_keys {
            provider = provider.with_encryption_key(key_id, decode_key(key_id, secret)?);
        }
        Ok(provider)
    }

    pub fn with_signing_seed(mut self, key_id: impl Into<String>, seed: [u8; 32]) -> Self {
        let key_id = key_id.into();
        let signing = SigningKey::from_bytes(&seed);
        self.verifying.insert(key_id.clone(), signing.verifying_key());
        self.signing.insert(key_id, signing);
        self
    }

    pub fn with_verifying_key(mut self, key_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.verifying.insert(key_id.into(), key);
        self
    }

    pub fn with_encryption_key(mut self, key_id: impl Into<String>, key: [u8; 32]) -> Self {
        self.encryption.insert(key_id.into(), key);
        self
    }

    fn encryption_key(&self, key_id: &str) -> Result<&[u8; 32], SecurityError> {
        self.encryption
            .get(key_id)
            .ok_or_else(|| SecurityError::UnknownKey(key_id.to_string()))
    }
}

impl SecurityProvider for KeyringSecurityProvider {
    fn sign(&self, message: &mut As4Message, key_id: &str) -> Result<(), SecurityError> {
        let key = self
            .signing
            .get(key_id)
            .ok_or_else(|| SecurityError::UnknownKey(key_id.to_string()))?;
        let references = compute_references(message);
        let signature = key.sign(&signing_input(&references));
        message.security.signature = Some(SignatureInfo {
            key_id: key_id.to_string(),
            references,
            value: BASE64_STANDARD.encode(signature.to_bytes()),
        });
        Ok(())
    }

    fn verify(&self, message: &As4Message) -> Result<(), SecurityError> {
        let signature = message
            .security
            .signature
            .as_ref()
            .ok_or(SecurityError::MissingSignature)?;

        let actual = compute_references(message);
        let signed: HashMap<&str, &str> = signature
            .references
            .iter()
            .map(|reference| (reference.uri.as_str(), reference.digest.as_str()))
            .collect();
        let actual_uris: HashSet<&str> = actual.iter().map(|r| r.uri.as_str()).collect();
        if let Some(extra) = signed.keys().find(|uri| !actual_uris.contains(*uri)) {
            return Err(SecurityError::ReferenceSetMismatch(format!(
                "`{extra}` is signed but not present"
            )));
        }
        for reference in &actual {
            match signed.get(reference.uri.as_str()) {
                None => {
                    return Err(SecurityError::ReferenceSetMismatch(format!(
                        "`{}` is not signed",
                        reference.uri
                    )))
                }
                Some(digest) if *digest != reference.digest => {
                    return Err(SecurityError::DigestMismatch {
                        uri: reference.uri.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        let key = self
            .verifying
            .get(&signature.key_id)
            .ok_or_else(|| SecurityError::UnknownKey(signature.key_id.clone()))?;
        let raw = BASE64_STANDARD
            .decode(signature.value.as_bytes())
            .map_err(|err| SecurityError::InvalidSignature(err.to_string()))?;
        let bytes: [u8; 64] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SecurityError::InvalidSignature("expected 64 bytes".into()))?;
        key.verify(
            &signing_input(&signature.references),
            &Signature::from_bytes(&bytes),
        )
        .map_err(|err| SecurityError::InvalidSignature(err.to_string()))
    }

    fn encrypt(&self, message: &mut As4Message, key_id: &str) -> Result<(), SecurityError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(self.encryption_key(key_id)?));
        let mut parts = BTreeMap::new();
        for attachment in &mut message.attachments {
            let mut nonce = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(
                    XNonce::from_slice(&nonce),
                    Payload {
                        msg: &attachment.content,
                        aad: attachment.content_id.as_bytes(),
                    },
                )
                .map_err(|err| SecurityError::EncryptionFailed {
                    content_id: attachment.content_id.clone(),
                    reason: err.to_string(),
                })?;
            attachment.content = ciphertext;
            parts.insert(attachment.content_id.clone(), BASE64_STANDARD.encode(nonce));
        }
        message.security.encryption = Some(EncryptionInfo {
            key_id: key_id.to_string(),
            parts,
        });
        Ok(())
    }

    fn decrypt(&self, message: &mut As4Message, key_id: Option<&str>) -> Result<(), SecurityError> {
        let info = message
            .security
            .encryption
            .clone()
            .ok_or(SecurityError::MissingEncryptionInfo)?;
        if let Some(expected) = key_id {
            if expected != info.key_id {
                return Err(SecurityError::KeyMismatch {
                    expected: expected.to_string(),
                    actual: info.key_id,
                });
            }
        }

        let cipher = XChaCha20Poly1305::new(Key::from_slice(self.encryption_key(&info.key_id)?));
        let mut plaintexts = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            let failed = |reason: String| SecurityError::DecryptionFailed {
                content_id: attachment.content_id.clone(),
                reason,
            };
            let encoded = info
                .parts
                .get(&attachment.content_id)
                .ok_or_else(|| failed("no nonce for part".into()))?;
            let nonce = BASE64_STANDARD
                .decode(encoded.as_bytes())
                .map_err(|err| failed(err.to_string()))?;
            if nonce.len() != NONCE_LEN {
                return Err(failed(format!("nonce must be {NONCE_LEN} bytes")));
            }
            let plaintext = cipher
                .decrypt(
                    XNonce::from_slice(&nonce),
                    Payload {
                        msg: &attachment.content,
                        aad: attachment.content_id.as_bytes(),
                    },
                )
                .map_err(|err| failed(err.to_string()))?;
            plaintexts.push(plaintext);
        }

        // Only touch the message once every part decrypted.
        for (attachment, plaintext) in message.attachments.iter_mut().zip(plaintexts) {
            attachment.content = plaintext;
        }
        message.security.encryption = None;
        Ok(())
    }
}

fn decode_key(key_id: &str, encoded: &str) -> Result<[u8; 32], SecurityError> {
    let raw = BASE64_STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|err| SecurityError::KeyMaterial {
            key_id: key_id.to_string(),
            reason: err.to_string(),
        })?;
    raw.as_slice()
        .try_into()
        .map_err(|_| SecurityError::KeyMaterial {
            key_id: key_id.to_string(),
            reason: format!("expected 32 bytes, got {}", raw.len()),
        })
}
