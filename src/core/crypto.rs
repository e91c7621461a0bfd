//! Payload checksums and Ed25519 record signatures.
//!
//! Checksum: lowercase hex SHA-256 of the canonical JSON encoding of a
//! payload (keys sorted at every depth, compact separators), so the digest
//! does not depend on how the payload was assembled.
//!
//! Signature: Ed25519 over `"{checksum}:{keyId}:{role}:{timestamp}"`,
//! base64 encoded. Public and private keys are stored base64 encoded.

use crate::core::error::GitgovError;
use crate::core::schemas::Signature;
use crate::core::time;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signer as _, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 32;

pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn compute_checksum(payload: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn checksum_of<P: Serialize>(payload: &P) -> Result<String, GitgovError> {
    Ok(compute_checksum(&serde_json::to_value(payload)?))
}

pub fn signing_message(checksum: &str, key_id: &str, role: &str, timestamp: u64) -> String {
    format!("{}:{}:{}:{}", checksum, key_id, role, timestamp)
}

/// Fresh Ed25519 keypair; the public half is `key.verifying_key()`.
pub fn generate_keypair() -> SigningKey {
    let mut csprng = rand::thread_rng();
    SigningKey::generate(&mut csprng)
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    B64.encode(key.to_bytes())
}

pub fn encode_private_key(key: &SigningKey) -> String {
    B64.encode(key.to_bytes())
}

pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey, GitgovError> {
    let bytes = B64
        .decode(encoded.trim())
        .map_err(|e| GitgovError::Crypto(format!("public key is not base64: {}", e)))?;
    let bytes: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| GitgovError::Crypto("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| GitgovError::Crypto(e.to_string()))
}

pub fn decode_private_key(encoded: &str) -> Result<SigningKey, GitgovError> {
    let bytes = B64
        .decode(encoded.trim())
        .map_err(|e| GitgovError::Crypto(format!("private key is not base64: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| GitgovError::Crypto("private key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn decode_signature(encoded: &str) -> Option<ed25519_dalek::Signature> {
    let bytes = B64.decode(encoded).ok()?;
    let bytes: [u8; SIGNATURE_LEN] = bytes.try_into().ok()?;
    Some(ed25519_dalek::Signature::from_bytes(&bytes))
}

/// True when `encoded` is base64 for exactly one Ed25519 signature.
pub fn is_well_formed_signature(encoded: &str) -> bool {
    decode_signature(encoded).is_some()
}

/// Structural problems with a signature entry, independent of any key.
pub fn signature_structure_problems(sig: &Signature) -> Vec<String> {
    let mut problems = Vec::new();
    if sig.key_id.trim().is_empty() {
        problems.push("empty keyId".to_string());
    }
    if sig.role.trim().is_empty() {
        problems.push("empty role".to_string());
    }
    if sig.timestamp == 0 {
        problems.push("missing timestamp".to_string());
    }
    if !is_well_formed_signature(&sig.signature) {
        problems.push(format!(
            "signature is not a base64 {}-byte value",
            SIGNATURE_LEN
        ));
    }
    problems
}

/// Verify `sig` against `checksum` (which callers recompute from the payload).
pub fn verify_signature(
    public_key: &str,
    checksum: &str,
    sig: &Signature,
) -> Result<bool, GitgovError> {
    let key = decode_public_key(public_key)?;
    let Some(signature) = decode_signature(&sig.signature) else {
        return Ok(false);
    };
    let message = signing_message(checksum, &sig.key_id, &sig.role, sig.timestamp);
    Ok(key.verify(message.as_bytes(), &signature).is_ok())
}

/// A private key bound to the actor id it signs as.
pub struct Signer {
    pub actor_id: String,
    key: SigningKey,
}

impl Signer {
    pub fn new(actor_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            actor_id: actor_id.into(),
            key,
        }
    }

    pub fn public_key(&self) -> String {
        encode_public_key(&self.key.verifying_key())
    }

    pub fn sign(&self, checksum: &str, role: &str, notes: Option<&str>) -> Signature {
        self.sign_at(checksum, role, notes, time::now_epoch_secs())
    }

    pub fn sign_at(
        &self,
        checksum: &str,
        role: &str,
        notes: Option<&str>,
        timestamp: u64,
    ) -> Signature {
        let message = signing_message(checksum, &self.actor_id, role, timestamp);
        let signature = self.key.sign(message.as_bytes());
        Signature {
            key_id: self.actor_id.clone(),
            role: role.to_string(),
            timestamp,
            signature: B64.encode(signature.to_bytes()),
            notes: notes.map(str::to_string),
        }
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("actor_id", &self.actor_id)
            .finish_non_exhaustive()
    }
}
