//! Per-envelope integrity verification shared by the indexer's integrity
//! report and the lint checksum/signature validators.
//!
//! Rule: the stored `payloadChecksum` must equal the recomputed one, every
//! signature must be structurally valid and name a known actor, and the most
//! recently appended signature must verify against the *recomputed* checksum.
//! Earlier signatures are audit history; they signed earlier payloads.

use crate::core::crypto;
use crate::core::error::GitgovError;
use crate::core::identity::IdentityResolver;
use crate::core::schemas::{ActorStatus, RecordEnvelope};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeCheck {
    pub recomputed_checksum: String,
    pub checksum_ok: bool,
    /// No signatures, or a latest signature that is malformed or does not verify.
    pub signature_problems: Vec<String>,
    /// Structural problems in superseded signatures. They stay in the audit
    /// trail and are reported as warnings.
    pub historical_problems: Vec<String>,
    pub unknown_signers: Vec<String>,
    pub revoked_signers: Vec<String>,
}

impl EnvelopeCheck {
    pub fn signatures_ok(&self) -> bool {
        self.signature_problems.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.checksum_ok
            && self.signature_problems.is_empty()
            && self.unknown_signers.is_empty()
    }
}

pub fn check_envelope(
    envelope: &RecordEnvelope<JsonValue>,
    identity: &dyn IdentityResolver,
) -> Result<EnvelopeCheck, GitgovError> {
    let recomputed = crypto::compute_checksum(&envelope.payload);
    let mut check = EnvelopeCheck {
        checksum_ok: recomputed == envelope.header.payload_checksum,
        recomputed_checksum: recomputed,
        ..EnvelopeCheck::default()
    };

    let signatures = &envelope.header.signatures;
    if signatures.is_empty() {
        check.signature_problems.push("record has no signatures".to_string());
        return Ok(check);
    }

    let last = signatures.len() - 1;
    for (i, sig) in signatures.iter().enumerate() {
        let problems = crypto::signature_structure_problems(sig);
        let well_formed = problems.is_empty();
        let bucket = if i == last {
            &mut check.signature_problems
        } else {
            &mut check.historical_problems
        };
        for p in problems {
            bucket.push(format!("signature #{} ({}): {}", i, sig.key_id, p));
        }
        if sig.key_id.trim().is_empty() {
            continue;
        }

        let Some(actor) = identity.get_actor(&sig.key_id)? else {
            if !check.unknown_signers.contains(&sig.key_id) {
                check.unknown_signers.push(sig.key_id.clone());
            }
            continue;
        };
        if actor.status == ActorStatus::Revoked && !check.revoked_signers.contains(&sig.key_id) {
            check.revoked_signers.push(sig.key_id.clone());
        }

        if i == last && well_formed {
            match crypto::verify_signature(&actor.public_key, &check.recomputed_checksum, sig) {
                Ok(true) => {}
                Ok(false) => check.signature_problems.push(format!(
                    "latest signature by {} does not verify against the payload",
                    sig.key_id
                )),
                Err(e) => check.signature_problems.push(format!(
                    "actor {} has an unusable public key: {}",
                    sig.key_id, e
                )),
            }
        }
    }
    Ok(check)
}
