//! Digest and salt primitives for the commitment protocol.
//!
//! Two newtypes keep the roles apart at compile time:
//! - [`StateDigest`]: SHA-256 content identity for engine-state snapshots,
//!   chain links, and rule digests. Persisted, deterministic across
//!   platforms.
//! - [`Salt`]: per-commitment secret material. Never persisted before its
//!   reveal record; never logged.
//!
//! All content addressing in the harness goes through [`sha256_parts`] so
//! that domain separation is explicit at every call site.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 digest of an opaque engine-state snapshot or other committed
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateDigest(pub [u8; 32]);

impl StateDigest {
    /// All-zero digest used as the genesis chain link.
    pub const ZERO: StateDigest = StateDigest([0u8; 32]);

    /// Compute a digest over a single byte slice.
    pub fn compute(data: &[u8]) -> Self {
        Self(sha256_parts(&[data]))
    }

    /// Compute a digest over several parts, length-prefixing each part so
    /// that part boundaries cannot be shifted.
    pub fn compute_parts(parts: &[&[u8]]) -> Self {
        Self(sha256_parts(parts))
    }

    /// Access the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex representation.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in &self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    /// Constant-time comparison for verification paths (no early exit).
    pub fn constant_time_eq(&self, other: &Self) -> bool {
        let mut diff: u8 = 0;
        for i in 0..32 {
            diff |= self.0[i] ^ other.0[i];
        }
        diff == 0
    }
}

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "digest:{}", self.to_hex())
    }
}

/// Per-commitment secret salt.
///
/// Generated and held by the party under test; disclosed only through the
/// reveal protocol. The harness stores the binding commitment, not the
/// salt itself, until reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; 32]);

impl Salt {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// SHA-256 over length-prefixed parts.
///
/// Length prefixes guarantee that `["ab", "c"]` and `["a", "bc"]` hash
/// differently.
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Binding commitment for a salted state digest at a given step.
///
/// `commitment = SHA-256(salt ‖ state_digest ‖ step_le)`. Verification
/// recomputes this from the revealed salt and compares in constant time.
pub fn salt_commitment(salt: &Salt, state_digest: &StateDigest, step: u64) -> StateDigest {
    StateDigest(sha256_parts(&[
        b"doppel.salt-commitment.v1",
        salt.as_bytes(),
        state_digest.as_bytes(),
        &step.to_le_bytes(),
    ]))
}

/// Verify a revealed salt against a prior commitment. Constant-time.
pub fn verify_salt(
    commitment: &StateDigest,
    salt: &Salt,
    state_digest: &StateDigest,
    step: u64,
) -> bool {
    salt_commitment(salt, state_digest, step).constant_time_eq(commitment)
}

/// Derive a deterministic, content-addressed identifier with a short
/// domain prefix, e.g. `mrf-3fa9c1d2e4b5a697`.
pub fn derive_content_id(prefix: &str, material: &[u8]) -> String {
    let digest = StateDigest::compute_parts(&[prefix.as_bytes(), material]);
    format!("{}-{}", prefix, &digest.to_hex()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_deterministic() {
        let a = StateDigest::compute(b"engine state");
        let b = StateDigest::compute(b"engine state");
        assert_eq!(a, b);
    }

    #[test]
    fn digest_different_inputs_differ() {
        assert_ne!(StateDigest::compute(b"a"), StateDigest::compute(b"b"));
    }

    #[test]
    fn part_boundaries_are_bound() {
        let a = StateDigest::compute_parts(&[b"ab", b"c"]);
        let b = StateDigest::compute_parts(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_display_and_hex() {
        let d = StateDigest::compute(b"x");
        assert!(d.to_string().starts_with("digest:"));
        assert_eq!(d.to_hex().len(), 64);
        assert!(d.to_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn zero_digest_is_all_zeros() {
        assert_eq!(StateDigest::ZERO.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn constant_time_eq_matches_eq() {
        let a = StateDigest::compute(b"same");
        let b = StateDigest::compute(b"same");
        let c = StateDigest::compute(b"other");
        assert!(a.constant_time_eq(&b));
        assert!(!a.constant_time_eq(&c));
    }

    #[test]
    fn salt_commitment_roundtrip() {
        let salt = Salt([7u8; 32]);
        let digest = StateDigest::compute(b"state at step 3");
        let commitment = salt_commitment(&salt, &digest, 3);
        assert!(verify_salt(&commitment, &salt, &digest, 3));
    }

    #[test]
    fn salt_commitment_binds_step() {
        let salt = Salt([7u8; 32]);
        let digest = StateDigest::compute(b"state");
        let commitment = salt_commitment(&salt, &digest, 3);
        assert!(!verify_salt(&commitment, &salt, &digest, 4));
    }

    #[test]
    fn salt_commitment_binds_salt() {
        let digest = StateDigest::compute(b"state");
        let commitment = salt_commitment(&Salt([7u8; 32]), &digest, 3);
        assert!(!verify_salt(&commitment, &Salt([8u8; 32]), &digest, 3));
    }

    #[test]
    fn salt_commitment_binds_digest() {
        let salt = Salt([7u8; 32]);
        let commitment = salt_commitment(&salt, &StateDigest::compute(b"state"), 3);
        assert!(!verify_salt(&commitment, &salt, &StateDigest::compute(b"tampered"), 3));
    }

    #[test]
    fn content_id_shape() {
        let id = derive_content_id("mrf", b"rule bytes");
        assert!(id.starts_with("mrf-"));
        assert_eq!(id.len(), "mrf-".len() + 16);
    }

    #[test]
    fn content_id_deterministic_and_distinct() {
        assert_eq!(
            derive_content_id("mrf", b"rule"),
            derive_content_id("mrf", b"rule")
        );
        assert_ne!(
            derive_content_id("mrf", b"rule"),
            derive_content_id("ses", b"rule")
        );
    }

    #[test]
    fn digest_serialization_round_trip() {
        let d = StateDigest::compute(b"serde");
        let json = serde_json::to_string(&d).expect("serialize");
        let restored: StateDigest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(d, restored);
    }
}
