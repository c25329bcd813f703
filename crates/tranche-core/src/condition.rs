//! Crypto-conditions binding an escrow release to a milestone.
//!
//! The fulfillment is a random 32-byte preimage. The condition is
//! `SHA256(fulfillment || milestone_id || escrow_id)`, hex-encoded, so a
//! fulfillment produced for one milestone/escrow pair cannot satisfy the
//! condition of another.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{Result, TrancheError};

/// Length of a fulfillment preimage in bytes.
pub const FULFILLMENT_LEN: usize = 32;

/// Hex-encoded SHA-256 commitment recorded on the escrow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition(String);

/// Hex-encoded preimage proving milestone completion.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fulfillment(String);

impl std::fmt::Debug for Fulfillment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fulfillment(<redacted>)")
    }
}

impl Condition {
    /// Parse a hex condition.
    pub fn from_hex(hex_str: impl Into<String>) -> Result<Self> {
        let s = hex_str.into().to_ascii_uppercase();
        let bytes = hex::decode(&s)
            .map_err(|e| TrancheError::CryptoError(format!("condition is not hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(TrancheError::CryptoError(format!(
                "condition must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(s))
    }

    /// Hex representation, upper case for ledger compatibility.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Fulfillment {
    /// Parse a hex fulfillment.
    pub fn from_hex(hex_str: impl Into<String>) -> Result<Self> {
        let s = hex_str.into().to_ascii_uppercase();
        let bytes = hex::decode(&s)
            .map_err(|e| TrancheError::CryptoError(format!("fulfillment is not hex: {}", e)))?;
        if bytes.len() < FULFILLMENT_LEN {
            return Err(TrancheError::CryptoError(format!(
                "fulfillment must be at least {} bytes",
                FULFILLMENT_LEN
            )));
        }
        Ok(Self(s))
    }

    /// Hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn bytes(&self) -> Vec<u8> {
        // Constructors only admit valid hex.
        hex::decode(&self.0).unwrap_or_default()
    }
}

/// Compute the condition digest for a preimage bound to a milestone/escrow pair.
fn commitment(preimage: &[u8], escrow_id: Uuid, milestone_id: Uuid) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(preimage);
    hasher.update(milestone_id.to_string().as_bytes());
    hasher.update(escrow_id.to_string().as_bytes());
    hasher.finalize().into()
}

/// Generate a fresh condition/fulfillment pair for `(escrow_id, milestone_id)`.
pub fn generate(escrow_id: Uuid, milestone_id: Uuid) -> (Condition, Fulfillment) {
    let mut preimage = [0u8; FULFILLMENT_LEN];
    OsRng.fill_bytes(&mut preimage);

    let digest = commitment(&preimage, escrow_id, milestone_id);
    (
        Condition(hex::encode_upper(digest)),
        Fulfillment(hex::encode_upper(preimage)),
    )
}

/// Returns true iff `fulfillment` is the preimage of `condition` for this pair.
///
/// The digest comparison runs in constant time.
pub fn validate(
    condition: &Condition,
    fulfillment: &Fulfillment,
    escrow_id: Uuid,
    milestone_id: Uuid,
) -> bool {
    let expected = match hex::decode(condition.as_str()) {
        Ok(bytes) if bytes.len() == 32 => bytes,
        _ => return false,
    };
    let recomputed = commitment(&fulfillment.bytes(), escrow_id, milestone_id);
    bool::from(recomputed.as_slice().ct_eq(expected.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_generate_and_validate() {
        let escrow = Uuid::new_v4();
        let milestone = Uuid::new_v4();
        let (condition, fulfillment) = generate(escrow, milestone);

        assert_eq!(condition.as_str().len(), 64);
        assert_eq!(fulfillment.as_str().len(), FULFILLMENT_LEN * 2);
        assert!(validate(&condition, &fulfillment, escrow, milestone));
    }

    #[test]
    fn test_binding_rejects_other_pairs() {
        let escrow = Uuid::new_v4();
        let milestone = Uuid::new_v4();
        let (condition, fulfillment) = generate(escrow, milestone);

        assert!(!validate(&condition, &fulfillment, Uuid::new_v4(), milestone));
        assert!(!validate(&condition, &fulfillment, escrow, Uuid::new_v4()));
        assert!(!validate(&condition, &fulfillment, milestone, escrow));
    }

    #[test]
    fn test_wrong_preimage_rejected() {
        let escrow = Uuid::new_v4();
        let milestone = Uuid::new_v4();
        let (condition, _) = generate(escrow, milestone);
        let (_, other) = generate(escrow, milestone);
        assert!(!validate(&condition, &other, escrow, milestone));
    }

    #[test]
    fn test_parse_round_trip_is_case_insensitive() {
        let (condition, fulfillment) = generate(Uuid::new_v4(), Uuid::new_v4());
        let lower = condition.as_str().to_ascii_lowercase();
        assert_eq!(Condition::from_hex(lower).unwrap(), condition);
        assert!(Fulfillment::from_hex("abcd").is_err());
        assert!(Condition::from_hex("zz").is_err());
    }

    #[test]
    fn test_fulfillment_debug_redacted() {
        let (_, fulfillment) = generate(Uuid::new_v4(), Uuid::new_v4());
        assert!(!format!("{:?}", fulfillment).contains(fulfillment.as_str()));
    }

    proptest! {
        #[test]
        fn validate_accepts_only_exact_preimage(
            preimage in proptest::collection::vec(any::<u8>(), FULFILLMENT_LEN..64),
            flip in 0usize..32,
        ) {
            let escrow = Uuid::new_v4();
            let milestone = Uuid::new_v4();
            let condition = Condition(hex::encode_upper(commitment(&preimage, escrow, milestone)));
            let fulfillment = Fulfillment::from_hex(hex::encode(&preimage)).unwrap();
            prop_assert!(validate(&condition, &fulfillment, escrow, milestone));

            let mut tampered = preimage.clone();
            let idx = flip % tampered.len();
            tampered[idx] ^= 0x01;
            let tampered = Fulfillment::from_hex(hex::encode(&tampered)).unwrap();
            prop_assert!(!validate(&condition, &tampered, escrow, milestone));
        }
    }
}
