//! Secret Commitments
//!
//! A commitment binds a participant to one secret per bracket level without
//! revealing it. The lottery contract recomputes the same hash when a secret is
//! revealed, so the encoding must match Solidity's
//! `keccak256(abi.encodePacked(uint256 secret, uint256 salt))` exactly:
//! two 32-byte big-endian words, hashed with Keccak-256.

use ethers::types::{H256, U256};
use ethers::utils::keccak256;

/// Width of one ABI word in bytes.
pub const WORD_SIZE: usize = 32;

/// Commit to `secret` under `salt`.
pub fn commit(secret: U256, salt: U256) -> H256 {
    let mut preimage = [0u8; 2 * WORD_SIZE];
    secret.to_big_endian(&mut preimage[..WORD_SIZE]);
    salt.to_big_endian(&mut preimage[WORD_SIZE..]);
    H256(keccak256(preimage))
}

/// Check a revealed `(secret, salt)` pair against a stored commitment.
pub fn verify(commitment: H256, secret: U256, salt: U256) -> bool {
    commit(secret, salt) == commitment
}

/// Commit to every secret in bracket order.
pub fn commit_all(secrets: &[U256], salt: U256) -> Vec<H256> {
    secrets.iter().map(|secret| commit(*secret, salt)).collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_matches_solidity_packed_encoding() {
        // keccak256(bytes32(0) ++ bytes32(0))
        let expected: H256 = "0xad3228b676f7d3cd4284a5443f17f1962b36e491b30a40b2405849e597ba5fb5"
            .parse()
            .unwrap();
        assert_eq!(commit(U256::zero(), U256::zero()), expected);
    }

    #[test]
    fn test_commitment_is_deterministic() {
        let a = commit(U256::from(42), U256::from(7));
        let b = commit(U256::from(42), U256::from(7));
        assert_eq!(a, b);
        assert!(verify(a, U256::from(42), U256::from(7)));
    }

    #[test]
    fn test_wrong_salt_fails_verification() {
        let commitment = commit(U256::from(42), U256::from(7));
        assert!(!verify(commitment, U256::from(42), U256::from(8)));
    }

    #[test]
    fn test_secret_and_salt_are_not_interchangeable() {
        assert_ne!(
            commit(U256::from(1), U256::from(2)),
            commit(U256::from(2), U256::from(1))
        );
    }

    #[test]
    fn test_commit_all_keeps_bracket_order() {
        let secrets = [U256::from(3), U256::from(9), U256::from(1)];
        let salt = U256::from(4);
        let commitments = commit_all(&secrets, salt);
        assert_eq!(commitments.len(), 3);
        for (secret, commitment) in secrets.iter().zip(&commitments) {
            assert!(verify(*commitment, *secret, salt));
        }
    }

    #[test]
    fn test_small_secret_corpus_has_no_collisions() {
        let salt = U256::from(1);
        let hashes: HashSet<H256> = (0u64..1_000).map(|s| commit(U256::from(s), salt)).collect();
        assert_eq!(hashes.len(), 1_000);
    }

    proptest! {
        #[test]
        fn prop_distinct_secrets_never_collide(a in any::<u64>(), b in any::<u64>(), salt in any::<u64>()) {
            prop_assume!(a != b);
            let salt = U256::from(salt);
            prop_assert_ne!(commit(U256::from(a), salt), commit(U256::from(b), salt));
        }

        #[test]
        fn prop_commit_then_verify(secret in any::<u128>(), salt in any::<u128>()) {
            let (secret, salt) = (U256::from(secret), U256::from(salt));
            prop_assert!(verify(commit(secret, salt), secret, salt));
        }
    }
}
