//! Participant identity and secrets.

use ethers::types::{Address, H256, U256};
use rand::Rng;

use super::commitment::commit_all;

/// Smallest secret drawn by [`Participant::random_secrets`].
pub const MIN_RANDOM_SECRET: u64 = 1;
/// Largest secret drawn by [`Participant::random_secrets`].
pub const MAX_RANDOM_SECRET: u64 = 11;

/// A lottery participant.
///
/// One secret per bracket level; the secret for level `l` is revealed in the
/// match played at that level.
#[derive(Clone)]
pub struct Participant {
    /// Signing address.
    pub address: Address,
    /// Display alias used in logs.
    pub alias: String,
    credential: String,
    salt: U256,
    secrets: Vec<U256>,
}

impl Participant {
    /// Create a participant.
    pub fn new(
        address: Address,
        alias: impl Into<String>,
        credential: impl Into<String>,
        salt: U256,
        secrets: Vec<U256>,
    ) -> Self {
        Self {
            address,
            alias: alias.into(),
            credential: credential.into(),
            salt,
            secrets,
        }
    }

    /// Draw `levels` secrets uniformly from `1..=11`.
    pub fn random_secrets<R: Rng>(rng: &mut R, levels: u32) -> Vec<U256> {
        (0..levels)
            .map(|_| U256::from(rng.gen_range(MIN_RANDOM_SECRET..=MAX_RANDOM_SECRET)))
            .collect()
    }

    /// Credential used to unlock the signing account.
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Per-tournament salt.
    pub fn salt(&self) -> U256 {
        self.salt
    }

    /// Number of levels this participant holds secrets for.
    pub fn levels(&self) -> usize {
        self.secrets.len()
    }

    /// Secret for `level`.
    pub fn secret(&self, level: u32) -> Option<U256> {
        self.secrets.get(level as usize).copied()
    }

    /// Commitments submitted at registration, in bracket order.
    pub fn commitments(&self) -> Vec<H256> {
        commit_all(&self.secrets, self.salt)
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("address", &self.address)
            .field("alias", &self.alias)
            .field("levels", &self.secrets.len())
            .finish_non_exhaustive()
    }
}
