//! Participant Engines
//!
//! Everything that drives one participant through a tournament:
//!
//! - `executor`: estimate-then-submit and confirmation watching
//! - `timeout`: cancelable periodic claim loops
//! - `watchers`: exactly-once release of subscriptions and loops
//! - `match_engine`: one commit-reveal match
//! - `tournament`: registration, refund, and the per-level bracket loop
//! - `supervisor`: several engines in one process
//!
//! ## Cadences
//!
//! All waits are driven by [`Timing`]. The defaults are the protocol's
//! cadences (60 s claim loops, 30 s idle polls, 5 s after a reveal); tests and
//! demos shrink them with [`Timing::scaled`].

pub mod executor;
pub mod match_engine;
pub mod supervisor;
pub mod timeout;
pub mod tournament;
pub mod watchers;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::time::Duration;

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::core::state::TournamentState;
use crate::ledger::LedgerError;

pub use executor::{Attempt, TransactionExecutor};
pub use match_engine::{MatchEngine, MatchResult};
pub use supervisor::{EngineSupervisor, RunError, RunId, RunReport, SupervisorError};
pub use timeout::{LoopSchedule, TimeoutLoop, TimeoutStatus};
pub use tournament::TournamentEngine;
pub use watchers::ActiveWatchers;

// =============================================================================
// TIMING
// =============================================================================

/// Polling and retry cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    /// Receipt polling period while awaiting confirmation.
    pub confirmation_poll: Duration,
    /// Period of the "still waiting" confirmation log.
    pub confirmation_progress: Duration,
    /// Delay before the first registration-timeout claim.
    pub registration_grace: Duration,
    /// Period of the registration-timeout claim loop.
    pub registration_claim_interval: Duration,
    /// Period of the ledger state re-check while waiting for registration.
    pub state_recheck: Duration,
    /// Period of the match forfeiture claim loop.
    pub match_claim_interval: Duration,
    /// Match state poll while it is not our turn.
    pub match_idle_poll: Duration,
    /// Match state poll right after our own reveal.
    pub match_after_reveal_poll: Duration,
    /// Wait before re-reading a decided match or retrying `goForward`.
    pub level_retry: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            confirmation_poll: Duration::from_secs(3),
            confirmation_progress: Duration::from_secs(10),
            registration_grace: Duration::from_secs(60),
            registration_claim_interval: Duration::from_secs(60),
            state_recheck: Duration::from_secs(60),
            match_claim_interval: Duration::from_secs(60),
            match_idle_poll: Duration::from_secs(30),
            match_after_reveal_poll: Duration::from_secs(5),
            level_retry: Duration::from_secs(30),
        }
    }
}

impl Timing {
    /// Default cadences divided by `divisor`.
    pub fn scaled(divisor: u32) -> Self {
        let divisor = divisor.max(1);
        let base = Self::default();
        let floor = Duration::from_millis(1);
        let scale = |d: Duration| (d / divisor).max(floor);
        Self {
            confirmation_poll: scale(base.confirmation_poll),
            confirmation_progress: scale(base.confirmation_progress),
            registration_grace: scale(base.registration_grace),
            registration_claim_interval: scale(base.registration_claim_interval),
            state_recheck: scale(base.state_recheck),
            match_claim_interval: scale(base.match_claim_interval),
            match_idle_poll: scale(base.match_idle_poll),
            match_after_reveal_poll: scale(base.match_after_reveal_poll),
            level_retry: scale(base.level_retry),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Fatal engine errors. Each halts only the participant it belongs to.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A ledger operation failed.
    #[error("[{alias}] {action} failed: {source}")]
    Ledger {
        /// Participant alias.
        alias: String,
        /// Action being attempted.
        action: &'static str,
        /// Gateway error.
        #[source]
        source: LedgerError,
    },

    /// The ledger is not in the state the action requires.
    #[error("[{alias}] cannot {action}: expected {expected:?}, found {found:?}")]
    InvalidState {
        /// Participant alias.
        alias: String,
        /// Action being attempted.
        action: &'static str,
        /// Required state.
        expected: TournamentState,
        /// State read from the ledger.
        found: TournamentState,
    },

    /// Participant and tournament parameters disagree.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The participant does not play in the given match.
    #[error("[{alias}] {address:?} is not a participant of match {contract:?}")]
    NotAParticipant {
        /// Participant alias.
        alias: String,
        /// Participant address.
        address: Address,
        /// Match contract.
        contract: Address,
    },

    /// The ledger refused the registration.
    #[error("[{alias}] registration rejected by the lottery")]
    RegistrationRejected {
        /// Participant alias.
        alias: String,
    },
}

impl EngineError {
    pub(crate) fn ledger(alias: &str, action: &'static str, source: LedgerError) -> Self {
        Self::Ledger {
            alias: alias.to_string(),
            action,
            source,
        }
    }
}

/// Run `read` until it succeeds, sleeping `period` after each transient
/// failure. Any other failure is fatal for `action`.
pub(crate) async fn until_reachable<T, F, Fut>(
    alias: &str,
    action: &'static str,
    period: Duration,
    mut read: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    loop {
        match read().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!(alias, action, %err, "Ledger unreachable, retrying");
                sleep(period).await;
            }
            Err(err) => return Err(EngineError::ledger(alias, action, err)),
        }
    }
}
