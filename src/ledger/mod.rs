//! Ledger Gateway
//!
//! Boundary between the engines and the ledger that runs the lottery and match
//! contracts. The [`Ledger`] trait is the only way engine code reads contract
//! state, submits transactions, or watches events.
//!
//! ## Backends
//!
//! - `rpc`: Ethereum JSON-RPC node over HTTP
//! - `simulated`: in-process contract simulation for tests and demos
//!
//! Event subscriptions deliver through channels; consumers must tolerate the
//! same event arriving more than once.

pub mod abi;
pub mod contract;
pub mod rpc;
pub mod simulated;

use std::future::Future;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use contract::{MatchContract, TournamentContract};
pub use rpc::{RpcConfig, RpcLedger};
pub use simulated::{SimConfig, SimulatedLedger};

// =============================================================================
// CALLS
// =============================================================================

/// A state-changing contract call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractCall {
    /// Register with the deposit and one commitment per level.
    Register {
        /// Commitments in bracket order.
        commitments: Vec<H256>,
    },
    /// X reveals its secret.
    RevealX {
        /// Plain secret.
        secret: U256,
        /// Salt used for the commitment.
        salt: U256,
    },
    /// Y reveals its secret.
    RevealY {
        /// Plain secret.
        secret: U256,
        /// Salt used for the commitment.
        salt: U256,
    },
    /// Y claims X forfeited its reveal.
    TimeoutX,
    /// X claims Y forfeited its reveal.
    TimeoutY,
    /// Claim that registration timed out.
    TimeoutRegistration,
    /// Reclaim the deposit after an aborted registration.
    Refund,
    /// Advance the bracket after winning the current-level match.
    GoForward,
}

impl ContractCall {
    /// Contract method name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::RevealX { .. } => "revealX",
            Self::RevealY { .. } => "revealY",
            Self::TimeoutX => "timeoutX",
            Self::TimeoutY => "timeoutY",
            Self::TimeoutRegistration => "timeoutRegistration",
            Self::Refund => "refund",
            Self::GoForward => "goForward",
        }
    }
}

/// A call together with everything needed to sign and send it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDescriptor {
    /// Signing account.
    pub from: Address,
    /// Target contract.
    pub to: Address,
    /// Value attached to the call.
    pub value: U256,
    /// Gas limit for the transaction.
    pub gas_limit: u64,
    /// The call itself.
    pub call: ContractCall,
}

/// A read-only contract accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewCall {
    /// Tournament state code.
    TournamentState,
    /// Current bracket level.
    Level,
    /// Total bracket levels (L).
    Levels,
    /// Expected participants (N).
    ExpectedParticipants,
    /// Required deposit.
    Deposit,
    /// The current-level match of a participant (zero address if none).
    CurrentMatch {
        /// Participant whose match is requested.
        of: Address,
    },
    /// Recorded tournament winner (zero address until decided).
    TournamentWinner,
    /// Match X participant.
    MatchX,
    /// Match Y participant.
    MatchY,
    /// Match state code.
    MatchState,
    /// Recorded match winner (zero address until decided).
    MatchWinner,
    /// Whether the match ended through a forfeiture claim.
    MatchTimedOut,
}

impl ViewCall {
    /// Contract accessor name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TournamentState | Self::MatchState => "state",
            Self::Level => "level",
            Self::Levels => "L",
            Self::ExpectedParticipants => "N",
            Self::Deposit => "DEPOSIT",
            Self::CurrentMatch { .. } => "getMatch",
            Self::TournamentWinner => "lotteryWinner",
            Self::MatchX => "x",
            Self::MatchY => "y",
            Self::MatchWinner => "winner",
            Self::MatchTimedOut => "timeout",
        }
    }
}

/// Decoded return value of a [`ViewCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewValue {
    /// Unsigned integer word.
    Uint(U256),
    /// Address word.
    Address(Address),
    /// Boolean word.
    Bool(bool),
}

impl ViewValue {
    /// Expect an integer.
    pub fn into_uint(self, view: ViewCall) -> Result<U256, LedgerError> {
        match self {
            Self::Uint(value) => Ok(value),
            other => Err(LedgerError::decode(view, format!("expected uint, got {:?}", other))),
        }
    }

    /// Expect an address.
    pub fn into_address(self, view: ViewCall) -> Result<Address, LedgerError> {
        match self {
            Self::Address(value) => Ok(value),
            other => Err(LedgerError::decode(view, format!("expected address, got {:?}", other))),
        }
    }

    /// Expect a boolean.
    pub fn into_bool(self, view: ViewCall) -> Result<bool, LedgerError> {
        match self {
            Self::Bool(value) => Ok(value),
            other => Err(LedgerError::decode(view, format!("expected bool, got {:?}", other))),
        }
    }
}

// =============================================================================
// TRANSACTIONS
// =============================================================================

/// A submitted, not yet confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Transaction hash.
    pub hash: H256,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

impl PendingTransaction {
    /// Wrap a freshly submitted hash.
    pub fn new(hash: H256) -> Self {
        Self {
            hash,
            submitted_at: Utc::now(),
        }
    }
}

/// Inclusion record of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction hash.
    pub hash: H256,
    /// Block the transaction was mined in.
    pub block: u64,
    /// Execution succeeded (a mined transaction may still have reverted).
    pub success: bool,
    /// Gas consumed.
    pub gas_used: u64,
    /// Address of a contract created by the transaction.
    pub contract_address: Option<Address>,
}

/// Progress of a transaction that creates a contract.
///
/// Backends report creation as two distinct signals, so callers never
/// distinguish "callback with a hash" from "callback with an address".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxSignal {
    /// The transaction was broadcast.
    TransactionHash(H256),
    /// The transaction was mined.
    Mined(Receipt),
}

// =============================================================================
// EVENTS
// =============================================================================

/// Event streams a contract can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventName {
    /// A participant registered.
    Registered,
    /// All expected participants registered.
    RegistrationDone,
    /// Registration was aborted through a timeout claim.
    RegistrationAborted,
    /// Every registrant was refunded.
    AllRefunded,
    /// The bracket advanced one level.
    LevelIncreased,
    /// A match winner advanced.
    MatchWinner,
    /// The tournament winner was recorded.
    TournamentWinner,
    /// X revealed its secret.
    XRevealed,
    /// Y revealed its secret.
    YRevealed,
    /// A match winner was recorded.
    Winner,
}

/// Decoded event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A participant registered.
    Registered {
        /// Registrant.
        participant: Address,
        /// Registration index.
        user_id: u64,
    },
    /// All expected participants registered.
    RegistrationDone,
    /// Registration was aborted.
    RegistrationAborted,
    /// Every registrant was refunded.
    AllRefunded,
    /// The bracket advanced one level.
    LevelIncreased,
    /// A match winner advanced.
    MatchWinner {
        /// Level of the match.
        level: u64,
        /// Match index within the level.
        match_id: u64,
        /// Winner's registration index.
        user_id: u64,
    },
    /// The tournament winner was recorded.
    TournamentWinner {
        /// Winner's registration index.
        user_id: u64,
    },
    /// X revealed its secret.
    XRevealed {
        /// Revealed secret.
        number: U256,
    },
    /// Y revealed its secret.
    YRevealed {
        /// Revealed secret.
        number: U256,
    },
    /// A match winner was recorded.
    Winner {
        /// Winning address.
        winner: Address,
        /// Decided by a forfeiture claim.
        timed_out: bool,
    },
}

impl EventKind {
    /// Stream this event belongs to.
    pub fn name(&self) -> EventName {
        match self {
            Self::Registered { .. } => EventName::Registered,
            Self::RegistrationDone => EventName::RegistrationDone,
            Self::RegistrationAborted => EventName::RegistrationAborted,
            Self::AllRefunded => EventName::AllRefunded,
            Self::LevelIncreased => EventName::LevelIncreased,
            Self::MatchWinner { .. } => EventName::MatchWinner,
            Self::TournamentWinner { .. } => EventName::TournamentWinner,
            Self::XRevealed { .. } => EventName::XRevealed,
            Self::YRevealed { .. } => EventName::YRevealed,
            Self::Winner { .. } => EventName::Winner,
        }
    }
}

/// An event emitted by a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Emitting contract.
    pub contract: Address,
    /// Block of the emitting transaction.
    pub block: u64,
    /// Payload.
    pub kind: EventKind,
}

/// Handle used to release a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

/// A live event subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Release handle.
    pub handle: SubscriptionHandle,
    /// Matching events, in emission order.
    pub events: mpsc::UnboundedReceiver<LedgerEvent>,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Gateway errors.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Network or node failure. Transient.
    #[error("ledger RPC unavailable: {0}")]
    RpcUnavailable(String),

    /// The signing account could not be unlocked.
    #[error("account {0:?} is locked")]
    AccountLocked(Address),

    /// The node reports the call would fail (or did fail).
    #[error("call reverted: {0}")]
    Reverted(String),

    /// A state code outside the known enumeration.
    #[error("unexpected {machine} state code {code}")]
    UnexpectedState {
        /// State machine name.
        machine: &'static str,
        /// Raw code read from the ledger.
        code: U256,
    },

    /// A returned value could not be decoded.
    #[error("cannot decode `{view}`: {detail}")]
    Decode {
        /// Accessor name.
        view: &'static str,
        /// What went wrong.
        detail: String,
    },

    /// No contract at the given address.
    #[error("no contract at {0:?}")]
    UnknownContract(Address),
}

impl LedgerError {
    pub(crate) fn decode(view: ViewCall, detail: impl Into<String>) -> Self {
        Self::Decode {
            view: view.name(),
            detail: detail.into(),
        }
    }

    /// Whether retrying at the normal cadence may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcUnavailable(_))
    }
}

// =============================================================================
// GATEWAY
// =============================================================================

/// Access to the ledger hosting the lottery contracts.
pub trait Ledger: Clone + Send + Sync + 'static {
    /// Read a contract accessor. Never mutates, never waits for blocks.
    fn call_view(
        &self,
        target: Address,
        view: ViewCall,
    ) -> impl Future<Output = Result<ViewValue, LedgerError>> + Send;

    /// Estimate the gas a call would consume.
    fn estimate_cost(
        &self,
        call: &CallDescriptor,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Unlock `address` for signing. Required before [`Ledger::submit`].
    fn unlock(
        &self,
        address: Address,
        credential: &str,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Sign and broadcast a call.
    fn submit(
        &self,
        call: &CallDescriptor,
    ) -> impl Future<Output = Result<PendingTransaction, LedgerError>> + Send;

    /// Inclusion record of a transaction, `None` while it is pending.
    fn receipt(
        &self,
        hash: H256,
    ) -> impl Future<Output = Result<Option<Receipt>, LedgerError>> + Send;

    /// Balance of an account.
    fn balance(&self, address: Address) -> impl Future<Output = Result<U256, LedgerError>> + Send;

    /// Subscribe to one event stream of one contract.
    fn subscribe(
        &self,
        contract: Address,
        name: EventName,
    ) -> impl Future<Output = Result<Subscription, LedgerError>> + Send;

    /// Release a subscription. Releasing twice is a no-op.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}
