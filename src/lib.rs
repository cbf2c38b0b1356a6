//! # Bracket Lottery Client
//!
//! Client-side engine for commit-reveal elimination lotteries run by an EVM
//! contract. Each participant commits one hashed secret per bracket level at
//! registration, then plays a two-party reveal match per level; the contract
//! decides every match and pays the pot to whoever survives every level.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BRACKET LOTTERY CLIENT                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Protocol primitives (no I/O)            │
//! │  ├── commitment.rs - keccak256(secret ‖ salt)                │
//! │  ├── state.rs      - Closed state codes, views, outcomes     │
//! │  └── participant.rs- Identity, salt, per-level secrets       │
//! │                                                              │
//! │  ledger/           - Ledger gateway                          │
//! │  ├── mod.rs        - Ledger trait, calls, events, errors     │
//! │  ├── abi.rs        - Selectors, topics, log decoding         │
//! │  ├── contract.rs   - Typed lottery / match accessors         │
//! │  ├── rpc.rs        - JSON-RPC node backend                   │
//! │  └── simulated.rs  - In-process contract simulation          │
//! │                                                              │
//! │  engine/           - Participant engines                     │
//! │  ├── executor.rs   - Estimate, submit, confirm               │
//! │  ├── timeout.rs    - Cancelable claim loops                  │
//! │  ├── watchers.rs   - Exactly-once resource release           │
//! │  ├── match_engine.rs - One commit-reveal match               │
//! │  ├── tournament.rs - Registration and bracket progression    │
//! │  └── supervisor.rs - Many engines per process                │
//! │                                                              │
//! │  monitor.rs        - Read-only tournament observer           │
//! │  config.rs         - File and environment configuration      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ledger Authority
//!
//! The contract is the only arbiter. Engines never decide a match or a level
//! locally: they read state, submit transactions whose preconditions the
//! contract checks, and treat a rejected estimate as "not yet".

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod engine;
pub mod ledger;
pub mod monitor;

// Re-export commonly used types
pub use config::{Config, ConfigError, PlayerConfig};
pub use core::participant::Participant;
pub use core::state::{MatchState, Outcome, TournamentState};
pub use engine::{EngineError, EngineSupervisor, MatchEngine, Timing, TournamentEngine};
pub use ledger::{Ledger, LedgerError, RpcLedger, SimulatedLedger};
pub use monitor::{MonitorSummary, TournamentMonitor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
