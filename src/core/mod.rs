//! Core protocol primitives.
//!
//! Pure types shared by the gateway and the engines: the commitment function,
//! the closed state enumerations, and participant identity. Nothing in here
//! touches the network.

pub mod commitment;
pub mod participant;
pub mod state;

// Re-export core types
pub use commitment::{commit, commit_all, verify};
pub use participant::Participant;
pub use state::{MatchState, MatchView, Outcome, Role, TournamentState, TournamentView};
