//! Ledger State Machines
//!
//! Closed enumerations for the two contract state machines, plus the local
//! views the engines cache between ledger reads. Raw state codes read from the
//! ledger are mapped with [`TournamentState::from_code`] /
//! [`MatchState::from_code`]; anything outside the enumeration is rejected
//! rather than coerced.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// On-ledger tournament state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TournamentState {
    /// Registration phase.
    Init,
    /// All participants registered, matches are being played.
    Start,
    /// Registration timed out, deposits can be refunded.
    Abort,
}

impl TournamentState {
    /// Map a raw contract code.
    pub fn from_code(code: U256) -> Option<Self> {
        if code > U256::from(u8::MAX) {
            return None;
        }
        match code.as_u32() {
            0 => Some(Self::Init),
            1 => Some(Self::Start),
            2 => Some(Self::Abort),
            _ => None,
        }
    }

    /// Raw contract code.
    pub fn code(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Start => 1,
            Self::Abort => 2,
        }
    }
}

/// On-ledger match state. Reveal order is strictly X then Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchState {
    /// Waiting for X to reveal.
    XReveal,
    /// X revealed, waiting for Y.
    YReveal,
    /// Winner recorded. Terminal.
    Winner,
}

impl MatchState {
    /// Map a raw contract code.
    pub fn from_code(code: U256) -> Option<Self> {
        if code > U256::from(u8::MAX) {
            return None;
        }
        match code.as_u32() {
            0 => Some(Self::XReveal),
            1 => Some(Self::YReveal),
            2 => Some(Self::Winner),
            _ => None,
        }
    }

    /// Raw contract code.
    pub fn code(self) -> u8 {
        match self {
            Self::XReveal => 0,
            Self::YReveal => 1,
            Self::Winner => 2,
        }
    }
}

/// Which side of a match a participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// First to reveal.
    X,
    /// Second to reveal.
    Y,
}

impl Role {
    /// The match state in which this side must reveal.
    pub fn reveal_turn(self) -> MatchState {
        match self {
            Self::X => MatchState::XReveal,
            Self::Y => MatchState::YReveal,
        }
    }

    /// The opposite side.
    pub fn opponent(self) -> Self {
        match self {
            Self::X => Self::Y,
            Self::Y => Self::X,
        }
    }
}

/// Cached tournament parameters and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentView {
    /// Current state.
    pub state: TournamentState,
    /// Current bracket level, `0..=levels`.
    pub level: u32,
    /// Total bracket levels (L).
    pub levels: u32,
    /// Expected participants (N).
    pub expected_participants: u64,
    /// Deposit required to register.
    pub deposit: U256,
}

impl TournamentView {
    /// The top of the bracket has been reached.
    pub fn is_finished(&self) -> bool {
        self.level >= self.levels
    }
}

/// Cached match state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchView {
    /// Current state.
    pub state: MatchState,
    /// First revealer.
    pub x: Address,
    /// Second revealer.
    pub y: Address,
    /// Recorded winner, unset until [`MatchState::Winner`].
    pub winner: Option<Address>,
    /// The match ended through a forfeiture claim.
    pub timed_out: bool,
}

impl MatchView {
    /// Side played by `address`, if it is in this match at all.
    pub fn role_of(&self, address: Address) -> Option<Role> {
        if address == self.x {
            Some(Role::X)
        } else if address == self.y {
            Some(Role::Y)
        } else {
            None
        }
    }
}

/// Terminal result of one participant's flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Reached the top of the bracket.
    Won,
    /// Lost the match at `level`.
    Lost {
        /// Level of the lost match.
        level: u32,
    },
    /// Registration aborted and the deposit was refunded.
    Refunded,
    /// Registration aborted but the refund was not enabled.
    Aborted,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Won => write!(f, "won the lottery"),
            Self::Lost { level } => write!(f, "lost at level {}", level),
            Self::Refunded => write!(f, "refunded"),
            Self::Aborted => write!(f, "aborted without refund"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for state in [TournamentState::Init, TournamentState::Start, TournamentState::Abort] {
            assert_eq!(TournamentState::from_code(U256::from(state.code())), Some(state));
        }
        for state in [MatchState::XReveal, MatchState::YReveal, MatchState::Winner] {
            assert_eq!(MatchState::from_code(U256::from(state.code())), Some(state));
        }
    }

    #[test]
    fn test_unknown_codes_are_rejected() {
        assert_eq!(TournamentState::from_code(U256::from(3)), None);
        assert_eq!(MatchState::from_code(U256::from(7)), None);
        assert_eq!(MatchState::from_code(U256::MAX), None);
    }

    #[test]
    fn test_role_of() {
        let view = MatchView {
            state: MatchState::XReveal,
            x: Address::from_low_u64_be(1),
            y: Address::from_low_u64_be(2),
            winner: None,
            timed_out: false,
        };
        assert_eq!(view.role_of(Address::from_low_u64_be(1)), Some(Role::X));
        assert_eq!(view.role_of(Address::from_low_u64_be(2)), Some(Role::Y));
        assert_eq!(view.role_of(Address::from_low_u64_be(3)), None);
        assert_eq!(Role::X.reveal_turn(), MatchState::XReveal);
        assert_eq!(Role::Y.opponent(), Role::X);
    }
}
