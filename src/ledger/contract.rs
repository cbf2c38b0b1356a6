//! Typed contract handles.
//!
//! Thin wrappers over [`Ledger::call_view`] that decode accessor results into
//! the closed state enumerations. Unknown state codes surface as
//! [`LedgerError::UnexpectedState`].

use ethers::types::{Address, U256};

use super::{Ledger, LedgerError, ViewCall};
use crate::core::state::{MatchState, MatchView, TournamentState, TournamentView};

fn small(view: ViewCall, value: U256) -> Result<u64, LedgerError> {
    if value > U256::from(u64::MAX) {
        return Err(LedgerError::decode(view, format!("{} does not fit in u64", value)));
    }
    Ok(value.as_u64())
}

fn non_zero(address: Address) -> Option<Address> {
    (!address.is_zero()).then_some(address)
}

/// Handle to a deployed lottery contract.
#[derive(Clone)]
pub struct TournamentContract<L> {
    ledger: L,
    address: Address,
}

impl<L: Ledger> TournamentContract<L> {
    /// Wrap the contract at `address`.
    pub fn new(ledger: L, address: Address) -> Self {
        Self { ledger, address }
    }

    /// Contract address.
    pub fn address(&self) -> Address {
        self.address
    }

    async fn uint(&self, view: ViewCall) -> Result<U256, LedgerError> {
        self.ledger.call_view(self.address, view).await?.into_uint(view)
    }

    /// Current state.
    pub async fn state(&self) -> Result<TournamentState, LedgerError> {
        let code = self.uint(ViewCall::TournamentState).await?;
        TournamentState::from_code(code).ok_or(LedgerError::UnexpectedState {
            machine: "lottery",
            code,
        })
    }

    /// Current bracket level.
    pub async fn level(&self) -> Result<u32, LedgerError> {
        let view = ViewCall::Level;
        let level = small(view, self.uint(view).await?)?;
        u32::try_from(level).map_err(|_| LedgerError::decode(view, "level overflows u32"))
    }

    /// Total bracket levels (L).
    pub async fn levels(&self) -> Result<u32, LedgerError> {
        let view = ViewCall::Levels;
        let levels = small(view, self.uint(view).await?)?;
        u32::try_from(levels).map_err(|_| LedgerError::decode(view, "L overflows u32"))
    }

    /// Expected participants (N).
    pub async fn expected_participants(&self) -> Result<u64, LedgerError> {
        let view = ViewCall::ExpectedParticipants;
        small(view, self.uint(view).await?)
    }

    /// Required deposit.
    pub async fn deposit(&self) -> Result<U256, LedgerError> {
        self.uint(ViewCall::Deposit).await
    }

    /// Match `participant` plays at the current level, if any.
    pub async fn current_match(&self, participant: Address) -> Result<Option<Address>, LedgerError> {
        let view = ViewCall::CurrentMatch { of: participant };
        let address = self.ledger.call_view(self.address, view).await?.into_address(view)?;
        Ok(non_zero(address))
    }

    /// Recorded tournament winner.
    pub async fn winner(&self) -> Result<Option<Address>, LedgerError> {
        let view = ViewCall::TournamentWinner;
        let address = self.ledger.call_view(self.address, view).await?.into_address(view)?;
        Ok(non_zero(address))
    }

    /// Read every cached field at once.
    pub async fn view(&self) -> Result<TournamentView, LedgerError> {
        Ok(TournamentView {
            state: self.state().await?,
            level: self.level().await?,
            levels: self.levels().await?,
            expected_participants: self.expected_participants().await?,
            deposit: self.deposit().await?,
        })
    }
}

/// Handle to a match contract.
#[derive(Clone)]
pub struct MatchContract<L> {
    ledger: L,
    address: Address,
}

impl<L: Ledger> MatchContract<L> {
    /// Wrap the contract at `address`.
    pub fn new(ledger: L, address: Address) -> Self {
        Self { ledger, address }
    }

    /// Contract address.
    pub fn address(&self) -> Address {
        self.address
    }

    async fn address_of(&self, view: ViewCall) -> Result<Address, LedgerError> {
        self.ledger.call_view(self.address, view).await?.into_address(view)
    }

    /// X participant.
    pub async fn x(&self) -> Result<Address, LedgerError> {
        self.address_of(ViewCall::MatchX).await
    }

    /// Y participant.
    pub async fn y(&self) -> Result<Address, LedgerError> {
        self.address_of(ViewCall::MatchY).await
    }

    /// Current state.
    pub async fn state(&self) -> Result<MatchState, LedgerError> {
        let view = ViewCall::MatchState;
        let code = self.ledger.call_view(self.address, view).await?.into_uint(view)?;
        MatchState::from_code(code).ok_or(LedgerError::UnexpectedState {
            machine: "match",
            code,
        })
    }

    /// Recorded winner.
    pub async fn winner(&self) -> Result<Option<Address>, LedgerError> {
        Ok(non_zero(self.address_of(ViewCall::MatchWinner).await?))
    }

    /// The match ended through a forfeiture claim.
    pub async fn timed_out(&self) -> Result<bool, LedgerError> {
        let view = ViewCall::MatchTimedOut;
        self.ledger.call_view(self.address, view).await?.into_bool(view)
    }

    /// Read every cached field at once.
    pub async fn view(&self) -> Result<MatchView, LedgerError> {
        Ok(MatchView {
            state: self.state().await?,
            x: self.x().await?,
            y: self.y().await?,
            winner: self.winner().await?,
            timed_out: self.timed_out().await?,
        })
    }
}
