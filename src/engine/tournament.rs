//! Tournament Engine
//!
//! One participant's path through a lottery:
//!
//! ```text
//!   INIT ──register──► wait ──RegistrationDone──► play ──► Won | Lost
//!                        │
//!                        ├──RegistrationAborted──┐
//!                        └──own timeout claim────┴──► refund ──► Refunded | Aborted
//! ```
//!
//! While waiting for the registration phase to end, three things race: the
//! two lottery events, the registration-timeout claim loop (started after a
//! grace period), and a periodic ledger state re-check that covers missed
//! events. The first to resolve wins; everything else is released.
//!
//! `play` walks the bracket one level at a time, delegating each match to a
//! [`MatchEngine`] and calling `goForward` after every win.

use ethers::types::{Address, U256};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::executor::{Attempt, TransactionExecutor};
use super::match_engine::MatchEngine;
use super::timeout::{LoopSchedule, TimeoutLoop, TimeoutStatus};
use super::watchers::ActiveWatchers;
use super::{until_reachable, EngineError, Timing};
use crate::core::participant::Participant;
use crate::core::state::{Outcome, TournamentState, TournamentView};
use crate::ledger::{
    ContractCall, EventName, Ledger, LedgerError, MatchContract, PendingTransaction,
    TournamentContract,
};

/// How the registration phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Started,
    Aborted,
}

/// Drives one participant through one lottery.
pub struct TournamentEngine<L: Ledger> {
    participant: Participant,
    executor: TransactionExecutor<L>,
    contract: TournamentContract<L>,
    params: TournamentView,
    timing: Timing,
    watchers: ActiveWatchers<L>,
    advanced_at: Option<u32>,
}

impl<L: Ledger> TournamentEngine<L> {
    /// Read the lottery parameters and check the participant fits them.
    pub async fn new(
        ledger: L,
        lottery: Address,
        participant: Participant,
        budget: u64,
        timing: Timing,
    ) -> Result<Self, EngineError> {
        let alias = participant.alias.clone();
        let contract = TournamentContract::new(ledger.clone(), lottery);
        let params =
            until_reachable(&alias, "read lottery", timing.level_retry, || contract.view()).await?;

        if participant.levels() != params.levels as usize {
            return Err(EngineError::InvalidParameters(format!(
                "{} holds {} secrets, lottery {:?} has {} levels",
                alias,
                participant.levels(),
                lottery,
                params.levels
            )));
        }

        match ledger.balance(participant.address).await {
            Ok(balance) => info!(
                alias = %alias,
                ?lottery,
                levels = params.levels,
                participants = params.expected_participants,
                deposit = %params.deposit,
                %balance,
                "Joining lottery"
            ),
            Err(err) => warn!(alias = %alias, %err, "Balance unavailable"),
        }

        let executor = TransactionExecutor::new(ledger.clone(), &participant, budget, &timing);
        Ok(Self {
            watchers: ActiveWatchers::new(ledger, alias),
            participant,
            executor,
            contract,
            params,
            timing,
            advanced_at: None,
        })
    }

    /// Participant alias.
    pub fn alias(&self) -> &str {
        &self.participant.alias
    }

    /// Participant driven by this engine.
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Lottery contract address.
    pub fn lottery(&self) -> Address {
        self.contract.address()
    }

    /// Lottery parameters read at construction. The level follows the bracket.
    pub fn params(&self) -> &TournamentView {
        &self.params
    }

    /// Times the watchers were actually released. At most one.
    pub fn watcher_releases(&self) -> usize {
        self.watchers.releases()
    }

    /// Register and play until a terminal outcome.
    ///
    /// Every subscription and loop started along the way is released before
    /// this returns, on success and on error.
    #[instrument(skip(self), fields(alias = %self.participant.alias))]
    pub async fn register_and_play(&mut self) -> Result<Outcome, EngineError> {
        let outcome = self.run().await;
        self.watchers.release_all();
        match &outcome {
            Ok(outcome) => info!(%outcome, "Participation finished"),
            Err(err) => error!(%err, "Participation failed"),
        }
        outcome
    }

    fn fail(&self, action: &'static str, err: LedgerError) -> EngineError {
        EngineError::ledger(&self.participant.alias, action, err)
    }

    async fn run(&mut self) -> Result<Outcome, EngineError> {
        let alias = self.participant.alias.as_str();
        let state = until_reachable(alias, "read lottery state", self.timing.level_retry, || {
            self.contract.state()
        })
        .await?;
        if state != TournamentState::Init {
            return Err(EngineError::InvalidState {
                alias: self.participant.alias.clone(),
                action: "register",
                expected: TournamentState::Init,
                found: state,
            });
        }

        match self.register_and_wait().await? {
            Registration::Started => self.play().await,
            Registration::Aborted => self.refund().await,
        }
    }

    // ===== REGISTRATION =====

    async fn submit_registration(&self) -> Result<PendingTransaction, EngineError> {
        let call = ContractCall::Register {
            commitments: self.participant.commitments(),
        };
        loop {
            match self
                .executor
                .attempt(self.lottery(), self.params.deposit, call.clone())
                .await
            {
                Ok(Attempt::Submitted(tx)) => return Ok(tx),
                Ok(Attempt::NotEnabled) => {
                    return Err(EngineError::RegistrationRejected {
                        alias: self.participant.alias.clone(),
                    })
                }
                Err(err) if err.is_transient() => {
                    warn!(%err, "Registration attempt failed, retrying");
                    sleep(self.timing.level_retry).await;
                }
                Err(err) => return Err(self.fail("register", err)),
            }
        }
    }

    async fn register_and_wait(&mut self) -> Result<Registration, EngineError> {
        info!(deposit = %self.params.deposit, "Registering");
        let tx = self.submit_registration().await?;

        let lottery = self.lottery();
        let ledger = self.executor.ledger().clone();
        let alias = self.participant.alias.clone();
        let retry = self.timing.level_retry;
        let mut done = until_reachable(&alias, "subscribe", retry, || {
            ledger.subscribe(lottery, EventName::RegistrationDone)
        })
        .await?;
        self.watchers.track_subscription(done.handle);
        let mut aborted = until_reachable(&alias, "subscribe", retry, || {
            ledger.subscribe(lottery, EventName::RegistrationAborted)
        })
        .await?;
        self.watchers.track_subscription(aborted.handle);

        match self.executor.await_confirmation(&tx).await {
            Ok(receipt) => info!(block = receipt.block, "Registered"),
            Err(LedgerError::Reverted(reason)) => {
                warn!(%reason, "Registration reverted");
                return Err(EngineError::RegistrationRejected {
                    alias: self.participant.alias.clone(),
                });
            }
            Err(err) => return Err(self.fail("register", err)),
        }

        let claim = TimeoutLoop::spawn(
            "registration",
            self.executor.clone(),
            lottery,
            ContractCall::TimeoutRegistration,
            LoopSchedule {
                delay: self.timing.registration_grace,
                interval: self.timing.registration_claim_interval,
            },
        );
        self.watchers.track_loop(claim.clone());

        // First tick is immediate: the registration may have completed the lottery
        let mut recheck = interval_at(Instant::now(), self.timing.state_recheck);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut claim_settled = false;

        let resolution = loop {
            tokio::select! {
                Some(_) = done.events.recv() => {
                    info!("Registration complete");
                    break Registration::Started;
                }
                Some(_) = aborted.events.recv() => {
                    info!("Registration aborted");
                    break Registration::Aborted;
                }
                status = claim.finished(), if !claim_settled => {
                    claim_settled = true;
                    match status {
                        TimeoutStatus::Fired => {
                            info!("Own registration timeout claim confirmed");
                            break Registration::Aborted;
                        }
                        other => debug!(?other, "Registration claim loop stopped"),
                    }
                }
                _ = recheck.tick() => {
                    match self.contract.state().await {
                        Ok(TournamentState::Init) => debug!("Still registering"),
                        Ok(TournamentState::Start) => {
                            info!("Registration complete (state re-check)");
                            break Registration::Started;
                        }
                        Ok(TournamentState::Abort) => {
                            info!("Registration aborted (state re-check)");
                            break Registration::Aborted;
                        }
                        Err(err) if err.is_transient() => warn!(%err, "State re-check failed"),
                        Err(err) => return Err(self.fail("read lottery state", err)),
                    }
                }
            }
        };

        claim.cancel();
        self.watchers.release_subscription(done.handle);
        self.watchers.release_subscription(aborted.handle);
        Ok(resolution)
    }

    async fn refund(&mut self) -> Result<Outcome, EngineError> {
        loop {
            let attempt = self
                .executor
                .attempt(self.lottery(), U256::zero(), ContractCall::Refund)
                .await;
            match attempt {
                Ok(Attempt::Submitted(tx)) => {
                    return match self.executor.await_confirmation(&tx).await {
                        Ok(_) => {
                            self.log_balance("Deposit refunded").await;
                            Ok(Outcome::Refunded)
                        }
                        Err(LedgerError::Reverted(reason)) => {
                            warn!(%reason, "Refund reverted");
                            Ok(Outcome::Aborted)
                        }
                        Err(err) => Err(self.fail("refund", err)),
                    };
                }
                Ok(Attempt::NotEnabled) => {
                    info!("Refund not enabled");
                    return Ok(Outcome::Aborted);
                }
                Err(err) if err.is_transient() => {
                    warn!(%err, "Refund attempt failed, retrying");
                    sleep(self.timing.level_retry).await;
                }
                Err(err) => return Err(self.fail("refund", err)),
            }
        }
    }

    async fn log_balance(&self, message: &'static str) {
        match self.executor.ledger().balance(self.participant.address).await {
            Ok(balance) => info!(%balance, "{}", message),
            Err(_) => info!("{}", message),
        }
    }

    // ===== BRACKET =====

    async fn play(&mut self) -> Result<Outcome, EngineError> {
        let me = self.participant.address;

        loop {
            let level = match self.contract.level().await {
                Ok(level) => level,
                Err(err) if err.is_transient() => {
                    warn!(%err, "Level poll failed");
                    sleep(self.timing.level_retry).await;
                    continue;
                }
                Err(err) => return Err(self.fail("read level", err)),
            };

            self.params.level = level;
            if self.params.is_finished() {
                self.log_balance("Won the lottery").await;
                return Ok(Outcome::Won);
            }

            let current = match self.contract.current_match(me).await {
                Ok(current) => current,
                Err(err) if err.is_transient() => {
                    warn!(%err, "Match lookup failed");
                    sleep(self.timing.level_retry).await;
                    continue;
                }
                Err(err) => return Err(self.fail("read match", err)),
            };
            let Some(match_address) = current else {
                debug!(level, "No match at this level yet");
                sleep(self.timing.level_retry).await;
                continue;
            };

            let contract = MatchContract::new(self.executor.ledger().clone(), match_address);
            let winner = match contract.winner().await {
                Ok(winner) => winner,
                Err(err) if err.is_transient() => {
                    warn!(%err, "Match winner poll failed");
                    sleep(self.timing.level_retry).await;
                    continue;
                }
                Err(err) => return Err(self.fail("read match", err)),
            };

            match winner {
                Some(winner) if winner != me => {
                    info!(level, ?winner, "Match already lost");
                    return Ok(Outcome::Lost { level });
                }
                Some(_) if self.advanced_at == Some(level) => {
                    debug!(level, "Waiting for the level to complete");
                    sleep(self.timing.level_retry).await;
                }
                Some(_) => self.go_forward(level).await?,
                None => {
                    info!(level, "Playing level");
                    let engine = MatchEngine::new(
                        self.executor.clone(),
                        contract,
                        &self.participant,
                        level,
                        self.timing,
                    )
                    .await?;
                    let result = engine.play().await?;
                    if !result.won {
                        return Ok(Outcome::Lost { level });
                    }
                    self.go_forward(level).await?;
                }
            }
        }
    }

    async fn go_forward(&mut self, level: u32) -> Result<(), EngineError> {
        loop {
            let attempt = self
                .executor
                .attempt(self.lottery(), U256::zero(), ContractCall::GoForward)
                .await;
            match attempt {
                Ok(Attempt::Submitted(tx)) => match self.executor.await_confirmation(&tx).await {
                    Ok(_) => {
                        info!(level, "Advanced to the next level");
                        self.advanced_at = Some(level);
                        return Ok(());
                    }
                    Err(LedgerError::Reverted(reason)) => warn!(%reason, "goForward reverted"),
                    Err(err) => return Err(self.fail("goForward", err)),
                },
                Ok(Attempt::NotEnabled) => info!(level, "goForward not enabled yet"),
                Err(err) if err.is_transient() => warn!(%err, "goForward attempt failed"),
                Err(err) => return Err(self.fail("goForward", err)),
            }

            // The level only moves past ours once we have advanced
            if let Ok(current) = self.contract.level().await {
                if current > level {
                    self.advanced_at = Some(level);
                    return Ok(());
                }
            }
            sleep(self.timing.level_retry).await;
        }
    }
}
