//! Match Engine
//!
//! Drives one participant through one commit-reveal match:
//!
//! ```text
//!   X_REVEAL ──X reveals──► Y_REVEAL ──Y reveals──► WINNER
//!       │                       │
//!   Y claims timeoutX       X claims timeoutY
//!       └──────────────► WINNER ◄────┘
//! ```
//!
//! The engine polls the match state and only reveals on its own turn. A
//! forfeiture loop runs alongside for the whole match so a stalled opponent
//! cannot block the bracket.

use std::time::Duration;

use ethers::types::{Address, U256};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::executor::{Attempt, TransactionExecutor};
use super::timeout::{LoopSchedule, TimeoutLoop};
use super::watchers::ActiveWatchers;
use super::{until_reachable, EngineError, Timing};
use crate::core::participant::Participant;
use crate::core::state::{MatchState, Role};
use crate::ledger::{ContractCall, Ledger, LedgerError, MatchContract};

/// How a match ended for this participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    /// Match contract.
    pub contract: Address,
    /// Recorded winner.
    pub winner: Address,
    /// The winner is this participant.
    pub won: bool,
    /// Decided by a forfeiture claim.
    pub timed_out: bool,
}

/// One participant's side of one match.
pub struct MatchEngine<L: Ledger> {
    executor: TransactionExecutor<L>,
    contract: MatchContract<L>,
    role: Role,
    level: u32,
    secret: U256,
    salt: U256,
    timing: Timing,
    watchers: ActiveWatchers<L>,
}

impl<L: Ledger> MatchEngine<L> {
    /// Prepare to play `contract` at `level`.
    ///
    /// Fails with [`EngineError::NotAParticipant`] when the participant is
    /// neither X nor Y.
    pub async fn new(
        executor: TransactionExecutor<L>,
        contract: MatchContract<L>,
        participant: &Participant,
        level: u32,
        timing: Timing,
    ) -> Result<Self, EngineError> {
        let alias = participant.alias.as_str();
        let secret = participant.secret(level).ok_or_else(|| {
            EngineError::InvalidParameters(format!("{} holds no secret for level {}", alias, level))
        })?;

        let view =
            until_reachable(alias, "read match", timing.match_idle_poll, || contract.view()).await?;
        let role = view.role_of(participant.address).ok_or_else(|| EngineError::NotAParticipant {
            alias: alias.to_string(),
            address: participant.address,
            contract: contract.address(),
        })?;
        let opponent = match role.opponent() {
            Role::X => view.x,
            Role::Y => view.y,
        };
        info!(alias, level, ?role, ?opponent, contract = ?contract.address(), "Match assigned");

        let watchers = ActiveWatchers::new(executor.ledger().clone(), format!("{}/match-{}", alias, level));
        Ok(Self {
            executor,
            contract,
            role,
            level,
            secret,
            salt: participant.salt(),
            timing,
            watchers,
        })
    }

    /// Side this participant plays.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Play until the ledger records a winner.
    #[instrument(skip(self), fields(alias = %self.executor.alias(), level = self.level))]
    pub async fn play(mut self) -> Result<MatchResult, EngineError> {
        let result = self.run().await;
        self.watchers.release_all();
        result
    }

    fn fail(&self, action: &'static str, err: LedgerError) -> EngineError {
        EngineError::ledger(self.executor.alias(), action, err)
    }

    fn reveal_call(&self) -> ContractCall {
        match self.role {
            Role::X => ContractCall::RevealX {
                secret: self.secret,
                salt: self.salt,
            },
            Role::Y => ContractCall::RevealY {
                secret: self.secret,
                salt: self.salt,
            },
        }
    }

    async fn run(&mut self) -> Result<MatchResult, EngineError> {
        let claim = match self.role {
            Role::X => ContractCall::TimeoutY,
            Role::Y => ContractCall::TimeoutX,
        };
        let forfeit = TimeoutLoop::spawn(
            "forfeit",
            self.executor.clone(),
            self.contract.address(),
            claim,
            LoopSchedule::every(self.timing.match_claim_interval),
        );
        self.watchers.track_loop(forfeit.clone());

        let mut forfeit_settled = false;
        let mut pause = Duration::ZERO;

        loop {
            if !pause.is_zero() {
                if forfeit_settled {
                    sleep(pause).await;
                } else {
                    tokio::select! {
                        _ = sleep(pause) => {}
                        status = forfeit.finished() => {
                            debug!(?status, "Forfeit loop settled");
                            forfeit_settled = true;
                        }
                    }
                }
            }

            let state = match self.contract.state().await {
                Ok(state) => state,
                Err(err) if err.is_transient() => {
                    warn!(%err, "Match state poll failed");
                    pause = self.timing.match_idle_poll;
                    continue;
                }
                Err(err) => return Err(self.fail("read match state", err)),
            };

            if state == MatchState::Winner {
                return self.result().await;
            }

            if state != self.role.reveal_turn() {
                debug!(?state, "Waiting for opponent");
                pause = self.timing.match_idle_poll;
                continue;
            }

            pause = self.reveal().await?;
        }
    }

    /// Submit the reveal and report how long to wait before the next poll.
    async fn reveal(&self) -> Result<Duration, EngineError> {
        let attempt = self
            .executor
            .attempt(self.contract.address(), U256::zero(), self.reveal_call())
            .await;

        match attempt {
            Ok(Attempt::Submitted(tx)) => match self.executor.await_confirmation(&tx).await {
                Ok(_) => {
                    info!(role = ?self.role, "Secret revealed");
                    Ok(self.timing.match_after_reveal_poll)
                }
                Err(LedgerError::Reverted(reason)) => {
                    warn!(%reason, "Reveal reverted");
                    Ok(self.timing.match_idle_poll)
                }
                Err(err) => Err(self.fail("reveal", err)),
            },
            Ok(Attempt::NotEnabled) => {
                info!("Reveal not enabled yet");
                Ok(self.timing.match_idle_poll)
            }
            Err(err) if err.is_transient() => {
                warn!(%err, "Reveal attempt failed");
                Ok(self.timing.match_idle_poll)
            }
            Err(err) => Err(self.fail("reveal", err)),
        }
    }

    async fn result(&self) -> Result<MatchResult, EngineError> {
        let view = until_reachable(
            self.executor.alias(),
            "read match result",
            self.timing.match_idle_poll,
            || self.contract.view(),
        )
        .await?;
        let winner = view.winner.unwrap_or_default();
        let result = MatchResult {
            contract: self.contract.address(),
            winner,
            won: winner == self.executor.signer(),
            timed_out: view.timed_out,
        };

        if result.won {
            info!(timed_out = result.timed_out, "Match won");
        } else {
            info!(?winner, timed_out = result.timed_out, "Match lost");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use ethers::types::H256;

    use super::*;
    use crate::engine::testing::{self, ether, match_of, participant, register_all};
    use crate::ledger::{
        CallDescriptor, EventName, PendingTransaction, Receipt, SimulatedLedger, Subscription,
        SubscriptionHandle, TournamentContract, ViewCall, ViewValue,
    };

    // ===== SCRIPTED LEDGER =====

    /// Ledger whose match state follows a fixed script, one code per read.
    /// Reveals are always estimated as enabled so only the engine's own turn
    /// check keeps them in order.
    #[derive(Clone)]
    struct ScriptedLedger {
        inner: Arc<Mutex<Script>>,
    }

    struct Script {
        x: Address,
        y: Address,
        winner: Address,
        states: VecDeque<u64>,
        current: u64,
        /// Upcoming participant or winner reads that fail as unreachable.
        failing_reads: u32,
        /// Submitted calls with the state code observed last.
        submitted: Vec<(ContractCall, u64)>,
    }

    impl ScriptedLedger {
        fn new(x: Address, y: Address, winner: Address, states: &[u64]) -> Self {
            Self {
                inner: Arc::new(Mutex::new(Script {
                    x,
                    y,
                    winner,
                    states: states.iter().copied().collect(),
                    current: 0,
                    failing_reads: 0,
                    submitted: Vec::new(),
                })),
            }
        }

        fn fail_next_reads(&self, count: u32) {
            self.inner.lock().unwrap().failing_reads = count;
        }

        fn submitted(&self) -> Vec<(ContractCall, u64)> {
            self.inner.lock().unwrap().submitted.clone()
        }
    }

    impl Ledger for ScriptedLedger {
        async fn call_view(&self, _target: Address, view: ViewCall) -> Result<ViewValue, LedgerError> {
            let mut script = self.inner.lock().unwrap();
            if view != ViewCall::MatchState && script.failing_reads > 0 {
                script.failing_reads -= 1;
                return Err(LedgerError::RpcUnavailable("connection refused".to_string()));
            }
            Ok(match view {
                ViewCall::MatchX => ViewValue::Address(script.x),
                ViewCall::MatchY => ViewValue::Address(script.y),
                ViewCall::MatchState => {
                    if let Some(next) = script.states.pop_front() {
                        script.current = next;
                    }
                    ViewValue::Uint(script.current.into())
                }
                ViewCall::MatchWinner => ViewValue::Address(script.winner),
                ViewCall::MatchTimedOut => ViewValue::Bool(false),
                other => return Err(LedgerError::Reverted(other.name().to_string())),
            })
        }

        async fn estimate_cost(&self, call: &CallDescriptor) -> Result<u64, LedgerError> {
            match call.call {
                ContractCall::RevealX { .. } | ContractCall::RevealY { .. } => Ok(60_000),
                _ => Err(LedgerError::Reverted("not enabled".to_string())),
            }
        }

        async fn unlock(&self, _address: Address, _credential: &str) -> Result<(), LedgerError> {
            Ok(())
        }

        async fn submit(&self, call: &CallDescriptor) -> Result<PendingTransaction, LedgerError> {
            let mut script = self.inner.lock().unwrap();
            let state = script.current;
            script.submitted.push((call.call.clone(), state));
            Ok(PendingTransaction::new(H256::from_low_u64_be(
                script.submitted.len() as u64,
            )))
        }

        async fn receipt(&self, hash: H256) -> Result<Option<Receipt>, LedgerError> {
            Ok(Some(Receipt {
                hash,
                block: 1,
                success: true,
                gas_used: 60_000,
                contract_address: None,
            }))
        }

        async fn balance(&self, _address: Address) -> Result<U256, LedgerError> {
            Ok(U256::zero())
        }

        async fn subscribe(&self, contract: Address, _name: EventName) -> Result<Subscription, LedgerError> {
            Err(LedgerError::UnknownContract(contract))
        }

        fn unsubscribe(&self, _handle: SubscriptionHandle) {}
    }

    const X_REVEAL: u64 = 0;
    const Y_REVEAL: u64 = 1;
    const WINNER: u64 = 2;

    async fn scripted_engine(
        me: &Participant,
        x: Address,
        y: Address,
        winner: Address,
        states: &[u64],
    ) -> (ScriptedLedger, Result<MatchEngine<ScriptedLedger>, EngineError>) {
        let ledger = ScriptedLedger::new(x, y, winner, states);
        let engine = engine_on(&ledger, me).await;
        (ledger, engine)
    }

    async fn engine_on(
        ledger: &ScriptedLedger,
        me: &Participant,
    ) -> Result<MatchEngine<ScriptedLedger>, EngineError> {
        let executor = TransactionExecutor::new(ledger.clone(), me, testing::BUDGET, &Timing::default());
        let contract = MatchContract::new(ledger.clone(), Address::from_low_u64_be(0x77));
        MatchEngine::new(executor, contract, me, 0, Timing::default()).await
    }

    // ===== TURN ORDER =====

    #[tokio::test(start_paused = true)]
    async fn test_x_reveals_only_on_its_turn() {
        let x = participant(0, &[3]);
        let y = participant(1, &[4]);
        let script = [Y_REVEAL, Y_REVEAL, X_REVEAL, Y_REVEAL, Y_REVEAL, WINNER];
        let (ledger, engine) = scripted_engine(&x, x.address, y.address, x.address, &script).await;
        let engine = engine.unwrap();
        assert_eq!(engine.role(), Role::X);

        let result = engine.play().await.unwrap();
        assert!(result.won);

        let reveals: Vec<_> = ledger
            .submitted()
            .into_iter()
            .filter(|(c, _)| matches!(c, ContractCall::RevealX { .. } | ContractCall::RevealY { .. }))
            .collect();
        assert_eq!(reveals.len(), 1);
        assert!(matches!(reveals[0].0, ContractCall::RevealX { .. }));
        assert_eq!(reveals[0].1, X_REVEAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_y_reveals_only_on_its_turn() {
        let x = participant(0, &[3]);
        let y = participant(1, &[4]);
        let script = [X_REVEAL, X_REVEAL, X_REVEAL, Y_REVEAL, WINNER];
        let (ledger, engine) = scripted_engine(&y, x.address, y.address, x.address, &script).await;
        let result = engine.unwrap().play().await.unwrap();
        assert!(!result.won);
        assert_eq!(result.winner, x.address);

        let submitted = ledger.submitted();
        assert_eq!(submitted.len(), 1);
        assert!(matches!(submitted[0].0, ContractCall::RevealY { .. }));
        assert_eq!(submitted[0].1, Y_REVEAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_state_code_is_fatal() {
        let x = participant(0, &[3]);
        let y = participant(1, &[4]);
        let (ledger, engine) = scripted_engine(&x, x.address, y.address, x.address, &[X_REVEAL, 7]).await;
        let err = engine.unwrap().play().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger {
                source: LedgerError::UnexpectedState { .. },
                ..
            }
        ));
        assert!(ledger.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outsider_is_rejected() {
        let x = participant(0, &[3]);
        let y = participant(1, &[4]);
        let outsider = participant(2, &[5]);
        let (_, engine) = scripted_engine(&outsider, x.address, y.address, x.address, &[]).await;
        assert!(matches!(engine, Err(EngineError::NotAParticipant { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_reads_are_retried() {
        let x = participant(0, &[3]);
        let y = participant(1, &[4]);
        let timing = Timing::default();
        // Setup reads the state once per attempt
        let script = [X_REVEAL, X_REVEAL, X_REVEAL, X_REVEAL, X_REVEAL, Y_REVEAL, WINNER];
        let ledger = ScriptedLedger::new(x.address, y.address, x.address, &script);

        let started = tokio::time::Instant::now();
        ledger.fail_next_reads(3);
        let engine = engine_on(&ledger, &x).await.unwrap();
        assert_eq!(engine.role(), Role::X);
        assert!(started.elapsed() >= timing.match_idle_poll * 3);

        // The winner lookup after WINNER is unreachable twice
        let played = tokio::spawn(engine.play());
        tokio::time::sleep(timing.match_idle_poll).await;
        ledger.fail_next_reads(2);
        let result = played.await.unwrap().unwrap();
        assert!(result.won);
        assert_eq!(result.winner, x.address);

        let reveals: Vec<_> = ledger
            .submitted()
            .into_iter()
            .filter(|(c, _)| matches!(c, ContractCall::RevealX { .. }))
            .collect();
        assert_eq!(reveals.len(), 1);
        assert_eq!(reveals[0].1, X_REVEAL);
    }

    // ===== SIMULATED MATCHES =====

    async fn started_match(players: &[Participant]) -> (SimulatedLedger, Address, Address) {
        let ledger = testing::funded(players);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        register_all(&ledger, lottery, players).await;
        let m = match_of(&ledger, lottery, players[0].address).await;
        (ledger, lottery, m)
    }

    async fn sim_engine(ledger: &SimulatedLedger, me: &Participant, m: Address) -> MatchEngine<SimulatedLedger> {
        let executor = TransactionExecutor::new(ledger.clone(), me, testing::BUDGET, &Timing::default());
        MatchEngine::new(executor, MatchContract::new(ledger.clone(), m), me, 0, Timing::default())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_sides_play_to_completion() {
        // 3 + 5 is even: X wins
        let players = [participant(0, &[3]), participant(1, &[5])];
        let (ledger, _, m) = started_match(&players).await;

        let x = sim_engine(&ledger, &players[0], m).await;
        let y = sim_engine(&ledger, &players[1], m).await;
        let (x, y) = tokio::join!(x.play(), y.play());
        let (x, y) = (x.unwrap(), y.unwrap());

        assert!(x.won);
        assert!(!y.won);
        assert_eq!(x.winner, players[0].address);
        assert!(!x.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_setup_waits_out_outage() {
        let players = [participant(0, &[3]), participant(1, &[5])];
        let (ledger, _, m) = started_match(&players).await;

        ledger.set_outage(true);
        let healer = ledger.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            healer.set_outage(false);
        });

        let x = sim_engine(&ledger, &players[0], m).await;
        let y = sim_engine(&ledger, &players[1], m).await;
        let (x, y) = tokio::join!(x.play(), y.play());
        assert!(x.unwrap().won);
        assert!(!y.unwrap().won);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_y_forfeits() {
        let players = [participant(0, &[3]), participant(1, &[4])];
        let (ledger, lottery, m) = started_match(&players).await;

        let result = sim_engine(&ledger, &players[0], m).await.play().await.unwrap();
        assert!(result.won);
        assert!(result.timed_out);
        assert_eq!(testing::submitted(&ledger, &players[0], &ContractCall::TimeoutY), 1);

        let contract = MatchContract::new(ledger.clone(), m);
        assert_eq!(contract.state().await.unwrap(), MatchState::Winner);
        assert_eq!(contract.winner().await.unwrap(), Some(players[0].address));
        assert_eq!(
            TournamentContract::new(ledger, lottery).level().await.unwrap(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_x_forfeits() {
        let players = [participant(0, &[3]), participant(1, &[4])];
        let (ledger, _, m) = started_match(&players).await;

        let result = sim_engine(&ledger, &players[1], m).await.play().await.unwrap();
        assert!(result.won);
        assert!(result.timed_out);
        assert!(ledger.submissions(players[1].address).iter().all(|c| !matches!(c, ContractCall::RevealY { .. })));
    }
}
