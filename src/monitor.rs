//! Tournament Monitor
//!
//! Read-only observer of one lottery. Subscribes to every lottery-level event
//! stream, narrates progress, and stops once the lottery reaches a terminal
//! event: `AllRefunded` or `TournamentWinner`.

use ethers::types::{Address, U256};
use futures_util::stream::{self, BoxStream, SelectAll};
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::engine::ActiveWatchers;
use crate::ledger::{EventKind, EventName, Ledger, LedgerError, LedgerEvent, TournamentContract};

/// Streams watched by the monitor.
pub const MONITORED_EVENTS: [EventName; 7] = [
    EventName::Registered,
    EventName::RegistrationDone,
    EventName::RegistrationAborted,
    EventName::AllRefunded,
    EventName::LevelIncreased,
    EventName::MatchWinner,
    EventName::TournamentWinner,
];

/// What the monitor saw.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    /// Registrations as (user id, address), in arrival order.
    pub registrations: Vec<(u64, Address)>,
    /// Levels completed.
    pub levels_completed: u32,
    /// Advancing match winners as (level, match id, user id).
    pub match_winners: Vec<(u64, u64, u64)>,
    /// Tournament winner as (user id, address).
    pub winner: Option<(u64, Address)>,
    /// Registration was aborted.
    pub aborted: bool,
    /// Every registrant was refunded.
    pub refunded: bool,
}

fn receiver_stream(rx: mpsc::UnboundedReceiver<LedgerEvent>) -> BoxStream<'static, LedgerEvent> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed()
}

/// Read side used while narrating.
struct Narrator<L> {
    ledger: L,
    contract: TournamentContract<L>,
}

/// Observer for one lottery.
pub struct TournamentMonitor<L: Ledger> {
    narrator: Narrator<L>,
    events: SelectAll<BoxStream<'static, LedgerEvent>>,
    watchers: ActiveWatchers<L>,
}

impl<L: Ledger> TournamentMonitor<L> {
    /// Subscribe to the lottery at `lottery`.
    ///
    /// Events emitted after this returns are guaranteed to be observed.
    pub async fn start(ledger: L, lottery: Address) -> Result<Self, LedgerError> {
        let mut watchers = ActiveWatchers::new(ledger.clone(), format!("monitor-{:?}", lottery));
        let mut streams = Vec::with_capacity(MONITORED_EVENTS.len());
        for name in MONITORED_EVENTS {
            let subscription = ledger.subscribe(lottery, name).await?;
            watchers.track_subscription(subscription.handle);
            streams.push(receiver_stream(subscription.events));
        }

        info!(?lottery, "Monitoring lottery");
        Ok(Self {
            narrator: Narrator {
                contract: TournamentContract::new(ledger.clone(), lottery),
                ledger,
            },
            events: stream::select_all(streams),
            watchers,
        })
    }

    /// Narrate until a terminal event. Subscriptions are released on return.
    pub async fn run(mut self) -> Result<MonitorSummary, LedgerError> {
        let mut summary = MonitorSummary::default();

        while let Some(event) = self.events.next().await {
            if !self.narrator.record(&mut summary, event).await {
                continue;
            }
            // Same-block events may sit in other streams
            while let Some(Some(event)) = self.events.next().now_or_never() {
                self.narrator.record(&mut summary, event).await;
            }
            self.watchers.release_all();
            return Ok(summary);
        }

        self.watchers.release_all();
        Err(LedgerError::RpcUnavailable("event streams closed".to_string()))
    }
}

impl<L: Ledger> Narrator<L> {
    async fn balance(&self) -> U256 {
        match self.ledger.balance(self.contract.address()).await {
            Ok(balance) => balance,
            Err(err) => {
                warn!(%err, "Lottery balance unavailable");
                U256::zero()
            }
        }
    }

    /// Fold one event into `summary`; `true` when it is terminal.
    async fn record(&self, summary: &mut MonitorSummary, event: LedgerEvent) -> bool {
        match event.kind {
            EventKind::Registered {
                participant,
                user_id,
            } => {
                info!(user_id, ?participant, block = event.block, "Participant registered");
                if !summary.registrations.iter().any(|(id, _)| *id == user_id) {
                    summary.registrations.push((user_id, participant));
                }
                false
            }
            EventKind::RegistrationDone => {
                let balance = self.balance().await;
                info!(%balance, "Registration done");
                false
            }
            EventKind::RegistrationAborted => {
                info!("Registration aborted");
                summary.aborted = true;
                false
            }
            EventKind::LevelIncreased => {
                info!(level = summary.levels_completed, "Level done");
                summary.levels_completed += 1;
                false
            }
            EventKind::MatchWinner {
                level,
                match_id,
                user_id,
            } => {
                info!(level, match_id, user_id, "Match winner advanced");
                let entry = (level, match_id, user_id);
                if !summary.match_winners.contains(&entry) {
                    summary.match_winners.push(entry);
                }
                false
            }
            EventKind::TournamentWinner { user_id } => {
                let address = match self.contract.winner().await {
                    Ok(winner) => winner.unwrap_or_default(),
                    Err(err) => {
                        warn!(%err, "Winner address unavailable");
                        Address::zero()
                    }
                };
                info!(user_id, winner = ?address, "Lottery winner");
                summary.winner = Some((user_id, address));
                true
            }
            EventKind::AllRefunded => {
                let balance = self.balance().await;
                info!(%balance, "All participants were refunded");
                summary.refunded = true;
                true
            }
            other => {
                warn!(event = ?other.name(), "Unexpected event on lottery stream");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Outcome;
    use crate::engine::testing::{self, ether, participant, BUDGET};
    use crate::engine::{Timing, TournamentEngine};
    use crate::ledger::SimulatedLedger;

    async fn play(ledger: &SimulatedLedger, lottery: Address, players: &[crate::core::Participant]) -> Vec<Outcome> {
        let mut tasks = Vec::new();
        for p in players {
            let mut engine = TournamentEngine::new(ledger.clone(), lottery, p.clone(), BUDGET, Timing::default())
                .await
                .unwrap();
            tasks.push(tokio::spawn(async move { engine.register_and_play().await.unwrap() }));
        }
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        outcomes
    }

    #[tokio::test(start_paused = true)]
    async fn test_narrates_full_tournament() {
        let players = vec![
            participant(0, &[3, 4]),
            participant(1, &[5, 1]),
            participant(2, &[2, 6]),
            participant(3, &[7, 9]),
        ];
        let ledger = testing::funded(&players);
        let lottery = ledger.create_lottery(2, ether(1)).unwrap();

        let monitor = TournamentMonitor::start(ledger.clone(), lottery).await.unwrap();
        let watching = tokio::spawn(monitor.run());
        play(&ledger, lottery, &players).await;
        let summary = watching.await.unwrap().unwrap();

        assert_eq!(summary.registrations.len(), 4);
        assert_eq!(summary.levels_completed, 2);
        assert_eq!(summary.match_winners.len(), 3);
        assert_eq!(summary.winner.map(|(_, address)| address), Some(players[3].address));
        assert!(!summary.refunded);
        assert_eq!(ledger.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_refund() {
        let players = vec![participant(0, &[3]), participant(1, &[5])];
        let ledger = testing::funded(&players);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();

        let monitor = TournamentMonitor::start(ledger.clone(), lottery).await.unwrap();
        let watching = tokio::spawn(monitor.run());
        let outcomes = play(&ledger, lottery, &players[..1]).await;
        assert_eq!(outcomes, vec![Outcome::Refunded]);

        let summary = watching.await.unwrap().unwrap();
        assert!(summary.aborted);
        assert!(summary.refunded);
        assert_eq!(summary.winner, None);
        assert_eq!(ledger.active_subscriptions(), 0);
    }
}
