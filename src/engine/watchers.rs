//! Watcher bookkeeping.
//!
//! Every subscription and claim loop an engine starts is tracked here so it
//! can be released exactly once, whichever terminal path the engine takes.

use tracing::debug;

use super::timeout::TimeoutLoop;
use crate::ledger::{Ledger, SubscriptionHandle};

/// Live subscriptions and loops owned by one engine.
pub struct ActiveWatchers<L: Ledger> {
    ledger: L,
    owner: String,
    subscriptions: Vec<SubscriptionHandle>,
    loops: Vec<TimeoutLoop>,
    released: bool,
    releases: usize,
}

impl<L: Ledger> ActiveWatchers<L> {
    /// Empty set for `owner`.
    pub fn new(ledger: L, owner: impl Into<String>) -> Self {
        Self {
            ledger,
            owner: owner.into(),
            subscriptions: Vec::new(),
            loops: Vec::new(),
            released: false,
            releases: 0,
        }
    }

    /// Track a subscription. Released on the spot once the set is released.
    pub fn track_subscription(&mut self, handle: SubscriptionHandle) {
        if self.released {
            debug!(owner = %self.owner, ?handle, "Late subscription released");
            self.ledger.unsubscribe(handle);
            return;
        }
        self.subscriptions.push(handle);
    }

    /// Track a claim loop. Cancelled on the spot once the set is released.
    pub fn track_loop(&mut self, timeout: TimeoutLoop) {
        if self.released {
            debug!(owner = %self.owner, name = timeout.name(), "Late claim loop cancelled");
            timeout.cancel();
            return;
        }
        self.loops.push(timeout);
    }

    /// Release one subscription ahead of the others.
    pub fn release_subscription(&mut self, handle: SubscriptionHandle) {
        if let Some(pos) = self.subscriptions.iter().position(|h| *h == handle) {
            self.subscriptions.swap_remove(pos);
            self.ledger.unsubscribe(handle);
        }
    }

    /// Cancel every loop and release every subscription.
    ///
    /// Returns `false` (and does nothing) when already released.
    pub fn release_all(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.releases += 1;

        for timeout in self.loops.drain(..) {
            timeout.cancel();
        }
        let count = self.subscriptions.len();
        for handle in self.subscriptions.drain(..) {
            self.ledger.unsubscribe(handle);
        }
        debug!(owner = %self.owner, subscriptions = count, "Watchers released");
        true
    }

    /// Whether [`ActiveWatchers::release_all`] ran.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Number of effective releases. Never exceeds one.
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Subscriptions still tracked.
    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Claim loops still tracked.
    pub fn loops(&self) -> &[TimeoutLoop] {
        &self.loops
    }
}

impl<L: Ledger> Drop for ActiveWatchers<L> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    use crate::engine::testing::{self, ether, participant};
    use crate::engine::timeout::{LoopSchedule, TimeoutStatus};
    use crate::engine::{Timing, TransactionExecutor};
    use crate::ledger::{ContractCall, EventName, SimConfig, SimulatedLedger};

    #[tokio::test(start_paused = true)]
    async fn test_release_is_exactly_once() {
        let ledger = SimulatedLedger::new(SimConfig::default());
        let lottery = ledger.create_lottery(1, U256::one()).unwrap();
        let mut watchers = ActiveWatchers::new(ledger.clone(), "Alice");

        for name in [EventName::RegistrationDone, EventName::RegistrationAborted] {
            let sub = ledger.subscribe(lottery, name).await.unwrap();
            watchers.track_subscription(sub.handle);
        }
        assert_eq!(ledger.active_subscriptions(), 2);

        assert!(watchers.release_all());
        assert!(!watchers.release_all());
        assert_eq!(watchers.releases(), 1);
        assert_eq!(ledger.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases() {
        let ledger = SimulatedLedger::new(SimConfig::default());
        let lottery = ledger.create_lottery(1, U256::one()).unwrap();
        {
            let mut watchers = ActiveWatchers::new(ledger.clone(), "Bob");
            let sub = ledger.subscribe(lottery, EventName::LevelIncreased).await.unwrap();
            watchers.track_subscription(sub.handle);
        }
        assert_eq!(ledger.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_single_subscription() {
        let ledger = SimulatedLedger::new(SimConfig::default());
        let lottery = ledger.create_lottery(1, U256::one()).unwrap();
        let mut watchers = ActiveWatchers::new(ledger.clone(), "Carl");
        let first = ledger.subscribe(lottery, EventName::RegistrationDone).await.unwrap();
        let second = ledger.subscribe(lottery, EventName::MatchWinner).await.unwrap();
        watchers.track_subscription(first.handle);
        watchers.track_subscription(second.handle);

        watchers.release_subscription(first.handle);
        assert_eq!(watchers.live_subscriptions(), 1);
        assert_eq!(ledger.active_subscriptions(), 1);
        assert!(!watchers.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tracking_is_released_immediately() {
        let p = participant(0, &[3]);
        let ledger = testing::funded(std::slice::from_ref(&p));
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        let mut watchers = ActiveWatchers::new(ledger.clone(), "Dora");
        assert!(watchers.release_all());

        let sub = ledger.subscribe(lottery, EventName::RegistrationDone).await.unwrap();
        watchers.track_subscription(sub.handle);
        assert_eq!(ledger.active_subscriptions(), 0);
        assert_eq!(watchers.live_subscriptions(), 0);

        let executor = TransactionExecutor::new(ledger.clone(), &p, testing::BUDGET, &Timing::default());
        let timeout = TimeoutLoop::spawn(
            "registration",
            executor,
            lottery,
            ContractCall::TimeoutRegistration,
            LoopSchedule::every(Timing::default().registration_claim_interval),
        );
        watchers.track_loop(timeout.clone());
        assert!(watchers.loops().is_empty());
        assert_eq!(timeout.finished().await, TimeoutStatus::Cancelled);
        assert_eq!(watchers.releases(), 1);
    }
}
