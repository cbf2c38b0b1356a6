//! Timeout claim loops.
//!
//! A [`TimeoutLoop`] repeatedly attempts one claim transaction until the
//! claim is confirmed on the ledger or the loop is cancelled. The same loop
//! drives the registration timeout and match forfeiture claims.
//!
//! ```text
//!   delay ──► attempt ──NotEnabled──► sleep(interval) ──► attempt ...
//!                │
//!            Submitted ──► await confirmation ──► Fired
//!                               │
//!                           reverted ──► sleep(interval) ──► attempt ...
//!
//!   cancel() at any point ──► Cancelled (an in-flight confirmation is dropped)
//! ```

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::executor::{Attempt, TransactionExecutor};
use crate::ledger::{ContractCall, Ledger, LedgerError};

/// Lifecycle of a claim loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    /// Still attempting.
    Running,
    /// The claim was confirmed.
    Fired,
    /// Stopped by its owner.
    Cancelled,
    /// Stopped on a non-retryable gateway error.
    Failed,
}

/// When a loop makes its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSchedule {
    /// Wait before the first attempt.
    pub delay: Duration,
    /// Wait between attempts.
    pub interval: Duration,
}

impl LoopSchedule {
    /// First attempt after one full interval.
    pub fn every(interval: Duration) -> Self {
        Self {
            delay: interval,
            interval,
        }
    }
}

/// Handle to a running claim loop.
///
/// Clones share the loop. Dropping every handle cancels it.
#[derive(Clone)]
pub struct TimeoutLoop {
    name: &'static str,
    cancel: Arc<watch::Sender<bool>>,
    status: watch::Receiver<TimeoutStatus>,
}

impl TimeoutLoop {
    /// Start attempting `call` against `target` on `schedule`.
    pub fn spawn<L: Ledger>(
        name: &'static str,
        executor: TransactionExecutor<L>,
        target: Address,
        call: ContractCall,
        schedule: LoopSchedule,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(TimeoutStatus::Running);

        debug!(
            alias = executor.alias(),
            loop_name = name,
            delay_ms = schedule.delay.as_millis() as u64,
            "Timeout loop started"
        );
        tokio::spawn(async move {
            let status = claim_until_settled(name, &executor, target, call, schedule, cancel_rx).await;
            status_tx.send_replace(status);
        });

        Self {
            name,
            cancel: Arc::new(cancel_tx),
            status: status_rx,
        }
    }

    /// Loop name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop future attempts. Idempotent; a fired loop stays fired.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Current status.
    pub fn status(&self) -> TimeoutStatus {
        *self.status.borrow()
    }

    /// Wait until the loop stops and report how.
    pub async fn finished(&self) -> TimeoutStatus {
        let mut status = self.status.clone();
        let settled = match status.wait_for(|s| *s != TimeoutStatus::Running).await {
            Ok(settled) => *settled,
            // The task is gone without reporting
            Err(_) => TimeoutStatus::Cancelled,
        };
        settled
    }

    /// Wait until the loop stops; `true` if its claim was confirmed.
    pub async fn fired(&self) -> bool {
        self.finished().await == TimeoutStatus::Fired
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // A dropped sender means every handle is gone
    let _ = cancel.wait_for(|c| *c).await;
}

/// Sleep for `period`; `true` if cancelled meanwhile.
async fn wait_or_cancel(cancel: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *cancel.borrow() {
        return true;
    }
    tokio::select! {
        _ = sleep(period) => *cancel.borrow(),
        _ = cancelled(cancel) => true,
    }
}

async fn claim_until_settled<L: Ledger>(
    name: &'static str,
    executor: &TransactionExecutor<L>,
    target: Address,
    call: ContractCall,
    schedule: LoopSchedule,
    mut cancel: watch::Receiver<bool>,
) -> TimeoutStatus {
    let alias = executor.alias();

    if wait_or_cancel(&mut cancel, schedule.delay).await {
        debug!(alias, loop_name = name, "Cancelled before first attempt");
        return TimeoutStatus::Cancelled;
    }

    loop {
        if *cancel.borrow() {
            return TimeoutStatus::Cancelled;
        }

        match executor.attempt(target, U256::zero(), call.clone()).await {
            Ok(Attempt::Submitted(tx)) => {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => {
                        debug!(alias, loop_name = name, "Cancelled while awaiting claim");
                        return TimeoutStatus::Cancelled;
                    }
                    confirmed = executor.await_confirmation(&tx) => match confirmed {
                        Ok(_) => {
                            info!(alias, loop_name = name, "Timeout claim confirmed");
                            return TimeoutStatus::Fired;
                        }
                        Err(LedgerError::Reverted(reason)) => {
                            debug!(alias, loop_name = name, %reason, "Claim reverted, retrying");
                        }
                        Err(err) => {
                            error!(alias, loop_name = name, %err, "Claim failed");
                            return TimeoutStatus::Failed;
                        }
                    }
                }
            }
            Ok(Attempt::NotEnabled) => {
                info!(alias, loop_name = name, "Timeout not enabled yet");
            }
            Err(err) if err.is_transient() => {
                warn!(alias, loop_name = name, %err, "Claim attempt failed, retrying");
            }
            Err(err) => {
                error!(alias, loop_name = name, %err, "Claim failed");
                return TimeoutStatus::Failed;
            }
        }

        if wait_or_cancel(&mut cancel, schedule.interval).await {
            return TimeoutStatus::Cancelled;
        }
    }
}
