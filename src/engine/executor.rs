//! Transaction execution.
//!
//! Every mutating call goes through [`TransactionExecutor::attempt`]: the
//! call is estimated first, and a call that would revert or exceed the gas
//! budget is reported as [`Attempt::NotEnabled`] instead of being sent.
//! `NotEnabled` is a retry signal, never an error.

use std::time::Duration;

use ethers::types::{Address, U256};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::Timing;
use crate::core::participant::Participant;
use crate::ledger::{CallDescriptor, ContractCall, Ledger, LedgerError, PendingTransaction, Receipt};

/// Result of trying to send a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The call was broadcast.
    Submitted(PendingTransaction),
    /// The call's precondition is not met yet.
    NotEnabled,
}

/// Sends calls on behalf of one participant.
#[derive(Clone)]
pub struct TransactionExecutor<L> {
    ledger: L,
    signer: Address,
    credential: String,
    alias: String,
    budget: u64,
    confirmation_poll: Duration,
    progress_every: Duration,
}

impl<L: Ledger> TransactionExecutor<L> {
    /// Executor signing as `participant`, with `budget` gas per call.
    pub fn new(ledger: L, participant: &Participant, budget: u64, timing: &Timing) -> Self {
        Self {
            ledger,
            signer: participant.address,
            credential: participant.credential().to_string(),
            alias: participant.alias.clone(),
            budget,
            confirmation_poll: timing.confirmation_poll,
            progress_every: timing.confirmation_progress,
        }
    }

    /// Underlying gateway.
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Signing address.
    pub fn signer(&self) -> Address {
        self.signer
    }

    /// Participant alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Gas budget per call.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Estimate `call` and submit it if it is enabled.
    pub async fn attempt(
        &self,
        to: Address,
        value: U256,
        call: ContractCall,
    ) -> Result<Attempt, LedgerError> {
        let name = call.name();
        let descriptor = CallDescriptor {
            from: self.signer,
            to,
            value,
            gas_limit: self.budget,
            call,
        };

        match self.ledger.estimate_cost(&descriptor).await {
            Ok(cost) if cost >= self.budget => {
                debug!(alias = %self.alias, call = name, cost, "Not enabled (would run out of gas)");
                return Ok(Attempt::NotEnabled);
            }
            Ok(_) => {}
            Err(LedgerError::Reverted(reason)) => {
                debug!(alias = %self.alias, call = name, %reason, "Not enabled");
                return Ok(Attempt::NotEnabled);
            }
            Err(err) => return Err(err),
        }

        self.ledger.unlock(self.signer, &self.credential).await?;
        let pending = self.ledger.submit(&descriptor).await?;
        info!(
            alias = %self.alias,
            call = name,
            tx = %hex::encode(pending.hash),
            "Transaction submitted"
        );
        Ok(Attempt::Submitted(pending))
    }

    /// Poll until `tx` is mined.
    ///
    /// Transient gateway failures are absorbed. A mined transaction whose
    /// execution failed surfaces as [`LedgerError::Reverted`].
    pub async fn await_confirmation(&self, tx: &PendingTransaction) -> Result<Receipt, LedgerError> {
        let started = Instant::now();
        let mut last_progress = started;

        loop {
            match self.ledger.receipt(tx.hash).await {
                Ok(Some(receipt)) if receipt.success => {
                    debug!(alias = %self.alias, tx = %hex::encode(tx.hash), block = receipt.block, "Confirmed");
                    return Ok(receipt);
                }
                Ok(Some(receipt)) => {
                    return Err(LedgerError::Reverted(format!(
                        "transaction 0x{} failed in block {}",
                        hex::encode(tx.hash),
                        receipt.block
                    )));
                }
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    warn!(alias = %self.alias, %err, "Receipt poll failed, retrying");
                }
                Err(err) => return Err(err),
            }

            if last_progress.elapsed() >= self.progress_every {
                info!(
                    alias = %self.alias,
                    tx = %hex::encode(tx.hash),
                    waited_secs = started.elapsed().as_secs(),
                    "Still waiting for transaction to be mined"
                );
                last_progress = Instant::now();
            }
            sleep(self.confirmation_poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::commitment::commit;
    use crate::ledger::{SimConfig, SimulatedLedger};

    const BUDGET: u64 = 4_700_000;

    fn participant(n: u64) -> Participant {
        Participant::new(
            Address::from_low_u64_be(0xA000 + n),
            format!("P{}", n),
            "pw",
            U256::from(n),
            vec![U256::from(3)],
        )
    }

    fn setup() -> (SimulatedLedger, Participant, Address) {
        let ledger = SimulatedLedger::new(SimConfig::default());
        let p = participant(1);
        ledger.fund_account(p.address, U256::exp10(20), "pw");
        let lottery = ledger.create_lottery(1, U256::exp10(18)).unwrap();
        (ledger, p, lottery)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverting_call_is_not_enabled() {
        let (ledger, p, lottery) = setup();
        let executor = TransactionExecutor::new(ledger.clone(), &p, BUDGET, &Timing::default());

        let attempt = executor
            .attempt(lottery, U256::zero(), ContractCall::Refund)
            .await
            .unwrap();
        assert_eq!(attempt, Attempt::NotEnabled);
        assert!(ledger.submissions(p.address).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_budget_is_not_enabled() {
        let (ledger, p, lottery) = setup();
        let executor = TransactionExecutor::new(ledger.clone(), &p, 10_000, &Timing::default());
        let call = ContractCall::Register {
            commitments: vec![commit(U256::from(3), U256::from(1))],
        };
        let attempt = executor.attempt(lottery, U256::exp10(18), call).await.unwrap();
        assert_eq!(attempt, Attempt::NotEnabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_confirm() {
        let (ledger, p, lottery) = setup();
        let executor = TransactionExecutor::new(ledger.clone(), &p, BUDGET, &Timing::default());
        let call = ContractCall::Register {
            commitments: p.commitments(),
        };

        let Attempt::Submitted(tx) = executor.attempt(lottery, U256::exp10(18), call).await.unwrap() else {
            panic!("registration should be enabled");
        };
        let receipt = executor.await_confirmation(&tx).await.unwrap();
        assert_eq!(receipt.hash, tx.hash);
        assert!(receipt.success);
        assert_eq!(ledger.submissions(p.address).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_survives_outage() {
        let (ledger, p, lottery) = setup();
        let executor = TransactionExecutor::new(ledger.clone(), &p, BUDGET, &Timing::default());
        let call = ContractCall::Register {
            commitments: p.commitments(),
        };
        let Attempt::Submitted(tx) = executor.attempt(lottery, U256::exp10(18), call).await.unwrap() else {
            panic!("registration should be enabled");
        };

        ledger.set_outage(true);
        let healer = ledger.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(20)).await;
            healer.set_outage(false);
        });

        let receipt = executor.await_confirmation(&tx).await.unwrap();
        assert!(receipt.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_credential_is_account_locked() {
        let (ledger, p, lottery) = setup();
        let impostor = Participant::new(p.address, "P1", "wrong", p.salt(), vec![U256::from(3)]);
        let executor = TransactionExecutor::new(ledger, &impostor, BUDGET, &Timing::default());
        let call = ContractCall::Register {
            commitments: impostor.commitments(),
        };
        let err = executor
            .attempt(lottery, U256::exp10(18), call)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountLocked(_)));
    }
}
