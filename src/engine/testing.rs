//! Shared fixtures for engine tests.

use ethers::types::{Address, U256};

use super::executor::{Attempt, TransactionExecutor};
use super::Timing;
use crate::core::participant::Participant;
use crate::ledger::{ContractCall, SimConfig, SimulatedLedger, TournamentContract};

pub const BUDGET: u64 = 4_700_000;
pub const CREDENTIAL: &str = "pw";

pub fn ether(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

pub fn participant(n: u64, secrets: &[u64]) -> Participant {
    Participant::new(
        Address::from_low_u64_be(0xA000 + n),
        format!("P{}", n),
        CREDENTIAL,
        U256::from(n + 1),
        secrets.iter().map(|s| U256::from(*s)).collect(),
    )
}

pub fn funded(participants: &[Participant]) -> SimulatedLedger {
    let ledger = SimulatedLedger::new(SimConfig::default());
    for p in participants {
        ledger.fund_account(p.address, ether(100), CREDENTIAL);
    }
    ledger
}

/// Register every participant directly, bypassing the tournament engine.
pub async fn register_all(ledger: &SimulatedLedger, lottery: Address, participants: &[Participant]) {
    let deposit = TournamentContract::new(ledger.clone(), lottery)
        .deposit()
        .await
        .unwrap();
    for p in participants {
        let executor = TransactionExecutor::new(ledger.clone(), p, BUDGET, &Timing::default());
        let call = ContractCall::Register {
            commitments: p.commitments(),
        };
        let Attempt::Submitted(tx) = executor.attempt(lottery, deposit, call).await.unwrap() else {
            panic!("{} could not register", p.alias);
        };
        executor.await_confirmation(&tx).await.unwrap();
    }
}

/// Current-level match of `address`.
pub async fn match_of(ledger: &SimulatedLedger, lottery: Address, address: Address) -> Address {
    TournamentContract::new(ledger.clone(), lottery)
        .current_match(address)
        .await
        .unwrap()
        .unwrap()
}

/// How many calls of the same kind as `call` `who` has submitted.
pub fn submitted(ledger: &SimulatedLedger, who: &Participant, call: &ContractCall) -> usize {
    ledger
        .submissions(who.address)
        .iter()
        .filter(|c| std::mem::discriminant(*c) == std::mem::discriminant(call))
        .count()
}
