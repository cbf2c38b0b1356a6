//! Simulated Ledger
//!
//! In-process [`Ledger`] running the lottery and match contract rules.
//!
//! ## Model
//!
//! - On-ledger time is the tokio clock measured from genesis, so tests under
//!   paused time run multi-minute timeouts instantly
//! - Blocks are produced every `block_interval`; every transaction waiting in
//!   the mempool is included in the next block, in submission order
//! - Gas is a fixed cost per call charged at the configured price
//! - A background miner delivers events even when nobody is calling in; every
//!   gateway call also catches the chain up first
//!
//! ## Contract rules
//!
//! A lottery with `L` levels expects `N = 2^L` registrants, each paying the
//! exact deposit and committing one hash per level. The N-th registration
//! starts the tournament and pairs registrants into level-0 matches. In every
//! match X reveals first, then Y; an even sum of the two secrets makes X the
//! winner. Winners call `goForward`; once every match of a level has
//! advanced, the level increases and winners are paired again, until the last
//! winner collects the pot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use ethers::types::{Address, H256, U256};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::{
    CallDescriptor, ContractCall, EventKind, EventName, Ledger, LedgerError, LedgerEvent,
    PendingTransaction, Receipt, Subscription, SubscriptionHandle, TxSignal, ViewCall, ViewValue,
};
use crate::core::commitment::verify;
use crate::core::state::{MatchState, TournamentState};

/// Domain separator for simulated transaction hashes.
const TX_HASH_DOMAIN: &[u8] = b"BRACKET_LOTTERY_SIM_TX_V1";

/// First address handed out to simulated contracts.
const CONTRACT_ADDRESS_BASE: u64 = 0xC0_0000;

/// Gas consumed by a lottery deployment.
pub const DEPLOY_GAS: u64 = 3_000_000;

/// Deepest bracket a simulated lottery accepts.
pub const MAX_LEVELS: u32 = 16;

/// Fixed gas consumed by each call.
pub fn gas_cost(call: &ContractCall) -> u64 {
    match call {
        ContractCall::Register { commitments } => 120_000 + 20_000 * commitments.len() as u64,
        ContractCall::RevealX { .. } | ContractCall::RevealY { .. } => 60_000,
        ContractCall::TimeoutX | ContractCall::TimeoutY => 45_000,
        ContractCall::TimeoutRegistration => 40_000,
        ContractCall::Refund => 35_000,
        ContractCall::GoForward => 250_000,
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Simulation parameters.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Time between blocks.
    pub block_interval: Duration,
    /// Price charged per unit of gas.
    pub gas_price: U256,
    /// Time after deployment from which a registrant may abort registration.
    pub registration_timeout: Duration,
    /// Time a match side has to reveal before the opponent may claim it.
    pub reveal_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_secs(1),
            gas_price: U256::from(500_000_000_000u64),
            registration_timeout: Duration::from_secs(180),
            reveal_timeout: Duration::from_secs(120),
        }
    }
}

impl SimConfig {
    /// Default parameters with every duration divided by `divisor`.
    pub fn scaled(divisor: u32) -> Self {
        let divisor = divisor.max(1);
        let base = Self::default();
        Self {
            block_interval: (base.block_interval / divisor).max(Duration::from_millis(1)),
            gas_price: base.gas_price,
            registration_timeout: base.registration_timeout / divisor,
            reveal_timeout: base.reveal_timeout / divisor,
        }
    }

    fn block_time(&self, number: u64) -> Duration {
        let number = u32::try_from(number).unwrap_or(u32::MAX);
        self.block_interval.checked_mul(number).unwrap_or(Duration::MAX)
    }
}

// =============================================================================
// CONTRACT STATE
// =============================================================================

#[derive(Debug, Clone)]
struct Registrant {
    address: Address,
    commitments: Vec<H256>,
    refunded: bool,
}

#[derive(Debug, Clone)]
struct SimLottery {
    levels: u32,
    deposit: U256,
    state: TournamentState,
    level: u32,
    created_at: Duration,
    registrants: Vec<Registrant>,
    /// Match contracts per level, in bracket order.
    brackets: Vec<Vec<Address>>,
    /// Advanced winner per match, per level.
    advanced: Vec<Vec<Option<Address>>>,
    winner: Option<Address>,
}

impl SimLottery {
    fn expected(&self) -> u64 {
        1u64 << self.levels
    }

    fn user_id(&self, address: Address) -> Option<u64> {
        self.registrants
            .iter()
            .position(|r| r.address == address)
            .map(|i| i as u64)
    }

    fn commitment(&self, address: Address, level: u32) -> H256 {
        self.registrants
            .iter()
            .find(|r| r.address == address)
            .and_then(|r| r.commitments.get(level as usize))
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
struct SimMatch {
    x: Address,
    y: Address,
    commitment_x: H256,
    commitment_y: H256,
    state: MatchState,
    secret_x: Option<U256>,
    turn_started: Duration,
    winner: Option<Address>,
    timed_out: bool,
}

impl SimMatch {
    fn has(&self, address: Address) -> bool {
        self.x == address || self.y == address
    }

    fn decide(&mut self, winner: Address, timed_out: bool) -> EventKind {
        self.state = MatchState::Winner;
        self.winner = Some(winner);
        self.timed_out = timed_out;
        EventKind::Winner { winner, timed_out }
    }
}

type Emitted = Vec<(Address, EventKind)>;

fn require(condition: bool, reason: &str) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason.to_string())
    }
}

/// Accounts and contracts. Cloned for dry runs.
#[derive(Debug, Clone, Default)]
struct Chain {
    balances: HashMap<Address, U256>,
    lotteries: HashMap<Address, SimLottery>,
    matches: HashMap<Address, SimMatch>,
    next_contract: u64,
}

impl Chain {
    fn balance(&self, address: Address) -> U256 {
        self.balances.get(&address).copied().unwrap_or_default()
    }

    fn debit(&mut self, address: Address, amount: U256) {
        let balance = self.balances.entry(address).or_default();
        *balance = balance.saturating_sub(amount);
    }

    fn credit(&mut self, address: Address, amount: U256) {
        let balance = self.balances.entry(address).or_default();
        *balance = balance.saturating_add(amount);
    }

    fn transfer(&mut self, from: Address, to: Address, amount: U256) {
        self.debit(from, amount);
        self.credit(to, amount);
    }

    fn allocate(&mut self) -> Address {
        self.next_contract += 1;
        Address::from_low_u64_be(CONTRACT_ADDRESS_BASE + self.next_contract)
    }

    fn create_lottery(&mut self, levels: u32, deposit: U256, now: Duration) -> Address {
        let address = self.allocate();
        self.lotteries.insert(
            address,
            SimLottery {
                levels,
                deposit,
                state: TournamentState::Init,
                level: 0,
                created_at: now,
                registrants: Vec::new(),
                brackets: Vec::new(),
                advanced: Vec::new(),
                winner: None,
            },
        );
        address
    }

    /// Pair the players of the lottery's current level into fresh matches.
    fn open_level(&mut self, lottery_address: Address, now: Duration) {
        let Some(lottery) = self.lotteries.get(&lottery_address) else {
            return;
        };
        let level = lottery.level;
        let players: Vec<Address> = match level {
            0 => lottery.registrants.iter().map(|r| r.address).collect(),
            _ => lottery
                .advanced
                .get(level as usize - 1)
                .map(|winners| winners.iter().flatten().copied().collect())
                .unwrap_or_default(),
        };
        let seeds: Vec<SimMatch> = players
            .chunks(2)
            .filter_map(|pair| match pair {
                [x, y] => Some(SimMatch {
                    x: *x,
                    y: *y,
                    commitment_x: lottery.commitment(*x, level),
                    commitment_y: lottery.commitment(*y, level),
                    state: MatchState::XReveal,
                    secret_x: None,
                    turn_started: now,
                    winner: None,
                    timed_out: false,
                }),
                _ => None,
            })
            .collect();

        let mut bracket = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let address = self.allocate();
            self.matches.insert(address, seed);
            bracket.push(address);
        }
        if let Some(lottery) = self.lotteries.get_mut(&lottery_address) {
            lottery.advanced.push(vec![None; bracket.len()]);
            lottery.brackets.push(bracket);
        }
    }

    fn current_match(&self, lottery: &SimLottery, of: Address) -> Option<(usize, Address)> {
        if lottery.state != TournamentState::Start {
            return None;
        }
        lottery
            .brackets
            .get(lottery.level as usize)?
            .iter()
            .enumerate()
            .find(|(_, m)| self.matches.get(m).is_some_and(|m| m.has(of)))
            .map(|(i, m)| (i, *m))
    }

    fn view(&self, target: Address, view: ViewCall) -> Result<ViewValue, LedgerError> {
        if let Some(lottery) = self.lotteries.get(&target) {
            return match view {
                ViewCall::TournamentState => Ok(ViewValue::Uint(lottery.state.code().into())),
                ViewCall::Level => Ok(ViewValue::Uint(lottery.level.into())),
                ViewCall::Levels => Ok(ViewValue::Uint(lottery.levels.into())),
                ViewCall::ExpectedParticipants => Ok(ViewValue::Uint(lottery.expected().into())),
                ViewCall::Deposit => Ok(ViewValue::Uint(lottery.deposit)),
                ViewCall::CurrentMatch { of } => Ok(ViewValue::Address(
                    self.current_match(lottery, of)
                        .map(|(_, m)| m)
                        .unwrap_or_default(),
                )),
                ViewCall::TournamentWinner => {
                    Ok(ViewValue::Address(lottery.winner.unwrap_or_default()))
                }
                other => Err(LedgerError::Reverted(format!(
                    "lottery has no accessor `{}`",
                    other.name()
                ))),
            };
        }
        if let Some(m) = self.matches.get(&target) {
            return match view {
                ViewCall::MatchX => Ok(ViewValue::Address(m.x)),
                ViewCall::MatchY => Ok(ViewValue::Address(m.y)),
                ViewCall::MatchState => Ok(ViewValue::Uint(m.state.code().into())),
                ViewCall::MatchWinner => Ok(ViewValue::Address(m.winner.unwrap_or_default())),
                ViewCall::MatchTimedOut => Ok(ViewValue::Bool(m.timed_out)),
                other => Err(LedgerError::Reverted(format!(
                    "match has no accessor `{}`",
                    other.name()
                ))),
            };
        }
        Err(LedgerError::UnknownContract(target))
    }

    /// Run a call. All checks happen before any mutation, so a revert leaves
    /// the chain untouched.
    fn execute(
        &mut self,
        tx: &CallDescriptor,
        now: Duration,
        config: &SimConfig,
    ) -> Result<Emitted, String> {
        let CallDescriptor {
            from,
            to,
            value,
            call,
            ..
        } = tx;
        let (from, to) = (*from, *to);

        require(
            matches!(call, ContractCall::Register { .. }) || value.is_zero(),
            "function is not payable",
        )?;
        require(self.balance(from) >= *value, "insufficient funds")?;

        let events = match call {
            ContractCall::Register { commitments } => {
                self.register(from, to, *value, commitments, now)?
            }
            ContractCall::TimeoutRegistration => self.timeout_registration(from, to, now, config)?,
            ContractCall::Refund => self.refund(from, to)?,
            ContractCall::GoForward => self.go_forward(from, to, now)?,
            ContractCall::RevealX { secret, salt } => self.reveal_x(from, to, *secret, *salt, now)?,
            ContractCall::RevealY { secret, salt } => self.reveal_y(from, to, *secret, *salt)?,
            ContractCall::TimeoutX => self.claim_forfeit(from, to, MatchState::XReveal, now, config)?,
            ContractCall::TimeoutY => self.claim_forfeit(from, to, MatchState::YReveal, now, config)?,
        };
        self.transfer(from, to, *value);
        Ok(events)
    }

    fn register(
        &mut self,
        from: Address,
        to: Address,
        value: U256,
        commitments: &[H256],
        now: Duration,
    ) -> Result<Emitted, String> {
        let lottery = self.lotteries.get_mut(&to).ok_or("not a lottery")?;
        require(lottery.state == TournamentState::Init, "registration closed")?;
        require(value == lottery.deposit, "wrong deposit")?;
        require(
            commitments.len() == lottery.levels as usize,
            "one commitment per level required",
        )?;
        require(lottery.user_id(from).is_none(), "already registered")?;

        let user_id = lottery.registrants.len() as u64;
        lottery.registrants.push(Registrant {
            address: from,
            commitments: commitments.to_vec(),
            refunded: false,
        });
        let mut events = vec![(
            to,
            EventKind::Registered {
                participant: from,
                user_id,
            },
        )];

        if lottery.registrants.len() as u64 == lottery.expected() {
            lottery.state = TournamentState::Start;
            events.push((to, EventKind::RegistrationDone));
            // Level-0 turn clocks start with the last registration
            self.open_level(to, now);
        }
        Ok(events)
    }

    fn timeout_registration(
        &mut self,
        from: Address,
        to: Address,
        now: Duration,
        config: &SimConfig,
    ) -> Result<Emitted, String> {
        let lottery = self.lotteries.get_mut(&to).ok_or("not a lottery")?;
        require(lottery.state == TournamentState::Init, "registration is not open")?;
        require(lottery.user_id(from).is_some(), "not registered")?;
        require(
            now.saturating_sub(lottery.created_at) >= config.registration_timeout,
            "registration timeout not reached",
        )?;
        lottery.state = TournamentState::Abort;
        Ok(vec![(to, EventKind::RegistrationAborted)])
    }

    fn refund(&mut self, from: Address, to: Address) -> Result<Emitted, String> {
        let lottery = self.lotteries.get_mut(&to).ok_or("not a lottery")?;
        require(lottery.state == TournamentState::Abort, "registration not aborted")?;
        let registrant = lottery
            .registrants
            .iter_mut()
            .find(|r| r.address == from)
            .ok_or("not registered")?;
        require(!registrant.refunded, "already refunded")?;
        registrant.refunded = true;

        let deposit = lottery.deposit;
        let all_refunded = lottery.registrants.iter().all(|r| r.refunded);
        self.transfer(to, from, deposit);

        Ok(if all_refunded {
            vec![(to, EventKind::AllRefunded)]
        } else {
            Vec::new()
        })
    }

    fn go_forward(&mut self, from: Address, to: Address, now: Duration) -> Result<Emitted, String> {
        let lottery = self.lotteries.get(&to).ok_or("not a lottery")?;
        require(
            lottery.state == TournamentState::Start && lottery.level < lottery.levels,
            "tournament not running",
        )?;
        let level = lottery.level;
        let (index, match_address) = self
            .current_match(lottery, from)
            .ok_or("no match at the current level")?;
        let winner = self.matches.get(&match_address).and_then(|m| m.winner);
        require(winner == Some(from), "match not won")?;
        require(
            lottery.advanced[level as usize][index].is_none(),
            "already advanced",
        )?;
        let user_id = lottery.user_id(from).unwrap_or_default();

        let lottery = self.lotteries.get_mut(&to).ok_or("not a lottery")?;
        lottery.advanced[level as usize][index] = Some(from);
        let mut events = vec![(
            to,
            EventKind::MatchWinner {
                level: level.into(),
                match_id: index as u64,
                user_id,
            },
        )];

        if lottery.advanced[level as usize].iter().all(Option::is_some) {
            lottery.level += 1;
            events.push((to, EventKind::LevelIncreased));
            if lottery.level == lottery.levels {
                lottery.winner = Some(from);
                events.push((to, EventKind::TournamentWinner { user_id }));
                let pot = self.balance(to);
                self.transfer(to, from, pot);
            } else {
                self.open_level(to, now);
            }
        }
        Ok(events)
    }

    fn reveal_x(
        &mut self,
        from: Address,
        to: Address,
        secret: U256,
        salt: U256,
        now: Duration,
    ) -> Result<Emitted, String> {
        let m = self.matches.get_mut(&to).ok_or("not a match")?;
        require(m.x == from, "only X may reveal first")?;
        require(m.state == MatchState::XReveal, "not X's turn")?;
        require(verify(m.commitment_x, secret, salt), "commitment mismatch")?;
        m.secret_x = Some(secret);
        m.state = MatchState::YReveal;
        m.turn_started = now;
        Ok(vec![(to, EventKind::XRevealed { number: secret })])
    }

    fn reveal_y(
        &mut self,
        from: Address,
        to: Address,
        secret: U256,
        salt: U256,
    ) -> Result<Emitted, String> {
        let m = self.matches.get_mut(&to).ok_or("not a match")?;
        require(m.y == from, "only Y may reveal second")?;
        require(m.state == MatchState::YReveal, "not Y's turn")?;
        require(verify(m.commitment_y, secret, salt), "commitment mismatch")?;
        let secret_x = m.secret_x.unwrap_or_default();
        let even = (secret_x.low_u64() ^ secret.low_u64()) & 1 == 0;
        let winner = if even { m.x } else { m.y };
        let decided = m.decide(winner, false);
        Ok(vec![
            (to, EventKind::YRevealed { number: secret }),
            (to, decided),
        ])
    }

    fn claim_forfeit(
        &mut self,
        from: Address,
        to: Address,
        stalled_turn: MatchState,
        now: Duration,
        config: &SimConfig,
    ) -> Result<Emitted, String> {
        let m = self.matches.get_mut(&to).ok_or("not a match")?;
        let claimant = match stalled_turn {
            MatchState::XReveal => m.y,
            _ => m.x,
        };
        require(from == claimant, "only the waiting side may claim")?;
        require(m.state == stalled_turn, "turn already taken")?;
        require(
            now.saturating_sub(m.turn_started) >= config.reveal_timeout,
            "reveal timeout not reached",
        )?;
        Ok(vec![(to, m.decide(from, true))])
    }
}

// =============================================================================
// WORLD
// =============================================================================

enum Queued {
    Call {
        hash: H256,
        tx: CallDescriptor,
    },
    Deploy {
        hash: H256,
        creator: Address,
        levels: u32,
        deposit: U256,
        signal: mpsc::UnboundedSender<TxSignal>,
    },
}

struct Subscriber {
    handle: SubscriptionHandle,
    contract: Address,
    name: EventName,
    tx: mpsc::UnboundedSender<LedgerEvent>,
}

struct World {
    genesis: Instant,
    block: u64,
    nonce: u64,
    chain: Chain,
    mempool: VecDeque<Queued>,
    receipts: HashMap<H256, Receipt>,
    credentials: HashMap<Address, String>,
    unlocked: HashSet<Address>,
    subscribers: Vec<Subscriber>,
    next_handle: u64,
    outage: bool,
    history: Vec<CallDescriptor>,
}

impl World {
    fn new() -> Self {
        Self {
            genesis: Instant::now(),
            block: 0,
            nonce: 0,
            chain: Chain::default(),
            mempool: VecDeque::new(),
            receipts: HashMap::new(),
            credentials: HashMap::new(),
            unlocked: HashSet::new(),
            subscribers: Vec::new(),
            next_handle: 1,
            outage: false,
            history: Vec::new(),
        }
    }

    fn now(&self) -> Duration {
        Instant::now().saturating_duration_since(self.genesis)
    }

    fn online(&self) -> Result<(), LedgerError> {
        if self.outage {
            return Err(LedgerError::RpcUnavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn next_hash(&mut self, payload: &[u8]) -> H256 {
        self.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(TX_HASH_DOMAIN);
        hasher.update(payload);
        hasher.update(self.nonce.to_le_bytes());
        H256::from_slice(&hasher.finalize())
    }

    /// Catch the chain up to the current time.
    fn advance(&mut self, config: &SimConfig) {
        let interval = config.block_interval.as_nanos().max(1);
        let due = u64::try_from(self.now().as_nanos() / interval).unwrap_or(u64::MAX);
        if due <= self.block {
            return;
        }
        if !self.mempool.is_empty() {
            self.mine(self.block + 1, config);
        }
        self.block = due;
    }

    fn mine(&mut self, number: u64, config: &SimConfig) {
        let timestamp = config.block_time(number);
        let queued: Vec<Queued> = self.mempool.drain(..).collect();
        trace!(block = number, txs = queued.len(), "Mining block");

        for entry in queued {
            match entry {
                Queued::Call { hash, tx } => {
                    let gas_used = gas_cost(&tx.call);
                    let fee = config.gas_price.saturating_mul(gas_used.into());
                    self.chain.debit(tx.from, fee);

                    let (success, events) = match self.chain.execute(&tx, timestamp, config) {
                        Ok(events) => (true, events),
                        Err(reason) => {
                            debug!(call = tx.call.name(), from = ?tx.from, %reason, "Transaction reverted");
                            (false, Vec::new())
                        }
                    };
                    self.receipts.insert(
                        hash,
                        Receipt {
                            hash,
                            block: number,
                            success,
                            gas_used,
                            contract_address: None,
                        },
                    );
                    for (contract, kind) in events {
                        self.dispatch(LedgerEvent {
                            contract,
                            block: number,
                            kind,
                        });
                    }
                }
                Queued::Deploy {
                    hash,
                    creator,
                    levels,
                    deposit,
                    signal,
                } => {
                    let fee = config.gas_price.saturating_mul(DEPLOY_GAS.into());
                    self.chain.debit(creator, fee);
                    let address = self.chain.create_lottery(levels, deposit, timestamp);
                    let receipt = Receipt {
                        hash,
                        block: number,
                        success: true,
                        gas_used: DEPLOY_GAS,
                        contract_address: Some(address),
                    };
                    self.receipts.insert(hash, receipt.clone());
                    let _ = signal.send(TxSignal::Mined(receipt));
                }
            }
        }
    }

    fn dispatch(&mut self, event: LedgerEvent) {
        let name = event.kind.name();
        for subscriber in &self.subscribers {
            if subscriber.contract == event.contract && subscriber.name == name {
                // A dropped receiver is the consumer's business; the handle
                // stays live until released.
                let _ = subscriber.tx.send(event.clone());
            }
        }
    }
}

fn lock(world: &Mutex<World>) -> MutexGuard<'_, World> {
    world.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// GATEWAY
// =============================================================================

/// In-process ledger.
///
/// Must be created inside a tokio runtime: construction spawns the miner.
#[derive(Clone)]
pub struct SimulatedLedger {
    world: Arc<Mutex<World>>,
    config: SimConfig,
}

impl SimulatedLedger {
    /// Start a fresh chain.
    pub fn new(config: SimConfig) -> Self {
        let world = Arc::new(Mutex::new(World::new()));
        spawn_miner(Arc::downgrade(&world), config);
        info!(
            block_interval_ms = config.block_interval.as_millis() as u64,
            "Simulated ledger started"
        );
        Self { world, config }
    }

    /// Simulation parameters.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn world(&self) -> MutexGuard<'_, World> {
        let mut world = lock(&self.world);
        world.advance(&self.config);
        world
    }

    /// Create a funded account unlockable with `credential`.
    pub fn fund_account(&self, address: Address, balance: U256, credential: &str) {
        let mut world = self.world();
        world.chain.credit(address, balance);
        world.credentials.insert(address, credential.to_string());
    }

    /// Deploy a lottery instantly, without a creator transaction.
    pub fn create_lottery(&self, levels: u32, deposit: U256) -> Result<Address, LedgerError> {
        validate_levels(levels)?;
        let mut world = self.world();
        let now = world.now();
        Ok(world.chain.create_lottery(levels, deposit, now))
    }

    /// Deploy a lottery through a creation transaction signed by `creator`.
    ///
    /// The returned channel yields [`TxSignal::TransactionHash`] immediately
    /// and [`TxSignal::Mined`], carrying the contract address, once included.
    pub fn deploy_lottery(
        &self,
        creator: Address,
        levels: u32,
        deposit: U256,
    ) -> Result<mpsc::UnboundedReceiver<TxSignal>, LedgerError> {
        validate_levels(levels)?;
        let mut world = self.world();
        world.online()?;
        if !world.unlocked.contains(&creator) {
            return Err(LedgerError::AccountLocked(creator));
        }
        let fee = self.config.gas_price.saturating_mul(DEPLOY_GAS.into());
        if world.chain.balance(creator) < fee {
            return Err(LedgerError::Reverted("insufficient funds for deployment".to_string()));
        }

        let mut payload = creator.as_bytes().to_vec();
        payload.extend(levels.to_be_bytes());
        let hash = world.next_hash(&payload);

        let (signal, rx) = mpsc::unbounded_channel();
        let _ = signal.send(TxSignal::TransactionHash(hash));
        world.mempool.push_back(Queued::Deploy {
            hash,
            creator,
            levels,
            deposit,
            signal,
        });
        info!(?creator, levels, %deposit, tx = %hex::encode(hash), "Lottery deployment submitted");
        Ok(rx)
    }

    /// Make every gateway call fail with [`LedgerError::RpcUnavailable`].
    pub fn set_outage(&self, outage: bool) {
        self.world().outage = outage;
    }

    /// Calls submitted by `from`, in submission order.
    pub fn submissions(&self, from: Address) -> Vec<ContractCall> {
        self.world()
            .history
            .iter()
            .filter(|tx| tx.from == from)
            .map(|tx| tx.call.clone())
            .collect()
    }

    /// Subscriptions not yet released.
    pub fn active_subscriptions(&self) -> usize {
        self.world().subscribers.len()
    }

    /// Latest block number.
    pub fn block_number(&self) -> u64 {
        self.world().block
    }
}

fn validate_levels(levels: u32) -> Result<(), LedgerError> {
    if levels == 0 || levels > MAX_LEVELS {
        return Err(LedgerError::Reverted(format!(
            "levels must be in 1..={}, got {}",
            MAX_LEVELS, levels
        )));
    }
    Ok(())
}

fn spawn_miner(world: Weak<Mutex<World>>, config: SimConfig) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.block_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(world) = world.upgrade() else {
                break;
            };
            lock(&world).advance(&config);
        }
    });
}

impl Ledger for SimulatedLedger {
    async fn call_view(&self, target: Address, view: ViewCall) -> Result<ViewValue, LedgerError> {
        let world = self.world();
        world.online()?;
        world.chain.view(target, view)
    }

    async fn estimate_cost(&self, call: &CallDescriptor) -> Result<u64, LedgerError> {
        let world = self.world();
        world.online()?;
        let mut dry_run = world.chain.clone();
        let now = world.now();
        dry_run
            .execute(call, now, &self.config)
            .map(|_| gas_cost(&call.call))
            .map_err(LedgerError::Reverted)
    }

    async fn unlock(&self, address: Address, credential: &str) -> Result<(), LedgerError> {
        let mut world = self.world();
        world.online()?;
        if world.credentials.get(&address).map(String::as_str) != Some(credential) {
            return Err(LedgerError::AccountLocked(address));
        }
        world.unlocked.insert(address);
        Ok(())
    }

    async fn submit(&self, call: &CallDescriptor) -> Result<PendingTransaction, LedgerError> {
        let mut world = self.world();
        world.online()?;
        if !world.unlocked.contains(&call.from) {
            return Err(LedgerError::AccountLocked(call.from));
        }
        let max_fee = self.config.gas_price.saturating_mul(call.gas_limit.into());
        if world.chain.balance(call.from) < max_fee.saturating_add(call.value) {
            return Err(LedgerError::Reverted(
                "insufficient funds for gas * price + value".to_string(),
            ));
        }

        let payload = bincode::serialize(call)
            .map_err(|e| LedgerError::RpcUnavailable(format!("cannot encode transaction: {}", e)))?;
        let hash = world.next_hash(&payload);
        world.history.push(call.clone());
        world.mempool.push_back(Queued::Call {
            hash,
            tx: call.clone(),
        });
        trace!(call = call.call.name(), from = ?call.from, tx = %hex::encode(hash), "Queued");
        Ok(PendingTransaction::new(hash))
    }

    async fn receipt(&self, hash: H256) -> Result<Option<Receipt>, LedgerError> {
        let world = self.world();
        world.online()?;
        Ok(world.receipts.get(&hash).cloned())
    }

    async fn balance(&self, address: Address) -> Result<U256, LedgerError> {
        let world = self.world();
        world.online()?;
        Ok(world.chain.balance(address))
    }

    async fn subscribe(&self, contract: Address, name: EventName) -> Result<Subscription, LedgerError> {
        let mut world = self.world();
        world.online()?;
        if !world.chain.lotteries.contains_key(&contract) && !world.chain.matches.contains_key(&contract) {
            return Err(LedgerError::UnknownContract(contract));
        }
        let handle = SubscriptionHandle(world.next_handle);
        world.next_handle += 1;
        let (tx, events) = mpsc::unbounded_channel();
        world.subscribers.push(Subscriber {
            handle,
            contract,
            name,
            tx,
        });
        Ok(Subscription { handle, events })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        lock(&self.world).subscribers.retain(|s| s.handle != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::commitment::commit;

    const CREDENTIAL: &str = "pw";

    fn ether(n: u64) -> U256 {
        U256::from(n) * U256::exp10(18)
    }

    fn account(n: u64) -> Address {
        Address::from_low_u64_be(0xA000 + n)
    }

    fn ledger_with_accounts(count: u64) -> SimulatedLedger {
        let ledger = SimulatedLedger::new(SimConfig::default());
        for n in 0..count {
            ledger.fund_account(account(n), ether(100), CREDENTIAL);
        }
        ledger
    }

    fn descriptor(from: Address, to: Address, value: U256, call: ContractCall) -> CallDescriptor {
        CallDescriptor {
            from,
            to,
            value,
            gas_limit: 4_700_000,
            call,
        }
    }

    async fn send(ledger: &SimulatedLedger, tx: CallDescriptor) -> Receipt {
        ledger.unlock(tx.from, CREDENTIAL).await.unwrap();
        let pending = ledger.submit(&tx).await.unwrap();
        loop {
            if let Some(receipt) = ledger.receipt(pending.hash).await.unwrap() {
                return receipt;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    fn register_call(secret: u64, salt: u64) -> ContractCall {
        ContractCall::Register {
            commitments: vec![commit(U256::from(secret), U256::from(salt))],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_starts_tournament() {
        let ledger = ledger_with_accounts(2);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        let mut done = ledger.subscribe(lottery, EventName::RegistrationDone).await.unwrap();

        let receipt = send(&ledger, descriptor(account(0), lottery, ether(1), register_call(3, 1))).await;
        assert!(receipt.success);
        assert_eq!(
            ledger.call_view(lottery, ViewCall::TournamentState).await.unwrap(),
            ViewValue::Uint(TournamentState::Init.code().into())
        );

        send(&ledger, descriptor(account(1), lottery, ether(1), register_call(4, 2))).await;
        let event = done.events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::RegistrationDone);
        assert_eq!(
            ledger.call_view(lottery, ViewCall::TournamentState).await.unwrap(),
            ViewValue::Uint(TournamentState::Start.code().into())
        );
        assert_eq!(ledger.balance(lottery).await.unwrap(), ether(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_deposit_reverts_estimate() {
        let ledger = ledger_with_accounts(1);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        let err = ledger
            .estimate_cost(&descriptor(account(0), lottery, ether(2), register_call(1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Reverted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_timeout_and_refund() {
        let ledger = ledger_with_accounts(1);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        send(&ledger, descriptor(account(0), lottery, ether(1), register_call(5, 1))).await;

        let claim = descriptor(account(0), lottery, U256::zero(), ContractCall::TimeoutRegistration);
        assert!(ledger.estimate_cost(&claim).await.is_err());

        tokio::time::sleep(SimConfig::default().registration_timeout).await;
        assert!(ledger.estimate_cost(&claim).await.is_ok());
        assert!(send(&ledger, claim).await.success);

        let mut refunded = ledger.subscribe(lottery, EventName::AllRefunded).await.unwrap();
        let receipt = send(
            &ledger,
            descriptor(account(0), lottery, U256::zero(), ContractCall::Refund),
        )
        .await;
        assert!(receipt.success);
        assert_eq!(refunded.events.recv().await.unwrap().kind, EventKind::AllRefunded);
        assert_eq!(ledger.balance(lottery).await.unwrap(), U256::zero());

        let spent = ether(100) - ledger.balance(account(0)).await.unwrap();
        let gas = gas_cost(&register_call(5, 1))
            + gas_cost(&ContractCall::TimeoutRegistration)
            + gas_cost(&ContractCall::Refund);
        assert_eq!(spent, SimConfig::default().gas_price * U256::from(gas));
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_parity_decides_winner() {
        let ledger = ledger_with_accounts(2);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        send(&ledger, descriptor(account(0), lottery, ether(1), register_call(3, 1))).await;
        send(&ledger, descriptor(account(1), lottery, ether(1), register_call(4, 2))).await;

        let m = ledger
            .call_view(lottery, ViewCall::CurrentMatch { of: account(0) })
            .await
            .unwrap()
            .into_address(ViewCall::MatchX)
            .unwrap();
        assert_eq!(
            ledger.call_view(m, ViewCall::MatchX).await.unwrap(),
            ViewValue::Address(account(0))
        );

        // Y may not reveal out of turn
        let early_y = ContractCall::RevealY {
            secret: U256::from(4),
            salt: U256::from(2),
        };
        assert!(ledger
            .estimate_cost(&descriptor(account(1), m, U256::zero(), early_y.clone()))
            .await
            .is_err());

        let reveal_x = ContractCall::RevealX {
            secret: U256::from(3),
            salt: U256::from(1),
        };
        assert!(send(&ledger, descriptor(account(0), m, U256::zero(), reveal_x)).await.success);
        assert!(send(&ledger, descriptor(account(1), m, U256::zero(), early_y)).await.success);

        // 3 + 4 is odd: Y wins
        assert_eq!(
            ledger.call_view(m, ViewCall::MatchWinner).await.unwrap(),
            ViewValue::Address(account(1))
        );
        assert_eq!(
            ledger.call_view(m, ViewCall::MatchState).await.unwrap(),
            ViewValue::Uint(MatchState::Winner.code().into())
        );

        let go = descriptor(account(0), lottery, U256::zero(), ContractCall::GoForward);
        assert!(ledger.estimate_cost(&go).await.is_err());
        let go = descriptor(account(1), lottery, U256::zero(), ContractCall::GoForward);
        assert!(send(&ledger, go).await.success);
        assert_eq!(
            ledger.call_view(lottery, ViewCall::TournamentWinner).await.unwrap(),
            ViewValue::Address(account(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_reveal_reverts_when_mined() {
        let ledger = ledger_with_accounts(2);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        send(&ledger, descriptor(account(0), lottery, ether(1), register_call(3, 1))).await;
        send(&ledger, descriptor(account(1), lottery, ether(1), register_call(4, 2))).await;
        let m = ledger
            .call_view(lottery, ViewCall::CurrentMatch { of: account(1) })
            .await
            .unwrap()
            .into_address(ViewCall::MatchX)
            .unwrap();

        let wrong = ContractCall::RevealX {
            secret: U256::from(9),
            salt: U256::from(1),
        };
        let receipt = send(&ledger, descriptor(account(0), m, U256::zero(), wrong)).await;
        assert!(!receipt.success);
        assert_eq!(
            ledger.call_view(m, ViewCall::MatchState).await.unwrap(),
            ViewValue::Uint(MatchState::XReveal.code().into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_signals_hash_then_address() {
        let ledger = ledger_with_accounts(1);
        ledger.unlock(account(0), CREDENTIAL).await.unwrap();
        let mut signals = ledger.deploy_lottery(account(0), 2, ether(1)).unwrap();

        let TxSignal::TransactionHash(hash) = signals.recv().await.unwrap() else {
            panic!("expected transaction hash first");
        };
        let TxSignal::Mined(receipt) = signals.recv().await.unwrap() else {
            panic!("expected mined signal");
        };
        assert_eq!(receipt.hash, hash);
        let lottery = receipt.contract_address.unwrap();
        assert_eq!(
            ledger.call_view(lottery, ViewCall::ExpectedParticipants).await.unwrap(),
            ViewValue::Uint(U256::from(4u64))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_account_cannot_submit() {
        let ledger = ledger_with_accounts(1);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        let tx = descriptor(account(0), lottery, ether(1), register_call(1, 1));
        assert!(matches!(
            ledger.submit(&tx).await,
            Err(LedgerError::AccountLocked(_))
        ));
        assert!(matches!(
            ledger.unlock(account(0), "wrong").await,
            Err(LedgerError::AccountLocked(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_is_transient() {
        let ledger = ledger_with_accounts(1);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        ledger.set_outage(true);
        let err = ledger.call_view(lottery, ViewCall::Level).await.unwrap_err();
        assert!(err.is_transient());
        ledger.set_outage(false);
        assert!(ledger.call_view(lottery, ViewCall::Level).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent() {
        let ledger = ledger_with_accounts(0);
        let lottery = ledger.create_lottery(1, ether(1)).unwrap();
        let sub = ledger.subscribe(lottery, EventName::Registered).await.unwrap();
        assert_eq!(ledger.active_subscriptions(), 1);
        ledger.unsubscribe(sub.handle);
        ledger.unsubscribe(sub.handle);
        assert_eq!(ledger.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_levels_rejected() {
        let ledger = ledger_with_accounts(0);
        assert!(ledger.create_lottery(0, ether(1)).is_err());
        assert!(ledger.create_lottery(MAX_LEVELS + 1, ether(1)).is_err());
    }
}
