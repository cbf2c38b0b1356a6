//! JSON-RPC gateway.
//!
//! [`Ledger`] over an Ethereum node reached through HTTP. Accounts are
//! node-managed: they are unlocked with `personal_unlockAccount` and
//! transactions are signed by the node on `eth_sendTransaction`.
//!
//! Subscriptions are polling tasks over `eth_getLogs`, one per stream, each
//! advancing its own block cursor. Lottery deployment reports progress as
//! [`TxSignal`]s, the same way the simulated backend does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockNumber, Filter, TransactionRequest,
    H256, U256, U64,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::abi::{decode_log, decode_view, encode_call, encode_deployment, encode_view, event_topic};
use super::{
    CallDescriptor, EventName, Ledger, LedgerError, LedgerEvent, PendingTransaction, Receipt,
    Subscription, SubscriptionHandle, TxSignal, ViewCall, ViewValue,
};

/// Default log polling period.
pub const DEFAULT_LOG_POLL: Duration = Duration::from_secs(2);

/// Node connection settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// HTTP endpoint of the node.
    pub url: String,
    /// Gas price attached to every transaction.
    pub gas_price: U256,
    /// Period of the `eth_getLogs` pollers.
    pub log_poll: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8545".to_string(),
            gas_price: U256::from(500_000_000_000u64),
            log_poll: DEFAULT_LOG_POLL,
        }
    }
}

struct Inner {
    provider: Provider<Http>,
    gas_price: U256,
    log_poll: Duration,
    next_handle: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

/// Gateway backed by an Ethereum node.
#[derive(Clone)]
pub struct RpcLedger {
    inner: Arc<Inner>,
}

/// Map a provider failure. JSON-RPC error responses mean the node evaluated
/// the request and refused it; anything else is a transport problem.
fn classify(err: ProviderError) -> LedgerError {
    match err.as_error_response() {
        Some(response) => LedgerError::Reverted(response.message.clone()),
        None => LedgerError::RpcUnavailable(err.to_string()),
    }
}

fn transport(err: ProviderError) -> LedgerError {
    LedgerError::RpcUnavailable(err.to_string())
}

/// Map an `eth_sendTransaction` failure from `from`.
fn rejected_send(from: Address, err: ProviderError) -> LedgerError {
    match err.as_error_response() {
        Some(response) if response.message.contains("locked") => LedgerError::AccountLocked(from),
        Some(response) => LedgerError::Reverted(response.message.clone()),
        None => transport(err),
    }
}

impl RpcLedger {
    /// Connect to the node described by `config`.
    pub fn connect(config: RpcConfig) -> Result<Self, LedgerError> {
        let provider = Provider::<Http>::try_from(config.url.as_str())
            .map_err(|e| LedgerError::RpcUnavailable(format!("invalid RPC URL: {}", e)))?;

        info!(url = %config.url, "Connected ledger gateway");

        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                gas_price: config.gas_price,
                log_poll: config.log_poll,
                next_handle: AtomicU64::new(1),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Number of live log pollers.
    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn transaction(&self, call: &CallDescriptor) -> TypedTransaction {
        TransactionRequest::new()
            .from(call.from)
            .to(call.to)
            .value(call.value)
            .gas(call.gas_limit)
            .gas_price(self.inner.gas_price)
            .data(encode_call(&call.call))
            .into()
    }

    /// Deploy a lottery from `bytecode`, signed by the unlocked `creator`.
    ///
    /// The returned channel yields [`TxSignal::TransactionHash`] once the node
    /// accepts the transaction and [`TxSignal::Mined`], carrying the contract
    /// address, once it is included. Receipt polling stops when the receiver
    /// is dropped.
    pub async fn deploy_lottery(
        &self,
        creator: Address,
        bytecode: &[u8],
        levels: u32,
        deposit: U256,
        gas_limit: u64,
    ) -> Result<mpsc::UnboundedReceiver<TxSignal>, LedgerError> {
        if bytecode.is_empty() {
            return Err(LedgerError::Reverted("empty lottery bytecode".to_string()));
        }
        let tx: TypedTransaction = TransactionRequest::new()
            .from(creator)
            .gas(gas_limit)
            .gas_price(self.inner.gas_price)
            .data(encode_deployment(bytecode, levels, deposit))
            .into();
        let hash = self
            .inner
            .provider
            .send_transaction(tx, None)
            .await
            .map_err(|err| rejected_send(creator, err))?
            .tx_hash();
        info!(?creator, levels, %deposit, tx = %hex::encode(hash), "Lottery deployment submitted");

        let (signal, rx) = mpsc::unbounded_channel();
        let _ = signal.send(TxSignal::TransactionHash(hash));
        tokio::spawn(await_deployment(self.clone(), hash, signal));
        Ok(rx)
    }
}

/// Poll for the creation receipt and forward it as [`TxSignal::Mined`].
async fn await_deployment(ledger: RpcLedger, hash: H256, signal: mpsc::UnboundedSender<TxSignal>) {
    let mut ticker = tokio::time::interval(ledger.inner.log_poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if signal.is_closed() {
            return;
        }
        match ledger.receipt(hash).await {
            Ok(Some(receipt)) => {
                debug!(tx = %hex::encode(hash), block = receipt.block, "Deployment mined");
                let _ = signal.send(TxSignal::Mined(receipt));
                return;
            }
            Ok(None) => {}
            Err(err) => warn!(tx = %hex::encode(hash), %err, "Deployment receipt poll failed"),
        }
    }
}

impl Ledger for RpcLedger {
    async fn call_view(&self, target: Address, view: ViewCall) -> Result<ViewValue, LedgerError> {
        let mut request = TransactionRequest::new().to(target).data(encode_view(&view));
        if let ViewCall::CurrentMatch { of } = view {
            // getMatch() answers for msg.sender
            request = request.from(of);
        }
        let tx: TypedTransaction = request.into();
        let data = self.inner.provider.call(&tx, None).await.map_err(classify)?;
        if data.is_empty() {
            return Err(LedgerError::UnknownContract(target));
        }
        decode_view(&view, &data)
    }

    async fn estimate_cost(&self, call: &CallDescriptor) -> Result<u64, LedgerError> {
        let tx = self.transaction(call);
        let gas = self.inner.provider.estimate_gas(&tx, None).await.map_err(classify)?;
        // Saturate so oversized estimates still compare as over budget
        Ok(if gas > U256::from(u64::MAX) { u64::MAX } else { gas.as_u64() })
    }

    async fn unlock(&self, address: Address, credential: &str) -> Result<(), LedgerError> {
        let unlocked: Result<bool, ProviderError> = self
            .inner
            .provider
            .request("personal_unlockAccount", (address, credential, None::<u64>))
            .await;
        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => Err(LedgerError::AccountLocked(address)),
            Err(err) if err.as_error_response().is_some() => {
                debug!(?address, %err, "Unlock refused");
                Err(LedgerError::AccountLocked(address))
            }
            Err(err) => Err(transport(err)),
        }
    }

    async fn submit(&self, call: &CallDescriptor) -> Result<PendingTransaction, LedgerError> {
        let tx = self.transaction(call);
        let pending = self
            .inner
            .provider
            .send_transaction(tx, None)
            .await
            .map_err(|err| rejected_send(call.from, err))?;
        Ok(PendingTransaction::new(pending.tx_hash()))
    }

    async fn receipt(&self, hash: H256) -> Result<Option<Receipt>, LedgerError> {
        let receipt = self
            .inner
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(transport)?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block) = receipt.block_number else {
            return Ok(None);
        };
        Ok(Some(Receipt {
            hash,
            block: block.as_u64(),
            success: receipt.status != Some(U64::zero()),
            gas_used: receipt.gas_used.map(|g| g.low_u64()).unwrap_or(0),
            contract_address: receipt.contract_address,
        }))
    }

    async fn balance(&self, address: Address) -> Result<U256, LedgerError> {
        self.inner
            .provider
            .get_balance(address, None)
            .await
            .map_err(transport)
    }

    async fn subscribe(&self, contract: Address, name: EventName) -> Result<Subscription, LedgerError> {
        let start = self
            .inner
            .provider
            .get_block_number()
            .await
            .map_err(transport)?
            .as_u64();

        let handle = SubscriptionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = self.inner.provider.clone();
        let period = self.inner.log_poll;

        let task = tokio::spawn(poll_logs(provider, contract, name, start, period, tx));
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, task);

        debug!(?contract, ?name, handle = handle.0, from_block = start, "Subscribed");
        Ok(Subscription { handle, events: rx })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let task = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        if let Some(task) = task {
            task.abort();
            debug!(handle = handle.0, "Unsubscribed");
        }
    }
}

/// Poll `eth_getLogs` for one event stream until the receiver goes away.
async fn poll_logs(
    provider: Provider<Http>,
    contract: Address,
    name: EventName,
    mut cursor: u64,
    period: Duration,
    tx: mpsc::UnboundedSender<LedgerEvent>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }

        let latest = match provider.get_block_number().await {
            Ok(block) => block.as_u64(),
            Err(err) => {
                warn!(?name, %err, "Block number poll failed");
                continue;
            }
        };
        if latest < cursor {
            continue;
        }

        let filter = Filter::new()
            .address(contract)
            .topic0(event_topic(name))
            .from_block(BlockNumber::Number(cursor.into()))
            .to_block(BlockNumber::Number(latest.into()));

        let logs = match provider.get_logs(&filter).await {
            Ok(logs) => logs,
            Err(err) => {
                warn!(?name, %err, "Log poll failed");
                continue;
            }
        };

        for log in logs {
            let block = log.block_number.map(|b| b.as_u64()).unwrap_or(latest);
            match decode_log(name, &log) {
                Ok(kind) => {
                    let event = LedgerEvent {
                        contract,
                        block,
                        kind,
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Err(err) => warn!(?name, %err, "Dropping undecodable log"),
            }
        }
        cursor = latest + 1;
    }
}
