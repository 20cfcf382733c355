//! Scripted collaborators for hermetic tests: a chain client with
//! pre-programmed responses, a static metadata fetcher, and log builders for
//! the standard interface events.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, B256, LogData, U256},
    rpc::types::Log,
    sol_types::SolEvent,
    transports::{RpcError, TransportErrorKind},
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    abi::{standard, EventKind, MethodCall, MethodValue},
    chain::{ChainClient, ClientError, ContractBinding, LogStream},
    enrichment::{FetchError, MetadataFetcher},
    types::Network,
};

enum ScriptedRange {
    Logs(Vec<Log>),
    Limit,
}

/// [`ChainClient`] driven entirely by scripted responses.
///
/// Unscripted `get_logs` ranges return no logs; unscripted calls fail with a
/// transport error; unscripted subscriptions stay open and silent.
#[derive(Default)]
pub struct MockChainClient {
    latest_blocks: Mutex<HashMap<Network, u64>>,
    ranges: Mutex<HashMap<(Address, EventKind, u64, u64), ScriptedRange>>,
    get_logs_calls: Mutex<Vec<(u64, u64)>>,
    method_responses: Mutex<HashMap<(Address, &'static str), MethodValue>>,
    feeds: Mutex<HashMap<(Address, EventKind), mpsc::Receiver<Log>>>,
    parked_senders: Mutex<Vec<mpsc::Sender<Log>>>,
    subscribe_count: AtomicUsize,
    subscribe_failures: AtomicUsize,
}

impl MockChainClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latest_block(&self, network: Network, block: u64) {
        self.latest_blocks.lock().unwrap().insert(network, block);
    }

    /// Scripts the logs returned for one exact `get_logs` range.
    pub fn script_logs(
        &self,
        address: Address,
        kind: EventKind,
        from: u64,
        to: u64,
        logs: Vec<Log>,
    ) {
        self.ranges
            .lock()
            .unwrap()
            .insert((address, kind, from, to), ScriptedRange::Logs(logs));
    }

    /// Scripts a result-limit rejection for one exact `get_logs` range.
    pub fn script_limit(&self, address: Address, kind: EventKind, from: u64, to: u64) {
        self.ranges.lock().unwrap().insert((address, kind, from, to), ScriptedRange::Limit);
    }

    /// Scripts the decoded return value of a read-only method, keyed by its
    /// Solidity name.
    pub fn script_call(&self, address: Address, method: &'static str, value: MethodValue) {
        self.method_responses.lock().unwrap().insert((address, method), value);
    }

    /// Returns a sender feeding the next subscription for this pair.
    pub fn live_feed(&self, address: Address, kind: EventKind) -> mpsc::Sender<Log> {
        let (sender, receiver) = mpsc::channel(64);
        self.feeds.lock().unwrap().insert((address, kind), receiver);
        sender
    }

    /// Makes the next `count` subscription attempts fail with a transport
    /// error.
    pub fn fail_subscribes(&self, count: usize) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// Ranges requested so far, in call order.
    pub fn get_logs_calls(&self) -> Vec<(u64, u64)> {
        self.get_logs_calls.lock().unwrap().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    fn transport_error() -> ClientError {
        ClientError::Transport(std::sync::Arc::new(RpcError::Transport(
            TransportErrorKind::BackendGone,
        )))
    }
}

impl fmt::Debug for MockChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChainClient")
            .field("get_logs_calls", &self.get_logs_calls.lock().unwrap().len())
            .field("subscribe_count", &self.subscribe_count.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn latest_block(&self, network: Network) -> Result<u64, ClientError> {
        Ok(self.latest_blocks.lock().unwrap().get(&network).copied().unwrap_or(0))
    }

    async fn get_logs(
        &self,
        binding: &ContractBinding,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ClientError> {
        self.get_logs_calls.lock().unwrap().push((from, to));
        match self.ranges.lock().unwrap().get(&(binding.address, kind, from, to)) {
            Some(ScriptedRange::Limit) => Err(ClientError::ResultLimitExceeded { from, to }),
            Some(ScriptedRange::Logs(logs)) => Ok(logs.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn subscribe_logs(
        &self,
        binding: &ContractBinding,
        kind: EventKind,
    ) -> Result<LogStream, ClientError> {
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        if self
            .subscribe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(Self::transport_error());
        }
        let receiver = self.feeds.lock().unwrap().remove(&(binding.address, kind));
        let receiver = match receiver {
            Some(receiver) => receiver,
            None => {
                // Keep the sender alive so the stream stays open and silent.
                let (sender, receiver) = mpsc::channel(1);
                self.parked_senders.lock().unwrap().push(sender);
                receiver
            }
        };
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn call(
        &self,
        binding: &ContractBinding,
        call: &MethodCall,
    ) -> Result<MethodValue, ClientError> {
        self.method_responses
            .lock()
            .unwrap()
            .get(&(binding.address, call.name()))
            .cloned()
            .ok_or_else(Self::transport_error)
    }
}

/// [`MetadataFetcher`] with canned documents per URL.
///
/// Unknown URLs fail with a 404 status; URLs scripted as invalid fail with
/// `FetchError::InvalidJson`.
#[derive(Default)]
pub struct StaticFetcher {
    responses: HashMap<String, Option<Value>>,
}

impl StaticFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_json(mut self, url: impl Into<String>, document: Value) -> Self {
        self.responses.insert(url.into(), Some(document));
        self
    }

    #[must_use]
    pub fn with_invalid_body(mut self, url: impl Into<String>) -> Self {
        self.responses.insert(url.into(), None);
        self
    }
}

#[async_trait]
impl MetadataFetcher for StaticFetcher {
    async fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
        match self.responses.get(url) {
            Some(Some(document)) => Ok(document.clone()),
            Some(None) => Err(FetchError::InvalidJson),
            None => Err(FetchError::Status(404)),
        }
    }
}

/// Builds an RPC log carrying the given event data at `block`, with a
/// transaction hash derived from `tx_seed`.
#[must_use]
pub fn build_log(address: Address, data: LogData, block: u64, tx_seed: u64) -> Log {
    Log {
        inner: alloy::primitives::Log { address, data },
        block_hash: Some(B256::from(U256::from(block))),
        block_number: Some(block),
        block_timestamp: None,
        transaction_hash: Some(B256::from(U256::from(tx_seed))),
        transaction_index: Some(0),
        log_index: Some(0),
        removed: false,
    }
}

/// A `Transfer` log for `token_id`.
#[must_use]
pub fn transfer_log(address: Address, token_id: u64, block: u64, tx_seed: u64) -> Log {
    let event = standard::Transfer {
        from: Address::repeat_byte(0x01),
        to: Address::repeat_byte(0x02),
        tokenId: U256::from(token_id),
    };
    build_log(address, event.encode_log_data(), block, tx_seed)
}

/// An `ApprovalForAll` log with `approved = true`.
#[must_use]
pub fn approval_for_all_log(address: Address, block: u64, tx_seed: u64) -> Log {
    let event = standard::ApprovalForAll {
        owner: Address::repeat_byte(0x01),
        operator: Address::repeat_byte(0x03),
        approved: true,
    };
    build_log(address, event.encode_log_data(), block, tx_seed)
}

/// Re-evaluates `poll` until it yields a value, panicking after five seconds.
/// Bridges tests to work that runs on spawned tasks.
pub async fn wait_for<T, F, Fut>(mut poll: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = poll().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// [`wait_for`] for boolean conditions.
pub async fn wait_until<F, Fut>(mut poll: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for(|| {
        let fut = poll();
        async move { fut.await.then_some(()) }
    })
    .await;
}
