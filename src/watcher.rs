//! Per-contract chain access: past-event fetches with adaptive range
//! splitting, live subscriptions, and read-only calls.

use std::sync::Arc;

use alloy::rpc::types::Log;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    abi::{decode_event, DecodedEvent, EventKind, InterfaceDescriptor, MethodCall, MethodValue},
    chain::{ChainClient, ClientError, ContractBinding},
    error::{ListenerError, ListenerResult},
    types::Network,
};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Inclusive block range for a past-event fetch. `to: None` means "up to the
/// current head", resolved once per request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: Option<u64>,
}

impl BlockRange {
    #[must_use]
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to: Some(to) }
    }
}

impl From<u64> for BlockRange {
    /// A bare block number means "from here to the head".
    fn from(from: u64) -> Self {
        Self { from, to: None }
    }
}

/// One contract on one network, bound to a chain client.
///
/// The watcher is stateless; the cursor and scheduling live in the
/// [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug)]
pub struct Watcher<C> {
    binding: ContractBinding,
    descriptor: InterfaceDescriptor,
    client: Arc<C>,
}

impl<C> Clone for Watcher<C> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding,
            descriptor: self.descriptor.clone(),
            client: Arc::clone(&self.client),
        }
    }
}

impl<C> Watcher<C> {
    #[must_use]
    pub fn binding(&self) -> &ContractBinding {
        &self.binding
    }

    #[must_use]
    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }
}

impl<C: ChainClient> Watcher<C> {
    /// Binds a contract by its address string. The address is validated here,
    /// before anything is registered or persisted.
    pub fn new(
        client: Arc<C>,
        address: &str,
        network: Network,
        descriptor: Option<InterfaceDescriptor>,
    ) -> ListenerResult<Self> {
        let address = address
            .parse()
            .map_err(|_| ListenerError::InvalidAddress(address.to_owned()))?;
        Ok(Self::from_parts(client, address, network, descriptor))
    }

    /// Binds an already-validated address, as stored records carry.
    #[must_use]
    pub fn from_parts(
        client: Arc<C>,
        address: alloy::primitives::Address,
        network: Network,
        descriptor: Option<InterfaceDescriptor>,
    ) -> Self {
        Self {
            binding: ContractBinding { address, network },
            descriptor: descriptor.unwrap_or_default(),
            client,
        }
    }

    /// Fetches and decodes all past `kind` events in `range`, ordered by
    /// ascending block number.
    ///
    /// When the node rejects a sub-range for matching too many results, the
    /// sub-range is split at its midpoint and both halves are retried,
    /// recursively, until every piece fits. A limit error on a single block
    /// cannot be split and is returned to the caller.
    pub async fn load_past_events(
        &self,
        kind: EventKind,
        range: impl Into<BlockRange>,
    ) -> ListenerResult<Vec<DecodedEvent>> {
        let range = range.into();
        let to = match range.to {
            Some(to) => to,
            None => self.client.latest_block(self.binding.network).await?,
        };

        let mut events = Vec::new();
        if range.from <= to {
            self.fetch_range(kind, range.from, to, &mut events).await?;
        }
        events.sort_by_key(|event| event.record.block_number);
        Ok(events)
    }

    fn fetch_range<'a>(
        &'a self,
        kind: EventKind,
        from: u64,
        to: u64,
        out: &'a mut Vec<DecodedEvent>,
    ) -> BoxFuture<'a, ListenerResult<()>> {
        async move {
            match self.client.get_logs(&self.binding, kind, from, to).await {
                Ok(logs) => {
                    out.extend(self.decode_logs(kind, logs));
                    Ok(())
                }
                Err(ClientError::ResultLimitExceeded { .. }) if from < to => {
                    let middle = from + (to - from) / 2;
                    debug!(
                        address = %self.binding.address,
                        network = %self.binding.network,
                        event = %kind,
                        from, to, middle,
                        "result limit hit, splitting range"
                    );
                    self.fetch_range(kind, from, middle, out).await?;
                    self.fetch_range(kind, middle + 1, to, out).await
                }
                Err(err) => Err(err.into()),
            }
        }
        .boxed()
    }

    fn decode_logs(&self, kind: EventKind, logs: Vec<Log>) -> Vec<DecodedEvent> {
        logs.iter()
            .filter(|log| !log.removed)
            .filter_map(|log| match decode_event(kind, &self.binding, log) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    warn!(
                        address = %self.binding.address,
                        network = %self.binding.network,
                        event = %kind,
                        error = %err,
                        "skipping undecodable log"
                    );
                    None
                }
            })
            .collect()
    }

    /// Opens a live subscription for `kind`, delivering decoded events over a
    /// buffered channel. The forwarding task stops when the node closes the
    /// subscription or the receiver is dropped.
    pub async fn subscribe(&self, kind: EventKind) -> ListenerResult<ReceiverStream<DecodedEvent>> {
        let mut logs = self.client.subscribe_logs(&self.binding, kind).await?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let watcher = self.clone();
        tokio::spawn(async move {
            while let Some(log) = logs.next().await {
                for decoded in watcher.decode_logs(kind, vec![log]) {
                    if sender.send(decoded).await.is_err() {
                        return;
                    }
                }
            }
            debug!(
                address = %watcher.binding.address,
                network = %watcher.binding.network,
                event = %kind,
                "log subscription ended"
            );
        });

        Ok(ReceiverStream::new(receiver))
    }

    /// Executes a read-only method on the contract.
    pub async fn call(&self, call: &MethodCall) -> ListenerResult<MethodValue> {
        self.client.call(&self.binding, call).await.map_err(|source| ListenerError::Call {
            method: call.name(),
            address: self.binding.address,
            source,
        })
    }
}
