//! Contract registry and scheduling.
//!
//! The orchestrator owns every registered contract: which events it tracks,
//! where each one is in the `Registered -> Backfilling -> Tailing` lifecycle,
//! and the contract's resumable block cursor. All chain work is delegated to
//! the contract's [`Watcher`]; all persistence goes through the
//! [`EventPipeline`] and the injected [`Storage`] handle.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::primitives::Address;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    abi::{DecodedEvent, EventKind, InterfaceDescriptor},
    chain::ChainClient,
    enrichment::{EnrichmentQueue, MetadataFetcher},
    error::{ListenerError, ListenerResult},
    pipeline::EventPipeline,
    storage::{ContractUpdate, Storage, StorageError},
    types::{ContractRecord, Network, OpStatus},
    watcher::Watcher,
};

/// Index of a contract entry in the registry arena. Stable for the lifetime
/// of the orchestrator; entries are never removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContractId(usize);

/// Lifecycle of one tracked event of one contract.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventState {
    /// Tracked, no backfill or subscription running.
    Registered,
    /// A past-event fetch is in progress.
    Backfilling,
    /// A live subscription is consuming new events.
    Tailing,
}

#[derive(Clone, Debug)]
struct EventTracker {
    kind: EventKind,
    state: EventState,
}

struct ContractEntry<C> {
    watcher: Watcher<C>,
    cursor: u64,
    events: Vec<EventTracker>,
}

impl<C> ContractEntry<C> {
    fn tracker_mut(&mut self, kind: EventKind) -> Option<&mut EventTracker> {
        self.events.iter_mut().find(|tracker| tracker.kind == kind)
    }
}

struct Registry<C> {
    entries: Vec<ContractEntry<C>>,
    index: HashMap<(Address, Network), ContractId>,
}

impl<C> Registry<C> {
    fn id_of(&self, address: Address, network: Network) -> Option<ContractId> {
        self.index.get(&(address, network)).copied()
    }

    fn entry(&self, id: ContractId) -> &ContractEntry<C> {
        &self.entries[id.0]
    }

    fn entry_mut(&mut self, id: ContractId) -> &mut ContractEntry<C> {
        &mut self.entries[id.0]
    }

    fn insert(&mut self, watcher: Watcher<C>, cursor: u64, events: Vec<EventKind>) -> ContractId {
        let id = ContractId(self.entries.len());
        let binding = *watcher.binding();
        self.entries.push(ContractEntry {
            watcher,
            cursor,
            events: events
                .into_iter()
                .map(|kind| EventTracker { kind, state: EventState::Registered })
                .collect(),
        });
        self.index.insert((binding.address, binding.network), id);
        id
    }
}

/// The events a registration tracks; a single kind or a list.
#[derive(Clone, Debug)]
pub enum TrackedEvents {
    One(EventKind),
    Many(Vec<EventKind>),
}

impl From<EventKind> for TrackedEvents {
    fn from(kind: EventKind) -> Self {
        TrackedEvents::One(kind)
    }
}

impl From<Vec<EventKind>> for TrackedEvents {
    fn from(kinds: Vec<EventKind>) -> Self {
        TrackedEvents::Many(kinds)
    }
}

impl TrackedEvents {
    /// Normalizes to a duplicate-free list, preserving order.
    fn into_vec(self) -> Vec<EventKind> {
        let kinds = match self {
            TrackedEvents::One(kind) => vec![kind],
            TrackedEvents::Many(kinds) => kinds,
        };
        let mut seen = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !seen.contains(&kind) {
                seen.push(kind);
            }
        }
        seen
    }
}

/// Registry of contracts with backfill and live-tail scheduling.
pub struct Orchestrator<C, S> {
    registry: Arc<Mutex<Registry<C>>>,
    client: Arc<C>,
    storage: Arc<S>,
    pipeline: EventPipeline<S>,
    enrichment: EnrichmentQueue<S>,
}

impl<C, S> Clone for Orchestrator<C, S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            client: Arc::clone(&self.client),
            storage: Arc::clone(&self.storage),
            pipeline: self.pipeline.clone(),
            enrichment: self.enrichment.clone(),
        }
    }
}

impl<C: ChainClient, S: Storage> Orchestrator<C, S> {
    #[must_use]
    pub fn new(client: Arc<C>, storage: Arc<S>, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        let pipeline = EventPipeline::new(Arc::clone(&storage));
        let enrichment = EnrichmentQueue::new(pipeline.clone(), fetcher);
        Self {
            registry: Arc::new(Mutex::new(Registry {
                entries: Vec::new(),
                index: HashMap::new(),
            })),
            client,
            storage,
            pipeline,
            enrichment,
        }
    }

    /// Overrides the enrichment throttle step (defaults to 2.5 s per
    /// outstanding fetch).
    #[must_use]
    pub fn with_throttle_step(mut self, step: Duration) -> Self {
        self.enrichment = self.enrichment.with_throttle_step(step);
        self
    }

    /// Registers a contract and starts backfilling its events from
    /// `start_block`, then tailing them live.
    ///
    /// Re-adding a contract that is already registered and loaded is
    /// rejected; a contract present in storage but not in memory (after a
    /// restart) is reloaded, resuming from the stored cursor.
    pub async fn add(
        &self,
        address: &str,
        network: Network,
        events: impl Into<TrackedEvents>,
        start_block: u64,
        descriptor: Option<InterfaceDescriptor>,
    ) -> ListenerResult<OpStatus> {
        let watcher = match Watcher::new(Arc::clone(&self.client), address, network, descriptor) {
            Ok(watcher) => watcher,
            Err(err) => return Ok(OpStatus::fail(err.to_string())),
        };

        let events = events.into().into_vec();
        if events.is_empty() {
            return Ok(OpStatus::fail("no events requested"));
        }
        for kind in &events {
            if !watcher.descriptor().supports_event(*kind) {
                let err = ListenerError::UnknownEvent { event: *kind };
                return Ok(OpStatus::fail(err.to_string()));
            }
        }

        let address = watcher.binding().address;
        let in_db = self.storage.contract_exists(address, network).await?;
        let in_memory = self.registry.lock().await.id_of(address, network).is_some();

        if in_db && in_memory {
            return Ok(OpStatus::fail(
                "contract already registered, use add_event to track more events",
            ));
        }

        let mut cursor = start_block;
        let mut tracked = events.clone();
        if in_db {
            // Restart path: resume from the stored registration.
            if let Some(stored) = self.stored_contract(address, network).await? {
                cursor = cursor.max(stored.latest_synced_block);
                for kind in &stored.events {
                    if !tracked.contains(kind) {
                        tracked.push(*kind);
                    }
                }
                // The union must survive the next restart too.
                if tracked.len() != stored.events.len() {
                    self.storage
                        .update_contract(address, network, ContractUpdate::events(tracked.clone()))
                        .await?;
                }
            }
        } else {
            let record = ContractRecord {
                address,
                network,
                events: events.clone(),
                latest_synced_block: start_block,
                descriptor: watcher.descriptor().clone(),
            };
            match self.storage.insert_contract(record).await {
                Ok(()) | Err(StorageError::Duplicate { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let id = {
            let mut registry = self.registry.lock().await;
            // A concurrent add may have won the race for this binding.
            if registry.id_of(address, network).is_some() {
                return Ok(OpStatus::fail(
                    "contract already registered, use add_event to track more events",
                ));
            }
            registry.insert(watcher, cursor, tracked.clone())
        };

        info!(%address, %network, events = ?tracked, cursor, "contract registered");
        self.spawn_backfill_then_tail(id, tracked);
        Ok(OpStatus::ok("contract registered"))
    }

    /// Starts tracking one more event on an already registered contract.
    pub async fn add_event(
        &self,
        address: &str,
        network: Network,
        kind: EventKind,
    ) -> ListenerResult<OpStatus> {
        let Ok(address) = address.parse::<Address>() else {
            return Ok(OpStatus::fail(format!("invalid contract address `{address}`")));
        };

        let id = {
            let mut registry = self.registry.lock().await;
            let Some(id) = registry.id_of(address, network) else {
                return Ok(OpStatus::fail("contract is not registered, call add first"));
            };
            let entry = registry.entry_mut(id);
            if !entry.watcher.descriptor().supports_event(kind) {
                let err = ListenerError::UnknownEvent { event: kind };
                return Ok(OpStatus::fail(err.to_string()));
            }
            if entry.tracker_mut(kind).is_some() {
                return Ok(OpStatus::fail(format!("event {kind} is already tracked")));
            }
            entry.events.push(EventTracker { kind, state: EventState::Registered });
            id
        };

        let tracked = self.tracked_events(id).await;
        self.storage
            .update_contract(address, network, ContractUpdate::events(tracked))
            .await?;

        info!(%address, %network, event = %kind, "event added");
        self.spawn_backfill_then_tail(id, vec![kind]);
        Ok(OpStatus::ok("event added"))
    }

    /// Backfills past events for every tracked (contract, event) pair, or
    /// only for `address` when given. Each pair fails independently; asking
    /// for an address that is not registered reports the miss.
    pub async fn load_past_events(&self, address: Option<Address>) -> ListenerResult<OpStatus> {
        let pairs = self.tracked_pairs(address).await;
        if address.is_some() && pairs.is_empty() {
            return Ok(OpStatus::fail("address is not registered"));
        }
        for (id, kind) in pairs {
            if let Err(err) = self.backfill_event(id, kind).await {
                let binding = self.binding_of(id).await;
                warn!(
                    address = %binding.0,
                    network = %binding.1,
                    event = %kind,
                    error = %err,
                    "backfill failed"
                );
            }
        }
        Ok(OpStatus::ok("past events loaded"))
    }

    /// Opens live subscriptions for every tracked (contract, event) pair not
    /// already tailing, or only for `address` when given. Asking for an
    /// address that is not registered reports the miss.
    pub async fn listen_events(&self, address: Option<Address>) -> ListenerResult<OpStatus> {
        let pairs = self.tracked_pairs(address).await;
        if address.is_some() && pairs.is_empty() {
            return Ok(OpStatus::fail("address is not registered"));
        }
        for (id, kind) in pairs {
            if let Err(err) = self.tail_event(id, kind).await {
                let binding = self.binding_of(id).await;
                warn!(
                    address = %binding.0,
                    network = %binding.1,
                    event = %kind,
                    error = %err,
                    "subscription failed"
                );
            }
        }
        Ok(OpStatus::ok("subscriptions opened"))
    }

    /// Reloads every stored registration, backfills each from its stored
    /// cursor, and starts tailing. Called once at startup.
    pub async fn bootstrap(&self) -> ListenerResult<()> {
        let contracts = self.storage.get_contracts().await?;
        let loaded = contracts.len();
        {
            let mut registry = self.registry.lock().await;
            for record in contracts {
                if registry.id_of(record.address, record.network).is_some() {
                    continue;
                }
                let watcher = Watcher::from_parts(
                    Arc::clone(&self.client),
                    record.address,
                    record.network,
                    Some(record.descriptor),
                );
                registry.insert(watcher, record.latest_synced_block, record.events);
            }
        }
        info!(contracts = loaded, "registry restored from storage");

        self.load_past_events(None).await?;
        self.listen_events(None).await?;
        Ok(())
    }

    /// Current block cursor of a registered contract.
    pub async fn cursor(&self, address: Address, network: Network) -> Option<u64> {
        let registry = self.registry.lock().await;
        registry.id_of(address, network).map(|id| registry.entry(id).cursor)
    }

    /// Lifecycle state of one tracked event.
    pub async fn event_state(
        &self,
        address: Address,
        network: Network,
        kind: EventKind,
    ) -> Option<EventState> {
        let registry = self.registry.lock().await;
        let id = registry.id_of(address, network)?;
        registry
            .entry(id)
            .events
            .iter()
            .find(|tracker| tracker.kind == kind)
            .map(|tracker| tracker.state)
    }

    async fn stored_contract(
        &self,
        address: Address,
        network: Network,
    ) -> ListenerResult<Option<ContractRecord>> {
        let contracts = self.storage.get_contracts().await?;
        Ok(contracts
            .into_iter()
            .find(|record| record.address == address && record.network == network))
    }

    async fn tracked_events(&self, id: ContractId) -> Vec<EventKind> {
        let registry = self.registry.lock().await;
        registry.entry(id).events.iter().map(|tracker| tracker.kind).collect()
    }

    async fn tracked_pairs(&self, address: Option<Address>) -> Vec<(ContractId, EventKind)> {
        let registry = self.registry.lock().await;
        registry
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                address.is_none_or(|address| entry.watcher.binding().address == address)
            })
            .flat_map(|(index, entry)| {
                entry
                    .events
                    .iter()
                    .map(move |tracker| (ContractId(index), tracker.kind))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    async fn binding_of(&self, id: ContractId) -> (Address, Network) {
        let registry = self.registry.lock().await;
        let binding = registry.entry(id).watcher.binding();
        (binding.address, binding.network)
    }

    fn spawn_backfill_then_tail(&self, id: ContractId, kinds: Vec<EventKind>) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            for kind in kinds {
                let binding = orchestrator.binding_of(id).await;
                // A failed backfill is isolated to this pair; tailing still
                // starts so live events are not lost on top of the gap.
                if let Err(err) = orchestrator.backfill_event(id, kind).await {
                    warn!(
                        address = %binding.0,
                        network = %binding.1,
                        event = %kind,
                        error = %err,
                        "backfill failed"
                    );
                }
                if let Err(err) = orchestrator.tail_event(id, kind).await {
                    warn!(
                        address = %binding.0,
                        network = %binding.1,
                        event = %kind,
                        error = %err,
                        "subscription failed"
                    );
                }
            }
        });
    }

    /// Fetches all past events for one pair from the contract's cursor to the
    /// head and ingests them.
    async fn backfill_event(&self, id: ContractId, kind: EventKind) -> ListenerResult<()> {
        let (watcher, cursor) = {
            let mut registry = self.registry.lock().await;
            let entry = registry.entry_mut(id);
            if let Some(tracker) = entry.tracker_mut(kind) {
                tracker.state = EventState::Backfilling;
            }
            (entry.watcher.clone(), entry.cursor)
        };

        let result = watcher.load_past_events(kind, cursor).await;

        let events = match result {
            Ok(events) => events,
            Err(err) => {
                self.set_state(id, kind, EventState::Registered).await;
                return Err(err);
            }
        };

        let inserted = self.ingest(id, &watcher, events).await?;
        debug!(
            address = %watcher.binding().address,
            network = %watcher.binding().network,
            event = %kind,
            inserted,
            "backfill complete"
        );
        self.set_state(id, kind, EventState::Registered).await;
        Ok(())
    }

    /// Opens the live subscription for one pair. Idempotent: a pair already
    /// tailing is left alone.
    async fn tail_event(&self, id: ContractId, kind: EventKind) -> ListenerResult<()> {
        let watcher = {
            let mut registry = self.registry.lock().await;
            let entry = registry.entry_mut(id);
            let Some(tracker) = entry.tracker_mut(kind) else {
                return Ok(());
            };
            if tracker.state == EventState::Tailing {
                return Ok(());
            }
            // Claim the pair before awaiting so concurrent calls cannot open
            // a second subscription.
            tracker.state = EventState::Tailing;
            entry.watcher.clone()
        };

        let mut stream = match watcher.subscribe(kind).await {
            Ok(stream) => stream,
            Err(err) => {
                self.set_state(id, kind, EventState::Registered).await;
                return Err(err);
            }
        };

        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let Err(err) = orchestrator.ingest(id, &watcher, vec![event]).await {
                    warn!(
                        address = %watcher.binding().address,
                        network = %watcher.binding().network,
                        event = %kind,
                        error = %err,
                        "failed to ingest live event"
                    );
                }
            }
            orchestrator.set_state(id, kind, EventState::Registered).await;
            debug!(
                address = %watcher.binding().address,
                network = %watcher.binding().network,
                event = %kind,
                "live subscription ended"
            );
        });
        Ok(())
    }

    async fn set_state(&self, id: ContractId, kind: EventKind, state: EventState) {
        let mut registry = self.registry.lock().await;
        if let Some(tracker) = registry.entry_mut(id).tracker_mut(kind) {
            tracker.state = state;
        }
    }

    /// Persists a batch of decoded events, advances the contract cursor to
    /// the highest block seen, and schedules enrichment for token-bearing
    /// events. The cursor only ever moves forward, and only after the batch
    /// is persisted, so a failed write leaves the range re-fetchable.
    async fn ingest(
        &self,
        id: ContractId,
        watcher: &Watcher<C>,
        events: Vec<DecodedEvent>,
    ) -> ListenerResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let records = events.iter().map(|event| event.record.clone()).collect();
        let inserted = self.pipeline.persist_batch(records).await?;

        let max_block = events.iter().map(|event| event.record.block_number).max();
        let advanced = if let Some(max_block) = max_block {
            let mut registry = self.registry.lock().await;
            let entry = registry.entry_mut(id);
            if max_block > entry.cursor {
                entry.cursor = max_block;
                Some(max_block)
            } else {
                None
            }
        } else {
            None
        };

        if let Some(block) = advanced {
            let binding = watcher.binding();
            self.storage
                .update_contract(
                    binding.address,
                    binding.network,
                    ContractUpdate::latest_synced_block(block),
                )
                .await?;
        }

        for event in &events {
            self.enrichment.schedule(watcher.clone(), event);
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChainClient;

    #[test]
    fn registry_insert_indexes_by_binding() {
        let client = Arc::new(MockChainClient::new());
        let address = Address::repeat_byte(0xAA);
        let watcher = Watcher::from_parts(client, address, Network::Rinkeby, None);

        let mut registry = Registry { entries: Vec::new(), index: HashMap::new() };
        let id = registry.insert(watcher, 5, vec![EventKind::Transfer]);

        assert_eq!(registry.id_of(address, Network::Rinkeby), Some(id));
        assert_eq!(registry.entry(id).cursor, 5);
        assert_eq!(registry.id_of(address, Network::Mainnet), None);
    }

    #[test]
    fn tracked_events_normalize_and_dedup() {
        let events =
            TrackedEvents::from(vec![EventKind::Transfer, EventKind::Approval, EventKind::Transfer])
                .into_vec();
        assert_eq!(events, vec![EventKind::Transfer, EventKind::Approval]);

        let single = TrackedEvents::from(EventKind::Transfer).into_vec();
        assert_eq!(single, vec![EventKind::Transfer]);
    }
}
