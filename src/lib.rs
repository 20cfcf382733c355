//! chain-listener ingests EVM contract events into a document store and
//! enriches token-bearing events with external metadata.
//!
//! The main entry point is the [`Orchestrator`]: register a contract with
//! [`Orchestrator::add`], and the orchestrator backfills its past events from
//! the requested start block, then tails new ones over a live subscription.
//! [`Orchestrator::bootstrap`] restores every stored registration after a
//! restart, resuming each contract from its persisted block cursor.
//!
//! # Per-contract access
//!
//! [`Watcher`] is the stateless chain-access layer underneath: past-event
//! fetches with adaptive range splitting when a node rejects a query for
//! matching too many results, channel-based live subscriptions, and read-only
//! method calls.
//!
//! # Duplicates and ordering
//!
//! Backfills can replay ranges and a live subscription can overlap the tail
//! of a backfill; the unique event index (address, network, transaction hash)
//! makes those replays idempotent. Past events are delivered ordered by block
//! number per request; there is no ordering guarantee across contracts.
//!
//! # Collaborators
//!
//! The chain ([`ChainClient`]), persistence ([`Storage`]) and metadata fetch
//! ([`MetadataFetcher`]) boundaries are traits, with [`RpcChainClient`],
//! [`MemoryStorage`] and [`HttpMetadataFetcher`] as the shipped
//! implementations. Tests script all three through [`test_utils`].

pub mod abi;
pub mod chain;
pub mod config;
pub mod enrichment;
pub mod orchestrator;
pub mod storage;
pub mod watcher;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

mod error;
mod pipeline;
mod types;

pub use abi::{
    DecodedEvent, EventKind, InterfaceDescriptor, MethodCall, MethodKind, MethodValue,
};
pub use chain::{ChainClient, ClientError, ContractBinding, LogStream, RpcChainClient};
pub use config::NetworkRpcConfig;
pub use enrichment::{
    EnrichmentQueue, FetchError, HttpMetadataFetcher, MetadataFetcher, DEFAULT_THROTTLE_STEP,
};
pub use error::{ListenerError, ListenerResult};
pub use orchestrator::{ContractId, EventState, Orchestrator, TrackedEvents};
pub use pipeline::EventPipeline;
pub use storage::{ContractUpdate, MemoryStorage, Storage, StorageError};
pub use types::{ContractRecord, EventRecord, Network, OpStatus, TokenRecord, UnknownNetwork};
pub use watcher::{BlockRange, Watcher};
