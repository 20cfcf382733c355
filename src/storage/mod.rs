//! Persistence boundary for contracts, events and tokens.
//!
//! The trait mirrors a document store with unique indexes on
//! (address, network) for contracts, (address, network, transactionHash) for
//! events and (address, network, tokenId) for tokens. [`MemoryStorage`] is
//! the in-process implementation used by tests and embedders without an
//! external store.

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use thiserror::Error;

use crate::{
    abi::{EventKind, InterfaceDescriptor},
    types::{ContractRecord, EventRecord, Network, TokenRecord},
};

mod memory;

pub use memory::MemoryStorage;

/// Errors from the persistence layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A unique index rejected the write. Benign on the event path, where
    /// replayed ranges are expected to collide.
    #[error("duplicate {entity} for key {key}")]
    Duplicate { entity: &'static str, key: String },

    /// The targeted document does not exist.
    #[error("no {entity} found for key {key}")]
    NotFound { entity: &'static str, key: String },

    /// The backing engine rejected the operation. Implementations over an
    /// external store map driver errors here.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Partial update of a contract document. `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct ContractUpdate {
    pub latest_synced_block: Option<u64>,
    pub events: Option<Vec<EventKind>>,
    pub descriptor: Option<InterfaceDescriptor>,
}

impl ContractUpdate {
    #[must_use]
    pub fn latest_synced_block(block: u64) -> Self {
        Self { latest_synced_block: Some(block), ..Self::default() }
    }

    #[must_use]
    pub fn events(events: Vec<EventKind>) -> Self {
        Self { events: Some(events), ..Self::default() }
    }
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// All registered contracts, used to rebuild the registry at startup.
    async fn get_contracts(&self) -> Result<Vec<ContractRecord>, StorageError>;

    async fn contract_exists(
        &self,
        address: Address,
        network: Network,
    ) -> Result<bool, StorageError>;

    async fn insert_contract(&self, contract: ContractRecord) -> Result<(), StorageError>;

    /// Applies the non-`None` fields of `update` to an existing contract.
    async fn update_contract(
        &self,
        address: Address,
        network: Network,
        update: ContractUpdate,
    ) -> Result<(), StorageError>;

    async fn insert_event(&self, event: EventRecord) -> Result<(), StorageError>;

    /// Inserts a batch, skipping duplicates. Returns how many were inserted.
    async fn insert_events(&self, events: Vec<EventRecord>) -> Result<usize, StorageError>;

    async fn insert_token(&self, token: TokenRecord) -> Result<(), StorageError>;

    /// Replaces an existing token document unless the stored one comes from a
    /// later block. Returns whether the update was applied.
    async fn update_token(&self, token: TokenRecord) -> Result<bool, StorageError>;

    async fn get_token(
        &self,
        address: Address,
        network: Network,
        token_id: U256,
    ) -> Result<Option<TokenRecord>, StorageError>;

    async fn get_events(
        &self,
        address: Address,
        network: Network,
    ) -> Result<Vec<EventRecord>, StorageError>;
}

pub(crate) fn contract_key(address: Address, network: Network) -> String {
    format!("{address}@{network}")
}

pub(crate) fn event_key(address: Address, network: Network, transaction_hash: B256) -> String {
    format!("{address}@{network}:{transaction_hash}")
}

pub(crate) fn token_key(address: Address, network: Network, token_id: U256) -> String {
    format!("{address}@{network}#{token_id}")
}
