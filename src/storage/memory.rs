//! In-memory [`Storage`] enforcing the same unique indexes as the document
//! store it stands in for.

use std::collections::HashMap;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    contract_key, event_key, token_key, ContractUpdate, Storage, StorageError,
};
use crate::types::{ContractRecord, EventRecord, Network, TokenRecord};

type ContractKey = (Address, Network);
type EventKey = (Address, Network, B256);
type TokenKey = (Address, Network, U256);

#[derive(Default)]
struct Tables {
    contracts: HashMap<ContractKey, ContractRecord>,
    events: HashMap<EventKey, EventRecord>,
    tokens: HashMap<TokenKey, TokenRecord>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_contracts(&self) -> Result<Vec<ContractRecord>, StorageError> {
        let tables = self.tables.read().await;
        let mut contracts: Vec<_> = tables.contracts.values().cloned().collect();
        contracts.sort_by_key(|contract| (contract.address, contract.network.as_str()));
        Ok(contracts)
    }

    async fn contract_exists(
        &self,
        address: Address,
        network: Network,
    ) -> Result<bool, StorageError> {
        Ok(self.tables.read().await.contracts.contains_key(&(address, network)))
    }

    async fn insert_contract(&self, contract: ContractRecord) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let key = (contract.address, contract.network);
        if tables.contracts.contains_key(&key) {
            return Err(StorageError::Duplicate {
                entity: "contract",
                key: contract_key(contract.address, contract.network),
            });
        }
        tables.contracts.insert(key, contract);
        Ok(())
    }

    async fn update_contract(
        &self,
        address: Address,
        network: Network,
        update: ContractUpdate,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let contract = tables.contracts.get_mut(&(address, network)).ok_or_else(|| {
            StorageError::NotFound { entity: "contract", key: contract_key(address, network) }
        })?;
        if let Some(block) = update.latest_synced_block {
            contract.latest_synced_block = block;
        }
        if let Some(events) = update.events {
            contract.events = events;
        }
        if let Some(descriptor) = update.descriptor {
            contract.descriptor = descriptor;
        }
        Ok(())
    }

    async fn insert_event(&self, event: EventRecord) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        insert_event_locked(&mut tables, event)
    }

    async fn insert_events(&self, events: Vec<EventRecord>) -> Result<usize, StorageError> {
        let mut tables = self.tables.write().await;
        let mut inserted = 0;
        for event in events {
            match insert_event_locked(&mut tables, event) {
                Ok(()) => inserted += 1,
                Err(StorageError::Duplicate { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(inserted)
    }

    async fn insert_token(&self, token: TokenRecord) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let key = (token.address, token.network, token.token_id);
        if tables.tokens.contains_key(&key) {
            return Err(StorageError::Duplicate {
                entity: "token",
                key: token_key(token.address, token.network, token.token_id),
            });
        }
        tables.tokens.insert(key, token);
        Ok(())
    }

    async fn update_token(&self, token: TokenRecord) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        let key = (token.address, token.network, token.token_id);
        let existing = tables.tokens.get(&key).ok_or_else(|| StorageError::NotFound {
            entity: "token",
            key: token_key(token.address, token.network, token.token_id),
        })?;
        if existing.block_number > token.block_number {
            return Ok(false);
        }
        tables.tokens.insert(key, token);
        Ok(true)
    }

    async fn get_token(
        &self,
        address: Address,
        network: Network,
        token_id: U256,
    ) -> Result<Option<TokenRecord>, StorageError> {
        Ok(self.tables.read().await.tokens.get(&(address, network, token_id)).cloned())
    }

    async fn get_events(
        &self,
        address: Address,
        network: Network,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let tables = self.tables.read().await;
        let mut events: Vec<_> = tables
            .events
            .values()
            .filter(|event| event.address == address && event.network == network)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.block_number);
        Ok(events)
    }
}

fn insert_event_locked(tables: &mut Tables, event: EventRecord) -> Result<(), StorageError> {
    let key = (event.address, event.network, event.transaction_hash);
    if tables.events.contains_key(&key) {
        return Err(StorageError::Duplicate {
            entity: "event",
            key: event_key(event.address, event.network, event.transaction_hash),
        });
    }
    tables.events.insert(key, event);
    Ok(())
}
