//! Persistence glue between decoded events and the storage layer.
//!
//! Duplicate-key rejections are part of normal operation here: backfills can
//! replay ranges, and a live subscription can overlap the tail of a
//! backfill. The unique event index makes the replays idempotent.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    error::ListenerResult,
    storage::{Storage, StorageError},
    types::{EventRecord, TokenRecord},
};

pub struct EventPipeline<S> {
    storage: Arc<S>,
}

impl<S> Clone for EventPipeline<S> {
    fn clone(&self) -> Self {
        Self { storage: Arc::clone(&self.storage) }
    }
}

impl<S: Storage> EventPipeline<S> {
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Persists a batch of events, skipping duplicates. Returns how many were
    /// actually inserted.
    pub async fn persist_batch(&self, events: Vec<EventRecord>) -> ListenerResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let total = events.len();
        let inserted = self.storage.insert_events(events).await?;
        if inserted < total {
            debug!(inserted, total, "skipped already-persisted events");
        }
        Ok(inserted)
    }

    /// Persists one event. A duplicate is benign and reported as `false`.
    pub async fn persist_one(&self, event: EventRecord) -> ListenerResult<bool> {
        match self.storage.insert_event(event).await {
            Ok(()) => Ok(true),
            Err(StorageError::Duplicate { key, .. }) => {
                debug!(key, "event already persisted");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Upserts a token document with last-block-wins semantics: insert, and
    /// on a duplicate key update unless the stored document is from a later
    /// block.
    pub async fn upsert_token(&self, token: TokenRecord) -> ListenerResult<()> {
        let key_block = token.block_number;
        match self.storage.insert_token(token.clone()).await {
            Ok(()) => Ok(()),
            Err(StorageError::Duplicate { .. }) => {
                let applied = self.storage.update_token(token).await?;
                if !applied {
                    debug!(block = key_block, "token update superseded by a later block");
                }
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "token insert failed");
                Err(err.into())
            }
        }
    }
}
