//! Token metadata enrichment.
//!
//! Every token-bearing event schedules a fetch of the token's `tokenURI` and
//! the JSON document behind it. Fetches are throttled with a process-wide
//! counter: each scheduled fetch waits one throttle step per fetch already
//! outstanding, spreading bursts of events out over time instead of hammering
//! the metadata hosts.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::primitives::U256;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    abi::{DecodedEvent, MethodCall, MethodKind, MethodValue},
    chain::ChainClient,
    pipeline::EventPipeline,
    storage::Storage,
    types::{EventRecord, TokenRecord},
    watcher::Watcher,
};

/// Delay added per outstanding fetch.
pub const DEFAULT_THROTTLE_STEP: Duration = Duration::from_millis(2500);

const IPFS_SCHEME: &str = "ipfs://";
const IPFS_GATEWAY: &str = "https://ipfs.io/ipfs/";

/// A metadata document could not be fetched.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("metadata endpoint returned status {0}")]
    Status(u16),
    #[error("metadata body is not valid JSON")]
    InvalidJson,
}

/// Fetches external JSON metadata documents.
#[async_trait]
pub trait MetadataFetcher: Send + Sync + 'static {
    async fn fetch_json(&self, url: &str) -> Result<Value, FetchError>;
}

/// reqwest-backed [`MetadataFetcher`].
#[derive(Clone, Default)]
pub struct HttpMetadataFetcher {
    client: reqwest::Client,
}

impl HttpMetadataFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataFetcher for HttpMetadataFetcher {
    async fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|_| FetchError::InvalidJson)
    }
}

/// Rewrites `ipfs://` references to an HTTP gateway URL; anything else passes
/// through untouched.
#[must_use]
pub fn ipfs_to_gateway(uri: &str) -> String {
    uri.replacen(IPFS_SCHEME, IPFS_GATEWAY, 1)
}

fn throttle_delay(step: Duration, ahead: usize) -> Duration {
    step.saturating_mul(ahead as u32)
}

/// Schedules and runs metadata fetches for token-bearing events.
pub struct EnrichmentQueue<S> {
    pipeline: EventPipeline<S>,
    fetcher: Arc<dyn MetadataFetcher>,
    outstanding: Arc<AtomicUsize>,
    step: Duration,
}

impl<S> Clone for EnrichmentQueue<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            fetcher: Arc::clone(&self.fetcher),
            outstanding: Arc::clone(&self.outstanding),
            step: self.step,
        }
    }
}

impl<S: Storage> EnrichmentQueue<S> {
    #[must_use]
    pub fn new(pipeline: EventPipeline<S>, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self {
            pipeline,
            fetcher,
            outstanding: Arc::new(AtomicUsize::new(0)),
            step: DEFAULT_THROTTLE_STEP,
        }
    }

    #[must_use]
    pub fn with_throttle_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Number of fetches currently scheduled or running.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Schedules an enrichment fetch for `event` if it carries a token id.
    /// Returns immediately; the fetch runs on its own task after the
    /// throttle delay.
    pub fn schedule<C: ChainClient>(&self, watcher: Watcher<C>, event: &DecodedEvent) {
        let Some(token_id) = event.token_id else {
            return;
        };

        let ahead = self.outstanding.fetch_add(1, Ordering::SeqCst);
        let delay = throttle_delay(self.step, ahead);
        let queue = self.clone();
        let record = event.record.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.run(watcher, token_id, record).await;
            queue.outstanding.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Reads `tokenURI`, fetches the document it points at, and upserts the
    /// token. A failed read still upserts the decoded parameters so the
    /// token's existence is recorded; a non-JSON document keeps the URI
    /// reference without the metadata body.
    async fn run<C: ChainClient>(&self, watcher: Watcher<C>, token_id: U256, record: EventRecord) {
        let mut data = record.params.clone();

        let uri = if watcher.descriptor().supports_method(MethodKind::TokenUri) {
            match watcher.call(&MethodCall::TokenUri { token_id }).await {
                Ok(MethodValue::Uri(uri)) => Some(uri),
                Ok(_) => None,
                Err(err) => {
                    warn!(
                        address = %record.address,
                        network = %record.network,
                        token_id = %token_id,
                        error = %err,
                        "tokenURI read failed, storing bare token"
                    );
                    None
                }
            }
        } else {
            None
        };

        if let Some(uri) = uri {
            data["tokenUri"] = Value::String(uri.clone());
            match self.fetcher.fetch_json(&ipfs_to_gateway(&uri)).await {
                Ok(metadata) => {
                    if let Some(image) = metadata.get("image").and_then(Value::as_str) {
                        data["image"] = Value::String(ipfs_to_gateway(image));
                    }
                    data["metadata"] = metadata;
                }
                Err(err) => {
                    debug!(
                        token_id = %token_id,
                        uri,
                        error = %err,
                        "metadata fetch failed, keeping the URI reference"
                    );
                }
            }
        }

        let token = TokenRecord {
            address: record.address,
            network: record.network,
            token_id,
            block_number: record.block_number,
            data,
        };
        if let Err(err) = self.pipeline.upsert_token(token).await {
            warn!(token_id = %token_id, error = %err, "token upsert failed");
        }
    }
}
