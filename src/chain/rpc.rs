//! RPC-backed [`ChainClient`] with one lazily connected provider per network.

use std::{collections::HashMap, sync::Arc};

use alloy::{
    network::{Ethereum, TransactionBuilder},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{Filter, Log, TransactionRequest},
    transports::{RpcError, TransportErrorKind},
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ChainClient, ClientError, ContractBinding, LogStream};
use crate::{
    abi::{EventKind, MethodCall, MethodValue},
    config::NetworkRpcConfig,
    types::Network,
};

/// JSON-RPC error code some gateways use for "query returned too many
/// results" (alongside the human message other gateways send).
const RESULT_LIMIT_CODE: i64 = -32005;
const RESULT_LIMIT_MESSAGE: &str = "more than 10000 results";

/// Talks JSON-RPC to the configured endpoints. Providers are connected on
/// first use and cached for the process lifetime.
pub struct RpcChainClient {
    config: NetworkRpcConfig,
    providers: RwLock<HashMap<Network, RootProvider<Ethereum>>>,
}

impl RpcChainClient {
    #[must_use]
    pub fn new(config: NetworkRpcConfig) -> Self {
        Self { config, providers: RwLock::new(HashMap::new()) }
    }

    async fn provider(&self, network: Network) -> Result<RootProvider<Ethereum>, ClientError> {
        if let Some(provider) = self.providers.read().await.get(&network) {
            return Ok(provider.clone());
        }

        let endpoint = self
            .config
            .endpoint(network)
            .ok_or(ClientError::UnsupportedNetwork(network))?;

        let mut providers = self.providers.write().await;
        // A concurrent caller may have connected while we waited for the
        // write lock.
        if let Some(provider) = providers.get(&network) {
            return Ok(provider.clone());
        }

        debug!(network = %network, "connecting provider");
        let provider = ProviderBuilder::new()
            .connect(endpoint)
            .await
            .map_err(|err| classify_rpc_error(err, None))?;
        let root = provider.root().clone();
        providers.insert(network, root.clone());
        Ok(root)
    }
}

fn log_filter(binding: &ContractBinding, kind: EventKind) -> Filter {
    Filter::new().address(binding.address).event_signature(kind.signature_hash())
}

/// Turns a raw RPC error into the structured [`ClientError`]. The result
/// limit is recognized here, once, by code or message; everything else stays
/// a transport error.
pub(crate) fn classify_rpc_error(
    error: RpcError<TransportErrorKind>,
    range: Option<(u64, u64)>,
) -> ClientError {
    match range {
        Some((from, to)) if is_result_limit(&error) => {
            ClientError::ResultLimitExceeded { from, to }
        }
        _ => ClientError::Transport(Arc::new(error)),
    }
}

fn is_result_limit(error: &RpcError<TransportErrorKind>) -> bool {
    match error {
        RpcError::ErrorResp(payload) => {
            payload.code == RESULT_LIMIT_CODE
                || payload.message.to_lowercase().contains(RESULT_LIMIT_MESSAGE)
        }
        _ => false,
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn latest_block(&self, network: Network) -> Result<u64, ClientError> {
        let provider = self.provider(network).await?;
        provider.get_block_number().await.map_err(|err| classify_rpc_error(err, None))
    }

    async fn get_logs(
        &self,
        binding: &ContractBinding,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ClientError> {
        let provider = self.provider(binding.network).await?;
        let filter = log_filter(binding, kind).from_block(from).to_block(to);
        provider
            .get_logs(&filter)
            .await
            .map_err(|err| classify_rpc_error(err, Some((from, to))))
    }

    async fn subscribe_logs(
        &self,
        binding: &ContractBinding,
        kind: EventKind,
    ) -> Result<LogStream, ClientError> {
        let provider = self.provider(binding.network).await?;
        let filter = log_filter(binding, kind);
        let subscription = provider.subscribe_logs(&filter).await.map_err(|err| match err {
            RpcError::Transport(TransportErrorKind::PubsubUnavailable) => {
                ClientError::PubsubUnavailable(binding.network)
            }
            other => classify_rpc_error(other, None),
        })?;
        Ok(subscription.into_stream().boxed())
    }

    async fn call(
        &self,
        binding: &ContractBinding,
        call: &MethodCall,
    ) -> Result<MethodValue, ClientError> {
        let provider = self.provider(binding.network).await?;
        let request = TransactionRequest::default()
            .with_to(binding.address)
            .with_input(call.abi_encode());
        let data = provider.call(request).await.map_err(|err| classify_rpc_error(err, None))?;
        call.decode_return(&data).map_err(|err| ClientError::Decode(err.to_string()))
    }
}
