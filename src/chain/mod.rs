//! The chain boundary: everything that talks to an RPC node goes through
//! [`ChainClient`], so the rest of the crate never sees a transport.

use std::sync::Arc;

use alloy::{
    primitives::Address,
    rpc::types::Log,
    transports::{RpcError, TransportErrorKind},
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{
    abi::{EventKind, MethodCall, MethodValue},
    types::Network,
};

mod rpc;

pub use rpc::RpcChainClient;

/// A contract on a specific network. The pair is the identity used
/// everywhere: registry keys, storage indexes, log filters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContractBinding {
    pub address: Address,
    pub network: Network,
}

/// Errors crossing the chain boundary.
///
/// Clonable so results can be fanned out to subscribers; transport errors are
/// wrapped in `Arc` for that reason.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The node refused a log query because it matched too many results.
    /// Classified once at the RPC boundary; callers react by splitting the
    /// range, never by inspecting messages.
    #[error("log query for blocks {from}..={to} exceeded the node result limit")]
    ResultLimitExceeded { from: u64, to: u64 },

    /// No RPC endpoint is configured for the network.
    #[error("no RPC endpoint configured for network {0}")]
    UnsupportedNetwork(Network),

    /// The endpoint does not support live subscriptions.
    #[error("endpoint for network {0} does not support log subscriptions")]
    PubsubUnavailable(Network),

    /// The underlying RPC transport returned an error.
    #[error("RPC error: {0}")]
    Transport(Arc<RpcError<TransportErrorKind>>),

    /// The node answered but the return data did not match the ABI.
    #[error("failed to decode return data: {0}")]
    Decode(String),
}

impl From<RpcError<TransportErrorKind>> for ClientError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        rpc::classify_rpc_error(error, None)
    }
}

/// Stream of raw logs from a live subscription.
pub type LogStream = BoxStream<'static, Log>;

/// Read-side operations the listener needs from a node.
///
/// One implementation speaks RPC ([`RpcChainClient`]); tests swap in a
/// scripted mock.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Current head block number of the network.
    async fn latest_block(&self, network: Network) -> Result<u64, ClientError>;

    /// All logs for one event of one contract in an inclusive block range.
    async fn get_logs(
        &self,
        binding: &ContractBinding,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ClientError>;

    /// Opens a live log subscription for one event of one contract.
    async fn subscribe_logs(
        &self,
        binding: &ContractBinding,
        kind: EventKind,
    ) -> Result<LogStream, ClientError>;

    /// Executes a read-only method call and decodes its return value.
    async fn call(
        &self,
        binding: &ContractBinding,
        call: &MethodCall,
    ) -> Result<MethodValue, ClientError>;
}
