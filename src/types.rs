use std::{fmt, str::FromStr};

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abi::{EventKind, InterfaceDescriptor};

/// EVM-compatible chains the listener knows how to reach.
///
/// Each variant maps to an RPC endpoint through
/// [`NetworkRpcConfig`](crate::config::NetworkRpcConfig); networks without a
/// configured endpoint are rejected at the RPC boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Network {
    Mainnet,
    Ropsten,
    Kovan,
    Rinkeby,
    BscMainnet,
    BscTestnet,
    PolygonMainnet,
    PolygonTestnet,
    FantomMainnet,
    FantomTestnet,
    HecoMainnet,
    HecoTestnet,
    ArbitrumMainnet,
    ArbitrumRinkeby,
}

impl Network {
    pub const ALL: [Network; 14] = [
        Network::Mainnet,
        Network::Ropsten,
        Network::Kovan,
        Network::Rinkeby,
        Network::BscMainnet,
        Network::BscTestnet,
        Network::PolygonMainnet,
        Network::PolygonTestnet,
        Network::FantomMainnet,
        Network::FantomTestnet,
        Network::HecoMainnet,
        Network::HecoTestnet,
        Network::ArbitrumMainnet,
        Network::ArbitrumRinkeby,
    ];

    /// Canonical name, identical to the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Ropsten => "ropsten",
            Network::Kovan => "kovan",
            Network::Rinkeby => "rinkeby",
            Network::BscMainnet => "bscMainnet",
            Network::BscTestnet => "bscTestnet",
            Network::PolygonMainnet => "polygonMainnet",
            Network::PolygonTestnet => "polygonTestnet",
            Network::FantomMainnet => "fantomMainnet",
            Network::FantomTestnet => "fantomTestnet",
            Network::HecoMainnet => "hecoMainnet",
            Network::HecoTestnet => "hecoTestnet",
            Network::ArbitrumMainnet => "arbitrumMainnet",
            Network::ArbitrumRinkeby => "arbitrumRinkeby",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The name did not match any supported network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown network `{0}`")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::ALL
            .into_iter()
            .find(|network| network.as_str() == s)
            .ok_or_else(|| UnknownNetwork(s.to_owned()))
    }
}

/// A persisted contract registration.
///
/// Unique per (address, network). `latest_synced_block` is the resumable
/// cursor: the highest block for which events have been fully processed. It
/// only ever moves forward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRecord {
    pub address: Address,
    pub network: Network,
    pub events: Vec<EventKind>,
    pub latest_synced_block: u64,
    #[serde(default)]
    pub descriptor: InterfaceDescriptor,
}

/// One decoded, persisted contract event.
///
/// Unique per (address, network, transaction_hash); append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub address: Address,
    pub network: Network,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub event: EventKind,
    #[serde(rename = "returnValues")]
    pub params: serde_json::Value,
}

/// A token with its merged decoded + fetched metadata fields.
///
/// Unique per (address, network, token_id); upserts follow last-block-wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub address: Address,
    pub network: Network,
    pub token_id: U256,
    pub block_number: u64,
    pub data: serde_json::Value,
}

/// Structured outcome of a registry operation.
///
/// Registry calls report expected rejections (already registered, unknown
/// address, already tracked event) through `success = false` with a
/// human-readable message instead of an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStatus {
    pub success: bool,
    pub message: String,
}

impl OpStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}
