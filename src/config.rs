//! RPC endpoint configuration.

use std::collections::HashMap;

use serde::Deserialize;

use crate::types::Network;

/// Environment variable holding the Infura project key used by
/// [`NetworkRpcConfig::from_env`].
pub const INFURA_API_KEY_VAR: &str = "INFURA_API_KEY";

/// Maps each [`Network`] to its RPC endpoint.
///
/// Networks without an entry are rejected by the RPC client with
/// `ClientError::UnsupportedNetwork`. WebSocket (`wss://`) endpoints are
/// required for live subscriptions; `https://` endpoints only support the
/// fetch and call paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct NetworkRpcConfig {
    endpoints: HashMap<Network, String>,
}

impl NetworkRpcConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the endpoint table from `INFURA_API_KEY`, covering the Infura
    /// and public-gateway networks. Networks Infura does not serve get the
    /// community websocket gateways.
    #[must_use]
    pub fn from_env() -> Self {
        let infura_key = std::env::var(INFURA_API_KEY_VAR).unwrap_or_default();
        let infura = |subdomain: &str| format!("wss://{subdomain}.infura.io/ws/v3/{infura_key}");

        let mut config = Self::new();
        config
            .set(Network::Mainnet, infura("mainnet"))
            .set(Network::Ropsten, infura("ropsten"))
            .set(Network::Kovan, infura("kovan"))
            .set(Network::Rinkeby, infura("rinkeby"))
            .set(Network::ArbitrumMainnet, infura("arbitrum-mainnet"))
            .set(Network::ArbitrumRinkeby, infura("arbitrum-rinkeby"))
            .set(Network::PolygonMainnet, infura("polygon-mainnet"))
            .set(Network::PolygonTestnet, infura("polygon-mumbai"))
            .set(Network::BscMainnet, "wss://bsc-ws-node.nariox.org:443")
            .set(Network::BscTestnet, "wss://testnet-dex.binance.org/api/ws")
            .set(Network::FantomMainnet, "wss://wsapi.fantom.network")
            .set(Network::FantomTestnet, "wss://wsapi.testnet.fantom.network")
            .set(Network::HecoMainnet, "wss://ws-mainnet.hecochain.com")
            .set(Network::HecoTestnet, "wss://ws-testnet.hecochain.com");
        config
    }

    /// Sets or replaces the endpoint for one network.
    pub fn set(&mut self, network: Network, endpoint: impl Into<String>) -> &mut Self {
        self.endpoints.insert(network, endpoint.into());
        self
    }

    /// Builder-style variant of [`set`](Self::set).
    #[must_use]
    pub fn with_endpoint(mut self, network: Network, endpoint: impl Into<String>) -> Self {
        self.set(network, endpoint);
        self
    }

    #[must_use]
    pub fn endpoint(&self, network: Network) -> Option<&str> {
        self.endpoints.get(&network).map(String::as_str)
    }
}
