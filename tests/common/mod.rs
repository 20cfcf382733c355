use std::{sync::Arc, time::Duration};

use alloy::primitives::Address;
use chain_listener::{
    test_utils::{MockChainClient, StaticFetcher},
    MemoryStorage, Network, Orchestrator,
};
use tracing_subscriber::EnvFilter;

pub const CONTRACT: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const NETWORK: Network = Network::Rinkeby;

pub struct Setup {
    pub client: Arc<MockChainClient>,
    pub storage: Arc<MemoryStorage>,
    pub orchestrator: Orchestrator<MockChainClient, MemoryStorage>,
}

pub fn setup() -> Setup {
    setup_with_fetcher(StaticFetcher::new())
}

pub fn setup_with_fetcher(fetcher: StaticFetcher) -> Setup {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).try_init();
    let client = Arc::new(MockChainClient::new());
    let storage = Arc::new(MemoryStorage::new());
    let orchestrator =
        Orchestrator::new(Arc::clone(&client), Arc::clone(&storage), Arc::new(fetcher))
            .with_throttle_step(Duration::ZERO);
    Setup { client, storage, orchestrator }
}

pub fn contract_address() -> Address {
    CONTRACT.parse().expect("valid test address")
}
