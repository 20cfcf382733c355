mod common;

use alloy::primitives::Address;
use anyhow::Result;
use chain_listener::{
    test_utils::{transfer_log, wait_for, wait_until},
    ContractRecord, EventKind, EventState, InterfaceDescriptor, MethodKind, Network, Storage,
};

use common::{contract_address, setup, CONTRACT, NETWORK};

#[tokio::test]
async fn add_backfills_and_advances_the_cursor() -> Result<()> {
    let env = setup();
    let address = contract_address();
    env.client.set_latest_block(NETWORK, 150);
    env.client.script_logs(
        address,
        EventKind::Transfer,
        0,
        150,
        vec![
            transfer_log(address, 1, 101, 1),
            transfer_log(address, 2, 105, 2),
            transfer_log(address, 3, 103, 3),
        ],
    );

    let status = env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;
    assert!(status.success, "{}", status.message);

    let orchestrator = &env.orchestrator;
    wait_until(|| async move { orchestrator.cursor(address, NETWORK).await == Some(105) }).await;

    let events = env.storage.get_events(address, NETWORK).await?;
    assert_eq!(events.len(), 3);
    let blocks: Vec<_> = events.iter().map(|event| event.block_number).collect();
    assert_eq!(blocks, vec![101, 103, 105]);

    // the persisted cursor follows the in-memory one
    let stored = env.storage.get_contracts().await?;
    assert_eq!(stored[0].latest_synced_block, 105);
    Ok(())
}

#[tokio::test]
async fn backfill_then_tail_reaches_tailing() -> Result<()> {
    let env = setup();
    let address = contract_address();

    env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;

    let orchestrator = &env.orchestrator;
    wait_until(|| async move {
        orchestrator.event_state(address, NETWORK, EventKind::Transfer).await
            == Some(EventState::Tailing)
    })
    .await;
    assert_eq!(env.client.subscribe_count(), 1);
    Ok(())
}

#[tokio::test]
async fn re_adding_a_loaded_contract_is_rejected() -> Result<()> {
    let env = setup();

    let first = env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;
    assert!(first.success);

    let second = env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;
    assert!(!second.success);
    assert!(second.message.contains("add_event"), "{}", second.message);
    Ok(())
}

#[tokio::test]
async fn same_address_on_another_network_is_a_new_registration() -> Result<()> {
    let env = setup();

    assert!(env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?.success);
    assert!(
        env.orchestrator
            .add(CONTRACT, Network::Mainnet, EventKind::Transfer, 0, None)
            .await?
            .success
    );
    assert_eq!(env.storage.get_contracts().await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn invalid_address_is_rejected_without_side_effects() -> Result<()> {
    let env = setup();

    let status =
        env.orchestrator.add("0xnot-hex", NETWORK, EventKind::Transfer, 0, None).await?;
    assert!(!status.success);
    assert!(env.storage.get_contracts().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn undeclared_event_is_rejected() -> Result<()> {
    let env = setup();
    let descriptor = InterfaceDescriptor {
        events: vec![EventKind::Transfer],
        methods: vec![MethodKind::TokenUri],
    };

    let status = env
        .orchestrator
        .add(CONTRACT, NETWORK, EventKind::Approval, 0, Some(descriptor))
        .await?;
    assert!(!status.success);
    assert!(status.message.contains("Approval"), "{}", status.message);
    Ok(())
}

#[tokio::test]
async fn add_event_tracks_one_more_event() -> Result<()> {
    let env = setup();
    let address = contract_address();

    env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;

    let status = env.orchestrator.add_event(CONTRACT, NETWORK, EventKind::Approval).await?;
    assert!(status.success, "{}", status.message);

    let orchestrator = &env.orchestrator;
    wait_until(|| async move {
        orchestrator.event_state(address, NETWORK, EventKind::Approval).await
            == Some(EventState::Tailing)
    })
    .await;

    let stored = env.storage.get_contracts().await?;
    assert!(stored[0].events.contains(&EventKind::Approval));

    let again = env.orchestrator.add_event(CONTRACT, NETWORK, EventKind::Approval).await?;
    assert!(!again.success);
    assert!(again.message.contains("already tracked"), "{}", again.message);
    Ok(())
}

#[tokio::test]
async fn add_event_requires_a_registration() -> Result<()> {
    let env = setup();

    let status = env.orchestrator.add_event(CONTRACT, NETWORK, EventKind::Transfer).await?;
    assert!(!status.success);
    assert!(status.message.contains("not registered"), "{}", status.message);
    Ok(())
}

#[tokio::test]
async fn live_events_are_ingested_and_deduplicated() -> Result<()> {
    let env = setup();
    let address = contract_address();
    let feed = env.client.live_feed(address, EventKind::Transfer);

    env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;
    let orchestrator = &env.orchestrator;
    wait_until(|| async move {
        orchestrator.event_state(address, NETWORK, EventKind::Transfer).await
            == Some(EventState::Tailing)
    })
    .await;

    feed.send(transfer_log(address, 7, 200, 10)).await?;
    // same transaction replayed, then a later one
    feed.send(transfer_log(address, 7, 200, 10)).await?;
    feed.send(transfer_log(address, 8, 205, 11)).await?;

    let storage = &env.storage;
    wait_until(|| async move {
        storage.get_events(address, NETWORK).await.map(|events| events.len()) == Ok(2)
    })
    .await;
    wait_until(|| async move { orchestrator.cursor(address, NETWORK).await == Some(205) }).await;
    Ok(())
}

#[tokio::test]
async fn cursor_never_moves_backwards() -> Result<()> {
    let env = setup();
    let address = contract_address();
    env.client.set_latest_block(NETWORK, 300);
    env.client.script_logs(
        address,
        EventKind::Transfer,
        0,
        300,
        vec![transfer_log(address, 1, 250, 1)],
    );
    let feed = env.client.live_feed(address, EventKind::Transfer);

    env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;
    let orchestrator = &env.orchestrator;
    wait_until(|| async move { orchestrator.cursor(address, NETWORK).await == Some(250) }).await;

    // an older event arriving late must not rewind the cursor
    feed.send(transfer_log(address, 2, 100, 2)).await?;
    let storage = &env.storage;
    wait_until(|| async move {
        storage.get_events(address, NETWORK).await.map(|events| events.len()) == Ok(2)
    })
    .await;

    assert_eq!(env.orchestrator.cursor(address, NETWORK).await, Some(250));
    assert_eq!(env.storage.get_contracts().await?[0].latest_synced_block, 250);
    Ok(())
}

#[tokio::test]
async fn listening_twice_opens_one_subscription() -> Result<()> {
    let env = setup();
    let address = contract_address();

    env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;
    let orchestrator = &env.orchestrator;
    wait_until(|| async move {
        orchestrator.event_state(address, NETWORK, EventKind::Transfer).await
            == Some(EventState::Tailing)
    })
    .await;

    env.orchestrator.listen_events(None).await?;
    env.orchestrator.listen_events(Some(address)).await?;
    assert_eq!(env.client.subscribe_count(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_subscribe_can_be_retried() -> Result<()> {
    let env = setup();
    let address = contract_address();
    env.client.fail_subscribes(1);

    env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;

    // the automatic tail after backfill fails and leaves the pair retryable
    let client = &env.client;
    wait_until(|| async move { client.subscribe_count() == 1 }).await;
    let orchestrator = &env.orchestrator;
    wait_until(|| async move {
        orchestrator.event_state(address, NETWORK, EventKind::Transfer).await
            == Some(EventState::Registered)
    })
    .await;

    env.orchestrator.listen_events(None).await?;
    assert_eq!(
        env.orchestrator.event_state(address, NETWORK, EventKind::Transfer).await,
        Some(EventState::Tailing)
    );
    assert_eq!(env.client.subscribe_count(), 2);
    Ok(())
}

#[tokio::test]
async fn bootstrap_restores_and_resumes_from_the_stored_cursor() -> Result<()> {
    let env = setup();
    let address = contract_address();
    env.storage
        .insert_contract(ContractRecord {
            address,
            network: NETWORK,
            events: vec![EventKind::Transfer],
            latest_synced_block: 120,
            descriptor: InterfaceDescriptor::default(),
        })
        .await?;
    env.client.set_latest_block(NETWORK, 200);
    env.client.script_logs(
        address,
        EventKind::Transfer,
        120,
        200,
        vec![transfer_log(address, 4, 180, 20)],
    );

    env.orchestrator.bootstrap().await?;

    // backfill started at the stored cursor, not at zero
    assert_eq!(env.client.get_logs_calls(), vec![(120, 200)]);
    let storage = &env.storage;
    wait_until(|| async move {
        storage.get_events(address, NETWORK).await.map(|events| events.len()) == Ok(1)
    })
    .await;
    assert_eq!(env.orchestrator.cursor(address, NETWORK).await, Some(180));
    assert_eq!(env.client.subscribe_count(), 1);
    Ok(())
}

#[tokio::test]
async fn one_failing_pair_does_not_stop_the_others() -> Result<()> {
    let env = setup();
    let address = contract_address();
    let other: Address = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".parse()?;
    env.client.set_latest_block(NETWORK, 50);
    // the first contract's single-block backfill is over the result limit,
    // which cannot split further and fails the pair
    env.client.script_limit(address, EventKind::Transfer, 50, 50);
    env.client.script_logs(
        other,
        EventKind::Transfer,
        0,
        50,
        vec![transfer_log(other, 1, 40, 30)],
    );

    env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 50, None).await?;
    env.orchestrator
        .add(&other.to_string(), NETWORK, EventKind::Transfer, 0, None)
        .await?;

    let storage = &env.storage;
    wait_until(|| async move {
        storage.get_events(other, NETWORK).await.map(|events| events.len()) == Ok(1)
    })
    .await;
    assert!(env.storage.get_events(address, NETWORK).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn token_events_produce_token_records() -> Result<()> {
    use alloy::primitives::U256;
    use chain_listener::test_utils::StaticFetcher;
    use common::setup_with_fetcher;

    let env = setup_with_fetcher(
        StaticFetcher::new()
            .with_json("https://host/7.json", serde_json::json!({ "name": "Seven" })),
    );
    let address = contract_address();
    env.client.set_latest_block(NETWORK, 100);
    env.client.script_logs(
        address,
        EventKind::Transfer,
        0,
        100,
        vec![transfer_log(address, 7, 90, 40)],
    );
    env.client.script_call(
        address,
        "tokenURI",
        chain_listener::MethodValue::Uri("https://host/7.json".into()),
    );

    env.orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;

    let storage = &env.storage;
    let token = wait_for(|| async move {
        storage.get_token(address, NETWORK, U256::from(7)).await.expect("storage ok")
    })
    .await;
    assert_eq!(token.block_number, 90);
    assert_eq!(token.data["metadata"]["name"], "Seven");
    Ok(())
}

#[tokio::test]
async fn re_adding_after_a_restart_persists_the_merged_events() -> Result<()> {
    let env = setup();
    let address = contract_address();
    // a registration left behind by a previous run, tracking Transfer only
    env.storage
        .insert_contract(ContractRecord {
            address,
            network: NETWORK,
            events: vec![EventKind::Transfer],
            latest_synced_block: 80,
            descriptor: InterfaceDescriptor::default(),
        })
        .await?;

    let status = env
        .orchestrator
        .add(CONTRACT, NETWORK, vec![EventKind::Transfer, EventKind::Approval], 0, None)
        .await?;
    assert!(status.success, "{}", status.message);

    // the union is tracked in memory and written back, so it survives the
    // next restart
    let stored = env.storage.get_contracts().await?;
    assert!(stored[0].events.contains(&EventKind::Transfer));
    assert!(stored[0].events.contains(&EventKind::Approval));
    assert_eq!(env.orchestrator.cursor(address, NETWORK).await, Some(80));
    Ok(())
}

#[tokio::test]
async fn unknown_address_reports_the_miss() -> Result<()> {
    let env = setup();
    let address = contract_address();

    let loaded = env.orchestrator.load_past_events(Some(address)).await?;
    assert!(!loaded.success);
    assert!(loaded.message.contains("not registered"), "{}", loaded.message);

    let listened = env.orchestrator.listen_events(Some(address)).await?;
    assert!(!listened.success);
    assert_eq!(env.client.subscribe_count(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_persist_leaves_the_cursor_for_a_retry() -> Result<()> {
    use crate::flaky::FlakyStorage;
    use std::{sync::Arc, time::Duration};

    let client = Arc::new(chain_listener::test_utils::MockChainClient::new());
    let storage = Arc::new(FlakyStorage::new());
    let orchestrator = chain_listener::Orchestrator::new(
        Arc::clone(&client),
        Arc::clone(&storage),
        Arc::new(chain_listener::test_utils::StaticFetcher::new()),
    )
    .with_throttle_step(Duration::ZERO);
    let address = contract_address();
    client.set_latest_block(NETWORK, 100);
    client.script_logs(
        address,
        EventKind::Transfer,
        0,
        100,
        vec![transfer_log(address, 1, 90, 50)],
    );

    storage.fail_event_inserts(true);
    orchestrator.add(CONTRACT, NETWORK, EventKind::Transfer, 0, None).await?;

    // the backfill fails to persist but tailing still starts
    let orchestrator_ref = &orchestrator;
    wait_until(|| async move {
        orchestrator_ref.event_state(address, NETWORK, EventKind::Transfer).await
            == Some(EventState::Tailing)
    })
    .await;
    assert_eq!(orchestrator.cursor(address, NETWORK).await, Some(0));
    assert!(storage.get_events(address, NETWORK).await?.is_empty());

    // once the store recovers, the same range is re-fetched from the old
    // cursor and nothing is lost
    storage.fail_event_inserts(false);
    orchestrator.load_past_events(Some(address)).await?;

    assert_eq!(storage.get_events(address, NETWORK).await?.len(), 1);
    assert_eq!(orchestrator.cursor(address, NETWORK).await, Some(90));
    assert_eq!(storage.get_contracts().await?[0].latest_synced_block, 90);
    Ok(())
}

mod flaky {
    use std::sync::atomic::{AtomicBool, Ordering};

    use alloy::primitives::{Address, U256};
    use chain_listener::{
        ContractRecord, ContractUpdate, EventRecord, MemoryStorage, Network, Storage,
        StorageError, TokenRecord,
    };

    /// [`MemoryStorage`] wrapper whose event writes can be switched off, for
    /// exercising persistence failures.
    pub struct FlakyStorage {
        inner: MemoryStorage,
        fail_event_inserts: AtomicBool,
    }

    impl FlakyStorage {
        pub fn new() -> Self {
            Self { inner: MemoryStorage::new(), fail_event_inserts: AtomicBool::new(false) }
        }

        pub fn fail_event_inserts(&self, fail: bool) {
            self.fail_event_inserts.store(fail, Ordering::SeqCst);
        }

        fn event_write_error(&self) -> Option<StorageError> {
            self.fail_event_inserts
                .load(Ordering::SeqCst)
                .then(|| StorageError::Backend("event writes unavailable".into()))
        }
    }

    #[async_trait::async_trait]
    impl Storage for FlakyStorage {
        async fn get_contracts(&self) -> Result<Vec<ContractRecord>, StorageError> {
            self.inner.get_contracts().await
        }

        async fn contract_exists(
            &self,
            address: Address,
            network: Network,
        ) -> Result<bool, StorageError> {
            self.inner.contract_exists(address, network).await
        }

        async fn insert_contract(&self, contract: ContractRecord) -> Result<(), StorageError> {
            self.inner.insert_contract(contract).await
        }

        async fn update_contract(
            &self,
            address: Address,
            network: Network,
            update: ContractUpdate,
        ) -> Result<(), StorageError> {
            self.inner.update_contract(address, network, update).await
        }

        async fn insert_event(&self, event: EventRecord) -> Result<(), StorageError> {
            match self.event_write_error() {
                Some(err) => Err(err),
                None => self.inner.insert_event(event).await,
            }
        }

        async fn insert_events(&self, events: Vec<EventRecord>) -> Result<usize, StorageError> {
            match self.event_write_error() {
                Some(err) => Err(err),
                None => self.inner.insert_events(events).await,
            }
        }

        async fn insert_token(&self, token: TokenRecord) -> Result<(), StorageError> {
            self.inner.insert_token(token).await
        }

        async fn update_token(&self, token: TokenRecord) -> Result<bool, StorageError> {
            self.inner.update_token(token).await
        }

        async fn get_token(
            &self,
            address: Address,
            network: Network,
            token_id: U256,
        ) -> Result<Option<TokenRecord>, StorageError> {
            self.inner.get_token(address, network, token_id).await
        }

        async fn get_events(
            &self,
            address: Address,
            network: Network,
        ) -> Result<Vec<EventRecord>, StorageError> {
            self.inner.get_events(address, network).await
        }
    }
}
