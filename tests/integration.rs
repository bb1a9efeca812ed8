//! Integration tests for playervault.
//!
//! Everything runs against the in-memory backends, which implement the
//! same CAS/TTL contracts as a real deployment. "Process restart" is
//! simulated by opening a fresh store over the same backend instances;
//! "crash" states are seeded directly into the DocStore with the public
//! codec.
//!
//! # Test Organization
//! - `scenario_*` - end-to-end flows: transfers, crash recovery, sharding
//! - `property_*` - invariant checks: lock exclusivity, orphan accounting

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use playervault::{
    codec, diff, ChangeEvent, LeaseMap, LogicalRecord, MemoryDocStore, MemoryLeaseMap,
    MigrationStep, Patch, RecordMeta, RetryPolicy, Store, StoreConfig, StoreError, Tunables,
};

// =============================================================================
// Harness helpers
// =============================================================================

/// Simple logging for `--nocapture` runs. `try_init` because every test
/// in the binary shares one global subscriber.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_test_writer()
        .try_init();
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        factor: 2.0,
        jitter: 0.0,
        max_attempts: Some(3),
    }
}

fn coin_config() -> StoreConfig {
    StoreConfig::new("players").template(json!({"coins": 0})).retry(fast_retry())
}

struct Backends {
    docs: Arc<MemoryDocStore>,
    leases: Arc<MemoryLeaseMap>,
}

impl Backends {
    fn new() -> Self {
        init_logging();
        Self { docs: Arc::new(MemoryDocStore::new()), leases: Arc::new(MemoryLeaseMap::new()) }
    }

    /// "Start a process": a store over the shared backends.
    async fn open(&self, config: StoreConfig) -> Store {
        Store::open(config, self.docs.clone(), self.leases.clone()).await.unwrap()
    }
}

/// Seed the crash-shaped state a process leaves when it dies after staging
/// (phase 2) for `key`: the record carries the tx patch but `data` and
/// `committedData` are still pre-transaction.
fn seed_staged(docs: &MemoryDocStore, key: &str, committed: Value, new_value: &Value, tx_id: &str) {
    let primary_id = format!("players/{key}");
    let patch: Patch = diff(&committed, new_value);
    let record = LogicalRecord {
        data: committed.clone(),
        meta: RecordMeta {
            shard_ids: vec![primary_id.clone()],
            active_tx_id: Some(tx_id.to_string()),
            committed_data: Some(committed),
            tx_patch: Some(patch),
            ..RecordMeta::default()
        },
    };
    let bytes = codec::encode_stored(&codec::StoredDoc::inline(&record)).unwrap();
    docs.put_raw(&primary_id, bytes);
}

fn stored_doc(docs: &MemoryDocStore, key: &str) -> codec::StoredDoc {
    let doc = docs.peek_raw(&format!("players/{key}")).unwrap();
    codec::decode_stored(&doc.bytes).unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

/// S1: a successful two-key coin transfer commits atomically and leaves no
/// ledger document behind.
#[tokio::test(start_paused = true)]
async fn scenario_successful_coin_transfer() {
    let backends = Backends::new();
    let store = backends.open(coin_config()).await;
    store.load("k1").await.unwrap();
    store.load("k2").await.unwrap();
    store
        .update("k1", |d| {
            d["coins"] = json!(10);
            true
        })
        .await
        .unwrap();

    let committed = store
        .tx(&["k1", "k2"], |state| {
            let from = state.get_mut("k1").unwrap();
            from["coins"] = json!(from["coins"].as_i64().unwrap() - 7);
            let to = state.get_mut("k2").unwrap();
            to["coins"] = json!(to["coins"].as_i64().unwrap() + 7);
            true
        })
        .await
        .unwrap();
    assert!(committed);

    assert_eq!(store.get("k1").unwrap()["coins"], json!(3));
    assert_eq!(store.get("k2").unwrap()["coins"], json!(7));

    // Phase 4 swept the ledger and collapsed the staging.
    assert!(backends.docs.ids().iter().all(|id| !id.contains("/tx/")));
    assert!(!stored_doc(&backends.docs, "k1").meta.is_staged());
    assert!(!stored_doc(&backends.docs, "k2").meta.is_staged());
    store.close().await;
}

/// S2: a crash between staging and the ledger write. The ledger is absent,
/// so a restarted process reassembles the pre-transaction data.
#[tokio::test(start_paused = true)]
async fn scenario_crash_between_stage_and_ledger() {
    let backends = Backends::new();
    seed_staged(&backends.docs, "k1", json!({"coins": 10}), &json!({"coins": 3}), "tx-dead");
    seed_staged(&backends.docs, "k2", json!({"coins": 0}), &json!({"coins": 7}), "tx-dead");

    let store = backends.open(coin_config()).await;
    store.load("k1").await.unwrap();
    store.load("k2").await.unwrap();

    assert_eq!(store.get("k1").unwrap(), json!({"coins": 10}));
    assert_eq!(store.get("k2").unwrap(), json!({"coins": 0}));

    // The load's first save collapsed the staging durably.
    assert!(!stored_doc(&backends.docs, "k1").meta.is_staged());
    assert!(!stored_doc(&backends.docs, "k2").meta.is_staged());
    store.close().await;
}

/// S3: a crash between the ledger write and cleanup. The ledger says
/// committed, so a restarted process applies the staged patches.
#[tokio::test(start_paused = true)]
async fn scenario_crash_between_ledger_and_cleanup() {
    let backends = Backends::new();
    seed_staged(&backends.docs, "k1", json!({"coins": 10}), &json!({"coins": 3}), "tx-done");
    seed_staged(&backends.docs, "k2", json!({"coins": 0}), &json!({"coins": 7}), "tx-done");
    backends.docs.put_raw("players/tx/tx-done", b"true".to_vec());

    let store = backends.open(coin_config()).await;
    store.load("k1").await.unwrap();
    store.load("k2").await.unwrap();

    assert_eq!(store.get("k1").unwrap(), json!({"coins": 3}));
    assert_eq!(store.get("k2").unwrap(), json!({"coins": 7}));

    // The subsequent save collapsed the staging.
    store.save("k1").await.unwrap();
    assert!(!stored_doc(&backends.docs, "k1").meta.is_staged());
    store.close().await;
}

/// S4: schema rejection leaves the session Ready with its data intact.
#[tokio::test(start_paused = true)]
async fn scenario_schema_rejection() {
    let backends = Backends::new();
    let config = coin_config().schema(|data| {
        data["coins"].as_i64().map(|_| ()).ok_or_else(|| "coins must be a number".to_string())
    });
    let store = backends.open(config).await;
    store.load("k1").await.unwrap();

    let err = store
        .update("k1", |d| {
            d["coins"] = json!("ten");
            true
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SchemaFailed { .. }));
    assert_eq!(store.get("k1").unwrap()["coins"], json!(0));

    // Still Ready: the next valid update commits.
    assert!(store
        .update("k1", |d| {
            d["coins"] = json!(1);
            true
        })
        .await
        .unwrap());
    store.close().await;
}

/// S5: a transform that blocks past its synchronous budget fails with
/// UpdateYielded and the data is unchanged.
#[tokio::test(start_paused = true)]
async fn scenario_update_yields() {
    let backends = Backends::new();
    let store = backends.open(coin_config()).await;
    store.load("k1").await.unwrap();

    let err = store
        .update("k1", |d| {
            std::thread::sleep(Duration::from_millis(250));
            d["coins"] = json!(1);
            true
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UpdateYielded { .. }));
    assert_eq!(store.get("k1").unwrap(), json!({"coins": 0}));
    store.close().await;
}

/// S6: a record three times the size budget shards on save and loads
/// identically in a fresh process.
#[tokio::test(start_paused = true)]
async fn scenario_sharded_record_round_trip() {
    let backends = Backends::new();
    let tunables = Tunables { max_doc_bytes: 12_000, ..Tunables::default() };
    let config = coin_config().tunables(tunables.clone());

    let store = backends.open(config.clone()).await;
    store.load("big").await.unwrap();
    let blob = "x".repeat(30_000);
    let expected = json!({"coins": 0, "blob": blob});
    store
        .update("big", {
            let blob = blob.clone();
            move |d| {
                d["blob"] = json!(blob);
                true
            }
        })
        .await
        .unwrap();
    store.save("big").await.unwrap();
    store.unload("big").await.unwrap();
    store.close().await;

    // Primary stores only the manifest; data lives in three shards.
    let stored = stored_doc(&backends.docs, "big");
    assert!(stored.data.is_none());
    let manifest = stored.manifest.unwrap();
    assert_eq!(manifest.shard_ids.len(), 3);

    // Fresh process.
    let store = backends.open(config).await;
    store.load("big").await.unwrap();
    assert_eq!(store.get("big").unwrap(), expected);
    store.close().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_change_observers_see_every_commit() {
    let backends = Backends::new();
    let seen: Arc<parking_lot::Mutex<Vec<(Option<Value>, Value)>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let config = coin_config().changed_callback(Arc::new(move |event: &ChangeEvent| {
        sink.lock().push((event.old.as_deref().cloned(), (*event.new).clone()));
    }));

    let store = backends.open(config).await;
    store.load("k1").await.unwrap();
    store
        .update("k1", |d| {
            d["coins"] = json!(5);
            true
        })
        .await
        .unwrap();
    store.close().await;

    let seen = seen.lock();
    // Load fires with old = None, then the update with both snapshots.
    assert_eq!(seen[0], (None, json!({"coins": 0})));
    assert_eq!(seen[1], (Some(json!({"coins": 0})), json!({"coins": 5})));
}

#[tokio::test(start_paused = true)]
async fn scenario_peek_applies_the_readtx_rule() {
    let backends = Backends::new();
    seed_staged(&backends.docs, "k1", json!({"coins": 10}), &json!({"coins": 3}), "tx-1");

    let store = backends.open(coin_config()).await;
    // Ledger absent: pre-transaction view, no session created.
    assert_eq!(store.peek("k1").await.unwrap(), Some(json!({"coins": 10})));
    assert!(!store.is_loaded("k1"));
    assert!(backends.leases.holder("players/k1").await.unwrap().is_none());

    // Ledger committed: post-transaction view.
    backends.docs.put_raw("players/tx/tx-1", b"true".to_vec());
    assert_eq!(store.peek("k1").await.unwrap(), Some(json!({"coins": 3})));

    assert_eq!(store.peek("absent").await.unwrap(), None);
    store.close().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_migrations_run_once_per_record() {
    let backends = Backends::new();
    let migrated = || {
        vec![MigrationStep::new("seed-inventory", |mut data| {
            data["inventory"] = json!([]);
            Ok(data)
        })]
    };

    let store = backends.open(coin_config()).await;
    store.load("k1").await.unwrap();
    store.close().await;

    // Restart with a migration configured.
    let store = backends.open(coin_config().migration_steps(migrated())).await;
    store.load("k1").await.unwrap();
    assert_eq!(store.get("k1").unwrap(), json!({"coins": 0, "inventory": []}));
    store.close().await;

    // And again: the step does not reapply.
    let store = backends.open(coin_config().migration_steps(migrated())).await;
    store.load("k1").await.unwrap();
    assert_eq!(store.get("k1").unwrap(), json!({"coins": 0, "inventory": []}));
    store.close().await;
}

// =============================================================================
// Properties
// =============================================================================

/// Property 1: two processes loading the same key concurrently: exactly
/// one wins; the loser acquires only after release, or times out.
#[tokio::test(start_paused = true)]
async fn property_lock_exclusivity_across_processes() {
    let backends = Backends::new();
    let store_a = backends.open(coin_config()).await;
    let store_b = backends.open(coin_config()).await;

    store_a.load("k1").await.unwrap();

    // B cannot load while A holds the lease: its acquire deadline (the
    // lock duration) elapses.
    let err = store_b.load("k1").await.unwrap_err();
    assert!(matches!(err, StoreError::LockUnavailable(_)));

    // After A unloads, B proceeds.
    store_a.unload("k1").await.unwrap();
    store_b.load("k1").await.unwrap();
    assert!(store_b.is_loaded("k1"));

    store_a.close().await;
    store_b.close().await;
}

/// Property 2: updates are atomic; `get` reflects pre- or post-transform
/// state, never a partial merge.
#[tokio::test(start_paused = true)]
async fn property_update_atomicity_on_abort() {
    let backends = Backends::new();
    let store = backends.open(coin_config()).await;
    store.load("k1").await.unwrap();

    let committed = store
        .update("k1", |d| {
            d["coins"] = json!(100);
            d["partial"] = json!(true);
            false
        })
        .await
        .unwrap();
    assert!(!committed);
    assert_eq!(store.get("k1").unwrap(), json!({"coins": 0}));
    store.close().await;
}

/// Property 3 (fault injected after staging): on reload the participant
/// set is all-post or all-pre, never mixed.
#[tokio::test(start_paused = true)]
async fn property_tx_atomicity_under_partial_staging() {
    let backends = Backends::new();
    // Only k1 staged (the "crash" hit between the two staging writes);
    // ledger absent.
    seed_staged(&backends.docs, "k1", json!({"coins": 10}), &json!({"coins": 3}), "tx-x");
    let record = LogicalRecord::new(json!({"coins": 0}), Vec::new(), "players/k2");
    backends.docs.put_raw(
        "players/k2",
        codec::encode_stored(&codec::StoredDoc::inline(&record)).unwrap(),
    );

    let store = backends.open(coin_config()).await;
    store.load("k1").await.unwrap();
    store.load("k2").await.unwrap();
    assert_eq!(store.get("k1").unwrap(), json!({"coins": 10}));
    assert_eq!(store.get("k2").unwrap(), json!({"coins": 0}));
    store.close().await;
}

/// Property 7: after size-shrinking writes, the DocStore holds exactly the
/// primary, its referenced shards, and the (empty) orphan queue.
#[tokio::test(start_paused = true)]
async fn property_orphan_cleanup_accounting() {
    let backends = Backends::new();
    let config = coin_config()
        .tunables(Tunables { max_doc_bytes: 12_000, ..Tunables::default() });
    let store = backends.open(config).await;
    store.load("k1").await.unwrap();

    // Grow to several shards, then shrink stepwise.
    for size in [60_000usize, 30_000, 40] {
        store
            .update("k1", move |d| {
                d["blob"] = json!("x".repeat(size));
                true
            })
            .await
            .unwrap();
        store.save("k1").await.unwrap();
    }

    let stored = stored_doc(&backends.docs, "k1");
    let mut expected: Vec<String> = vec!["players/k1".into(), "players/orphans".into()];
    expected.extend(stored.meta.shard_ids.iter().filter(|id| *id != "players/k1").cloned());
    expected.sort();

    let mut actual = backends.docs.ids();
    actual.sort();
    assert_eq!(actual, expected);

    let stats = store.stats().await;
    assert_eq!(stats.orphans_queued, Some(0));
    store.close().await;
}

#[tokio::test(start_paused = true)]
async fn property_updates_coalesce_with_saves() {
    let backends = Backends::new();
    let store = backends.open(coin_config()).await;
    store.load("k1").await.unwrap();

    store
        .update("k1", |d| {
            d["coins"] = json!(1);
            true
        })
        .await
        .unwrap();
    store.save("k1").await.unwrap();
    let v1 = backends.docs.peek_raw("players/k1").unwrap().version;

    // A save with nothing dirty writes nothing.
    store.save("k1").await.unwrap();
    assert_eq!(backends.docs.peek_raw("players/k1").unwrap().version, v1);
    store.close().await;
}
