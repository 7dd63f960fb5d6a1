//! End-to-end scenarios (SPEC_FULL.md §8) against the in-memory store, no
//! live Redis required.

use delayecho::freshness::FreshnessSource;
use delayecho::store::StoreGateway;
use delayecho::{Component, DispatchEngine, EngineConfig, MemoryStoreGateway};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    // Keep the lock TTL and retry delay short so the "leftover, retry
    // later" path doesn't make these tests slow.
    config.processing_window_ms = 60;
    config.processing_retry_delay_ms = 70;
    config
}

async fn running_engine<S>(store: S, config: EngineConfig) -> DispatchEngine<S>
where
    S: StoreGateway + FreshnessSource + 'static,
{
    let mut engine = DispatchEngine::new(store, config);
    engine.init().await.unwrap();
    engine.start().await.unwrap();
    engine
}

#[tokio::test]
async fn single_replica_dispatches_due_messages() {
    let store = MemoryStoreGateway::new();
    let engine = running_engine(store, fast_config()).await;

    let base = now_ms();
    let id_b = delayecho::id::message_id((base + 50) as f64, "B");
    let id_a = delayecho::id::message_id((base + 150) as f64, "A");
    engine.enqueue(base + 150, "A").await.unwrap();
    engine.enqueue(base + 50, "B").await.unwrap();

    tokio::time::sleep(Duration::from_millis(90)).await;
    let shared = engine_store(&engine);
    assert_eq!(shared.fetch_content(&id_b).await.unwrap(), None, "B should already be dispatched");
    assert!(shared.fetch_content(&id_a).await.unwrap().is_some(), "A is not due yet");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(shared.fetch_content(&id_a).await.unwrap(), None, "A should now be dispatched");
}

#[tokio::test]
async fn idempotent_resubmission_keeps_a_single_entry() {
    let store = MemoryStoreGateway::new();
    let engine = running_engine(store, fast_config()).await;

    let due = now_ms() + 5_000;
    engine.enqueue(due, "hello").await.unwrap();
    engine.enqueue(due, "hello").await.unwrap();

    let id = delayecho::id::message_id(due as f64, "hello");
    let shared = engine_store(&engine);
    assert_eq!(shared.fetch_content(&id).await.unwrap().as_deref(), Some("hello"));
    let matches = shared.range_low_high(due, false, 10).await.unwrap();
    assert_eq!(matches.iter().filter(|e| e.id == id).count(), 1);
}

#[tokio::test]
async fn earlier_arrival_preempts_a_later_one() {
    let store = MemoryStoreGateway::new();
    let engine = running_engine(store, fast_config()).await;

    let base = now_ms();
    let id_late = delayecho::id::message_id((base + 5_000) as f64, "late");
    let id_early = delayecho::id::message_id((base + 150) as f64, "early");
    engine.enqueue(base + 5_000, "late").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.enqueue(base + 150, "early").await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let shared = engine_store(&engine);
    assert_eq!(shared.fetch_content(&id_early).await.unwrap(), None, "early should be dispatched");
    assert!(shared.fetch_content(&id_late).await.unwrap().is_some(), "late is still far off");
}

#[tokio::test]
async fn peer_crash_mid_dispatch_is_recovered_by_a_surviving_replica() {
    let shared_store = Arc::new(MemoryStoreGateway::new());
    let config = fast_config();

    let due = now_ms() + 20;
    let id = delayecho::id::message_id(due as f64, "payload");
    shared_store.write_message(&id, "payload", due, true).await.unwrap();

    // Simulate replica A claiming the message then crashing before
    // emitting or cleaning up: the lock exists, the content still does
    // too.
    assert!(shared_store.claim(&id, config.processing_window()).await.unwrap());

    // Only replica B is actually running; it must observe the claim as a
    // leftover, retry after PROCESSING_RETRY_DELAY once the lock expires,
    // and then dispatch it.
    let engine_b = running_engine(Arc::clone(&shared_store), config.clone()).await;
    let _ = &engine_b;

    tokio::time::sleep(Duration::from_millis(
        config.processing_window_ms + config.processing_retry_delay_ms + 100,
    ))
    .await;

    assert_eq!(shared_store.fetch_content(&id).await.unwrap(), None, "B should have recovered the message");
}

#[tokio::test]
async fn two_replicas_emit_a_shared_message_exactly_once() {
    let shared_store = Arc::new(MemoryStoreGateway::new());
    let config = fast_config();

    let replica_a = running_engine(Arc::clone(&shared_store), config.clone()).await;
    let replica_b = running_engine(Arc::clone(&shared_store), config.clone()).await;

    let due = now_ms() + 100;
    replica_a.enqueue(due, "shared").await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;

    let id = delayecho::id::message_id(due as f64, "shared");
    // Whichever replica claimed it, the content and lock are both gone and
    // the queue member with it — there is exactly one winner, not zero (a
    // stuck leftover) and not a re-dispatch (which would need the queue
    // entry to still exist after content is gone, which Cleanup forbids).
    assert_eq!(shared_store.fetch_content(&id).await.unwrap(), None);
    assert_eq!(shared_store.range_low_high(due, false, 10).await.unwrap().len(), 0);

    let _ = (&replica_a, &replica_b);
}

#[tokio::test]
async fn health_check_reflects_lifecycle_state() {
    let store = MemoryStoreGateway::new();
    let mut engine = DispatchEngine::new(store, fast_config());

    assert!(engine.health_check().await.is_err());
    engine.init().await.unwrap();
    assert!(engine.health_check().await.is_err());
    engine.start().await.unwrap();
    assert!(engine.health_check().await.is_ok());
    engine.stop().await.unwrap();
    assert!(engine.health_check().await.is_err());
}

/// Reach into a running engine's store for assertions. Tests live outside
/// the crate, so this goes through the same `Arc<S>` clone the engine
/// itself holds internally — there is no other seam to observe store state
/// from the outside, which mirrors how a real deployment would only ever
/// observe outcomes (dispatch to stdout), not internal engine fields.
fn engine_store(engine: &DispatchEngine<MemoryStoreGateway>) -> Arc<MemoryStoreGateway> {
    engine.store_handle()
}
