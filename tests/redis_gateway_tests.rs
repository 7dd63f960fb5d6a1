//! `RedisGateway` exercised against a real store (§AMBIENT.6). Ignored by
//! default: these require `REDIS_URL` (or `redis://127.0.0.1:6379`) to be
//! reachable and use database 15 to stay out of the way of anything else
//! using the default database.

use delayecho::freshness::FreshnessSource;
use delayecho::store::StoreGateway;
use delayecho::RedisGateway;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

async fn connect() -> RedisGateway {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
    let gateway = RedisGateway::connect(&url).await.expect("redis reachable at REDIS_URL");
    gateway.ping().await.expect("redis responds to PING");
    gateway
}

#[tokio::test]
#[ignore] // requires a reachable redis
async fn write_claim_fetch_cleanup_round_trip() {
    let store = connect().await;
    let due = now_ms() + 60_000;
    let id = delayecho::id::message_id(due as f64, "live-redis-payload");

    let outcome = store.write_message(&id, "live-redis-payload", due, true).await.unwrap();
    assert_eq!(outcome, delayecho::store::WriteOutcome::Written);

    assert!(store.claim(&id, Duration::from_millis(1000)).await.unwrap());
    assert!(!store.claim(&id, Duration::from_millis(1000)).await.unwrap());

    assert_eq!(store.fetch_content(&id).await.unwrap().as_deref(), Some("live-redis-payload"));
    store.cleanup(&id).await.unwrap();
    assert_eq!(store.fetch_content(&id).await.unwrap(), None);
}

#[tokio::test]
#[ignore] // requires a reachable redis
async fn watched_republish_publishes_current_minimum() {
    let store = connect().await;
    let mut channel = store.freshness_channel().await.unwrap();

    let due = now_ms() + 60_000;
    let id = delayecho::id::message_id(due as f64, "republish-payload");
    store.write_message(&id, "republish-payload", due, false).await.unwrap();
    store.watched_republish().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), channel.next())
        .await
        .expect("a publication arrives within 5s")
        .unwrap();
    assert_eq!(event, delayecho::freshness::FreshnessEvent::Update(Some(due)));

    store.cleanup(&id).await.unwrap();
}

#[tokio::test]
#[ignore] // requires a reachable redis
async fn range_low_high_respects_reverse_and_limit_against_redis() {
    let store = connect().await;
    let base = now_ms() + 120_000;
    for (offset, text) in [(0, "a"), (10, "b"), (20, "c")] {
        let due = base + offset;
        let id = delayecho::id::message_id(due as f64, text);
        store.write_message(&id, text, due, false).await.unwrap();
    }

    let asc = store.range_low_high(base + 15, false, 2).await.unwrap();
    assert_eq!(asc.len(), 2);
    assert!(asc[0].score_ms <= asc[1].score_ms);

    let desc = store.range_low_high(base + 15, true, 2).await.unwrap();
    assert_eq!(desc.len(), 2);
    assert!(desc[0].score_ms >= desc[1].score_ms);
}
