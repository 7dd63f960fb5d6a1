//! In-memory [`StoreGateway`] fake, for engine tests that need no external
//! process. Single `Mutex`-guarded state is fine here — unlike the engine
//! itself, this is test scaffolding, not the single-task-owns-state design
//! the rest of the crate follows.

use crate::errors::Result;
use crate::freshness::{FreshnessChannel, FreshnessEvent, FreshnessSource};
use crate::store::{QueueEntry, StoreGateway, WriteOutcome};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

struct State {
    /// Ordered by `(score_ms, id)` so ties break on id, matching a sorted
    /// set's lexical tiebreak for equal scores.
    queue: BTreeMap<(i64, String), ()>,
    content: std::collections::HashMap<String, String>,
    /// Lock id -> expiry instant, so a "crashed" holder's claim is observed
    /// to lapse the same way a real TTL key would, without a background
    /// reaper task.
    locks: HashMap<String, Instant>,
}

/// Dependency-free stand-in for [`crate::store::RedisGateway`]. Publishes
/// `ndt` updates on a broadcast channel a test can subscribe to in place of
/// [`crate::freshness::FreshnessChannel`].
pub struct MemoryStoreGateway {
    state: Mutex<State>,
    ndt_tx: broadcast::Sender<Option<i64>>,
}

impl MemoryStoreGateway {
    pub fn new() -> Self {
        let (ndt_tx, _) = broadcast::channel(64);
        MemoryStoreGateway {
            state: Mutex::new(State {
                queue: BTreeMap::new(),
                content: std::collections::HashMap::new(),
                locks: HashMap::new(),
            }),
            ndt_tx,
        }
    }

    /// Subscribe to `ndt` updates published by writes and watched republishes.
    pub fn subscribe(&self) -> broadcast::Receiver<Option<i64>> {
        self.ndt_tx.subscribe()
    }

    fn current_min(state: &State) -> Option<i64> {
        state.queue.keys().next().map(|(score, _)| *score)
    }
}

impl Default for MemoryStoreGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreGateway for MemoryStoreGateway {
    async fn range_min(&self) -> Result<Option<QueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .queue
            .keys()
            .next()
            .map(|(score_ms, id)| QueueEntry { id: id.clone(), score_ms: *score_ms }))
    }

    async fn range_low_high(
        &self,
        due_time_ms: i64,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().unwrap();
        let matches = || {
            state
                .queue
                .keys()
                .filter(|(score, _)| *score <= due_time_ms)
                .map(|(score_ms, id)| QueueEntry { id: id.clone(), score_ms: *score_ms })
        };
        let mut rows: Vec<QueueEntry> = if reverse {
            let mut v: Vec<_> = matches().collect();
            v.reverse();
            v
        } else {
            matches().collect()
        };
        rows.truncate(limit);
        Ok(rows)
    }

    async fn write_message(
        &self,
        id: &str,
        text: &str,
        time_ms: i64,
        publish_min: bool,
    ) -> Result<WriteOutcome> {
        let min_after = {
            let mut state = self.state.lock().unwrap();
            if state.content.contains_key(id) {
                return Ok(WriteOutcome::AlreadyPresent);
            }
            state.content.insert(id.to_string(), text.to_string());
            state.queue.insert((time_ms, id.to_string()), ());
            Self::current_min(&state)
        };
        if publish_min {
            let _ = self.ndt_tx.send(min_after);
        }
        Ok(WriteOutcome::Written)
    }

    async fn rollback(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.content.remove(id);
        state.queue.retain(|(_, qid), _| qid != id);
    }

    async fn claim(&self, id: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let held = state.locks.get(id).is_some_and(|expiry| *expiry > now);
        if held {
            return Ok(false);
        }
        state.locks.insert(id.to_string(), now + ttl);
        Ok(true)
    }

    async fn fetch_content(&self, id: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.content.get(id).cloned())
    }

    async fn cleanup(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.content.remove(id);
        state.queue.retain(|(_, qid), _| qid != id);
        state.locks.remove(id);
        Ok(())
    }

    async fn watched_republish(&self) -> Result<()> {
        let min = {
            let state = self.state.lock().unwrap();
            Self::current_min(&state)
        };
        let _ = self.ndt_tx.send(min);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FreshnessSource for MemoryStoreGateway {
    async fn freshness_channel(&self) -> Result<Box<dyn FreshnessChannel>> {
        Ok(Box::new(MemoryFreshnessChannel { rx: self.subscribe() }))
    }
}

struct MemoryFreshnessChannel {
    rx: broadcast::Receiver<Option<i64>>,
}

#[async_trait]
impl FreshnessChannel for MemoryFreshnessChannel {
    async fn next(&mut self) -> Result<FreshnessEvent> {
        match self.rx.recv().await {
            Ok(min) => Ok(FreshnessEvent::Update(min)),
            // A lagged receiver missed publications, which in this fake is
            // indistinguishable from a dropped subscription: the caller
            // must rebootstrap rather than trust a stale `nextDueTime`.
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(FreshnessEvent::Dropped),
            Err(broadcast::error::RecvError::Closed) => Ok(FreshnessEvent::Dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_claim_then_cleanup() {
        let store = MemoryStoreGateway::new();
        let outcome = store.write_message("a", "hello", 1000, true).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);

        let again = store.write_message("a", "hello", 1000, true).await.unwrap();
        assert_eq!(again, WriteOutcome::AlreadyPresent);

        assert!(store.claim("a", Duration::from_millis(100)).await.unwrap());
        assert!(!store.claim("a", Duration::from_millis(100)).await.unwrap());

        assert_eq!(store.fetch_content("a").await.unwrap().as_deref(), Some("hello"));
        store.cleanup("a").await.unwrap();
        assert_eq!(store.fetch_content("a").await.unwrap(), None);
        assert_eq!(store.range_min().await.unwrap(), None);
    }

    #[tokio::test]
    async fn range_low_high_respects_reverse_and_limit() {
        let store = MemoryStoreGateway::new();
        for (id, t) in [("a", 10), ("b", 20), ("c", 30)] {
            store.write_message(id, "x", t, false).await.unwrap();
        }
        let asc = store.range_low_high(25, false, 2).await.unwrap();
        assert_eq!(asc.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        let desc = store.range_low_high(25, true, 2).await.unwrap();
        assert_eq!(desc.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_is_reclaimable_after_ttl_expires() {
        let store = MemoryStoreGateway::new();
        assert!(store.claim("a", Duration::from_millis(50)).await.unwrap());
        assert!(!store.claim("a", Duration::from_millis(50)).await.unwrap());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(store.claim("a", Duration::from_millis(50)).await.unwrap());
    }

    #[tokio::test]
    async fn watched_republish_broadcasts_current_min() {
        let store = MemoryStoreGateway::new();
        let mut rx = store.subscribe();
        store.write_message("a", "x", 500, false).await.unwrap();
        store.watched_republish().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(500));
    }
}
