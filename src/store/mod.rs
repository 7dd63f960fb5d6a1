//! Store Gateway (§4.2): the seam between the Dispatch Engine and whatever
//! key-value store backs the fleet. Expressed as a trait so the engine can
//! be tested against an in-memory fake as well as a real store.

mod memory;
mod redis_gateway;

pub use memory::MemoryStoreGateway;
pub use redis_gateway::RedisGateway;

use crate::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One entry read back from the `msgq` ordered set.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: String,
    pub score_ms: i64,
}

/// Result of a `WriteMessage` transaction (§4.2), distinguishing a fresh
/// write from an idempotent re-submission so the caller can log but not
/// fail on the latter (§4.3.2 step 6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    AlreadyPresent,
}

/// The operations the Dispatch Engine needs from the shared store. All
/// operations are non-blocking from the engine's perspective (`async`);
/// errors are reported per-operation per the table in SPEC_FULL.md §7.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// First (id, score) of the queue, or `None` if the queue is empty.
    async fn range_min(&self) -> Result<Option<QueueEntry>>;

    /// Up to `limit` entries with score in `[-inf, due_time_ms]`. Ascending
    /// order if `reverse` is false; descending from `due_time_ms` if true.
    async fn range_low_high(
        &self,
        due_time_ms: i64,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<QueueEntry>>;

    /// Pipelined transaction: set `msg:<id>`, add `(id, time_ms)` to the
    /// queue, and if `publish_min` is true, publish `time_ms` on `ndt`.
    ///
    /// On a transaction-level (network) failure, the caller learns no
    /// write happened. On a per-op failure inside the transaction, the
    /// caller is expected to call [`StoreGateway::rollback`] best-effort
    /// and then surface the original error.
    async fn write_message(
        &self,
        id: &str,
        text: &str,
        time_ms: i64,
        publish_min: bool,
    ) -> Result<WriteOutcome>;

    /// Best-effort cleanup of a partially-applied write: remove the queue
    /// member and delete the content key. Errors are logged by the caller,
    /// not propagated.
    async fn rollback(&self, id: &str);

    /// Conditionally set `lk:<id>` with the given TTL, only if absent.
    /// Returns `true` iff the claim was obtained.
    async fn claim(&self, id: &str, ttl: Duration) -> Result<bool>;

    /// Fetch `msg:<id>`'s text, or `None` if it no longer exists (another
    /// replica already dispatched it).
    async fn fetch_content(&self, id: &str) -> Result<Option<String>>;

    /// Best-effort pipelined removal of the queue member, content key, and
    /// lock key for `id`. Errors are logged by the caller, not propagated.
    async fn cleanup(&self, id: &str) -> Result<()>;

    /// Begin a watched transaction on the queue, read the current minimum,
    /// publish it (or an empty payload if the queue is empty) on `ndt`, and
    /// commit. If another replica modified the queue during the watch
    /// window, the commit aborts silently — the peer will publish instead.
    async fn watched_republish(&self) -> Result<()>;

    /// Round-trip a minimal command against the data connection. Backs the
    /// `health_check` grace-period check (§4.3.6 ambient addition).
    async fn ping(&self) -> Result<()>;
}

/// Lets an `Arc<S>` stand in for `S` wherever a `StoreGateway` is needed —
/// used in tests to share one `MemoryStoreGateway` across several
/// `DispatchEngine`s to simulate multiple replicas against one store.
#[async_trait]
impl<S: StoreGateway + ?Sized> StoreGateway for Arc<S> {
    async fn range_min(&self) -> Result<Option<QueueEntry>> {
        (**self).range_min().await
    }

    async fn range_low_high(
        &self,
        due_time_ms: i64,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        (**self).range_low_high(due_time_ms, reverse, limit).await
    }

    async fn write_message(
        &self,
        id: &str,
        text: &str,
        time_ms: i64,
        publish_min: bool,
    ) -> Result<WriteOutcome> {
        (**self).write_message(id, text, time_ms, publish_min).await
    }

    async fn rollback(&self, id: &str) {
        (**self).rollback(id).await
    }

    async fn claim(&self, id: &str, ttl: Duration) -> Result<bool> {
        (**self).claim(id, ttl).await
    }

    async fn fetch_content(&self, id: &str) -> Result<Option<String>> {
        (**self).fetch_content(id).await
    }

    async fn cleanup(&self, id: &str) -> Result<()> {
        (**self).cleanup(id).await
    }

    async fn watched_republish(&self) -> Result<()> {
        (**self).watched_republish().await
    }

    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }
}
