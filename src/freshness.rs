//! Freshness Channel (§4.3.1, §4.3.3): the dedicated subscriber connection
//! that feeds `nextDueTime` updates to the Dispatch Engine, including
//! self-delivery of its own publications. Kept separate from the data
//! connection because a subscribed connection cannot issue data commands.

use crate::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// One event observed on the freshness subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessEvent {
    /// A new minimum (or "none") was published.
    Update(Option<i64>),
    /// The subscription itself was lost; the engine must mark `upToDate =
    /// false` and, once a fresh channel is established, rebootstrap via a
    /// direct query (§4.3.3).
    Dropped,
}

/// A live subscription to the `ndt` channel (or its test double).
#[async_trait]
pub trait FreshnessChannel: Send {
    /// Await the next event. Returns `Ok(FreshnessEvent::Dropped)` exactly
    /// once when the underlying subscription ends; the caller is expected
    /// to reconnect via [`FreshnessSource::freshness_channel`] afterward,
    /// not to keep polling a dead channel.
    async fn next(&mut self) -> Result<FreshnessEvent>;
}

/// Anything that can open a fresh [`FreshnessChannel`] on demand — the
/// Store Gateway's subscriber-side counterpart to its data-connection
/// methods. Implemented by both `RedisGateway` and `MemoryStoreGateway` so
/// the engine can be driven identically in tests and in production.
#[async_trait]
pub trait FreshnessSource: Send + Sync {
    async fn freshness_channel(&self) -> Result<Box<dyn FreshnessChannel>>;
}

/// See the matching `StoreGateway for Arc<S>` impl: lets a shared store
/// stand in for an owned one.
#[async_trait]
impl<S: FreshnessSource + ?Sized> FreshnessSource for Arc<S> {
    async fn freshness_channel(&self) -> Result<Box<dyn FreshnessChannel>> {
        (**self).freshness_channel().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStoreGateway;

    #[tokio::test]
    async fn memory_source_delivers_self_publication() {
        let store = MemoryStoreGateway::new();
        let mut channel = store.freshness_channel().await.unwrap();

        use crate::store::StoreGateway;
        store.write_message("a", "x", 1234, true).await.unwrap();

        assert_eq!(channel.next().await.unwrap(), FreshnessEvent::Update(Some(1234)));
    }
}
