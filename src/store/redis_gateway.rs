//! Redis-backed [`StoreGateway`] (§4.2, §6).
//!
//! Key schema: `msgq` (sorted set of message ids scored by due-time, ms),
//! `msg:<id>` (content), `lk:<id>` (claim, TTL = processing window). The
//! `ndt` channel carries the queue minimum as an 8-byte host-endian `f64`,
//! or an empty payload for "queue empty" (see the endianness note in
//! SPEC_FULL.md §9 — a heterogeneous fleet would need a fixed encoding
//! here instead).

use crate::errors::{Error, ErrorContext, ErrorExt, Result};
use crate::freshness::{FreshnessChannel, FreshnessEvent, FreshnessSource};
use crate::store::{QueueEntry, StoreGateway, WriteOutcome};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{trace, warn};

const QUEUE_KEY: &str = "msgq";
const CHANNEL: &str = "ndt";

fn content_key(id: &str) -> String {
    format!("msg:{id}")
}

fn lock_key(id: &str) -> String {
    format!("lk:{id}")
}

/// Encode a due-time (ms) as the `ndt` payload; `None` encodes as empty.
pub fn encode_min(score_ms: Option<i64>) -> Vec<u8> {
    match score_ms {
        Some(ms) => (ms as f64).to_ne_bytes().to_vec(),
        None => Vec::new(),
    }
}

/// Decode an `ndt` payload back into a due-time (ms), or `None` if empty.
pub fn decode_min(payload: &[u8]) -> Option<i64> {
    if payload.is_empty() {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&payload[..8.min(payload.len())]);
    Some(f64::from_ne_bytes(buf) as i64)
}

/// Redis-backed store gateway. `conn` is the shared multiplexed connection
/// used for all ordinary commands; `client` is kept around so
/// [`RedisGateway::watched_republish`] can open a dedicated, non-multiplexed
/// connection per attempt — `WATCH` is connection-scoped, so running it over
/// a connection shared with unrelated callers would watch (and unwatch) on
/// their behalf too.
pub struct RedisGateway {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisGateway {
    /// Connect to `url`, returning a gateway wrapping an auto-reconnecting
    /// multiplexed connection plus the client used to open dedicated ones.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(Error::from)?;
        let conn = client.get_connection_manager().await.map_err(Error::from)?;
        Ok(RedisGateway { client, conn })
    }

    /// Clone of the underlying client-managed connection, for building a
    /// second logical connection (e.g. the dedicated subscriber) against
    /// the same URL without re-parsing it.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl StoreGateway for RedisGateway {
    async fn range_min(&self) -> Result<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, i64)> = conn
            .zrangebyscore_limit_withscores(QUEUE_KEY, "-inf", "+inf", 0, 1)
            .await
            .map_err(Error::from)?;
        Ok(rows.into_iter().next().map(|(id, score_ms)| QueueEntry { id, score_ms }))
    }

    async fn range_low_high(
        &self,
        due_time_ms: i64,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, i64)> = if reverse {
            conn.zrevrangebyscore_limit_withscores(QUEUE_KEY, due_time_ms, "-inf", 0, limit as isize)
                .await
                .map_err(Error::from)?
        } else {
            conn.zrangebyscore_limit_withscores(QUEUE_KEY, "-inf", due_time_ms, 0, limit as isize)
                .await
                .map_err(Error::from)?
        };
        Ok(rows
            .into_iter()
            .map(|(id, score_ms)| QueueEntry { id, score_ms })
            .collect())
    }

    async fn write_message(
        &self,
        id: &str,
        text: &str,
        time_ms: i64,
        publish_min: bool,
    ) -> Result<WriteOutcome> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(content_key(id))
            .arg(text)
            .ignore()
            .cmd("ZADD")
            .arg(QUEUE_KEY)
            .arg(time_ms)
            .arg(id);
        if publish_min {
            pipe.cmd("PUBLISH").arg(CHANNEL).arg(encode_min(Some(time_ms))).ignore();
        }

        let (zadd_added,): (i64,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;

        // A single-member ZADD should report exactly 1 newly-added member.
        // Anything else (0 = already present, or an impossible >1) is
        // treated as the soft anomaly the spec's Open Question describes:
        // log and continue rather than fail the enqueue.
        if zadd_added != 1 {
            warn!(id, zadd_added, "zadd reported a non-1 result for a single-member add");
            return Ok(WriteOutcome::AlreadyPresent);
        }
        Ok(WriteOutcome::Written)
    }

    async fn rollback(&self, id: &str) {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("ZREM").arg(QUEUE_KEY).arg(id).ignore();
        pipe.cmd("DEL").arg(content_key(id)).ignore();
        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            warn!(id, error = %e, "best-effort rollback failed");
        }
    }

    async fn claim(&self, id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ok: Option<String> = redis::cmd("SET")
            .arg(lock_key(id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::from(e).with_context(ErrorContext::new("store", "claim").with_details(id)))?;
        Ok(ok.is_some())
    }

    async fn fetch_content(&self, id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let text: Option<String> = conn
            .get(content_key(id))
            .await
            .map_err(|e| Error::from(e).with_context(ErrorContext::new("store", "fetch_content").with_details(id)))?;
        Ok(text)
    }

    async fn cleanup(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREM")
            .arg(QUEUE_KEY)
            .arg(id)
            .ignore()
            .cmd("DEL")
            .arg(content_key(id))
            .ignore()
            .cmd("DEL")
            .arg(lock_key(id))
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::from(e).with_context(ErrorContext::new("store", "cleanup").with_details(id)))
    }

    async fn watched_republish(&self) -> Result<()> {
        // A dedicated connection, not the shared `ConnectionManager`: WATCH
        // is per-connection state, and interleaving it with other callers'
        // commands on a multiplexed connection would watch/unwatch on their
        // behalf too.
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(Error::from)?;

        redis::cmd("WATCH")
            .arg(QUEUE_KEY)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(Error::from)?;

        let top: Vec<(String, i64)> = redis::cmd("ZRANGE")
            .arg(QUEUE_KEY)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async::<_, Vec<String>>(&mut conn)
            .await
            .map_err(Error::from)
            .map(|flat| {
                flat.chunks(2)
                    .filter_map(|pair| {
                        let score: i64 = pair.get(1)?.parse().ok()?;
                        Some((pair[0].clone(), score))
                    })
                    .collect()
            })?;
        let payload = encode_min(top.into_iter().next().map(|(_, score)| score));

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("PUBLISH").arg(CHANNEL).arg(payload).ignore();

        let committed: Option<()> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Transaction(e.to_string()))?;

        if committed.is_none() {
            // A concurrent writer touched `msgq` between WATCH and EXEC, so
            // redis aborted the transaction. That writer's own
            // `write_message` (or its own `WatchedRepublish`) already
            // published, or will — nothing to do here.
            trace!("watched republish aborted by a concurrent queue change");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl FreshnessSource for RedisGateway {
    async fn freshness_channel(&self) -> Result<Box<dyn FreshnessChannel>> {
        // A dedicated connection per §4.3.1: a subscribed connection can no
        // longer issue data commands, so this is never `self.conn`.
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(Error::from)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(CHANNEL).await.map_err(Error::from)?;
        Ok(Box::new(RedisFreshnessChannel { pubsub }))
    }
}

struct RedisFreshnessChannel {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl FreshnessChannel for RedisFreshnessChannel {
    async fn next(&mut self) -> Result<FreshnessEvent> {
        match self.pubsub.on_message().next().await {
            Some(msg) => {
                let payload: Vec<u8> = msg.get_payload().map_err(Error::from)?;
                Ok(FreshnessEvent::Update(decode_min(&payload)))
            }
            // The message stream ends when the underlying connection
            // closes — a dropped subscription (§4.3.3).
            None => Ok(FreshnessEvent::Dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        assert_eq!(decode_min(&encode_min(Some(1_700_000_000_123))), Some(1_700_000_000_123));
        assert_eq!(decode_min(&encode_min(None)), None);
    }

    #[test]
    fn empty_payload_decodes_to_none() {
        assert_eq!(decode_min(&[]), None);
    }
}
