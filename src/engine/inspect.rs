//! The inspection loop (§4.3.4) and `TryDispatch` (§4.3.5): the heart of
//! the Dispatch Engine. Free functions rather than methods on
//! `DispatchEngine` so the reentrancy guard (`inspecting`/`resumeRequested`)
//! stays owned entirely by the task that calls [`run_pass`] — this module
//! never touches that state itself, it only reads `resume_requested` to
//! know when to abandon.

use crate::config::EngineConfig;
use crate::engine::emit::emit;
use crate::store::{QueueEntry, StoreGateway};
use crate::timer::now_ms;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// How one pass ended, so the caller knows what to do next.
pub enum PassOutcome {
    /// The window drained with no leftovers; the new minimum was
    /// republished.
    Drained,
    /// The window drained but left claim/content leftovers; reschedule
    /// another pass after the returned delay (locks held by peers will
    /// have expired by then).
    RetryAfter(Duration),
    /// `resumeRequested` was observed mid-pass; the caller should start a
    /// fresh pass immediately with a freshly-computed cutoff.
    Abandoned,
}

/// Run one inspection pass against `cutoff = max(next_due_time_ms, now)`
/// (§4.3.4). `resume_requested` is polled at each loop boundary and cleared
/// by the caller, never by this function.
pub async fn run_pass<S>(
    store: &Arc<S>,
    config: &EngineConfig,
    next_due_time_ms: Option<i64>,
    resume_requested: &AtomicBool,
) -> PassOutcome
where
    S: StoreGateway + 'static,
{
    let cutoff = next_due_time_ms.map(|t| t.max(now_ms())).unwrap_or_else(now_ms);
    let mut reverse = false;
    let mut saw_leftover = false;

    loop {
        if resume_requested.load(Ordering::SeqCst) {
            return PassOutcome::Abandoned;
        }

        let batch = match store.range_low_high(cutoff, reverse, config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "inspection pass could not fetch a batch, retrying later");
                return PassOutcome::RetryAfter(config.processing_retry_delay());
            }
        };

        if batch.is_empty() {
            if let Err(e) = store.watched_republish().await {
                warn!(error = %e, "watched republish failed after an empty batch");
            }
            return PassOutcome::Drained;
        }

        let full_batch = batch.len() == config.batch_size;

        for entry in &batch {
            if resume_requested.load(Ordering::SeqCst) {
                return PassOutcome::Abandoned;
            }
            if try_dispatch(store, config, entry).await {
                saw_leftover = true;
            }
        }

        if !full_batch {
            return if saw_leftover {
                PassOutcome::RetryAfter(config.processing_retry_delay())
            } else {
                if let Err(e) = store.watched_republish().await {
                    warn!(error = %e, "watched republish failed after draining the window");
                }
                PassOutcome::Drained
            };
        }

        reverse = !reverse;
    }
}

/// Claim, fetch, emit, and clean up one entry (§4.3.5). Returns `true` if
/// the entry is a leftover (still possibly pending) rather than dispatched.
async fn try_dispatch<S>(store: &Arc<S>, config: &EngineConfig, entry: &QueueEntry) -> bool
where
    S: StoreGateway + 'static,
{
    match store.claim(&entry.id, config.processing_window()).await {
        Ok(true) => {}
        Ok(false) => {
            trace!(id = %entry.id, "claim lost to a peer replica");
            return true;
        }
        Err(e) => {
            warn!(id = %entry.id, error = %e, "claim failed");
            return true;
        }
    }

    let text = match store.fetch_content(&entry.id).await {
        Ok(Some(text)) => text,
        Ok(None) => {
            trace!(id = %entry.id, "content missing after claim, a peer already dispatched it");
            return true;
        }
        Err(e) => {
            warn!(id = %entry.id, error = %e, "fetch content failed after claim");
            return true;
        }
    };

    // Emit before cleanup: a crash here leaves the queue entry behind, but
    // its lock self-expires and the next pass's `content = missing` check
    // (above) treats it as already-dispatched once a peer's cleanup runs.
    emit(entry.score_ms, now_ms(), &text);

    // Fire-and-forget per §4.3.5 step 5: subsequent store commands are
    // serialized by the connection regardless, and a cleanup failure is a
    // log-only concern (§7), not a reason to hold up the pass.
    let store = Arc::clone(store);
    let id = entry.id.clone();
    tokio::spawn(async move {
        if let Err(e) = store.cleanup(&id).await {
            warn!(id = %id, error = %e, "cleanup failed");
        }
    });

    false
}
