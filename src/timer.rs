//! Reprogrammable single-shot timer (§4.1).
//!
//! Arms at an absolute wall-clock instant rather than a relative delay, is
//! idempotent when re-armed at the same instant, and sleeps in bounded
//! chunks so an arbitrarily distant instant still behaves as one firing
//! rather than depending on the sleep primitive's own maximum delay.

use tokio::sync::mpsc;
use tokio::time::Duration;

/// Upper bound on a single sleep before re-checking the armed instant. Any
/// target further out than this is approached in steps of this size, so the
/// timer never depends on whatever maximum delay the runtime's sleep
/// primitive happens to support.
const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(3600);

enum Command {
    Arm(i64),
    Cancel,
}

/// Handle to a running timer task. Cloning is cheap; all clones share the
/// same underlying armed instant.
#[derive(Clone)]
pub struct Timer {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Timer {
    /// Spawn the timer's background task. `fire_tx` receives one message
    /// per firing; the receiving end is expected to be read by the same
    /// executor that calls [`Timer::trigger`]/[`Timer::cancel`], which is
    /// what makes it safe to re-arm or cancel from within the fire handler.
    pub fn spawn(fire_tx: mpsc::UnboundedSender<()>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, fire_tx));
        Timer { cmd_tx }
    }

    /// Arm the timer to fire once at absolute instant `at_ms`. A no-op if
    /// the timer is already armed for exactly that instant. Supersedes any
    /// previously armed instant otherwise. `at_ms <= now` fires on the next
    /// tick.
    pub fn trigger(&self, at_ms: i64) {
        let _ = self.cmd_tx.send(Command::Arm(at_ms));
    }

    /// Disarm the timer. A no-op if nothing is armed.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(Command::Cancel);
    }
}

async fn run(mut cmd_rx: mpsc::UnboundedReceiver<Command>, fire_tx: mpsc::UnboundedSender<()>) {
    let mut armed: Option<i64> = None;

    loop {
        let Some(target) = armed else {
            match cmd_rx.recv().await {
                Some(Command::Arm(t)) => {
                    armed = Some(t);
                    continue;
                }
                Some(Command::Cancel) => continue,
                None => return,
            }
        };

        let remaining_ms = target - now_ms();
        let sleep_for = if remaining_ms <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(remaining_ms as u64).min(MAX_SLEEP_CHUNK)
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {
                if now_ms() >= target {
                    armed = None;
                    let _ = fire_tx.send(());
                }
                // else: chunk elapsed but target is still in the future, loop
                // and sleep another chunk.
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Arm(t)) => {
                        if t != target {
                            armed = Some(t);
                        }
                    }
                    Some(Command::Cancel) => armed = None,
                    None => return,
                }
            }
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_at_armed_instant() {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
        let timer = Timer::spawn(fire_tx);

        let target = now_ms() + 50;
        timer.trigger(target);

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::time::sleep(Duration::from_millis(1)).await; // let the task run
        assert!(fire_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn past_instant_fires_on_next_tick() {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
        let timer = Timer::spawn(fire_tx);

        timer.trigger(now_ms() - 1000);
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(fire_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_firing() {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
        let timer = Timer::spawn(fire_tx);

        timer.trigger(now_ms() + 50);
        timer.cancel();
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(fire_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_to_same_instant_is_a_no_op() {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
        let timer = Timer::spawn(fire_tx);

        let target = now_ms() + 200;
        timer.trigger(target);
        timer.trigger(target);
        tokio::time::advance(Duration::from_millis(210)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        // Only one firing, not two.
        assert!(fire_rx.try_recv().is_ok());
        assert!(fire_rx.try_recv().is_err());
    }
}
