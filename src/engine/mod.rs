//! The Dispatch Engine (§4.3): the component that owns `nextDueTime`,
//! drives the [`crate::timer::Timer`], runs the inspection loop, and
//! exposes `enqueue`.
//!
//! All of `nextDueTime`, `upToDate`, `latency`, `inspecting`, and
//! `resumeRequested` live inside one spawned task (§5, "the single-task
//! discipline is the mutex"); everything else — `enqueue`, lifecycle calls —
//! talks to that task over a channel rather than touching the state
//! directly. `resumeRequested` is the one exception: the inspection pass
//! itself runs as a second task so a timer firing mid-pass can actually
//! observe it concurrently, so it is shared via an `AtomicBool` rather than
//! owned outright — still written from exactly one place (the owning task).

pub mod emit;
pub mod inspect;

use crate::config::EngineConfig;
use crate::errors::{Error, Result};
use crate::freshness::{FreshnessChannel, FreshnessEvent, FreshnessSource};
use crate::lifecycle::{Component, ComponentState};
use crate::store::StoreGateway;
use crate::timer::{now_ms, Timer};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

enum Command {
    Enqueue {
        time_ms: i64,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handles to the background work spawned by [`DispatchEngine::start`].
struct Running {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: oneshot::Sender<()>,
    main_task: JoinHandle<()>,
    freshness_task: JoinHandle<()>,
}

/// Drives delayed dispatch against a store `S`. Generic over the store so
/// the same engine logic runs against `RedisGateway` in production and
/// `MemoryStoreGateway` in tests.
pub struct DispatchEngine<S> {
    store: Arc<S>,
    config: EngineConfig,
    state: Arc<Mutex<ComponentState>>,
    running: Mutex<Option<Running>>,
    fatal_tx: watch::Sender<bool>,
}

/// Shared handle a background task uses to report this engine as fatally
/// broken (§7 "after startup, call the fatal-exit hook"): flips the
/// lifecycle state to `Error` and notifies anyone watching
/// [`DispatchEngine::fatal_signal`].
#[derive(Clone)]
struct FatalHook {
    state: Arc<Mutex<ComponentState>>,
    tx: watch::Sender<bool>,
}

impl FatalHook {
    fn trigger(&self, reason: &str) {
        tracing::error!(reason, "fatal condition, signalling host for exit");
        *self.state.lock().unwrap() = ComponentState::Error;
        let _ = self.tx.send(true);
    }
}

impl<S> DispatchEngine<S>
where
    S: StoreGateway + FreshnessSource + 'static,
{
    pub fn new(store: S, config: EngineConfig) -> Self {
        let (fatal_tx, _) = watch::channel(false);
        DispatchEngine {
            store: Arc::new(store),
            config,
            state: Arc::new(Mutex::new(ComponentState::Created)),
            running: Mutex::new(None),
            fatal_tx,
        }
    }

    /// Clone of the store handle this engine drives. Exists for tests that
    /// need to observe store state directly (no other seam exists; a real
    /// deployment only ever observes outcomes via stdout emission).
    pub fn store_handle(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Subscribe to this engine's fatal signal. Fires once if a background
    /// task (currently: the freshness forwarder) hits an unrecoverable
    /// condition after startup; the host process is expected to `select!` on
    /// this alongside its termination signal and exit (§7's fatal-exit
    /// hook).
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_tx.subscribe()
    }

    /// Submit a message for delayed emission (§4.3.2). Returns once the
    /// write transaction has committed (or failed); `nextDueTime` itself is
    /// updated later, asynchronously, via the Freshness Channel.
    pub async fn enqueue(&self, time_ms: i64, text: impl Into<String>) -> Result<()> {
        let cmd_tx = {
            let running = self.running.lock().unwrap();
            running
                .as_ref()
                .map(|r| r.cmd_tx.clone())
                .ok_or_else(|| Error::ComponentNotReady(self.name().to_string()))?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Enqueue { time_ms, text: text.into(), reply: reply_tx })
            .map_err(|_| Error::ComponentNotReady(self.name().to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::ComponentNotReady(self.name().to_string()))?
    }
}

/// Query the store's current minimum, timing the round trip. Used both at
/// startup (§4.3.1) and to rebootstrap after a subscription restoration
/// (§4.3.3).
async fn bootstrap<S: StoreGateway>(store: &S) -> Result<(Option<i64>, i64)> {
    let started = now_ms();
    let min = store.range_min().await?;
    let latency_ms = (now_ms() - started).max(0);
    Ok((min.map(|entry| entry.score_ms), latency_ms))
}

/// Arm (or cancel) the timer from the current `nextDueTime`/`latency`, three
/// store queries ahead of the due-time as §4.3.1 specifies.
fn reprogram_timer(timer: &Timer, next_due_time_ms: Option<i64>, latency_ms: i64) {
    match next_due_time_ms {
        Some(due) => timer.trigger(due - 3 * latency_ms),
        None => timer.cancel(),
    }
}

/// Re-establish the freshness subscription after it drops, with the capped
/// backoff policy §7 prescribes for connection loss: first attempt after
/// `reconnect_initial_delay_ms`, then linear growth of
/// `total_retry_time/(attempt-1)*2`, giving up after
/// `3 + max(times_connected, reconnect_min_attempts)` attempts, where
/// `times_connected` counts this replica's successful (re)connects over its
/// process lifetime so far — a replica with a long successful uptime gets
/// more attempts before giving up than one still on its first connection.
/// Returns `None` once attempts are exhausted.
async fn reconnect_freshness<S: FreshnessSource>(
    store: &S,
    config: &EngineConfig,
    times_connected: &AtomicU32,
) -> Option<Box<dyn FreshnessChannel>> {
    let max_attempts = 3 + times_connected.load(Ordering::SeqCst).max(config.reconnect_min_attempts);
    let mut total_retry_ms: u64 = 0;

    for attempt in 1..=max_attempts {
        let delay_ms = if attempt == 1 {
            config.reconnect_initial_delay_ms
        } else {
            (total_retry_ms / (attempt as u64 - 1) * 2).max(config.reconnect_initial_delay_ms)
        };
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        total_retry_ms += delay_ms;

        match store.freshness_channel().await {
            Ok(channel) => {
                times_connected.fetch_add(1, Ordering::SeqCst);
                info!(attempt, "freshness subscription restored");
                return Some(channel);
            }
            Err(e) => warn!(attempt, max_attempts, error = %e, "freshness reconnect attempt failed"),
        }
    }
    None
}

/// Drive the freshness subscription for the lifetime of the engine: forward
/// every event, and on a drop, reconnect with backoff and resume forwarding
/// rather than letting the subscription stay dead (§4.3.3 "on subscription
/// restoration ... rebootstrap").
async fn run_freshness_forwarder<S: FreshnessSource>(
    store: Arc<S>,
    mut channel: Box<dyn FreshnessChannel>,
    config: EngineConfig,
    times_connected: Arc<AtomicU32>,
    fatal: FatalHook,
    tx: mpsc::UnboundedSender<FreshnessEvent>,
) {
    loop {
        let event = match channel.next().await {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "freshness channel error, treating as dropped");
                FreshnessEvent::Dropped
            }
        };
        let dropped = matches!(event, FreshnessEvent::Dropped);
        if tx.send(event).is_err() {
            return;
        }
        if !dropped {
            continue;
        }

        match reconnect_freshness(store.as_ref(), &config, times_connected.as_ref()).await {
            Some(new_channel) => channel = new_channel,
            None => {
                // Give-up path of §7's connection-lost policy: the
                // subscriber connection is unrecoverable. `nextDueTime`
                // stays whatever the last direct-query rebootstrap left it
                // at; the process is no longer informed of new minima from
                // peers, which is fatal for this replica's usefulness but
                // not for messages it already knows about.
                fatal.trigger("freshness subscription permanently lost, this replica can no longer track new minima");
                return;
            }
        }
    }
}

async fn do_enqueue<S: StoreGateway>(
    store: &S,
    up_to_date: bool,
    next_due_time_ms: Option<i64>,
    time_ms: i64,
    text: String,
) -> Result<()> {
    let id = crate::id::message_id(time_ms as f64, &text);
    let publish_min = !up_to_date || next_due_time_ms.map_or(true, |due| time_ms < due);

    match store.write_message(&id, &text, time_ms, publish_min).await {
        Ok(crate::store::WriteOutcome::Written) => Ok(()),
        Ok(crate::store::WriteOutcome::AlreadyPresent) => {
            debug!(id, time_ms, "idempotent re-submission");
            Ok(())
        }
        // A transaction-level (network) failure means no write happened at
        // all — nothing to roll back (§4.3.2 step 4). Only a per-op
        // failure inside an otherwise-committed transaction needs
        // best-effort cleanup (§4.3.2 step 5).
        Err(e) if e.is_connection() || matches!(e, Error::Transaction(_)) => Err(e),
        Err(e) => {
            store.rollback(&id).await;
            Err(e)
        }
    }
}

/// Spawn one inspection pass as its own task, reporting its outcome back to
/// the owning loop over `done_tx`.
fn spawn_pass<S>(
    store: Arc<S>,
    config: EngineConfig,
    next_due_time_ms: Option<i64>,
    resume_requested: Arc<AtomicBool>,
    done_tx: mpsc::UnboundedSender<inspect::PassOutcome>,
) where
    S: StoreGateway + 'static,
{
    tokio::spawn(
        async move {
            let outcome = inspect::run_pass(&store, &config, next_due_time_ms, &resume_requested).await;
            let _ = done_tx.send(outcome);
        }
        .instrument(info_span!("inspection_pass")),
    );
}

#[async_trait]
impl<S> Component for DispatchEngine<S>
where
    S: StoreGateway + FreshnessSource + 'static,
{
    fn name(&self) -> &str {
        "dispatch_engine"
    }

    fn state(&self) -> ComponentState {
        *self.state.lock().unwrap()
    }

    async fn init(&mut self) -> std::result::Result<(), Error> {
        self.store.ping().await?;
        *self.state.lock().unwrap() = ComponentState::Initialized;
        Ok(())
    }

    async fn start(&mut self) -> std::result::Result<(), Error> {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<()>();
        let (freshness_event_tx, mut freshness_rx) = mpsc::unbounded_channel::<FreshnessEvent>();
        let (pass_done_tx, mut pass_done_rx) = mpsc::unbounded_channel::<inspect::PassOutcome>();

        let timer = Timer::spawn(fire_tx);
        let store = Arc::clone(&self.store);
        let config = self.config.clone();

        // Subscribe before bootstrapping (§4.3.1): a value observed on the
        // channel after this point, but before the direct query below
        // completes, is still correctly reflected because `up_to_date`
        // starts false and the direct query only applies if it is still
        // false by the time it returns.
        let freshness_channel = store.freshness_channel().await?;
        let times_connected = Arc::new(AtomicU32::new(1));
        let fatal_hook = FatalHook { state: Arc::clone(&self.state), tx: self.fatal_tx.clone() };
        let freshness_task = tokio::spawn(run_freshness_forwarder(
            Arc::clone(&store),
            freshness_channel,
            config.clone(),
            times_connected,
            fatal_hook,
            freshness_event_tx,
        ));

        let (initial_due, initial_latency) = bootstrap(store.as_ref()).await?;

        let main_task = tokio::spawn({
            let store = Arc::clone(&store);
            let config = config.clone();
            async move {
                let mut up_to_date = false;
                let mut next_due_time_ms = initial_due;
                let mut latency_ms = initial_latency.max(1);
                reprogram_timer(&timer, next_due_time_ms, latency_ms);
                info!("dispatch engine bootstrapped");

                let resume_requested = Arc::new(AtomicBool::new(false));
                let mut inspecting = false;

                loop {
                    tokio::select! {
                        biased;

                        _ = &mut shutdown_rx => {
                            timer.cancel();
                            return;
                        }

                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(Command::Enqueue { time_ms, text, reply }) => {
                                    let result = do_enqueue(store.as_ref(), up_to_date, next_due_time_ms, time_ms, text).await;
                                    let _ = reply.send(result);
                                }
                                None => return,
                            }
                        }

                        Some(event) = freshness_rx.recv() => {
                            match event {
                                FreshnessEvent::Update(min) => {
                                    up_to_date = true;
                                    next_due_time_ms = min;
                                    reprogram_timer(&timer, next_due_time_ms, latency_ms);
                                }
                                FreshnessEvent::Dropped => {
                                    up_to_date = false;
                                    // Rebootstrap directly; once it returns
                                    // we may have a fresher value from a
                                    // replacement subscription, but a stale
                                    // `nextDueTime` is strictly safer than
                                    // none (§4.3.3).
                                    match bootstrap(store.as_ref()).await {
                                        Ok((due, lat)) => {
                                            if !up_to_date {
                                                next_due_time_ms = due;
                                            }
                                            latency_ms = lat.max(1);
                                            reprogram_timer(&timer, next_due_time_ms, latency_ms);
                                        }
                                        Err(e) => warn!(error = %e, "rebootstrap after subscription drop failed"),
                                    }
                                }
                            }
                        }

                        Some(()) = fire_rx.recv() => {
                            if inspecting {
                                resume_requested.store(true, Ordering::SeqCst);
                            } else {
                                inspecting = true;
                                resume_requested.store(false, Ordering::SeqCst);
                                spawn_pass(Arc::clone(&store), config.clone(), next_due_time_ms, Arc::clone(&resume_requested), pass_done_tx.clone());
                            }
                        }

                        Some(outcome) = pass_done_rx.recv() => {
                            inspecting = false;
                            if let inspect::PassOutcome::RetryAfter(delay) = outcome {
                                timer.trigger(now_ms() + delay.as_millis() as i64);
                            }
                            if resume_requested.swap(false, Ordering::SeqCst) {
                                inspecting = true;
                                spawn_pass(Arc::clone(&store), config.clone(), next_due_time_ms, Arc::clone(&resume_requested), pass_done_tx.clone());
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("dispatch_engine"))
        });

        *self.running.lock().unwrap() = Some(Running { cmd_tx, shutdown_tx, main_task, freshness_task });
        *self.state.lock().unwrap() = ComponentState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> std::result::Result<(), Error> {
        if let Some(running) = self.running.lock().unwrap().take() {
            let _ = running.shutdown_tx.send(());
            let _ = running.main_task.await;
            running.freshness_task.abort();
        }
        *self.state.lock().unwrap() = ComponentState::Stopped;
        Ok(())
    }

    async fn shutdown(&mut self) -> std::result::Result<(), Error> {
        if self.state() == ComponentState::Running {
            self.stop().await?;
        }
        // Connections are owned by the store (`Arc<S>`), not by this
        // component; they close when the last `Arc` referencing them
        // drops, once the host process releases its own handle.
        *self.state.lock().unwrap() = ComponentState::ShutDown;
        Ok(())
    }

    async fn health_check(&self) -> std::result::Result<(), Error> {
        if self.state() != ComponentState::Running {
            return Err(Error::ComponentNotReady(self.name().to_string()));
        }
        match tokio::time::timeout(self.config.health_check_timeout(), self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!(
                "ping did not answer within {:?}",
                self.config.health_check_timeout()
            ))),
        }
    }
}
