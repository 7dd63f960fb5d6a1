//! Standard component lifecycle, implemented by the [`crate::engine::DispatchEngine`]
//! so a host process (or a test harness) can drive it uniformly.

use crate::errors::Error;
use async_trait::async_trait;

/// Possible states of a component in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// Created but not yet initialized.
    Created,
    /// Connections opened, nothing subscribed or running yet.
    Initialized,
    /// Subscribed, bootstrapped, background tasks spawned.
    Running,
    /// Background tasks cancelled; connections still open.
    Stopped,
    /// Connections closed; terminal state.
    ShutDown,
    /// A fatal, unrecoverable error occurred.
    Error,
}

/// Standard lifecycle for long-running components.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique name, used in logs and health reports.
    fn name(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> ComponentState;

    /// Open connections and perform setup that doesn't depend on other
    /// components being up yet. Idempotent-ish: called once per process.
    async fn init(&mut self) -> Result<(), Error>;

    /// Subscribe, bootstrap state from the store, and spawn background
    /// tasks. Called after `init`.
    async fn start(&mut self) -> Result<(), Error>;

    /// Cancel background tasks, but keep connections open so the component
    /// could in principle be `start`ed again.
    async fn stop(&mut self) -> Result<(), Error>;

    /// Tear down connections. Terminal: the component cannot be restarted
    /// after this.
    async fn shutdown(&mut self) -> Result<(), Error>;

    /// Names of components this one depends on being started first. The
    /// Dispatch Engine has none — it owns its own store connections rather
    /// than sharing another component's.
    fn dependencies(&self) -> Vec<&str> {
        vec![]
    }

    /// Report whether the component is healthy right now.
    async fn health_check(&self) -> Result<(), Error> {
        match self.state() {
            ComponentState::Running => Ok(()),
            _ => Err(Error::ComponentNotReady(self.name().to_string())),
        }
    }
}
