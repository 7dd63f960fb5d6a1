//! Crate-wide error type and context helpers.
//!
//! Mirrors the error-kind table in the design doc: store connection loss is
//! distinct from a transaction-level failure, which is distinct from a
//! per-operation failure inside a transaction, so callers can apply the
//! right recovery policy for each.

use std::fmt;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the store gateway, the dispatch engine, and the
/// ambient configuration/logging layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store connection is down or could not be (re)established.
    #[error("store connection error: {0}")]
    Connection(String),

    /// A pipelined transaction failed at the network/protocol level; no
    /// writes are known to have happened.
    #[error("store transaction error: {0}")]
    Transaction(String),

    /// A single operation (inside or outside a transaction) failed.
    #[error("store operation error: {0}")]
    Op(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure encoding or decoding a value (e.g. the `ndt` payload).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A component was asked to act from a lifecycle state that does not
    /// support the action (e.g. `enqueue` before `start`).
    #[error("component '{0}' is not ready")]
    ComponentNotReady(String),
}

impl Error {
    /// True for errors that represent a lost or never-established
    /// connection, the only class that triggers the reconnect/backoff path.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Error::Connection(err.to_string())
        } else {
            Error::Op(err.to_string())
        }
    }
}

/// Context attached to an error for logging, without changing its kind.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub details: Option<String>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        ErrorContext {
            component: component.into(),
            operation: operation.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in component '{}' during operation '{}'",
            self.component, self.operation
        )?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// Extension trait for attaching an [`ErrorContext`] to an [`Error`] while
/// preserving its variant (so callers can still match on kind).
pub trait ErrorExt {
    fn with_context(self, ctx: ErrorContext) -> Error;
}

impl ErrorExt for Error {
    fn with_context(self, ctx: ErrorContext) -> Error {
        let msg = format!("{self} [{ctx}]");
        match self {
            Error::Connection(_) => Error::Connection(msg),
            Error::Transaction(_) => Error::Transaction(msg),
            Error::Op(_) => Error::Op(msg),
            Error::Config(_) => Error::Config(msg),
            Error::Serialization(_) => Error::Serialization(msg),
            Error::ComponentNotReady(_) => Error::ComponentNotReady(msg),
        }
    }
}
