//! Distributed delayed-message echo service.
//!
//! Clients submit text and a due-time; exactly one replica in the fleet
//! emits it to standard output at (or just after) that instant. Replicas
//! coordinate through a shared store (`msgq` sorted set, `msg:<id>` /
//! `lk:<id>` keys, and the `ndt` pub/sub channel) rather than through each
//! other directly.
//!
//! [`engine::DispatchEngine`] is the core; [`store`], [`freshness`], and
//! [`timer`] are the pieces it is built from. [`config`], [`logging`],
//! [`lifecycle`], and [`ingress`] are the ambient stack that turns the
//! engine into a runnable process.

pub mod config;
pub mod engine;
pub mod errors;
pub mod freshness;
pub mod id;
pub mod ingress;
pub mod lifecycle;
pub mod logging;
pub mod store;
pub mod timer;

pub use config::EngineConfig;
pub use engine::DispatchEngine;
pub use errors::{Error, Result};
pub use lifecycle::{Component, ComponentState};
pub use store::{MemoryStoreGateway, RedisGateway, StoreGateway};
