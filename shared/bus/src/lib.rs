//! Session-state and fan-out seams of the hub.
//!
//! The hub talks to short-lived session state through [`SessionStore`] and
//! to its internal packet fan-out through [`MessageBus`]. Production
//! deployments may back these with an external key-value + pub/sub service;
//! the in-process implementations here are sufficient for a single
//! instance and for tests.

pub mod bus;
pub mod keys;
pub mod store;
pub mod topics;

pub use bus::{MemoryBus, MessageBus, Subscription};
pub use store::{MemorySessionStore, SessionStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus backend: {0}")]
    Backend(String),
}
