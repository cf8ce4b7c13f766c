//! Muster client.
//!
//! [`StoreClient`] is the user-facing stub: synchronous-feeling request and
//! reply calls over one persistent socket, with per-call timeouts and the
//! startup barrier. A second socket feeds the watch listener worker, which
//! dispatches server-pushed key-change events to registered callbacks.
//!
//! The process that hosts the authoritative server constructs its client
//! with `is_server: true`; the embedded [`muster_server::Server`] then lives
//! and dies with that client.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod error;
mod listener;

pub use client::{DEFAULT_TIMEOUT, StoreClient, StoreConfig};
pub use error::ClientError;
pub use listener::WatchCallback;
