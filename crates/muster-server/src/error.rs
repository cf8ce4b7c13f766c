//! Server error types.
//!
//! Two layers, two enums: [`DriverError`] for violations the store driver
//! detects while applying a request (fatal to that session only), and
//! [`ServerError`] for runtime failures around binding and transport. A
//! driver error never crashes the process; the runtime contains it to a
//! purge of the offending connection.

use std::io;

use thiserror::Error;

use crate::driver::SessionId;

/// Violations detected while applying a request.
///
/// Every variant is fatal to the session that sent the request and to
/// nothing else.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Event referenced a session the driver does not know.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// `Get` of a key that is not present. Clients establish presence with
    /// a wait before reading, so reaching this is a client bug.
    #[error("get of absent key {0:?}")]
    AbsentKey(String),

    /// `Add` target holds bytes that do not parse as a base-10 `i64`.
    #[error("value under key {key:?} is not a decimal integer")]
    NonDecimalValue {
        /// The key whose value failed to parse.
        key: String,
    },
}

/// Failures of the production runtime.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listening socket.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying socket error.
        source: io::Error,
    },

    /// Socket-level failure outside of bind.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Store driver rejected an event.
    #[error(transparent)]
    Driver(#[from] DriverError),
}
