//! Client error type.

use std::{io, time::Duration};

use muster_proto::ProtocolError;
use muster_server::ServerError;
use thiserror::Error;

/// Errors surfaced to callers of the client stub.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not establish a connection to the server.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying socket error.
        source: io::Error,
    },

    /// Socket-level failure on an established connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The server sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A reply did not arrive within the configured timeout.
    ///
    /// This is also how a `get` of a key that never gets written reports
    /// itself; there is no distinct absent-key error on the wire.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The in-process server failed to start.
    #[error("embedded server failed: {0}")]
    Server(#[from] ServerError),

    /// The startup barrier counter holds a non-decimal value.
    #[error("barrier counter is corrupt")]
    CorruptBarrier,
}
