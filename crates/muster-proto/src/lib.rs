//! Wire protocol for the muster rendezvous store.
//!
//! Defines the query and reply tag enums, the length-prefixed framing
//! primitives, and the [`Request`]/[`Reply`] types exchanged between clients
//! and the server. This crate is a pure codec: it knows how to move protocol
//! values through any [`tokio::io::AsyncRead`] and how to encode them into a
//! [`bytes::BytesMut`], but it owns no sockets and no policy.
//!
//! # Wire format
//!
//! - Tags (query kind, check reply, wait reply, watch reply) are single bytes
//!   assigned in declaration order starting at 0.
//! - Integers are fixed-width little-endian: `i64` for counters and deltas,
//!   `u64` for length prefixes and key counts.
//! - A blob is a `u64` length followed by that many raw bytes. Decoders
//!   reject blobs over [`MAX_BLOB_LEN`] before allocating.
//! - A string is a blob interpreted as UTF-8.
//!
//! A request is one query tag byte followed by tag-specific arguments. One
//! request produces at most one reply on the same socket; the connection is
//! persistent and carries arbitrarily many requests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod errors;
mod reply;
mod request;
mod wire;

pub use errors::{ProtocolError, Result};
pub use reply::{KeyUpdate, Reply};
pub use request::Request;
pub use wire::{
    CheckReply, MAX_BLOB_LEN, QueryKind, WaitReply, WatchReply, put_blob, put_string, read_blob,
    read_i64, read_string,
};
