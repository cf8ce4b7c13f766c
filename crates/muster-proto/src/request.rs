//! Request type: one query tag byte plus tag-specific arguments.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    errors::{ProtocolError, Result},
    wire::{QueryKind, put_blob, put_string, read_blob, read_i64, read_string},
};

/// A single client request.
///
/// Requests are a dense tagged variant: the server dispatches on the
/// [`QueryKind`] byte and the decoder reads exactly the arguments that kind
/// carries. Keys arrive already prefixed by the client stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Unconditional write. No reply; wakes waiters and notifies watchers.
    Set {
        /// Target key.
        key: String,
        /// New value.
        value: Bytes,
    },

    /// Conditional write. Replies with the value that is current after the
    /// request, except on an absent key where it echoes `expected` back.
    CompareSet {
        /// Target key.
        key: String,
        /// Value the caller believes is stored.
        expected: Bytes,
        /// Replacement written on a match.
        desired: Bytes,
    },

    /// Read a key the caller has already established as present.
    Get {
        /// Target key.
        key: String,
    },

    /// Integer increment. The stored value is a base-10 signed decimal
    /// string; an absent key behaves as zero.
    Add {
        /// Target key.
        key: String,
        /// Signed increment.
        delta: i64,
    },

    /// Non-blocking presence check over a key set.
    Check {
        /// Keys to test.
        keys: Vec<String>,
    },

    /// Blocking presence wait over a key set. The reply is deferred until
    /// every key is present.
    Wait {
        /// Keys to await.
        keys: Vec<String>,
    },

    /// Count keys in the store.
    GetNumKeys,

    /// Subscribe this connection to change events for a key. No reply.
    WatchKey {
        /// Key to watch.
        key: String,
    },

    /// Erase a key. Replies with the erased count (1 or 0).
    DeleteKey {
        /// Key to erase.
        key: String,
    },
}

impl Request {
    /// Query kind corresponding to this request.
    #[must_use]
    pub const fn kind(&self) -> QueryKind {
        match self {
            Self::Set { .. } => QueryKind::Set,
            Self::CompareSet { .. } => QueryKind::CompareSet,
            Self::Get { .. } => QueryKind::Get,
            Self::Add { .. } => QueryKind::Add,
            Self::Check { .. } => QueryKind::Check,
            Self::Wait { .. } => QueryKind::Wait,
            Self::GetNumKeys => QueryKind::GetNumKeys,
            Self::WatchKey { .. } => QueryKind::WatchKey,
            Self::DeleteKey { .. } => QueryKind::DeleteKey,
        }
    }

    /// Encode the full request into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.kind() as u8);
        match self {
            Self::Set { key, value } => {
                put_string(dst, key);
                put_blob(dst, value);
            },
            Self::CompareSet { key, expected, desired } => {
                put_string(dst, key);
                put_blob(dst, expected);
                put_blob(dst, desired);
            },
            Self::Get { key } | Self::WatchKey { key } | Self::DeleteKey { key } => {
                put_string(dst, key);
            },
            Self::Add { key, delta } => {
                put_string(dst, key);
                dst.put_i64_le(*delta);
            },
            Self::Check { keys } | Self::Wait { keys } => {
                dst.put_u64_le(keys.len() as u64);
                for key in keys {
                    put_string(dst, key);
                }
            },
            Self::GetNumKeys => {},
        }
    }

    /// Decode one request from the stream.
    ///
    /// # Errors
    ///
    /// `UnknownQueryTag` for an unrecognized tag byte; any framing failure
    /// (EOF mid-frame, oversized blob, invalid UTF-8) from the argument
    /// decoders. All of these are fatal to the connection.
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let tag = r.read_u8().await?;
        let kind = QueryKind::from_u8(tag).ok_or(ProtocolError::UnknownQueryTag(tag))?;

        match kind {
            QueryKind::Set => {
                let key = read_string(r).await?;
                let value = read_blob(r).await?;
                Ok(Self::Set { key, value })
            },
            QueryKind::CompareSet => {
                let key = read_string(r).await?;
                let expected = read_blob(r).await?;
                let desired = read_blob(r).await?;
                Ok(Self::CompareSet { key, expected, desired })
            },
            QueryKind::Get => Ok(Self::Get { key: read_string(r).await? }),
            QueryKind::Add => {
                let key = read_string(r).await?;
                let delta = read_i64(r).await?;
                Ok(Self::Add { key, delta })
            },
            QueryKind::Check => Ok(Self::Check { keys: Self::decode_key_set(r).await? }),
            QueryKind::Wait => Ok(Self::Wait { keys: Self::decode_key_set(r).await? }),
            QueryKind::GetNumKeys => Ok(Self::GetNumKeys),
            QueryKind::WatchKey => Ok(Self::WatchKey { key: read_string(r).await? }),
            QueryKind::DeleteKey => Ok(Self::DeleteKey { key: read_string(r).await? }),
        }
    }

    /// Decode a `u64` count followed by that many strings.
    ///
    /// The vector grows as keys actually arrive, so a hostile count cannot
    /// reserve memory ahead of the bytes backing it.
    async fn decode_key_set<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<String>> {
        let count = r.read_u64_le().await?;
        let mut keys = Vec::new();
        for _ in 0..count {
            keys.push(read_string(r).await?);
        }
        Ok(keys)
    }
}
