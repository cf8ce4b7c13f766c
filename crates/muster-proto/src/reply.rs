//! Reply and watch-event types.
//!
//! Replies carry no framing envelope of their own: each request kind knows
//! the exact shape of its reply, so the bytes on the wire are just the
//! encoded value. The one exception is the watch event, which is pushed
//! unsolicited and therefore leads with its own tag byte.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    errors::{ProtocolError, Result},
    wire::{CheckReply, WaitReply, WatchReply, put_blob, put_string, read_blob, read_string},
};

/// A single server-to-client message.
///
/// `Value`, `Int`, `Check` and `StopWaiting` answer requests on the request
/// socket; `KeyUpdate` is pushed to watcher connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Length-prefixed value blob (`Get` and `CompareSet` replies).
    Value(Bytes),

    /// Little-endian `i64` (`Add`, `GetNumKeys` and `DeleteKey` replies).
    Int(i64),

    /// Presence verdict for a `Check` request.
    Check(CheckReply),

    /// Release for a `Wait` request, possibly long after the request.
    StopWaiting,

    /// Change notification for a watched key.
    KeyUpdate(KeyUpdate),
}

impl Reply {
    /// Encode the reply into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Value(value) => put_blob(dst, value),
            Self::Int(n) => dst.put_i64_le(*n),
            Self::Check(verdict) => dst.put_u8(*verdict as u8),
            Self::StopWaiting => dst.put_u8(WaitReply::StopWaiting as u8),
            Self::KeyUpdate(update) => update.encode(dst),
        }
    }
}

/// Change notification pushed to every watcher of a key.
///
/// Carries the value before and after the write. A side that does not exist
/// (the old value on a key's first write) is carried as an empty blob; the
/// wire cannot distinguish absent from empty here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdate {
    /// The key that changed, as stored (prefix included).
    pub key: String,
    /// Value before the write.
    pub old: Bytes,
    /// Value after the write.
    pub new: Bytes,
}

impl KeyUpdate {
    /// Encode the event, tag byte first.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(WatchReply::KeyUpdated as u8);
        put_string(dst, &self.key);
        put_blob(dst, &self.old);
        put_blob(dst, &self.new);
    }

    /// Decode one event from the listener stream.
    ///
    /// # Errors
    ///
    /// `UnexpectedReplyTag` if the tag byte is not `KeyUpdated`; the listener
    /// treats that as fatal.
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let tag = r.read_u8().await?;
        if tag != WatchReply::KeyUpdated as u8 {
            return Err(ProtocolError::UnexpectedReplyTag { expected: "watch", tag });
        }
        let key = read_string(r).await?;
        let old = read_blob(r).await?;
        let new = read_blob(r).await?;
        Ok(Self { key, old, new })
    }
}
