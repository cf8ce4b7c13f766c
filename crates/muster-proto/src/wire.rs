//! Tag enums and length-prefixed framing primitives.
//!
//! Every multi-byte integer on the wire is little-endian. The usual
//! deployment puts all peers on one machine, but fixing the byte order keeps
//! heterogeneous hosts interoperable at no cost.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{ProtocolError, Result};

/// Maximum blob length a decoder will allocate for (16 MiB).
///
/// Rendezvous payloads are addresses and small handshake blobs; anything
/// near this limit is a broken or hostile peer, rejected before allocation.
pub const MAX_BLOB_LEN: usize = 16 * 1024 * 1024;

/// Request kind, the first byte of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryKind {
    /// Unconditional write.
    Set = 0,
    /// Conditional write (compare-and-set).
    CompareSet = 1,
    /// Read a present key.
    Get = 2,
    /// Integer increment over a decimal-string value.
    Add = 3,
    /// Non-blocking presence check for a key set.
    Check = 4,
    /// Blocking presence wait for a key set.
    Wait = 5,
    /// Count keys in the store.
    GetNumKeys = 6,
    /// Subscribe the connection to change events for a key.
    WatchKey = 7,
    /// Erase a key.
    DeleteKey = 8,
}

impl QueryKind {
    /// Decode a query tag byte.
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Set),
            1 => Some(Self::CompareSet),
            2 => Some(Self::Get),
            3 => Some(Self::Add),
            4 => Some(Self::Check),
            5 => Some(Self::Wait),
            6 => Some(Self::GetNumKeys),
            7 => Some(Self::WatchKey),
            8 => Some(Self::DeleteKey),
            _ => None,
        }
    }
}

/// Reply tag for `Check` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckReply {
    /// Every queried key is present.
    Ready = 0,
    /// At least one queried key is absent.
    NotReady = 1,
}

impl CheckReply {
    /// Read one check reply from the stream.
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        match r.read_u8().await? {
            0 => Ok(Self::Ready),
            1 => Ok(Self::NotReady),
            tag => Err(ProtocolError::UnexpectedReplyTag { expected: "check", tag }),
        }
    }
}

/// Reply tag for `Wait` requests. The only variant releases the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitReply {
    /// Every awaited key is now present.
    StopWaiting = 0,
}

impl WaitReply {
    /// Read one wait reply from the stream.
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        match r.read_u8().await? {
            0 => Ok(Self::StopWaiting),
            tag => Err(ProtocolError::UnexpectedReplyTag { expected: "wait", tag }),
        }
    }
}

/// Event tag pushed to watcher connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatchReply {
    /// A watched key changed value.
    KeyUpdated = 0,
}

/// Append a length-prefixed blob to `dst`.
pub fn put_blob(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u64_le(data.len() as u64);
    dst.put_slice(data);
}

/// Append a length-prefixed UTF-8 string to `dst`.
pub fn put_string(dst: &mut BytesMut, s: &str) {
    put_blob(dst, s.as_bytes());
}

/// Read a length-prefixed blob from the stream.
///
/// # Errors
///
/// `BlobTooLarge` if the length prefix exceeds [`MAX_BLOB_LEN`]. The claimed
/// bytes are never read, so the stream is left mid-frame and the caller must
/// drop the connection.
pub async fn read_blob<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = r.read_u64_le().await?;
    if len > MAX_BLOB_LEN as u64 {
        return Err(ProtocolError::BlobTooLarge { len, max: MAX_BLOB_LEN });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read a length-prefixed UTF-8 string from the stream.
pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let blob = read_blob(r).await?;
    Ok(String::from_utf8(blob.to_vec())?)
}

/// Read a little-endian `i64` from the stream.
pub async fn read_i64<R: AsyncRead + Unpin>(r: &mut R) -> Result<i64> {
    Ok(r.read_i64_le().await?)
}
