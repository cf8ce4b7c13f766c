//! Protocol error type.
//!
//! One strongly-typed error for every way a peer can violate the wire
//! contract. I/O errors enter through `#[from]` at the transport boundary;
//! everything else names the violation precisely so the dispatcher can log
//! it before purging the connection.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Query tag byte does not name any known request.
    #[error("unknown query tag {0:#04x}")]
    UnknownQueryTag(u8),

    /// Reply tag byte does not match what the caller was waiting for.
    #[error("unexpected {expected} reply tag {tag:#04x}")]
    UnexpectedReplyTag {
        /// Reply family the caller expected.
        expected: &'static str,
        /// Tag byte actually received.
        tag: u8,
    },

    /// Length prefix exceeds the decoder's allocation limit.
    #[error("blob of {len} bytes exceeds limit of {max} bytes")]
    BlobTooLarge {
        /// Claimed length from the wire.
        len: u64,
        /// Maximum the decoder accepts.
        max: usize,
    },

    /// String argument is not valid UTF-8.
    #[error("string argument is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Underlying transport failure, including EOF mid-frame.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True if this error is a clean end-of-stream rather than a violation.
    ///
    /// An EOF on a request boundary means the peer simply closed the
    /// connection; anything else indicates a broken or malicious peer.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
