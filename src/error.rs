//! # Error Types
//!
//! Error handling for the internode protocol and the transaction router.
//!
//! ## Error Categories
//! - **Framing errors**: bad magic number, malformed or oversized lengths,
//!   undecodable payloads. Fatal to the connection that produced them.
//! - **Transport errors**: I/O failures and end-of-stream. They end the
//!   connection and are never propagated past it.
//! - **Remote failures**: an `Error` packet answering a request, surfaced to
//!   the caller that was waiting for the ack.
//! - **Database errors**: the unified [`DbError`] raised by the router after
//!   any rollback has completed.
//!
//! ## Example Usage
//! ```rust
//! use internode_protocol::error::{DbError, ProtocolError};
//! use std::error::Error;
//!
//! let err = DbError::convert(ProtocolError::Timeout);
//! assert!(matches!(err, DbError::Protocol(ProtocolError::Timeout)));
//!
//! let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
//! let err = DbError::convert(io);
//! assert!(err.source().is_some());
//! ```

use std::io;
use thiserror::Error;

use crate::router::StatementKind;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Handshake errors
    pub const ERR_ENDPOINT_LENGTH: &str = "Invalid endpoint identity length";
    pub const ERR_PEER_REJECTED_VERSION: &str = "Peer closed the connection during version negotiation";

    /// Codec errors
    pub const ERR_TRUNCATED_PAYLOAD: &str = "Payload ended before all fields were read";
    pub const ERR_TRAILING_BYTES: &str = "Payload has bytes left after decoding";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";

    /// Session errors
    pub const ERR_NO_TRANSACTION: &str = "No transaction is active";
}

/// Boxed error used as the cause of a converted [`DbError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ProtocolError is the error type for every wire-level operation
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid magic number: 0x{0:08x}")]
    InvalidMagic(i32),

    #[error("Malformed length field: {0}")]
    MalformedLength(i64),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Block checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(i32),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Remote failure {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Framing errors mean the byte stream can no longer be trusted.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMagic(_)
                | ProtocolError::MalformedLength(_)
                | ProtocolError::OversizedFrame(_)
                | ProtocolError::UnknownPacketType(_)
                | ProtocolError::Decode(_)
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::DecompressionFailure
        )
    }

    /// End-of-stream is the normal way a peer goes away.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// The unified database error raised by the transaction router.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Unsupported statement kind for this operation: {0:?}")]
    UnsupportedStatement(StatementKind),

    #[error("{message}")]
    General {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl DbError {
    /// A plain error with no underlying cause.
    pub fn general(message: impl Into<String>) -> Self {
        DbError::General {
            message: message.into(),
            source: None,
        }
    }

    /// Convert any error into a `DbError`.
    ///
    /// A `DbError` passes through unchanged and a `ProtocolError` becomes
    /// `DbError::Protocol`. Anything else is wrapped with the original error
    /// kept as the source.
    pub fn convert<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        let boxed: BoxError = err.into();
        let boxed = match boxed.downcast::<DbError>() {
            Ok(db) => return *db,
            Err(other) => other,
        };
        match boxed.downcast::<ProtocolError>() {
            Ok(protocol) => DbError::Protocol(*protocol),
            Err(other) => DbError::General {
                message: other.to_string(),
                source: Some(other),
            },
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Type alias for Results using DbError
pub type DbResult<T> = std::result::Result<T, DbError>;
