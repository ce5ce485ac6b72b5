//! Error types for ZimSync.
//!
//! This module provides a unified error type for all ZimSync operations.
//! Local failures surface through [`Error`]; protocol failures travel to the
//! peer as `Error` packets carrying an [`ErrorCode`](crate::protocol::ErrorCode).

use std::io;

use thiserror::Error;

use crate::protocol::ErrorCode;

/// A specialized `Result` type for ZimSync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for ZimSync.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport could not bind or connect
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A datagram could not be decoded as a ZimSync packet
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// A checksum or decompressed-size check failed
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Requested file absent on disk, or unknown file id
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A file name that would escape the shared directory
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Operation timed out
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Peer speaks a protocol version newer than ours
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Service discovery failure
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Compression or decompression failure
    #[error("compression error: {0}")]
    Compression(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The wire error code this error maps to, if it is reportable to a peer.
    #[must_use]
    pub const fn wire_code(&self) -> Option<ErrorCode> {
        match self {
            Self::FileNotFound(_) => Some(ErrorCode::FileNotFound),
            Self::ChecksumMismatch(_) => Some(ErrorCode::ChecksumMismatch),
            Self::InvalidPath(_) | Self::UnsupportedVersion(_) => {
                Some(ErrorCode::UnsupportedFormat)
            }
            Self::Timeout(_) => Some(ErrorCode::Timeout),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ChecksumMismatch(_))
    }
}
