//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering envelope encoding and framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// Payload cannot be described by a 4-byte length prefix.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum representable size.
        max: usize,
    },

    // Transport errors
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Failure modes of the key exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer closed the stream before sending its full public key.
    #[error("peer closed the connection before completing the key exchange")]
    PeerClosed,

    /// The peer's public key is not usable for Diffie-Hellman.
    #[error("invalid peer public key: {0}")]
    InvalidKey(String),

    /// The peer did not send its public key in time.
    #[error("key exchange timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// Writing our public key or reading the peer's failed.
    #[error("i/o error during key exchange: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned across the compression/encryption boundary.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Compression operation failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Decompression operation failed.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// The worker running the transform panicked or was cancelled.
    #[error("transform worker failed: {0}")]
    WorkerFailed(String),

    /// The offload pool has been shut down.
    #[error("transform pool is closed")]
    PoolClosed,
}

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
