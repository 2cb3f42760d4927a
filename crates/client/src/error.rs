//! Error types for the client crate.

use std::time::Duration;

use protocol::{HandshakeError, ProtocolError, RequestId, TransformError};
use thiserror::Error;

/// Errors surfaced to callers of the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every candidate failed its probe.
    #[error("no reachable node among {candidates} candidate(s)")]
    NoReachableNode {
        /// Number of candidates that were probed.
        candidates: usize,
    },

    /// Opening the session connection to the selected node failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The key exchange failed; the connection was dropped.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Compressing or encrypting an outbound message failed.
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    /// Envelope encoding or framing failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No response arrived for `id` within `timeout`.
    #[error("no response for request {id} within {timeout:?}")]
    CorrelationTimeout {
        /// The request that timed out.
        id: RequestId,
        /// How long the caller waited.
        timeout: Duration,
    },

    /// Another caller is already waiting for the response to `id`.
    #[error("request {id} already has a waiting caller")]
    AlreadyAwaited {
        /// The contested request.
        id: RequestId,
    },

    /// The connection failed; reconnect through node selection.
    #[error("session disconnected")]
    Disconnected,

    /// The session or client was closed by its owner.
    #[error("session closed")]
    Closed,

    /// Other I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Returns true if reconnecting could resolve the error.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ClientError::Disconnected | ClientError::Connect { .. } | ClientError::Io(_)
        )
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Why a single candidate probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The node actively refused the connection.
    #[error("connection refused")]
    Refused,

    /// The probe did not complete in time.
    #[error("probe timed out after {0:?}")]
    TimedOut(Duration),

    /// Any other connect failure (unresolvable host, unreachable network).
    #[error("probe failed: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::ConnectionRefused {
            ProbeError::Refused
        } else {
            ProbeError::Io(err)
        }
    }
}
