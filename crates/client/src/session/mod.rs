//! Session layer: one encrypted connection and its outstanding requests.

pub mod manager;
pub mod pending;

pub use manager::{LoggingRequestHandler, RequestHandler, SessionManager, SessionOptions};
pub use pending::{PendingTable, Termination, DEFAULT_MAX_PENDING};

/// Lifecycle of a connection.
///
/// ```text
/// Disconnected -> Connecting -> Handshaking -> Active -> Closed
///                                                |
///                                                +-> Disconnected (I/O error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Selecting a node and opening the TCP connection.
    Connecting,
    /// Exchanging public keys.
    Handshaking,
    /// Ready for traffic.
    Active,
    /// Closed by its owner.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
