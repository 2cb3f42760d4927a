//! # NodeLink Client Library
//!
//! Connects to the best of several candidate nodes and exchanges correlated,
//! encrypted requests and responses over a single TCP connection.
//!
//! ## Overview
//!
//! - **Node selection**: TCP probes, lowest latency wins, `0.0.0.0` falls back to `localhost`
//! - **Sessions**: one writer lock, one inbound reader, pending responses keyed by id
//! - **Transform pool**: bounded offload of compression and encryption
//! - **Health endpoint**: HTTP ping that reports round-trip latency
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        NodeClient                        │
//! ├──────────────┬───────────────────────────────────────────┤
//! │ NodeSelector │              SessionManager               │
//! │  (probing)   │  ┌──────────────┐  ┌───────────────────┐  │
//! │              │  │ PendingTable │  │   TransformPool   │  │
//! │              │  └──────────────┘  └───────────────────┘  │
//! ├──────────────┴───────────────────────────────────────────┤
//! │         protocol: handshake, framing, envelopes          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use client::{Config, NodeClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let client = NodeClient::from_config(&config)?;
//!
//!     client.connect().await?;
//!     let latency = client.ping().await?;
//!     println!("node answered in {:?}", latency);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Failure handling
//!
//! A dropped connection moves the session to `Disconnected` and wakes every
//! caller waiting for a response. The client does not reconnect on its own.
//! Frames that fail to decrypt or decode are logged and discarded, so a
//! caller waiting on such a response sees a timeout.

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod node_client;
pub mod pool;
pub mod selector;
pub mod session;

pub use config::{Config, ConfigError, EnvOverride, NodeAddress};
pub use error::{ClientError, ProbeError, Result};
pub use node_client::{ClientOptions, NodeClient};
pub use pool::TransformPool;
pub use selector::{pick_best, Candidate, NodeSelector, Prober, TcpProber};
pub use session::{
    LoggingRequestHandler, PendingTable, RequestHandler, SessionManager, SessionOptions,
    SessionState,
};
