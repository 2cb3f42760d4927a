//! High-level client: node selection, handshake and session in one handle.
//!
//! [`NodeClient`] holds at most one session. It never reconnects behind the
//! caller's back: once a session drops, requests fail with
//! [`ClientError::Disconnected`] until [`NodeClient::connect`] is called again.
//! The one exception is the very first request, which connects on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use protocol::{CryptoCodec, Envelope, Fields, HandshakeEngine, Request, RequestId, StandardCodec};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use crate::config::{Config, ConfigError};
use crate::error::{ClientError, Result};
use crate::pool::TransformPool;
use crate::selector::{Candidate, NodeSelector, Prober, TcpProber};
use crate::session::{
    LoggingRequestHandler, RequestHandler, SessionManager, SessionOptions, SessionState,
};

/// Settings for [`NodeClient`], usually derived from [`Config`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Bound on opening the TCP connection.
    pub connect_timeout: Duration,
    /// Bound on receiving the node's public key.
    pub handshake_timeout: Duration,
    /// Default wait used by [`NodeClient::ping`].
    pub receive_timeout: Duration,
    /// Bound on the pending-response table.
    pub max_pending: usize,
    /// Transform pool size.
    pub workers: usize,
    /// Compression and encryption implementation.
    pub codec: Arc<dyn CryptoCodec>,
    /// Receiver for node-initiated requests.
    pub handler: Arc<dyn RequestHandler>,
}

impl ClientOptions {
    /// Builds options from a loaded configuration.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            connect_timeout: config.nodes.connect_timeout(),
            handshake_timeout: config.session.handshake_timeout(),
            receive_timeout: config.session.receive_timeout(),
            max_pending: config.session.max_pending,
            workers: config.pool.workers,
            codec: Arc::new(StandardCodec::new(config.codec.compression()?)),
            handler: Arc::new(LoggingRequestHandler),
        })
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        let config = Config::default();
        Self {
            connect_timeout: config.nodes.connect_timeout(),
            handshake_timeout: config.session.handshake_timeout(),
            receive_timeout: config.session.receive_timeout(),
            max_pending: config.session.max_pending,
            workers: config.pool.workers,
            codec: Arc::new(StandardCodec::default()),
            handler: Arc::new(LoggingRequestHandler),
        }
    }
}

/// Connection manager for one logical node connection.
pub struct NodeClient<P = TcpProber> {
    options: ClientOptions,
    selector: Mutex<NodeSelector<P>>,
    pool: TransformPool,
    session: RwLock<Option<Arc<SessionManager>>>,
    phase: watch::Sender<SessionState>,
    connect_lock: Mutex<()>,
    ever_connected: AtomicBool,
}

impl NodeClient<TcpProber> {
    /// Builds a client from configuration.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        Ok(Self::new(
            NodeSelector::from_config(&config.nodes),
            ClientOptions::from_config(config)?,
        ))
    }
}

impl<P: Prober> NodeClient<P> {
    /// Creates a disconnected client.
    pub fn new(selector: NodeSelector<P>, options: ClientOptions) -> Self {
        let pool = TransformPool::new(Arc::clone(&options.codec), options.workers);
        let (phase, _) = watch::channel(SessionState::Disconnected);
        Self {
            options,
            selector: Mutex::new(selector),
            pool,
            session: RwLock::new(None),
            phase,
            connect_lock: Mutex::new(()),
            ever_connected: AtomicBool::new(false),
        }
    }

    /// Selects a node, connects, and performs the handshake.
    ///
    /// Replaces any session that is no longer active. A no-op if the current
    /// session is active.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        if let Some(session) = self.current_session() {
            if session.is_active() {
                return Ok(());
            }
            // The old node failed us; pick again.
            self.selector.lock().await.invalidate();
        }

        match self.establish().await {
            Ok(session) => {
                let previous = self.replace_session(Some(Arc::new(session)));
                self.ever_connected.store(true, Ordering::Release);
                self.set_phase(SessionState::Active);
                if let Some(previous) = previous {
                    previous.close().await;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connection attempt failed");
                self.set_phase(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<SessionManager> {
        self.set_phase(SessionState::Connecting);
        let candidate = self.selector.lock().await.select_best_node().await?;
        let addr = candidate.addr();

        tracing::info!(node = %addr, "Connecting");
        let connected = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(addr.as_str()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        });
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(source) => {
                self.selector.lock().await.invalidate();
                return Err(ClientError::Connect { addr, source });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        self.set_phase(SessionState::Handshaking);
        let keys = HandshakeEngine::new()
            .timeout(self.options.handshake_timeout)
            .perform(&mut stream)
            .await?;

        let session = SessionManager::start(
            stream,
            keys,
            self.pool.clone(),
            SessionOptions {
                max_pending: self.options.max_pending,
                handler: Arc::clone(&self.options.handler),
            },
        );
        tracing::info!(
            node = %addr,
            remote_key = %hex::encode(session.remote_public_key().as_bytes()),
            "Session established"
        );
        Ok(session)
    }

    /// Connects unless a session is already active.
    pub async fn ensure_connected(&self) -> Result<()> {
        match self.current_session() {
            Some(session) if session.is_active() => Ok(()),
            _ => self.connect().await,
        }
    }

    /// Sends a request and returns its correlation id.
    ///
    /// Connects first if this client has never been connected.
    pub async fn send(&self, fields: Fields) -> Result<RequestId> {
        self.session_for_send().await?.send(fields).await
    }

    /// Waits for the response to `id`.
    pub async fn receive(&self, id: RequestId, timeout: Duration) -> Result<Envelope> {
        let session = self.current_session().ok_or_else(|| self.no_session_error())?;
        session.receive(id, timeout).await
    }

    /// Sends a request and waits for its response.
    pub async fn request(&self, fields: Fields, timeout: Duration) -> Result<Envelope> {
        let session = self.session_for_send().await?;
        session.request(fields, timeout).await
    }

    /// Round-trips a ping and records the latency on the selected node.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .request(Request::ping_fields(), self.options.receive_timeout)
            .await?;
        let latency = started.elapsed();

        self.selector.lock().await.record_latency(latency);
        tracing::debug!(
            id = %response.id(),
            latency_us = latency.as_micros() as u64,
            "Ping answered"
        );
        Ok(latency)
    }

    /// Probes every candidate and returns the results.
    pub async fn probe(&self) -> Vec<Candidate> {
        let mut selector = self.selector.lock().await;
        if let Err(e) = selector.reprobe().await {
            tracing::warn!(error = %e, "No candidate answered the probe");
        }
        selector.candidates().to_vec()
    }

    /// Snapshot of the candidate list.
    pub async fn candidates(&self) -> Vec<Candidate> {
        self.selector.lock().await.candidates().to_vec()
    }

    /// The node currently selected, if any.
    pub async fn selected(&self) -> Option<Candidate> {
        self.selector.lock().await.selected().cloned()
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        let phase = *self.phase.borrow();
        if phase != SessionState::Active {
            return phase;
        }
        self.current_session()
            .map(|session| session.state())
            .unwrap_or(SessionState::Disconnected)
    }

    /// Closes the session. Further requests fail with [`ClientError::Closed`].
    pub async fn close(&self) {
        let _guard = self.connect_lock.lock().await;
        self.set_phase(SessionState::Closed);
        if let Some(session) = self.replace_session(None) {
            session.close().await;
        }
        self.pool.close();
    }

    async fn session_for_send(&self) -> Result<Arc<SessionManager>> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        if self.ever_connected.load(Ordering::Acquire) {
            return Err(ClientError::Disconnected);
        }

        self.connect().await?;
        self.current_session().ok_or(ClientError::Disconnected)
    }

    fn no_session_error(&self) -> ClientError {
        if self.is_closed() {
            ClientError::Closed
        } else {
            ClientError::Disconnected
        }
    }

    fn is_closed(&self) -> bool {
        *self.phase.borrow() == SessionState::Closed
    }

    fn set_phase(&self, state: SessionState) {
        self.phase.send_replace(state);
    }

    fn current_session(&self) -> Option<Arc<SessionManager>> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace_session(&self, session: Option<Arc<SessionManager>>) -> Option<Arc<SessionManager>> {
        let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, session)
    }
}
