//! One live, encrypted connection to a node.
//!
//! The manager owns the write half of the stream behind an async mutex, so
//! each frame goes out as one uninterrupted write. A single inbound task owns
//! the read half and the reassembly buffer. Frame transforms run on the
//! [`TransformPool`]; the inbound task takes a pool slot before handing each
//! frame off, so a slow codec slows reading instead of queueing without bound.
//!
//! A frame that fails to decrypt, decompress or decode is logged and dropped.
//! Its caller, if any, only learns about it through a receive timeout.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::{
    frame, CipherKey, Envelope, Fields, Reassembler, Request, RequestId, SessionKeys,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use x25519_dalek::PublicKey;

use super::pending::{PendingTable, Termination, DEFAULT_MAX_PENDING};
use super::SessionState;
use crate::error::{ClientError, Result};
use crate::pool::TransformPool;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives requests initiated by the node.
pub trait RequestHandler: Send + Sync {
    /// Called once per inbound `Request` envelope, on a worker task.
    fn on_request(&self, request: Request);
}

/// Handler that logs and discards server-initiated requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRequestHandler;

impl RequestHandler for LoggingRequestHandler {
    fn on_request(&self, request: Request) {
        tracing::debug!(
            id = %request.id,
            fields = request.fields.len(),
            "Ignoring request initiated by node"
        );
    }
}

/// Per-session settings.
#[derive(Clone)]
pub struct SessionOptions {
    /// Bound on the pending-response table.
    pub max_pending: usize,
    /// Where node-initiated requests go.
    pub handler: Arc<dyn RequestHandler>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            handler: Arc::new(LoggingRequestHandler),
        }
    }
}

/// State shared with the inbound task.
struct Shared {
    pool: TransformPool,
    cipher: CipherKey,
    pending: PendingTable,
    handler: Arc<dyn RequestHandler>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl Shared {
    fn disconnect(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Disconnected;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::warn!(reason, "Session disconnected");
            self.pending.fail_all(Termination::Disconnected);
        }
    }

    async fn process_frame(&self, permit: OwnedSemaphorePermit, frame: Bytes) {
        let frame_len = frame.len();
        let plaintext = match self
            .pool
            .open_permitted(permit, frame.to_vec(), self.cipher)
            .await
        {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(frame_len, error = %e, "Dropping frame that failed to open");
                return;
            }
        };

        let envelope = match Envelope::from_msgpack(&plaintext) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(frame_len, error = %e, "Dropping frame with undecodable envelope");
                return;
            }
        };

        match envelope {
            Envelope::Response(_) => {
                tracing::trace!(id = %envelope.id(), "Response received");
                self.pending.deliver(envelope);
            }
            Envelope::Request(request) => self.handler.on_request(request),
        }
    }
}

async fn run_inbound<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut reassembler = Reassembler::new();

    loop {
        let read = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            read = reader.read_buf(reassembler.buffer_mut()) => read,
        };

        match read {
            Ok(0) => {
                shared.disconnect("node closed the connection");
                break;
            }
            Ok(n) => tracing::trace!(bytes = n, buffered = reassembler.buffered(), "Read"),
            Err(e) => {
                tracing::debug!(error = %e, "Read failed");
                shared.disconnect("read failed");
                break;
            }
        }

        let frames = match reassembler.drain() {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!(error = %e, "Frame reassembly failed");
                shared.disconnect("frame reassembly failed");
                break;
            }
        };

        for frame in frames {
            let permit = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                permit = shared.pool.acquire() => permit,
            };
            let Ok(permit) = permit else {
                shared.disconnect("transform pool closed");
                return;
            };
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.process_frame(permit, frame).await });
        }
    }

    tracing::debug!("Inbound loop stopped");
}

/// Active session over one stream.
pub struct SessionManager {
    shared: Arc<Shared>,
    writer: Mutex<BoxedWriter>,
    keys: SessionKeys,
    inbound: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Takes over a stream that has just completed the handshake and starts
    /// the inbound loop. The session starts `Active`.
    pub fn start<S>(
        stream: S,
        keys: SessionKeys,
        pool: TransformPool,
        options: SessionOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (state, _) = watch::channel(SessionState::Active);

        let shared = Arc::new(Shared {
            pool,
            cipher: keys.cipher_key(),
            pending: PendingTable::new(options.max_pending),
            handler: options.handler,
            state,
            cancel: CancellationToken::new(),
        });

        let inbound = tokio::spawn(run_inbound(reader, Arc::clone(&shared)));

        Self {
            shared,
            writer: Mutex::new(Box::new(writer)),
            keys,
            inbound: std::sync::Mutex::new(Some(inbound)),
        }
    }

    /// Sends a request and returns its correlation id without waiting for
    /// the response.
    pub async fn send(&self, fields: Fields) -> Result<RequestId> {
        self.ensure_active()?;

        let id = self.shared.pending.reserve();
        match self.write_request(id, fields).await {
            Ok(()) => {
                tracing::trace!(id = %id, "Request sent");
                Ok(id)
            }
            Err(e) => {
                self.shared.pending.release(id);
                Err(e)
            }
        }
    }

    async fn write_request(&self, id: RequestId, fields: Fields) -> Result<()> {
        let envelope = Envelope::Request(Request::new(id, fields));
        let plaintext = envelope.to_msgpack()?;
        let ciphertext = self.shared.pool.seal(plaintext, self.shared.cipher).await?;
        let framed = frame(&ciphertext)?;

        let mut writer = self.writer.lock().await;
        // Re-check under the lock so nothing is written after close().
        self.ensure_active()?;
        let written = async {
            writer.write_all(&framed).await?;
            writer.flush().await
        }
        .await;
        drop(writer);

        if let Err(e) = written {
            self.shared.disconnect("write failed");
            return Err(ClientError::Io(e));
        }
        Ok(())
    }

    /// Waits for the response to `id`.
    pub async fn receive(&self, id: RequestId, timeout: Duration) -> Result<Envelope> {
        self.shared.pending.receive(id, timeout).await
    }

    /// Sends a request and waits for its response.
    pub async fn request(&self, fields: Fields, timeout: Duration) -> Result<Envelope> {
        let id = self.send(fields).await?;
        self.receive(id, timeout).await
    }

    /// Stops the inbound loop, fails outstanding waits and shuts the stream.
    pub async fn close(&self) {
        let changed = self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        self.shared.cancel.cancel();
        self.shared.pending.fail_all(Termination::Closed);

        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = inbound {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Inbound task ended abnormally");
            }
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "Stream shutdown failed");
        }
        tracing::info!("Session closed");
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Returns true while the session accepts requests.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Watches state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// The node's public key from the handshake.
    pub fn remote_public_key(&self) -> &PublicKey {
        self.keys.remote_public_key()
    }

    /// Number of outstanding correlation slots.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            SessionState::Closed => Err(ClientError::Closed),
            _ => Err(ClientError::Disconnected),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("pending", &self.shared.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{
        derive_nonce, query_fields, CryptoCodec, HandshakeEngine, Response, StandardCodec,
    };
    use rand::rngs::OsRng;
    use tokio::io::{duplex, DuplexStream};
    use x25519_dalek::StaticSecret;

    struct Node {
        io: DuplexStream,
        key: CipherKey,
        codec: StandardCodec,
    }

    impl Node {
        async fn read_envelope(&mut self) -> Envelope {
            let len = self.io.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            self.io.read_exact(&mut body).await.unwrap();
            let plaintext = self.codec.open(body, self.key).unwrap();
            Envelope::from_msgpack(&plaintext).unwrap()
        }

        async fn write_envelope(&mut self, envelope: &Envelope) {
            let sealed = self
                .codec
                .seal(envelope.to_msgpack().unwrap(), self.key)
                .unwrap();
            self.io.write_all(&frame(&sealed).unwrap()).await.unwrap();
        }

        async fn respond(&mut self, id: RequestId, tag: &str) {
            let mut fields = Fields::new();
            fields.insert("tag".to_string(), rmpv::Value::from(tag));
            self.write_envelope(&Envelope::Response(Response::new(id, fields)))
                .await;
        }
    }

    async fn connected(options: SessionOptions) -> (SessionManager, Node) {
        let (mut client_io, mut node_io) = duplex(1 << 16);

        let node_secret = StaticSecret::random_from_rng(OsRng);
        node_io
            .write_all(PublicKey::from(&node_secret).as_bytes())
            .await
            .unwrap();
        let keys = HandshakeEngine::new().perform(&mut client_io).await.unwrap();

        let mut client_public = [0u8; 32];
        node_io.read_exact(&mut client_public).await.unwrap();
        let shared = node_secret
            .diffie_hellman(&PublicKey::from(client_public))
            .to_bytes();
        let key = CipherKey::new(shared, derive_nonce(&shared));
        assert_eq!(key, keys.cipher_key());

        let pool = TransformPool::new(Arc::new(StandardCodec::default()), 2);
        let session = SessionManager::start(client_io, keys, pool, options);
        let node = Node {
            io: node_io,
            key,
            codec: StandardCodec::default(),
        };
        (session, node)
    }

    fn tag(envelope: &Envelope) -> Option<&str> {
        envelope.fields().get("tag").and_then(|v| v.as_str())
    }

    #[tokio::test]
    async fn test_request_reaches_node_and_response_returns() {
        let (session, mut node) = connected(SessionOptions::default()).await;

        let id = session.send(query_fields("Ping")).await.unwrap();
        let seen = node.read_envelope().await;
        assert_eq!(seen.id(), id);
        assert!(!seen.is_response());
        assert_eq!(
            seen.fields().get("q").and_then(|v| v.as_str()),
            Some("Ping")
        );

        node.respond(id, "pong").await;
        let response = session.receive(id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(tag(&response), Some("pong"));
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_routed_by_id() {
        let (session, mut node) = connected(SessionOptions::default()).await;
        let session = Arc::new(session);

        let (a, b) = tokio::join!(
            session.send(query_fields("A")),
            session.send(query_fields("B"))
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);

        let first = node.read_envelope().await;
        let second = node.read_envelope().await;
        let mut ids = vec![first.id(), second.id()];
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);

        node.respond(b, "b").await;
        node.respond(a, "a").await;

        let got_a = session.receive(a, Duration::from_secs(2)).await.unwrap();
        let got_b = session.receive(b, Duration::from_secs(2)).await.unwrap();
        assert_eq!(got_a.id(), a);
        assert_eq!(tag(&got_a), Some("a"));
        assert_eq!(tag(&got_b), Some("b"));
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped_and_loop_continues() {
        let (session, mut node) = connected(SessionOptions::default()).await;

        let id = session.send(query_fields("Ping")).await.unwrap();
        node.read_envelope().await;

        node.io
            .write_all(&frame(&[0xAB; 40]).unwrap())
            .await
            .unwrap();
        node.respond(id, "after garbage").await;

        let response = session.receive(id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(tag(&response), Some("after garbage"));
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_node_hangup_disconnects_and_wakes_waiters() {
        let (session, node) = connected(SessionOptions::default()).await;
        let session = Arc::new(session);
        let mut states = session.subscribe_state();

        let id = session.send(query_fields("Ping")).await.unwrap();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.receive(id, Duration::from_secs(30)).await })
        };

        drop(node);

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
        assert!(matches!(result, Err(ClientError::Disconnected)));

        states
            .wait_for(|s| *s == SessionState::Disconnected)
            .await
            .unwrap();
        assert!(matches!(
            session.send(query_fields("Ping")).await,
            Err(ClientError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_close_fails_waiters_with_closed() {
        let (session, _node) = connected(SessionOptions::default()).await;
        let session = Arc::new(session);

        let id = session.send(query_fields("Ping")).await.unwrap();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.receive(id, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.close().await;

        assert!(matches!(waiter.await.unwrap(), Err(ClientError::Closed)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.send(query_fields("Ping")).await,
            Err(ClientError::Closed)
        ));
        // Idempotent.
        session.close().await;
    }

    #[tokio::test]
    async fn test_node_requests_go_to_handler() {
        struct Collect(tokio::sync::mpsc::UnboundedSender<Request>);

        impl RequestHandler for Collect {
            fn on_request(&self, request: Request) {
                let _ = self.0.send(request);
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let options = SessionOptions {
            handler: Arc::new(Collect(tx)),
            ..SessionOptions::default()
        };
        let (session, mut node) = connected(options).await;

        node.write_envelope(&Envelope::Request(Request::new(
            RequestId(9),
            query_fields("Announce"),
        )))
        .await;

        let request = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.id, RequestId(9));
        assert_eq!(session.pending_len(), 0);
    }
}
