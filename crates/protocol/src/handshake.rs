//! X25519 key exchange run at the start of every connection.
//!
//! ## Exchange
//! ```text
//! <- peer public key      (32 raw bytes, unframed)
//! -> our public key       (32 raw bytes, unframed)
//! ```
//!
//! The node speaks first. Once its key has arrived we generate a fresh key
//! pair, compute the Diffie-Hellman shared secret, reply with our public key and
//! derive the session nonce from the secret (see [`crate::nonce`]). There is no
//! acknowledgment message: the first frame the node can decrypt is the proof
//! that both sides derived the same key.
//!
//! ## Limitations
//!
//! Neither side authenticates the other. The exchange gives confidentiality
//! against a passive observer only; an active man-in-the-middle can substitute
//! both public keys and relay traffic unnoticed. Pin the node's public key
//! out-of-band if that matters for a deployment.

use std::time::Duration;

use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::HandshakeError;
use crate::nonce::{Nonce, NonceDeriver};
use crate::transform::CipherKey;

/// Length of an X25519 public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of the Diffie-Hellman shared secret in bytes.
pub const SHARED_SECRET_LENGTH: usize = 32;

/// Curve25519 u-coordinates of small order (and their non-canonical aliases
/// below 2^255). Any of them forces the shared secret into a tiny subgroup.
const LOW_ORDER_POINTS: [[u8; PUBLIC_KEY_LENGTH]; 7] = [
    // 0
    [0; 32],
    // 1
    [
        1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0,
    ],
    // order 8
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    // order 8
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    // p - 1
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p + 1
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
];

/// Checks a peer's raw public key before it is used in scalar multiplication.
pub fn validate_public_key(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<PublicKey, HandshakeError> {
    if LOW_ORDER_POINTS.iter().any(|point| point == bytes) {
        return Err(HandshakeError::InvalidKey(
            "public key is a low-order curve point".to_string(),
        ));
    }
    Ok(PublicKey::from(*bytes))
}

/// Key material produced by one successful handshake.
///
/// Owned by exactly one session and never mutated; a reconnect produces a new
/// value. The shared secret is zeroed on drop.
pub struct SessionKeys {
    local_public: PublicKey,
    local_private: StaticSecret,
    remote_public: PublicKey,
    shared_secret: [u8; SHARED_SECRET_LENGTH],
    nonce: Nonce,
}

impl SessionKeys {
    /// Our ephemeral public key, as sent to the peer.
    pub fn local_public_key(&self) -> &PublicKey {
        &self.local_public
    }

    /// Our ephemeral private key.
    pub fn local_private_key(&self) -> &StaticSecret {
        &self.local_private
    }

    /// The peer's public key, as received.
    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public
    }

    /// The Diffie-Hellman shared secret.
    pub fn shared_secret(&self) -> &[u8; SHARED_SECRET_LENGTH] {
        &self.shared_secret
    }

    /// The nonce derived from the shared secret.
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Key and nonce in the form the cipher needs.
    pub fn cipher_key(&self) -> CipherKey {
        CipherKey::new(self.shared_secret, self.nonce)
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("local_public", &self.local_public.as_bytes())
            .field("remote_public", &self.remote_public.as_bytes())
            .field("local_private", &"[REDACTED]")
            .field("shared_secret", &"[REDACTED]")
            .finish()
    }
}

/// Runs the client side of the key exchange.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeEngine<'a> {
    nonces: &'a NonceDeriver,
    timeout: Option<Duration>,
}

impl HandshakeEngine<'static> {
    /// Creates an engine backed by the process-wide nonce deriver.
    pub fn new() -> Self {
        Self::with_deriver(NonceDeriver::global())
    }
}

impl Default for HandshakeEngine<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> HandshakeEngine<'a> {
    /// Creates an engine backed by a specific nonce deriver.
    pub fn with_deriver(nonces: &'a NonceDeriver) -> Self {
        Self {
            nonces,
            timeout: None,
        }
    }

    /// Bounds how long to wait for the peer's public key.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Performs the exchange over `stream`.
    ///
    /// On success the stream is positioned at the first length-prefixed frame.
    pub async fn perform<S>(&self, stream: &mut S) -> Result<SessionKeys, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer_key = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, read_peer_key(stream))
                .await
                .map_err(|_| HandshakeError::TimedOut(limit))??,
            None => read_peer_key(stream).await?,
        };
        let remote_public = validate_public_key(&peer_key)?;

        let local_private = StaticSecret::random_from_rng(OsRng);
        let local_public = PublicKey::from(&local_private);

        let shared = local_private.diffie_hellman(&remote_public);
        if !shared.was_contributory() {
            return Err(HandshakeError::InvalidKey(
                "shared secret is degenerate".to_string(),
            ));
        }

        stream.write_all(local_public.as_bytes()).await?;
        stream.flush().await?;

        let shared_secret = shared.to_bytes();
        let nonce = self.nonces.derive(&shared_secret);

        tracing::debug!(
            remote_key = ?remote_public.as_bytes(),
            "Key exchange complete"
        );

        Ok(SessionKeys {
            local_public,
            local_private,
            remote_public,
            shared_secret,
            nonce,
        })
    }
}

async fn read_peer_key<S>(stream: &mut S) -> Result<[u8; PUBLIC_KEY_LENGTH], HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut key = [0u8; PUBLIC_KEY_LENGTH];
    match stream.read_exact(&mut key).await {
        Ok(_) => Ok(key),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(HandshakeError::PeerClosed),
        Err(e) => Err(HandshakeError::Io(e)),
    }
}
