//! # NodeLink Protocol Library
//!
//! Transport-agnostic building blocks of the NodeLink wire protocol.
//!
//! ## Overview
//!
//! - **Envelopes**: `Request`/`Response` messages correlated by id, MessagePack-encoded
//! - **Handshake**: one round-trip X25519 key exchange over any async byte stream
//! - **Nonce derivation**: SHA-256 fold of the shared secret, memoized in a bounded LRU
//! - **Transforms**: compress-then-encrypt boundary and its ChaCha20 + zstd/lz4 implementation
//! - **Framing**: 4-byte big-endian length prefix and streaming reassembly
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Envelopes                 │  MessagePack, named fields
//! ├─────────────────────────────────────────┤
//! │         Compression + Encryption        │  zstd/lz4, ChaCha20
//! ├─────────────────────────────────────────┤
//! │                Framing                  │  u32 BE length prefix
//! ├─────────────────────────────────────────┤
//! │    Handshake (raw 32-byte keys, once)   │  X25519
//! ├─────────────────────────────────────────┤
//! │                  TCP                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Security
//!
//! The handshake is unauthenticated: an active attacker can substitute its own
//! public key in both directions. Every message of a session is encrypted with
//! the same key and nonce. Both properties are required for compatibility with
//! deployed nodes and are not fixed here.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{frame, query_fields, Envelope, Reassembler, Request, RequestId};
//!
//! let envelope = Envelope::Request(Request::new(RequestId(1), query_fields("Ping")));
//! let bytes = envelope.to_msgpack().unwrap();
//!
//! let mut reassembler = Reassembler::new();
//! let frames = reassembler.feed(&frame(&bytes).unwrap()).unwrap();
//! assert_eq!(Envelope::from_msgpack(&frames[0]).unwrap(), envelope);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Envelope definitions
//! - [`handshake`]: Key exchange and session key material
//! - [`nonce`]: Nonce derivation
//! - [`transform`]: Compression/encryption boundary
//! - [`framing`]: Frame encoding and reassembly
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod nonce;
pub mod transform;

pub use error::{HandshakeError, ProtocolError, Result, TransformError};
pub use framing::{
    encode_into, frame, FrameCodec, Reassembler, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE,
};
pub use handshake::{
    validate_public_key, HandshakeEngine, SessionKeys, PUBLIC_KEY_LENGTH, SHARED_SECRET_LENGTH,
};
pub use messages::{query_fields, Envelope, Fields, Request, RequestId, Response};
pub use nonce::{derive_nonce, Nonce, NonceDeriver, NONCE_LENGTH};
pub use transform::{
    CipherKey, Compression, CryptoCodec, StandardCodec, TransformTask, DEFAULT_ZSTD_LEVEL,
};
