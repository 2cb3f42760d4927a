//! Compression and encryption of frame payloads.
//!
//! Outbound envelopes are compressed and then encrypted; inbound frames are
//! decrypted and then decompressed. The [`CryptoCodec`] trait is the boundary:
//! callers hand it one [`TransformTask`] at a time and get bytes back. The
//! methods are synchronous and CPU-bound, so async callers should run them on a
//! blocking pool.
//!
//! [`StandardCodec`] is the implementation the nodes speak: IETF ChaCha20 keyed
//! by the handshake's shared secret and derived nonce, with zstd (or lz4)
//! compression.
//!
//! Every message of a session is encrypted with the same key and nonce, so
//! keystreams repeat across messages. That is what the nodes expect; it is not
//! a property to copy into a new protocol.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce as ChaChaNonce};
use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::handshake::SHARED_SECRET_LENGTH;
use crate::nonce::Nonce;

/// Default zstd compression level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Symmetric key plus nonce for one session.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CipherKey {
    key: [u8; SHARED_SECRET_LENGTH],
    nonce: Nonce,
}

impl CipherKey {
    /// Creates a cipher key from raw parts.
    pub fn new(key: [u8; SHARED_SECRET_LENGTH], nonce: Nonce) -> Self {
        Self { key, nonce }
    }

    /// The 32-byte ChaCha20 key.
    pub fn key(&self) -> &[u8; SHARED_SECRET_LENGTH] {
        &self.key
    }

    /// The 12-byte ChaCha20 nonce.
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("key", &"[REDACTED]")
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// One unit of work for a [`CryptoCodec`].
#[derive(Debug, Clone)]
pub enum TransformTask {
    /// Encrypt `data` with the session cipher.
    Encrypt { data: Vec<u8>, key: CipherKey },
    /// Decrypt `data` with the session cipher.
    Decrypt { data: Vec<u8>, key: CipherKey },
    /// Compress `data`.
    Compress { data: Vec<u8> },
    /// Decompress `data`.
    Decompress { data: Vec<u8> },
}

impl TransformTask {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            TransformTask::Encrypt { .. } => "encrypt",
            TransformTask::Decrypt { .. } => "decrypt",
            TransformTask::Compress { .. } => "compress",
            TransformTask::Decompress { .. } => "decompress",
        }
    }
}

/// Stateless compression/encryption service.
pub trait CryptoCodec: Send + Sync {
    /// Runs one task and returns the transformed bytes.
    fn transform(&self, task: TransformTask) -> Result<Vec<u8>, TransformError>;

    /// Compress-then-encrypt, the outbound pipeline.
    fn seal(&self, plaintext: Vec<u8>, key: CipherKey) -> Result<Vec<u8>, TransformError> {
        let compressed = self.transform(TransformTask::Compress { data: plaintext })?;
        self.transform(TransformTask::Encrypt {
            data: compressed,
            key,
        })
    }

    /// Decrypt-then-decompress, the inbound pipeline.
    fn open(&self, ciphertext: Vec<u8>, key: CipherKey) -> Result<Vec<u8>, TransformError> {
        let compressed = self.transform(TransformTask::Decrypt {
            data: ciphertext,
            key,
        })?;
        self.transform(TransformTask::Decompress { data: compressed })
    }
}

/// Compression algorithm applied before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum Compression {
    /// zstd frame at the given level.
    Zstd { level: i32 },
    /// LZ4 block with a little-endian size prefix.
    Lz4,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

/// ChaCha20 plus zstd/lz4: the codec the nodes speak.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec {
    compression: Compression,
}

impl StandardCodec {
    /// Creates a codec with the given compression.
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    /// The configured compression.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    fn apply_keystream(mut data: Vec<u8>, key: &CipherKey) -> Result<Vec<u8>, String> {
        let mut cipher = ChaCha20::new(
            Key::from_slice(key.key()),
            ChaChaNonce::from_slice(key.nonce()),
        );
        cipher
            .try_apply_keystream(&mut data)
            .map_err(|e| e.to_string())?;
        Ok(data)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        match self.compression {
            Compression::Zstd { level } => zstd::stream::encode_all(data, level)
                .map_err(|e| TransformError::Compression(e.to_string())),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        match self.compression {
            Compression::Zstd { .. } => zstd::stream::decode_all(data)
                .map_err(|e| TransformError::Decompression(e.to_string())),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| TransformError::Decompression(e.to_string())),
        }
    }
}

impl CryptoCodec for StandardCodec {
    fn transform(&self, task: TransformTask) -> Result<Vec<u8>, TransformError> {
        match task {
            TransformTask::Encrypt { data, key } => {
                Self::apply_keystream(data, &key).map_err(TransformError::Encryption)
            }
            TransformTask::Decrypt { data, key } => {
                Self::apply_keystream(data, &key).map_err(TransformError::Decryption)
            }
            TransformTask::Compress { data } => self.compress(&data),
            TransformTask::Decompress { data } => self.decompress(&data),
        }
    }
}
