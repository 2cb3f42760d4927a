//! Length-prefixed framing and streaming reassembly.
//!
//! # Frame Format
//!
//! Each frame on the wire consists of:
//! - 4 bytes: payload length (big-endian, unsigned)
//! - N bytes: payload (ciphertext of one envelope)
//!
//! No maximum is enforced beyond what the 32-bit prefix can describe; callers
//! that need a tighter bound must cap payloads before framing them.
//!
//! # Reassembly
//!
//! TCP delivers a byte stream, not messages. [`FrameCodec`] is a two-state
//! decoder (awaiting length, awaiting body) that pulls complete frames out of a
//! buffer and leaves any trailing partial frame in place. [`Reassembler`] owns
//! the buffer and the codec so a read loop can feed it arbitrary chunks.
//!
//! A short buffer is never an error: a length prefix that has not fully
//! arrived and a body that is still in flight both mean "more data needed".

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{ProtocolError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload a 4-byte prefix can describe.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Frames a payload: 4-byte big-endian length followed by the payload.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    let mut output = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    encode_into(payload, &mut output)?;
    Ok(output.to_vec())
}

/// Appends a framed payload to `dst`.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: payload.len(),
        max: MAX_PAYLOAD_SIZE,
    })?;

    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingLength,
    AwaitingBody(usize),
}

/// Incremental decoder for length-prefixed frames.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
}

impl FrameCodec {
    /// Create a codec waiting for the first length prefix.
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingLength,
        }
    }

    /// Length of the frame currently being assembled, if its prefix has been read.
    pub fn expected_len(&self) -> Option<usize> {
        match self.state {
            DecodeState::AwaitingLength => None,
            DecodeState::AwaitingBody(len) => Some(len),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let len = match self.state {
            DecodeState::AwaitingLength => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let prefix = src.split_to(LENGTH_PREFIX_SIZE);
                let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
                self.state = DecodeState::AwaitingBody(len);
                len
            }
            DecodeState::AwaitingBody(len) => len,
        };

        // The prefix is untrusted, so the body is not preallocated.
        if src.len() < len {
            return Ok(None);
        }

        self.state = DecodeState::AwaitingLength;
        Ok(Some(src.split_to(len).freeze()))
    }
}

/// Buffer plus decoder: the read side of the framing layer.
///
/// Owned by exactly one reader. Every call to [`Reassembler::drain`] extracts
/// all frames that are complete in the buffer, in order, and returns without
/// waiting for more input.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
    codec: FrameCodec,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(chunk);
        self.drain()
    }

    /// Extract all complete frames currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Mutable access to the buffer, for reading directly from a socket.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Length of the frame currently being assembled, if known.
    pub fn expected_len(&self) -> Option<usize> {
        self.codec.expected_len()
    }
}
