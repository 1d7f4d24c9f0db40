//! Payload encoding: MessagePack body, Snappy framed compression, and a pool
//! of reusable encoders.
//!
//! An [`Encoder`] owns two growable buffers (the serialized body and its
//! compressed form). Reusing them across exports keeps the steady state free
//! of large allocations. Encoders that grew past [`MAX_RETAINED_CAPACITY`]
//! while encoding an unusually large batch are shrunk on reset so the pool
//! does not pin that memory forever.

use crate::invariants::debug_assert_encoder_reset;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use thiserror::Error;

/// `Content-Type` of every upload.
pub const CONTENT_TYPE: &str = "application/msgpack";
/// `Content-Encoding` of every upload. S2 readers accept the Snappy framing format.
pub const CONTENT_ENCODING: &str = "s2";

/// Capacity a fresh encoder starts with.
pub const INITIAL_CAPACITY: usize = 64 * 1024;
/// Buffers larger than this are shrunk back to [`INITIAL_CAPACITY`] on reset.
pub const MAX_RETAINED_CAPACITY: usize = 4 * 1024 * 1024;
/// Default number of idle encoders kept by an [`EncoderPool`].
pub const DEFAULT_MAX_IDLE: usize = 16;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("msgpack serialization failed: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("compression failed: {0}")]
    Compress(#[from] io::Error),

    #[error("msgpack deserialization failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Reusable MessagePack + Snappy encoder.
#[derive(Debug)]
pub struct Encoder {
    buf: Vec<u8>,
    compressed: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
            compressed: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    fn unallocated() -> Self {
        Self {
            buf: Vec::new(),
            compressed: Vec::new(),
        }
    }

    /// Serializes `value` as MessagePack with named struct fields.
    ///
    /// The returned slice is valid until the next call on this encoder.
    pub fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&[u8], EncodeError> {
        self.buf.clear();
        rmp_serde::encode::write_named(&mut self.buf, value)?;
        Ok(&self.buf)
    }

    /// Serializes `value` and compresses the result with the Snappy frame format.
    pub fn encode_compressed<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<&[u8], EncodeError> {
        self.encode(value)?;

        let mut out = std::mem::take(&mut self.compressed);
        out.clear();
        let mut writer = FrameEncoder::new(out);
        writer.write_all(&self.buf)?;
        self.compressed = writer
            .into_inner()
            .map_err(|err| io::Error::new(err.error().kind(), err.error().to_string()))?;
        Ok(&self.compressed)
    }

    /// Drops buffered bytes, shrinking buffers that outgrew the retention bound.
    pub fn reset(&mut self) {
        for buf in [&mut self.buf, &mut self.compressed] {
            buf.clear();
            if buf.capacity() > MAX_RETAINED_CAPACITY {
                buf.shrink_to(INITIAL_CAPACITY);
            }
        }
    }

    /// Returns `true` when no bytes from a previous payload are held.
    pub fn is_reset(&self) -> bool {
        self.buf.is_empty()
            && self.compressed.is_empty()
            && self.buf.capacity() <= MAX_RETAINED_CAPACITY
            && self.compressed.capacity() <= MAX_RETAINED_CAPACITY
    }

    /// Combined capacity of the internal buffers.
    pub fn capacity(&self) -> usize {
        self.buf.capacity() + self.compressed.capacity()
    }
}

/// Pool of idle encoders shared by concurrent export tasks.
#[derive(Debug)]
pub struct EncoderPool {
    free: Mutex<Vec<Encoder>>,
    max_idle: usize,
}

impl Default for EncoderPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl EncoderPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Takes an idle encoder or creates one. Dropping the guard returns it.
    pub fn acquire(&self) -> PooledEncoder<'_> {
        let encoder = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_default();
        debug_assert_encoder_reset!(encoder);
        PooledEncoder {
            pool: self,
            encoder,
        }
    }

    /// Resets `encoder` and keeps it for reuse unless the pool is full.
    pub fn release(&self, mut encoder: Encoder) {
        encoder.reset();
        let mut free = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if free.len() < self.max_idle {
            free.push(encoder);
        }
    }

    /// Number of idle encoders.
    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Encoder borrowed from an [`EncoderPool`].
pub struct PooledEncoder<'a> {
    pool: &'a EncoderPool,
    encoder: Encoder,
}

impl Deref for PooledEncoder<'_> {
    type Target = Encoder;

    fn deref(&self) -> &Encoder {
        &self.encoder
    }
}

impl DerefMut for PooledEncoder<'_> {
    fn deref_mut(&mut self) -> &mut Encoder {
        &mut self.encoder
    }
}

impl Drop for PooledEncoder<'_> {
    fn drop(&mut self) {
        let encoder = std::mem::replace(&mut self.encoder, Encoder::unallocated());
        self.pool.release(encoder);
    }
}

/// Decodes a MessagePack body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EncodeError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Decompresses a Snappy framed body and decodes the MessagePack inside.
pub fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EncodeError> {
    let mut raw = Vec::with_capacity(bytes.len() * 2);
    FrameDecoder::new(bytes).read_to_end(&mut raw)?;
    decode(&raw)
}
