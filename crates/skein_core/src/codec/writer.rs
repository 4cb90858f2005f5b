//! # Message Writer
//!
//! Appends little-endian fields to a caller-owned vector.
//!
//! ## Design
//!
//! - Writes into a pooled buffer's vector, so no intermediate allocation
//! - Every write is checked against the size limit before touching the output
//! - Direct memory copies for Pod types

use bytemuck::{bytes_of, cast_slice, Pod};

use super::error::{CodecError, CodecResult};
use super::MAX_MESSAGE_SIZE;

/// Field writer for message payloads.
pub struct MessageWriter<'a> {
    out: &'a mut Vec<u8>,
    start: usize,
    limit: usize,
}

impl<'a> MessageWriter<'a> {
    /// Creates a writer appending to `out` with the default size limit.
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self::with_limit(out, MAX_MESSAGE_SIZE)
    }

    /// Creates a writer appending to `out`, refusing to grow it by more
    /// than `limit` bytes.
    pub fn with_limit(out: &'a mut Vec<u8>, limit: usize) -> Self {
        let start = out.len();
        Self { out, start, limit }
    }

    /// Number of bytes written through this writer.
    #[inline]
    #[must_use]
    pub fn written(&self) -> usize {
        self.out.len() - self.start
    }

    #[inline]
    fn ensure(&self, additional: usize) -> CodecResult<()> {
        let size = self.written() + additional;
        if size > self.limit {
            return Err(CodecError::TooLarge {
                size,
                max: self.limit,
            });
        }
        Ok(())
    }

    /// Writes raw bytes without a length prefix.
    #[inline]
    pub fn write_raw(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.ensure(bytes.len())?;
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) -> CodecResult<()> {
        self.write_raw(&[value])
    }

    /// Writes a u16 in little-endian format.
    #[inline]
    pub fn write_u16(&mut self, value: u16) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes a u32 in little-endian format.
    #[inline]
    pub fn write_u32(&mut self, value: u32) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes a u64 in little-endian format.
    #[inline]
    pub fn write_u64(&mut self, value: u64) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes an i8.
    #[inline]
    pub fn write_i8(&mut self, value: i8) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes an i16 in little-endian format.
    #[inline]
    pub fn write_i16(&mut self, value: i16) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes an i32 in little-endian format.
    #[inline]
    pub fn write_i32(&mut self, value: i32) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes an i64 in little-endian format.
    #[inline]
    pub fn write_i64(&mut self, value: i64) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes a f32 in little-endian format.
    #[inline]
    pub fn write_f32(&mut self, value: f32) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes a f64 in little-endian format.
    #[inline]
    pub fn write_f64(&mut self, value: f64) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Writes a bool as one byte.
    #[inline]
    pub fn write_bool(&mut self, value: bool) -> CodecResult<()> {
        self.write_u8(u8::from(value))
    }

    /// Writes a u32 length prefix followed by the bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| CodecError::TooLarge {
            size: bytes.len(),
            max: self.limit,
        })?;
        self.ensure(4 + bytes.len())?;
        self.out.extend_from_slice(&len.to_le_bytes());
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string.
    #[inline]
    pub fn write_str(&mut self, value: &str) -> CodecResult<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes a Pod type directly.
    #[inline]
    pub fn write_pod<T: Pod>(&mut self, value: &T) -> CodecResult<()> {
        self.write_raw(bytes_of(value))
    }

    /// Writes a u32 element count followed by the raw elements.
    pub fn write_pod_slice<T: Pod>(&mut self, values: &[T]) -> CodecResult<()> {
        let count = u32::try_from(values.len()).map_err(|_| CodecError::TooLarge {
            size: values.len(),
            max: self.limit,
        })?;
        let bytes: &[u8] = cast_slice(values);
        self.ensure(4 + bytes.len())?;
        self.out.extend_from_slice(&count.to_le_bytes());
        self.out.extend_from_slice(bytes);
        Ok(())
    }
}
