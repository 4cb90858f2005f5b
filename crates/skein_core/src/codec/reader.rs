//! # Message Reader
//!
//! Reads little-endian fields from a borrowed byte slice.

use bytemuck::Pod;

use super::error::{CodecError, CodecResult};

/// Field reader for message payloads.
pub struct MessageReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> MessageReader<'a> {
    /// Creates a reader over a payload.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Returns the number of bytes remaining.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Returns true once every byte has been consumed.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrows the next `count` bytes.
    #[inline]
    pub fn take(&mut self, count: usize) -> CodecResult<&'a [u8]> {
        if count > self.remaining() {
            return Err(CodecError::UnexpectedEnd {
                needed: count,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    /// Borrows everything not yet consumed.
    #[inline]
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buffer[self.position..];
        self.position = self.buffer.len();
        slice
    }

    #[inline]
    fn array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Reads a u16 in little-endian format.
    #[inline]
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    /// Reads a u32 in little-endian format.
    #[inline]
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    /// Reads a u64 in little-endian format.
    #[inline]
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    /// Reads an i8.
    #[inline]
    pub fn read_i8(&mut self) -> CodecResult<i8> {
        self.array().map(i8::from_le_bytes)
    }

    /// Reads an i16 in little-endian format.
    #[inline]
    pub fn read_i16(&mut self) -> CodecResult<i16> {
        self.array().map(i16::from_le_bytes)
    }

    /// Reads an i32 in little-endian format.
    #[inline]
    pub fn read_i32(&mut self) -> CodecResult<i32> {
        self.array().map(i32::from_le_bytes)
    }

    /// Reads an i64 in little-endian format.
    #[inline]
    pub fn read_i64(&mut self) -> CodecResult<i64> {
        self.array().map(i64::from_le_bytes)
    }

    /// Reads a f32 in little-endian format.
    #[inline]
    pub fn read_f32(&mut self) -> CodecResult<f32> {
        self.array().map(f32::from_le_bytes)
    }

    /// Reads a f64 in little-endian format.
    #[inline]
    pub fn read_f64(&mut self) -> CodecResult<f64> {
        self.array().map(f64::from_le_bytes)
    }

    /// Reads a bool; any non-zero byte is true.
    #[inline]
    pub fn read_bool(&mut self) -> CodecResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads length-prefixed bytes, borrowing them from the input.
    pub fn read_bytes(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Reads length-prefixed bytes into `out`, reusing its capacity.
    pub fn read_bytes_into(&mut self, out: &mut Vec<u8>) -> CodecResult<()> {
        let bytes = self.read_bytes()?;
        out.clear();
        out.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads a length-prefixed UTF-8 string, borrowing it from the input.
    pub fn read_str(&mut self) -> CodecResult<&'a str> {
        std::str::from_utf8(self.read_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Reads a length-prefixed UTF-8 string into `out`, reusing its
    /// capacity.
    pub fn read_string_into(&mut self, out: &mut String) -> CodecResult<()> {
        let value = self.read_str()?;
        out.clear();
        out.push_str(value);
        Ok(())
    }

    /// Reads a Pod type directly.
    #[inline]
    pub fn read_pod<T: Pod>(&mut self) -> CodecResult<T> {
        let slice = self.take(std::mem::size_of::<T>())?;
        bytemuck::try_pod_read_unaligned(slice).map_err(|_| CodecError::InvalidPod)
    }

    /// Reads a counted run of Pod values into `out`, reusing its capacity.
    pub fn read_pod_vec_into<T: Pod>(&mut self, out: &mut Vec<T>) -> CodecResult<()> {
        let count = self.read_u32()? as usize;
        let size = std::mem::size_of::<T>();
        let needed = count.checked_mul(size).ok_or(CodecError::UnexpectedEnd {
            needed: usize::MAX,
            remaining: self.remaining(),
        })?;
        let bytes = self.take(needed)?;
        out.clear();
        out.reserve(count);
        for chunk in bytes.chunks_exact(size.max(1)).take(count) {
            out.push(bytemuck::try_pod_read_unaligned(chunk).map_err(|_| CodecError::InvalidPod)?);
        }
        Ok(())
    }
}
