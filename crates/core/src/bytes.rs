//! Little-endian binary primitives for blob payloads.
//!
//! Strings and byte runs are prefixed with a 4-byte length.

use crate::error::{Error, Result};

/// Growable buffer writer
pub struct BytesWriter {
    buf: Vec<u8>,
}

impl BytesWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64),
        }
    }

    #[inline]
    pub fn push_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    #[inline]
    pub fn push_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    #[inline]
    pub fn push_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn push_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn push_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_f32s(&mut self, values: &[f32]) {
        for v in values {
            self.push_f32(*v);
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_string(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for BytesWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a borrowed buffer
pub struct BytesReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> BytesReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.off)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        match self.off.checked_add(len) {
            Some(end) if end <= self.buf.len() => {
                let start = self.off;
                self.off = end;
                Ok(&self.buf[start..end])
            }
            _ => Err(Error::Codec(format!(
                "read of {} bytes at offset {} out of bounds ({} total)",
                len,
                self.off,
                self.buf.len()
            ))),
        }
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Codec(format!("invalid bool byte {}", other))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32s<const N: usize>(&mut self) -> Result<[f32; N]> {
        let mut out = [0f32; N];
        for v in out.iter_mut() {
            *v = self.read_f32()?;
        }
        Ok(out)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| Error::Codec("invalid UTF-8 string".into()))
    }

    /// Read a 4-byte element count and guard it against the remaining input
    pub fn read_count(&mut self, element_size: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        let needed = count.saturating_mul(element_size);
        if needed > self.remaining() {
            return Err(Error::Codec(format!(
                "count {} exceeds remaining {} bytes",
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }

    /// Fail if any input is left unread
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::Codec(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}
