#![forbid(unsafe_code)]
//! Varints, a checked decoding cursor, and the write-then-read `ByteHolder`.

use std::io::Read;

use crate::types::{Result, StoreError};

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use super::{Result, StoreError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(StoreError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(StoreError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StoreError::Corruption("varint longer than 10 bytes"))
    }

    /// Encodes an i64 as a ZigZag varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        encode_u64(((v << 1) ^ (v >> 63)) as u64, out);
    }

    /// Decodes a ZigZag varint.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let zigzag = decode_u64(src, off)?;
        Ok(((zigzag >> 1) as i64) ^ (-((zigzag & 1) as i64)))
    }

    /// Appends a varint length followed by the bytes.
    pub fn put_bytes(bytes: &[u8], out: &mut Vec<u8>) {
        encode_u64(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }
}

pub mod buf {
    //! Slice-backed cursor used by every decoder in the crate.

    use core::fmt;

    use super::{var, Result, StoreError};

    /// Reads fixed and variable width fields from a slice, failing with
    /// [`StoreError::Corruption`] instead of panicking on short input.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a cursor at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Current offset.
        pub fn position(&self) -> usize {
            self.off
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or(StoreError::Corruption("record truncated"))?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Bytes left to read.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Everything not yet read.
        pub fn rest(&mut self) -> &'a [u8] {
            let slice = &self.buf[self.off.min(self.buf.len())..];
            self.off = self.buf.len();
            slice
        }

        /// Reads one byte.
        pub fn read_u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a little-endian u16.
        pub fn read_u16(&mut self) -> Result<u16> {
            let mut raw = [0u8; 2];
            raw.copy_from_slice(self.take(2)?);
            Ok(u16::from_be_bytes(raw))
        }

        /// Reads a little-endian u32.
        pub fn read_u32(&mut self) -> Result<u32> {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(self.take(4)?);
            Ok(u32::from_be_bytes(raw))
        }

        /// Reads a little-endian u64.
        pub fn read_u64(&mut self) -> Result<u64> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(raw))
        }

        /// Reads an unsigned varint.
        pub fn read_var_u64(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads an unsigned varint that must fit in a u32.
        pub fn read_var_u32(&mut self) -> Result<u32> {
            u32::try_from(self.read_var_u64()?)
                .map_err(|_| StoreError::Corruption("varint exceeds u32"))
        }

        /// Reads a ZigZag varint.
        pub fn read_var_i64(&mut self) -> Result<i64> {
            var::decode_i64(self.buf, &mut self.off)
        }

        /// Reads bytes written by [`var::put_bytes`].
        pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
            let len = usize::try_from(self.read_var_u64()?)
                .map_err(|_| StoreError::Corruption("length exceeds usize"))?;
            self.take(len)
        }

        /// Fails unless every byte was consumed.
        pub fn finish(&self) -> Result<()> {
            if self.remaining() == 0 {
                Ok(())
            } else {
                Err(StoreError::Corruption("trailing bytes after record"))
            }
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}

/// Growable buffer that is first written, then read sequentially.
///
/// Transactions use one as the scratch area for optional log data, and long
/// columns are streamed through one when a row is split across pages.
#[derive(Debug, Default)]
pub struct ByteHolder {
    data: Vec<u8>,
    read_pos: usize,
    reading: bool,
}

impl ByteHolder {
    /// Creates an empty holder in writing mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty holder with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Appends a single byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.ensure_writing()?;
        self.data.push(byte);
        Ok(())
    }

    /// Appends a slice.
    pub fn write_slice(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_writing()?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Copies up to `count` bytes from `src`, returning how many were copied.
    pub fn write_from<R: Read>(&mut self, src: &mut R, count: usize) -> Result<usize> {
        self.ensure_writing()?;
        let before = self.data.len();
        src.by_ref().take(count as u64).read_to_end(&mut self.data)?;
        Ok(self.data.len() - before)
    }

    /// Switches to reading mode, rewinding to the first byte.
    pub fn start_reading(&mut self) {
        self.reading = true;
        self.read_pos = 0;
    }

    /// Whether the holder still accepts writes.
    pub fn writing_mode(&self) -> bool {
        !self.reading
    }

    /// Bytes still to be read in reading mode, or zero while writing.
    pub fn available(&self) -> usize {
        if self.reading {
            self.data.len() - self.read_pos
        } else {
            0
        }
    }

    /// Total bytes written since the last clear.
    pub fn num_bytes_saved(&self) -> usize {
        self.data.len()
    }

    /// Skips up to `count` unread bytes.
    pub fn skip(&mut self, count: usize) -> usize {
        let n = count.min(self.available());
        self.read_pos += n;
        n
    }

    /// Drops the bytes already read and returns to writing mode, keeping the
    /// unread tail at the front.
    pub fn shift_to_front(&mut self) {
        let consumed = if self.reading { self.read_pos } else { 0 };
        self.data.drain(..consumed);
        self.read_pos = 0;
        self.reading = false;
    }

    /// Empties the holder and returns to writing mode.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.reading = false;
    }

    /// Everything written, regardless of read position.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn ensure_writing(&self) -> Result<()> {
        if self.reading {
            Err(StoreError::Invalid("byte holder is in reading mode"))
        } else {
            Ok(())
        }
    }
}

impl std::io::Write for ByteHolder {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_slice(buf)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::io::Read for ByteHolder {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if !self.reading {
            return Ok(0);
        }
        let n = out.len().min(self.available());
        out[..n].copy_from_slice(&self.data[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        Ok(n)
    }
}
