use std::io::{self, ErrorKind, Read, Write};

use crate::error::{Result, TraceError};

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u128_le(&mut self, v: u128) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    /// `u16` length then UTF-8 bytes. `None` and `""` both encode as length 0.
    fn write_opt_string(&mut self, s: Option<&str>) -> Result<()> {
        let bytes = s.unwrap_or_default().as_bytes();
        let len: u16 = bytes
            .len()
            .try_into()
            .map_err(|_| TraceError::Corrupt("string does not fit in u16"))?;
        self.write_u16_le(len)?;
        self.write_all(bytes)?;
        Ok(())
    }

    /// `u32` length then the bytes. `None` and empty both encode as length 0.
    fn write_opt_bytes(&mut self, data: Option<&[u8]>) -> Result<()> {
        let data = data.unwrap_or_default();
        let len: u32 = data
            .len()
            .try_into()
            .map_err(|_| TraceError::Corrupt("array does not fit in u32"))?;
        self.write_u32_le(len)?;
        self.write_all(data)?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u128_le(&mut self) -> Result<u128> {
        let mut buf = [0u8; 16];
        self.read_exact(&mut buf)?;
        Ok(u128::from_le_bytes(buf))
    }

    fn read_opt_string(&mut self) -> Result<Option<String>> {
        let len = self.read_u16_le()?;
        string_body(self, len)
    }

    fn read_opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_u32_le()?;
        bytes_body(self, len)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

/// Payload size of an optional string.
pub(crate) fn string_size(s: Option<&str>) -> usize {
    2 + s.map_or(0, str::len)
}

/// Payload size of an optional byte array.
pub(crate) fn bytes_size(data: Option<&[u8]>) -> usize {
    4 + data.map_or(0, <[u8]>::len)
}

fn string_body<R: Read + ?Sized>(r: &mut R, len: u16) -> Result<Option<String>> {
    match bytes_body(r, u32::from(len))? {
        Some(buf) => Ok(Some(String::from_utf8(buf)?)),
        None => Ok(None),
    }
}

/// Reads `len` bytes, growing the buffer only as data arrives.
fn bytes_body<R: Read + ?Sized>(r: &mut R, len: u32) -> Result<Option<Vec<u8>>> {
    if len == 0 {
        return Ok(None);
    }
    let mut buf = Vec::new();
    Read::take(&mut *r, u64::from(len)).read_to_end(&mut buf)?;
    if buf.len() as u64 != u64::from(len) {
        return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
    }
    Ok(Some(buf))
}

/// Record payload reader limited to the size declared in the record header.
///
/// Reads past the limit see end of stream, and the reader remembers how far into the payload
/// the decoder wanted to go.
pub(crate) struct Bounded<R> {
    inner: R,
    remaining: u64,
    consumed: u64,
    wanted: Option<u64>,
}

impl<R: Read> Bounded<R> {
    pub(crate) fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            consumed: 0,
            wanted: None,
        }
    }

    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Payload size the decoder needed, if it ran past the limit.
    pub(crate) fn overrun(&self) -> Option<u64> {
        self.wanted
    }

    fn claim(&mut self, len: u64) -> Result<()> {
        if len > self.remaining {
            self.wanted = Some(self.consumed + len);
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    /// Like [`ReadLeExt::read_opt_string`], rejecting a length the payload cannot hold.
    pub(crate) fn read_string_field(&mut self) -> Result<Option<String>> {
        let len = self.read_u16_le()?;
        self.claim(u64::from(len))?;
        string_body(self, len)
    }

    /// Like [`ReadLeExt::read_opt_bytes`], rejecting a length the payload cannot hold.
    pub(crate) fn read_bytes_field(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_u32_le()?;
        self.claim(u64::from(len))?;
        bytes_body(self, len)
    }
}

impl<R: Read> Read for Bounded<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            self.wanted.get_or_insert(self.consumed + buf.len() as u64);
            return Ok(0);
        }
        let max = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..max])?;
        self.remaining -= n as u64;
        self.consumed += n as u64;
        Ok(n)
    }
}
