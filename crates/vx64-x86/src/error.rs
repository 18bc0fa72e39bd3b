use core::fmt;

use thiserror::Error;

/// Architectural upper bound on the length of one instruction.
pub const MAX_INST_LEN: usize = 15;

/// Up to [`MAX_INST_LEN`] raw instruction bytes, stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawBytes {
    buf: [u8; MAX_INST_LEN],
    len: u8,
}

impl RawBytes {
    /// Copies at most [`MAX_INST_LEN`] leading bytes of `bytes`.
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_INST_LEN);
        let mut buf = [0u8; MAX_INST_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            buf,
            len: len as u8,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for RawBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawBytes({self})")
    }
}

impl fmt::Display for RawBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.as_slice().iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    /// The byte stream ended inside the instruction.
    UnexpectedEof,
    /// The encoding exceeds [`MAX_INST_LEN`] bytes.
    TooLong,
    /// The encoding is architecturally undefined.
    Invalid,
    /// Valid encoding outside the implemented instruction subset.
    Unsupported,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecodeErrorKind::UnexpectedEof => "unexpected end of instruction bytes",
            DecodeErrorKind::TooLong => "instruction longer than 15 bytes",
            DecodeErrorKind::Invalid => "invalid instruction",
            DecodeErrorKind::Unsupported => "unsupported instruction",
        })
    }
}

/// Decode failure for the instruction at `addr`.
///
/// `bytes` holds the bytes consumed up to the point of failure, so the embedder can render them
/// as data or substitute an intrinsic at `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at 0x{addr:x}: [{bytes}]")]
pub struct DecodeError {
    pub addr: u64,
    pub bytes: RawBytes,
    pub kind: DecodeErrorKind,
}
