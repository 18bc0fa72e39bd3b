use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TraceError>;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record's payload did not match the size in its header. `actual` is the size the
    /// payload needed, which for an overrun is counted up to the first field that did not fit.
    #[error("record {kind:#010x}: declared {declared} bytes, payload was {actual}")]
    SizeMismatch { kind: u32, declared: u32, actual: u64 },

    #[error("corrupt trace: {0}")]
    Corrupt(&'static str),

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
