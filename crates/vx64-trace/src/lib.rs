#![forbid(unsafe_code)]

//! Binary execution trace framing.
//!
//! A trace is a sequence of records, each `{kind: u32 LE, size: u32 LE, payload}`. The writer
//! checks it emitted exactly `size` payload bytes and the reader checks it consumed exactly
//! `size`; either mismatch is [`TraceError::SizeMismatch`].

mod error;
mod io;
mod reader;
mod record;
mod writer;

pub use error::{Result, TraceError};
pub use io::{ReadLeExt, WriteLeExt};
pub use reader::TraceReader;
pub use record::{Location, MemoryEvent, Record, RecordKind, Step, SystemLog};
pub use writer::TraceWriter;
