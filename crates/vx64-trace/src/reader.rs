use std::io::{self, ErrorKind, Read};

use tracing::warn;

use crate::error::{Result, TraceError};
use crate::io::{Bounded, ReadLeExt};
use crate::record::{Record, RecordKind};

/// Reads framed records from `R`. Unknown record kinds are skipped.
pub struct TraceReader<R: Read> {
    input: R,
}

impl<R: Read> TraceReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    /// Next known record, or `None` at a clean end of stream.
    ///
    /// A stream that ends inside a header or payload is an I/O error. A payload that is shorter
    /// or longer than its declared size is [`TraceError::SizeMismatch`]; field lengths are
    /// checked against the declared size before anything is allocated.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let Some(kind) = self.read_kind()? else {
                return Ok(None);
            };
            let declared = self.input.read_u32_le()?;

            let mut payload = Bounded::new(&mut self.input, u64::from(declared));
            let record = match Record::read_payload(kind, &mut payload) {
                Ok(record) => record,
                // A field that runs past `declared` is a framing error, not a short stream.
                Err(e) => {
                    return Err(match payload.overrun() {
                        Some(actual) => TraceError::SizeMismatch {
                            kind: kind.0,
                            declared,
                            actual,
                        },
                        None => e,
                    })
                }
            };
            if record.is_none() {
                warn!(
                    kind = format_args!("{:#010x}", kind.0),
                    size = declared,
                    "unknown trace record"
                );
                io::copy(&mut payload, &mut io::sink())?;
                if payload.consumed() != u64::from(declared) {
                    return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
                }
            }

            let actual = payload.consumed();
            if actual != u64::from(declared) {
                return Err(TraceError::SizeMismatch {
                    kind: kind.0,
                    declared,
                    actual,
                });
            }
            if let Some(record) = record {
                return Ok(Some(record));
            }
        }
    }

    /// Record type, or `None` if the stream ends before its first byte.
    fn read_kind(&mut self) -> Result<Option<RecordKind>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.input.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(RecordKind(u32::from_le_bytes(buf))))
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
