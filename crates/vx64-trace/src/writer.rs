use std::io::Write;

use crate::error::{Result, TraceError};
use crate::io::WriteLeExt;
use crate::record::Record;

/// Streams framed records to `W`.
pub struct TraceWriter<W: Write> {
    out: W,
    records: u64,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, records: 0 }
    }

    /// Number of records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn write(&mut self, record: &Record) -> Result<()> {
        let kind = record.kind();
        let declared: u32 = record
            .payload_size()
            .try_into()
            .map_err(|_| TraceError::Corrupt("record payload does not fit in u32"))?;
        // Encode first so a rejected record leaves nothing behind in `out`.
        let mut payload = Vec::with_capacity(declared as usize);
        record.write_payload(&mut payload)?;
        let actual = payload.len() as u64;
        if actual != u64::from(declared) {
            return Err(TraceError::SizeMismatch {
                kind: kind.0,
                declared,
                actual,
            });
        }
        self.out.write_u32_le(kind.0)?;
        self.out.write_u32_le(declared)?;
        self.out.write_all(&payload)?;
        self.records += 1;
        Ok(())
    }

    /// Appends an [`Record::Eof`] marker, flushes and returns the sink.
    pub fn finish(mut self) -> Result<W> {
        self.write(&Record::Eof)?;
        self.out.flush()?;
        Ok(self.out)
    }
}
