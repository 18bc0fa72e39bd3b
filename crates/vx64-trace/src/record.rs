use std::io::{Read, Write};

use vx64_cpu_core::CpuSnapshot;

use crate::error::{Result, TraceError};
use crate::io::{bytes_size, string_size, Bounded, ReadLeExt, WriteLeExt};

/// Record type tag, stored as the first `u32` of every record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKind(pub u32);

const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

impl RecordKind {
    pub const CPU_STATE: RecordKind = RecordKind(fourcc(b"CPU0"));
    pub const STEP: RecordKind = RecordKind(fourcc(b"STEP"));
    pub const MEMORY_EVENT: RecordKind = RecordKind(fourcc(b"MEM0"));
    pub const LOCATION: RecordKind = RecordKind(fourcc(b"LOC0"));
    pub const SYSTEM_LOG: RecordKind = RecordKind(fourcc(b"SLOG"));
    pub const EOF: RecordKind = RecordKind(fourcc(b"EOF0"));

    pub fn name(self) -> Option<&'static str> {
        match self {
            RecordKind::CPU_STATE => Some("CPU_STATE"),
            RecordKind::STEP => Some("STEP"),
            RecordKind::MEMORY_EVENT => Some("MEMORY_EVENT"),
            RecordKind::LOCATION => Some("LOCATION"),
            RecordKind::SYSTEM_LOG => Some("SYSTEM_LOG"),
            RecordKind::EOF => Some("EOF"),
            _ => None,
        }
    }
}

/// One executed instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub index: u64,
    pub pc: u64,
    pub machine_code: Vec<u8>,
    pub disassembly: Option<String>,
    /// Architectural state before the instruction ran.
    pub state: CpuSnapshot,
}

/// One guest memory access. `size` is in bytes (1, 2, 4, 8 or 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEvent {
    pub address: u64,
    pub size: u8,
    pub write: bool,
    pub value: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub filename: Option<String>,
    pub symbol: Option<String>,
    pub offset: u64,
    pub pc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemLog {
    pub pc: u64,
    pub tid: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    CpuState(CpuSnapshot),
    Step(Step),
    MemoryEvent(MemoryEvent),
    Location(Location),
    SystemLog(SystemLog),
    Eof,
}

const MAX_VECTOR_REGS: u32 = 32;

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::CpuState(_) => RecordKind::CPU_STATE,
            Record::Step(_) => RecordKind::STEP,
            Record::MemoryEvent(_) => RecordKind::MEMORY_EVENT,
            Record::Location(_) => RecordKind::LOCATION,
            Record::SystemLog(_) => RecordKind::SYSTEM_LOG,
            Record::Eof => RecordKind::EOF,
        }
    }

    /// Bytes [`Record::write_payload`] emits.
    pub fn payload_size(&self) -> usize {
        match self {
            Record::CpuState(s) => snapshot_size(s),
            Record::Step(s) => {
                8 + 8
                    + bytes_size(Some(s.machine_code.as_slice()))
                    + string_size(s.disassembly.as_deref())
                    + snapshot_size(&s.state)
            }
            Record::MemoryEvent(_) => 8 + 1 + 1 + 16,
            Record::Location(l) => {
                string_size(l.filename.as_deref()) + string_size(l.symbol.as_deref()) + 8 + 8
            }
            Record::SystemLog(l) => 8 + 8 + string_size(Some(l.message.as_str())),
            Record::Eof => 0,
        }
    }

    pub fn write_payload<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        match self {
            Record::CpuState(s) => write_snapshot(w, s),
            Record::Step(s) => {
                w.write_u64_le(s.index)?;
                w.write_u64_le(s.pc)?;
                w.write_opt_bytes(Some(s.machine_code.as_slice()))?;
                w.write_opt_string(s.disassembly.as_deref())?;
                write_snapshot(w, &s.state)
            }
            Record::MemoryEvent(e) => {
                w.write_u64_le(e.address)?;
                w.write_u8(e.size)?;
                w.write_u8(u8::from(e.write))?;
                w.write_u128_le(e.value)
            }
            Record::Location(l) => {
                w.write_opt_string(l.filename.as_deref())?;
                w.write_opt_string(l.symbol.as_deref())?;
                w.write_u64_le(l.offset)?;
                w.write_u64_le(l.pc)
            }
            Record::SystemLog(l) => {
                w.write_u64_le(l.pc)?;
                w.write_u64_le(l.tid)?;
                w.write_opt_string(Some(l.message.as_str()))
            }
            Record::Eof => Ok(()),
        }
    }

    /// Parses the payload of a known record kind; `Ok(None)` for unknown kinds.
    pub(crate) fn read_payload<R: Read>(
        kind: RecordKind,
        r: &mut Bounded<R>,
    ) -> Result<Option<Self>> {
        let record = match kind {
            RecordKind::CPU_STATE => Record::CpuState(read_snapshot(r)?),
            RecordKind::STEP => Record::Step(Step {
                index: r.read_u64_le()?,
                pc: r.read_u64_le()?,
                machine_code: r.read_bytes_field()?.unwrap_or_default(),
                disassembly: r.read_string_field()?,
                state: read_snapshot(r)?,
            }),
            RecordKind::MEMORY_EVENT => {
                let address = r.read_u64_le()?;
                let size = r.read_u8()?;
                if !matches!(size, 1 | 2 | 4 | 8 | 16) {
                    return Err(TraceError::Corrupt("memory event size"));
                }
                let write = match r.read_u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(TraceError::Corrupt("memory event direction")),
                };
                Record::MemoryEvent(MemoryEvent {
                    address,
                    size,
                    write,
                    value: r.read_u128_le()?,
                })
            }
            RecordKind::LOCATION => Record::Location(Location {
                filename: r.read_string_field()?,
                symbol: r.read_string_field()?,
                offset: r.read_u64_le()?,
                pc: r.read_u64_le()?,
            }),
            RecordKind::SYSTEM_LOG => Record::SystemLog(SystemLog {
                pc: r.read_u64_le()?,
                tid: r.read_u64_le()?,
                message: r.read_string_field()?.unwrap_or_default(),
            }),
            RecordKind::EOF => Record::Eof,
            _ => return Ok(None),
        };
        Ok(Some(record))
    }
}

fn snapshot_size(s: &CpuSnapshot) -> usize {
    // rip, rflags, 16 GPRs, fs/gs base, vector count, vectors
    8 * (2 + 16 + 2) + 4 + s.vectors.len() * 64
}

fn write_snapshot<W: Write + ?Sized>(w: &mut W, s: &CpuSnapshot) -> Result<()> {
    w.write_u64_le(s.rip)?;
    w.write_u64_le(s.rflags)?;
    for v in s.gpr {
        w.write_u64_le(v)?;
    }
    w.write_u64_le(s.fs_base)?;
    w.write_u64_le(s.gs_base)?;
    let count: u32 = s
        .vectors
        .len()
        .try_into()
        .ok()
        .filter(|&n| n <= MAX_VECTOR_REGS)
        .ok_or(TraceError::Corrupt("too many vector registers"))?;
    w.write_u32_le(count)?;
    for reg in &s.vectors {
        for word in reg {
            w.write_u64_le(*word)?;
        }
    }
    Ok(())
}

fn read_snapshot<R: Read + ?Sized>(r: &mut R) -> Result<CpuSnapshot> {
    let rip = r.read_u64_le()?;
    let rflags = r.read_u64_le()?;
    let mut gpr = [0u64; 16];
    for v in &mut gpr {
        *v = r.read_u64_le()?;
    }
    let fs_base = r.read_u64_le()?;
    let gs_base = r.read_u64_le()?;
    let count = r.read_u32_le()?;
    if count > MAX_VECTOR_REGS {
        return Err(TraceError::Corrupt("too many vector registers"));
    }
    let mut vectors = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut words = [0u64; 8];
        for w in &mut words {
            *w = r.read_u64_le()?;
        }
        vectors.push(words);
    }
    Ok(CpuSnapshot {
        rip,
        rflags,
        gpr,
        fs_base,
        gs_base,
        vectors,
    })
}
