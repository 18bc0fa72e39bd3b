use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use vx64_cpu_core::{fetch, BatchExit, BatchResult, CpuBus, Engine};
use vx64_mem::{MemoryError, VirtualMemory};
use vx64_trace::{MemoryEvent, Record, Step, TraceWriter};

/// [`CpuBus`] that remembers every data access it forwards. Code fetches are not recorded.
struct RecordingBus {
    inner: Arc<VirtualMemory>,
    events: Vec<MemoryEvent>,
}

impl RecordingBus {
    fn log(&mut self, address: u64, size: u8, write: bool, value: u128) {
        self.events.push(MemoryEvent {
            address,
            size,
            write,
            value,
        });
    }

    /// Logs a bulk transfer as the fewest events of at most 16 bytes each.
    fn log_bytes(&mut self, mut address: u64, mut bytes: &[u8], write: bool) {
        while !bytes.is_empty() {
            let size = [16, 8, 4, 2, 1]
                .into_iter()
                .find(|&n| n <= bytes.len())
                .unwrap_or(1);
            let (piece, rest) = bytes.split_at(size);
            let mut le = [0u8; 16];
            le[..size].copy_from_slice(piece);
            self.log(address, size as u8, write, u128::from_le_bytes(le));
            address = address.wrapping_add(size as u64);
            bytes = rest;
        }
    }
}

macro_rules! recorded {
    ($read:ident, $write:ident, $ty:ty, $size:expr) => {
        fn $read(&mut self, vaddr: u64) -> Result<$ty, MemoryError> {
            let v = VirtualMemory::$read(&self.inner, vaddr)?;
            self.log(vaddr, $size, false, u128::from(v));
            Ok(v)
        }

        fn $write(&mut self, vaddr: u64, val: $ty) -> Result<(), MemoryError> {
            VirtualMemory::$write(&self.inner, vaddr, val)?;
            self.log(vaddr, $size, true, u128::from(val));
            Ok(())
        }
    };
}

impl CpuBus for RecordingBus {
    recorded!(read_u8, write_u8, u8, 1);
    recorded!(read_u16, write_u16, u16, 2);
    recorded!(read_u32, write_u32, u32, 4);
    recorded!(read_u64, write_u64, u64, 8);
    recorded!(read_u128, write_u128, u128, 16);

    fn fetch(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
        VirtualMemory::fetch(&self.inner, vaddr, buf)
    }

    fn read_bytes(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        VirtualMemory::read_bytes(&self.inner, vaddr, buf)?;
        self.log_bytes(vaddr, buf, false);
        Ok(())
    }

    // Same all-or-nothing behavior as the untraced bus; nothing is logged on a fault.
    fn write_bytes(&mut self, vaddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        VirtualMemory::write_bytes(&self.inner, vaddr, buf)?;
        self.log_bytes(vaddr, buf, true);
        Ok(())
    }
}

/// Single-steps an [`Engine`], writing a `Step` record and its memory events per instruction.
pub struct Recorder<W: Write> {
    writer: TraceWriter<W>,
    steps: u64,
}

impl<W: Write> Recorder<W> {
    pub fn new(writer: TraceWriter<W>) -> Self {
        Self { writer, steps: 0 }
    }

    pub fn write(&mut self, record: &Record) -> Result<()> {
        self.writer.write(record).context("failed to write trace record")
    }

    pub fn run(&mut self, engine: &mut Engine, max_insts: u64) -> Result<BatchResult> {
        let mut bus = RecordingBus {
            inner: Arc::clone(engine.memory()),
            events: Vec::new(),
        };
        let mut executed = 0;
        while executed < max_insts {
            let pc = engine.state().rip();
            // An undecodable instruction gets no step record; the run below reports the fault.
            if let Ok(inst) = fetch(&mut bus, pc, engine.intrinsics()) {
                let state = engine.state_mut().snapshot();
                self.write(&Record::Step(Step {
                    index: self.steps,
                    pc,
                    machine_code: inst.bytes.as_slice().to_vec(),
                    disassembly: Some(inst.to_string()),
                    state,
                }))?;
            }
            self.steps += 1;

            let res = engine.run_with(&mut bus, 1);
            for event in bus.events.drain(..) {
                self.write(&Record::MemoryEvent(event))?;
            }
            executed += res.executed;
            if res.exit != BatchExit::Completed {
                return Ok(BatchResult {
                    executed,
                    exit: res.exit,
                });
            }
        }
        Ok(BatchResult {
            executed,
            exit: BatchExit::Completed,
        })
    }

    /// Writes the final CPU state and the end marker.
    pub fn finish(mut self, engine: &mut Engine) -> Result<W> {
        let state = engine.state_mut().snapshot();
        self.write(&Record::CpuState(state))?;
        self.writer.finish().context("failed to finish trace")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_transfers_split_into_power_of_two_events() {
        let mut bus = RecordingBus {
            inner: Arc::new(VirtualMemory::new()),
            events: Vec::new(),
        };
        let data: Vec<u8> = (0..23).collect();
        bus.log_bytes(0x1000, &data, true);

        let sizes: Vec<u8> = bus.events.iter().map(|e| e.size).collect();
        assert_eq!(sizes, [16, 4, 2, 1]);
        assert_eq!(bus.events[1].address, 0x1010);
        assert_eq!(bus.events[1].value, u128::from(u32::from_le_bytes([16, 17, 18, 19])));
        assert_eq!(bus.events[3].value, 22);
    }

    #[test]
    fn failed_bulk_write_logs_nothing() {
        let mut bus = RecordingBus {
            inner: Arc::new(VirtualMemory::new()),
            events: Vec::new(),
        };
        assert!(bus.write_bytes(0x1000, &[0; 32]).is_err());
        assert!(bus.events.is_empty());
    }
}
