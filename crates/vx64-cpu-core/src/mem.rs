use std::sync::Arc;

use vx64_mem::{MemoryError, VirtualMemory};

/// Guest memory as seen by the interpreter.
///
/// [`VirtualMemory`] is the production implementation. The trait is the seam for wrappers that
/// observe accesses, such as a trace recorder.
pub trait CpuBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, MemoryError>;
    fn read_u16(&mut self, vaddr: u64) -> Result<u16, MemoryError>;
    fn read_u32(&mut self, vaddr: u64) -> Result<u32, MemoryError>;
    fn read_u64(&mut self, vaddr: u64) -> Result<u64, MemoryError>;
    fn read_u128(&mut self, vaddr: u64) -> Result<u128, MemoryError>;

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), MemoryError>;
    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), MemoryError>;
    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), MemoryError>;
    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), MemoryError>;
    fn write_u128(&mut self, vaddr: u64, val: u128) -> Result<(), MemoryError>;

    /// Reads up to `buf.len()` executable bytes; see [`VirtualMemory::fetch`].
    fn fetch(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<usize, MemoryError>;

    fn read_bytes(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.read_u8(vaddr.wrapping_add(i as u64))?;
        }
        Ok(())
    }

    fn write_bytes(&mut self, vaddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        for (i, b) in buf.iter().enumerate() {
            self.write_u8(vaddr.wrapping_add(i as u64), *b)?;
        }
        Ok(())
    }

    /// Width-generic read used by integer operand access; `bytes` is 1, 2, 4 or 8.
    fn read_sized(&mut self, vaddr: u64, bytes: usize) -> Result<u64, MemoryError> {
        Ok(match bytes {
            1 => self.read_u8(vaddr)?.into(),
            2 => self.read_u16(vaddr)?.into(),
            4 => self.read_u32(vaddr)?.into(),
            _ => self.read_u64(vaddr)?,
        })
    }

    fn write_sized(&mut self, vaddr: u64, bytes: usize, val: u64) -> Result<(), MemoryError> {
        match bytes {
            1 => self.write_u8(vaddr, val as u8),
            2 => self.write_u16(vaddr, val as u16),
            4 => self.write_u32(vaddr, val as u32),
            _ => self.write_u64(vaddr, val),
        }
    }
}

macro_rules! impl_cpu_bus {
    ($ty:ty) => {
        impl CpuBus for $ty {
            fn read_u8(&mut self, vaddr: u64) -> Result<u8, MemoryError> {
                VirtualMemory::read_u8(self, vaddr)
            }
            fn read_u16(&mut self, vaddr: u64) -> Result<u16, MemoryError> {
                VirtualMemory::read_u16(self, vaddr)
            }
            fn read_u32(&mut self, vaddr: u64) -> Result<u32, MemoryError> {
                VirtualMemory::read_u32(self, vaddr)
            }
            fn read_u64(&mut self, vaddr: u64) -> Result<u64, MemoryError> {
                VirtualMemory::read_u64(self, vaddr)
            }
            fn read_u128(&mut self, vaddr: u64) -> Result<u128, MemoryError> {
                VirtualMemory::read_u128(self, vaddr)
            }

            fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), MemoryError> {
                VirtualMemory::write_u8(self, vaddr, val)
            }
            fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), MemoryError> {
                VirtualMemory::write_u16(self, vaddr, val)
            }
            fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), MemoryError> {
                VirtualMemory::write_u32(self, vaddr, val)
            }
            fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), MemoryError> {
                VirtualMemory::write_u64(self, vaddr, val)
            }
            fn write_u128(&mut self, vaddr: u64, val: u128) -> Result<(), MemoryError> {
                VirtualMemory::write_u128(self, vaddr, val)
            }

            fn fetch(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
                VirtualMemory::fetch(self, vaddr, buf)
            }

            fn read_bytes(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
                VirtualMemory::read_bytes(self, vaddr, buf)
            }
            fn write_bytes(&mut self, vaddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
                VirtualMemory::write_bytes(self, vaddr, buf)
            }
        }
    };
}

impl_cpu_bus!(VirtualMemory);
impl_cpu_bus!(Arc<VirtualMemory>);
impl_cpu_bus!(&VirtualMemory);
