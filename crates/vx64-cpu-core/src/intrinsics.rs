//! Host implementations of common libc routines, installed at guest addresses.
//!
//! An intrinsic executes as if the guest had `call`ed a conforming System V function: arguments
//! in RDI/RSI/RDX, result in RAX, and the return address popped from `[RSP]`.

use std::collections::BTreeMap;

use vx64_types::Gpr;
use vx64_x86::IntrinsicId;

use crate::error::Result;
use crate::mem::CpuBus;
use crate::state::CpuState;

const CHUNK: usize = 4096;

/// Guest addresses that run an intrinsic instead of decoding guest bytes.
#[derive(Debug, Clone, Default)]
pub struct IntrinsicTable {
    by_addr: BTreeMap<u64, IntrinsicId>,
}

impl IntrinsicTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `id` at `addr`, returning whatever was registered there before.
    pub fn register(&mut self, addr: u64, id: IntrinsicId) -> Option<IntrinsicId> {
        self.by_addr.insert(addr, id)
    }

    pub fn unregister(&mut self, addr: u64) -> Option<IntrinsicId> {
        self.by_addr.remove(&addr)
    }

    #[must_use]
    pub fn get(&self, addr: u64) -> Option<IntrinsicId> {
        self.by_addr.get(&addr).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, IntrinsicId)> + '_ {
        self.by_addr.iter().map(|(&addr, &id)| (addr, id))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

/// Runs `id` against the current state and returns the address to continue at.
pub fn exec<B: CpuBus>(id: IntrinsicId, state: &mut CpuState, bus: &mut B) -> Result<u64> {
    let rsp = state.gpr(Gpr::Rsp);
    let ret = bus.read_u64(rsp)?;
    let (rdi, rsi, rdx) = (
        state.gpr(Gpr::Rdi),
        state.gpr(Gpr::Rsi),
        state.gpr(Gpr::Rdx),
    );

    let rax = match id {
        IntrinsicId::Strlen => scan(bus, rdi, |_| false)?.wrapping_sub(rdi),
        IntrinsicId::Strchrnul => scan(bus, rdi, |b| b == rsi as u8)?,
        IntrinsicId::Memcpy => {
            let mut buf = [0u8; CHUNK];
            let mut done = 0u64;
            while done < rdx {
                let n = (rdx - done).min(CHUNK as u64) as usize;
                bus.read_bytes(rsi.wrapping_add(done), &mut buf[..n])?;
                bus.write_bytes(rdi.wrapping_add(done), &buf[..n])?;
                done += n as u64;
            }
            rdi
        }
        IntrinsicId::Memset => {
            let buf = [rsi as u8; CHUNK];
            let mut done = 0u64;
            while done < rdx {
                let n = (rdx - done).min(CHUNK as u64) as usize;
                bus.write_bytes(rdi.wrapping_add(done), &buf[..n])?;
                done += n as u64;
            }
            rdi
        }
    };

    state.set_gpr(Gpr::Rax, rax);
    state.set_gpr(Gpr::Rsp, rsp.wrapping_add(8));
    Ok(ret)
}

/// Address of the first NUL byte at or after `start`, or of the first byte matching `stop`.
fn scan<B: CpuBus>(bus: &mut B, start: u64, stop: impl Fn(u8) -> bool) -> Result<u64> {
    let mut addr = start;
    loop {
        let b = bus.read_u8(addr)?;
        if b == 0 || stop(b) {
            return Ok(addr);
        }
        addr = addr.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_and_unregister_removes() {
        let mut table = IntrinsicTable::new();
        assert!(table.is_empty());
        assert_eq!(table.register(0x1000, IntrinsicId::Strlen), None);
        assert_eq!(
            table.register(0x1000, IntrinsicId::Memset),
            Some(IntrinsicId::Strlen)
        );
        table.register(0x800, IntrinsicId::Memcpy);
        let all: Vec<_> = table.iter().collect();
        assert_eq!(
            all,
            vec![(0x800, IntrinsicId::Memcpy), (0x1000, IntrinsicId::Memset)]
        );
        assert_eq!(table.unregister(0x1000), Some(IntrinsicId::Memset));
        assert_eq!(table.get(0x1000), None);
    }
}
