//! Operand binding and resolution.
//!
//! Decoded operands are descriptors. Binding turns them into [`Loc`]s once per instruction
//! instance (folding RIP-relative displacements, which depend only on the instruction address);
//! effective addresses are still computed from live registers on every access.

use vx64_types::{Gpr, Width};
use vx64_x86::{Address, Instruction, Operand, Reg, SegOverride, VecReg};

use crate::error::{CpuError, Result};
use crate::mem::CpuBus;
use crate::state::CpuState;

/// A bound memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    /// Displacement; absolute for operands that were RIP-relative.
    pub disp: u64,
    pub segment: Option<SegOverride>,
    pub addr32: bool,
}

impl MemRef {
    #[must_use]
    pub fn bind(addr: &Address, next_rip: u64) -> Self {
        let disp = addr.disp as i64 as u64;
        Self {
            base: addr.base,
            index: addr.index,
            scale: addr.scale,
            disp: if addr.rip_relative {
                next_rip.wrapping_add(disp)
            } else {
                disp
            },
            segment: addr.segment,
            addr32: addr.addr32,
        }
    }

    /// Address before the segment base is applied (what `lea` produces).
    #[must_use]
    pub fn offset(&self, state: &CpuState) -> u64 {
        let mut ea = self.disp;
        if let Some(base) = self.base {
            ea = ea.wrapping_add(state.gpr(base));
        }
        if let Some(index) = self.index {
            ea = ea.wrapping_add(state.gpr(index).wrapping_mul(u64::from(self.scale)));
        }
        if self.addr32 {
            ea &= 0xffff_ffff;
        }
        ea
    }

    /// Linear address of the access, including an FS/GS base.
    #[must_use]
    pub fn effective_address(&self, state: &CpuState) -> u64 {
        let ea = self.offset(state);
        match self.segment {
            Some(seg) => ea.wrapping_add(state.seg_base(seg)),
            None => ea,
        }
    }
}

/// A bound operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Gpr(Reg),
    Vec(VecReg),
    Mem(MemRef),
    Imm(u64),
}

impl Loc {
    #[must_use]
    pub fn bind(op: &Operand, next_rip: u64) -> Self {
        match op {
            Operand::Reg(r) => Loc::Gpr(*r),
            Operand::Vec(v) => Loc::Vec(*v),
            Operand::Mem(addr) => Loc::Mem(MemRef::bind(addr, next_rip)),
            Operand::Imm(v) => Loc::Imm(*v),
        }
    }

    #[must_use]
    pub fn address(&self, state: &CpuState) -> Option<u64> {
        match self {
            Loc::Mem(m) => Some(m.effective_address(state)),
            _ => None,
        }
    }

    /// Reads an integer operand, zero-extended from `width`.
    pub fn read<B: CpuBus>(&self, state: &CpuState, bus: &mut B, width: Width) -> Result<u64> {
        match self {
            Loc::Gpr(r) => Ok(state.read_reg(*r)),
            Loc::Imm(v) => Ok(width.truncate(*v)),
            Loc::Mem(m) => Ok(bus.read_sized(m.effective_address(state), width.bytes())?),
            Loc::Vec(_) => Err(CpuError::InvalidOpcode { rip: state.rip() }),
        }
    }

    pub fn write<B: CpuBus>(
        &self,
        state: &mut CpuState,
        bus: &mut B,
        width: Width,
        val: u64,
    ) -> Result<()> {
        match self {
            Loc::Gpr(r) => {
                state.write_reg(*r, val);
                Ok(())
            }
            Loc::Mem(m) => {
                bus.write_sized(m.effective_address(state), width.bytes(), val)?;
                Ok(())
            }
            Loc::Imm(_) | Loc::Vec(_) => Err(CpuError::InvalidOpcode { rip: state.rip() }),
        }
    }

    /// Reads a 128-bit operand (vector register or `m128`).
    pub fn read_xmm<B: CpuBus>(&self, state: &mut CpuState, bus: &mut B) -> Result<u128> {
        match self {
            Loc::Vec(v) => Ok(state.vec_mut(v.index as usize).xmm()),
            Loc::Mem(m) => Ok(bus.read_u128(m.effective_address(state))?),
            _ => Err(CpuError::InvalidOpcode { rip: state.rip() }),
        }
    }

    /// Legacy-SSE 128-bit store: register bits 128..512 are preserved.
    pub fn write_xmm<B: CpuBus>(&self, state: &mut CpuState, bus: &mut B, val: u128) -> Result<()> {
        match self {
            Loc::Vec(v) => {
                state.vec_mut(v.index as usize).set_xmm(val);
                Ok(())
            }
            Loc::Mem(m) => Ok(bus.write_u128(m.effective_address(state), val)?),
            _ => Err(CpuError::InvalidOpcode { rip: state.rip() }),
        }
    }
}

/// Resolved operand locations of one instruction, in [`vx64_x86::InstKind::operands`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    locs: [Loc; 3],
    len: u8,
}

impl Bound {
    #[must_use]
    pub fn new(inst: &Instruction) -> Self {
        let next_rip = inst.next_rip();
        let mut locs = [Loc::Imm(0); 3];
        let ops = inst.kind.operands();
        for (slot, op) in locs.iter_mut().zip(&ops) {
            *slot = Loc::bind(op, next_rip);
        }
        Self {
            locs,
            len: ops.len().min(3) as u8,
        }
    }

    #[must_use]
    pub fn locs(&self) -> &[Loc] {
        &self.locs[..self.len as usize]
    }

    /// Operand `i`. Out-of-range indices yield `Imm(0)`.
    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> Loc {
        self.locs[i.min(2)]
    }
}

/// A decoded instruction together with its lazily bound operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    decoded: Instruction,
    bound: Option<Bound>,
}

impl Inst {
    #[must_use]
    pub fn new(decoded: Instruction) -> Self {
        Self {
            decoded,
            bound: None,
        }
    }

    #[must_use]
    pub fn decoded(&self) -> &Instruction {
        &self.decoded
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Binds operands on first use and returns the cached binding afterwards.
    pub fn bind(&mut self) -> &Bound {
        let decoded = &self.decoded;
        self.bound.get_or_insert_with(|| Bound::new(decoded))
    }
}

impl From<Instruction> for Inst {
    fn from(decoded: Instruction) -> Self {
        Self::new(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vx64_x86::decode;

    #[test]
    fn rip_relative_folds_at_bind_time() {
        // mov rax, [rip+0x10] at 0x1000 (7 bytes)
        let inst = decode(0x1000, &[0x48, 0x8b, 0x05, 0x10, 0, 0, 0]).unwrap();
        let bound = Bound::new(&inst);
        let Loc::Mem(m) = bound.get(1) else {
            panic!("expected memory operand");
        };
        assert_eq!(m.base, None);
        assert_eq!(m.disp, 0x1017);
        assert_eq!(m.effective_address(&CpuState::new()), 0x1017);
    }

    #[test]
    fn effective_address_uses_live_registers() {
        // mov eax, [rbx+rcx*4-8]
        let inst = decode(0, &[0x8b, 0x44, 0x8b, 0xf8]).unwrap();
        let mut inst = Inst::new(inst);
        let loc = inst.bind().get(1);
        let mut state = CpuState::new();
        state.set_gpr(Gpr::Rbx, 0x1000);
        state.set_gpr(Gpr::Rcx, 2);
        assert_eq!(loc.address(&state), Some(0x1000));
        state.set_gpr(Gpr::Rcx, 4);
        assert_eq!(loc.address(&state), Some(0x1008));
        assert!(inst.is_bound());
    }

    #[test]
    fn addr32_truncates_before_segment_base() {
        let m = MemRef {
            base: Some(Gpr::Rax),
            index: None,
            scale: 1,
            disp: 0x10,
            segment: Some(SegOverride::Fs),
            addr32: true,
        };
        let mut state = CpuState::new();
        state.set_gpr(Gpr::Rax, 0x1_ffff_fff8);
        state.set_fs_base(0x7000_0000_0000);
        assert_eq!(m.offset(&state), 0x8);
        assert_eq!(m.effective_address(&state), 0x7000_0000_0008);
    }
}
