use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use vx64_types::{Cond, Gpr, Width};
use vx64_x86::{Reg, SegOverride};

use crate::vector::VectorReg;

bitflags! {
    /// Architectural RFLAGS bits modelled by the interpreter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RFlags: u64 {
        const CF = 1 << 0;
        /// Reserved, always reads as 1.
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const DF = 1 << 10;
        const OF = 1 << 11;

        /// Flags written by arithmetic instructions.
        const STATUS = Self::CF.bits()
            | Self::PF.bits()
            | Self::AF.bits()
            | Self::ZF.bits()
            | Self::SF.bits()
            | Self::OF.bits();
    }
}

pub const RFLAGS_RESERVED1: u64 = RFlags::RESERVED1.bits();

pub const VECTOR_REGS: usize = 16;

/// Register/flag file of one logical CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuState {
    gpr: [u64; 16],
    rip: u64,
    rflags: RFlags,
    fs_base: u64,
    gs_base: u64,
    vec: [VectorReg; VECTOR_REGS],
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: RFlags::RESERVED1,
            fs_base: 0,
            gs_base: 0,
            vec: [VectorReg::zeroed(); VECTOR_REGS],
        }
    }

    #[inline]
    #[must_use]
    pub fn rip(&self) -> u64 {
        self.rip
    }

    #[inline]
    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip;
    }

    #[inline]
    #[must_use]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg.index()]
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: Gpr, val: u64) {
        self.gpr[reg.index()] = val;
    }

    /// Reads a register view, zero-extended to 64 bits.
    #[must_use]
    pub fn read_reg(&self, reg: Reg) -> u64 {
        let full = self.gpr[reg.gpr.index()];
        if reg.high8 {
            (full >> 8) & 0xff
        } else {
            reg.width.truncate(full)
        }
    }

    /// Writes a register view with x86-64 merge rules: 32-bit writes zero-extend, 8/16-bit
    /// writes leave the remaining bits untouched.
    pub fn write_reg(&mut self, reg: Reg, val: u64) {
        let slot = &mut self.gpr[reg.gpr.index()];
        *slot = match (reg.width, reg.high8) {
            (Width::W8, true) => (*slot & !0xff00) | ((val & 0xff) << 8),
            (Width::W64, _) => val,
            (Width::W32, _) => val & 0xffff_ffff,
            (width, _) => (*slot & !width.mask()) | width.truncate(val),
        };
    }

    #[inline]
    #[must_use]
    pub fn rflags(&self) -> u64 {
        self.rflags.bits()
    }

    pub fn set_rflags(&mut self, flags: u64) {
        self.rflags = RFlags::from_bits_truncate(flags) | RFlags::RESERVED1;
    }

    #[inline]
    #[must_use]
    pub fn flag(&self, flag: RFlags) -> bool {
        self.rflags.contains(flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: RFlags, val: bool) {
        self.rflags.set(flag, val);
        self.rflags.insert(RFlags::RESERVED1);
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> RFlags {
        self.rflags
    }

    #[inline]
    pub fn set_flags(&mut self, flags: RFlags) {
        self.rflags = flags | RFlags::RESERVED1;
    }

    #[must_use]
    pub fn fs_base(&self) -> u64 {
        self.fs_base
    }

    pub fn set_fs_base(&mut self, base: u64) {
        self.fs_base = base;
    }

    #[must_use]
    pub fn gs_base(&self) -> u64 {
        self.gs_base
    }

    pub fn set_gs_base(&mut self, base: u64) {
        self.gs_base = base;
    }

    #[must_use]
    pub fn seg_base(&self, seg: SegOverride) -> u64 {
        match seg {
            SegOverride::Fs => self.fs_base,
            SegOverride::Gs => self.gs_base,
        }
    }

    #[must_use]
    pub fn vec(&self, index: usize) -> &VectorReg {
        &self.vec[index]
    }

    pub fn vec_mut(&mut self, index: usize) -> &mut VectorReg {
        &mut self.vec[index]
    }

    pub fn vectors_mut(&mut self) -> &mut [VectorReg; VECTOR_REGS] {
        &mut self.vec
    }

    /// Evaluates a `Jcc`/`SETcc`/`CMOVcc` condition against the current flags.
    #[must_use]
    pub fn cond(&self, cond: Cond) -> bool {
        let f = |flag| self.flag(flag);
        match cond {
            Cond::O => f(RFlags::OF),
            Cond::No => !f(RFlags::OF),
            Cond::B => f(RFlags::CF),
            Cond::Ae => !f(RFlags::CF),
            Cond::E => f(RFlags::ZF),
            Cond::Ne => !f(RFlags::ZF),
            Cond::Be => f(RFlags::CF) || f(RFlags::ZF),
            Cond::A => !f(RFlags::CF) && !f(RFlags::ZF),
            Cond::S => f(RFlags::SF),
            Cond::Ns => !f(RFlags::SF),
            Cond::P => f(RFlags::PF),
            Cond::Np => !f(RFlags::PF),
            Cond::L => f(RFlags::SF) != f(RFlags::OF),
            Cond::Ge => f(RFlags::SF) == f(RFlags::OF),
            Cond::Le => f(RFlags::ZF) || f(RFlags::SF) != f(RFlags::OF),
            Cond::G => !f(RFlags::ZF) && f(RFlags::SF) == f(RFlags::OF),
        }
    }

    /// Exports the architectural state. Cached scalars are materialized first.
    pub fn snapshot(&mut self) -> CpuSnapshot {
        CpuSnapshot {
            rip: self.rip,
            rflags: self.rflags(),
            gpr: self.gpr,
            fs_base: self.fs_base,
            gs_base: self.gs_base,
            vectors: self.vec.iter_mut().map(VectorReg::words).collect(),
        }
    }

    /// Inverse of [`CpuState::snapshot`]. Missing vector registers are zeroed.
    pub fn restore(&mut self, snapshot: &CpuSnapshot) {
        self.rip = snapshot.rip;
        self.set_rflags(snapshot.rflags);
        self.gpr = snapshot.gpr;
        self.fs_base = snapshot.fs_base;
        self.gs_base = snapshot.gs_base;
        for (i, reg) in self.vec.iter_mut().enumerate() {
            *reg = snapshot
                .vectors
                .get(i)
                .map_or_else(VectorReg::zeroed, |w| VectorReg::from_words(*w));
        }
    }
}

/// Materialized, serializable copy of a [`CpuState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub rip: u64,
    pub rflags: u64,
    pub gpr: [u64; 16],
    pub fs_base: u64,
    pub gs_base: u64,
    /// Each register as eight little-endian 64-bit words (512 bits).
    pub vectors: Vec<[u64; 8]>,
}

impl CpuSnapshot {
    #[must_use]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(gpr: Gpr, width: Width) -> Reg {
        Reg::new(gpr, width)
    }

    #[test]
    fn sub_register_writes_merge_or_zero_extend() {
        let mut s = CpuState::new();
        s.set_gpr(Gpr::Rax, 0x1122_3344_5566_7788);

        s.write_reg(reg(Gpr::Rax, Width::W8), 0xaa);
        assert_eq!(s.gpr(Gpr::Rax), 0x1122_3344_5566_77aa);

        s.write_reg(reg(Gpr::Rax, Width::W16), 0xbbcc);
        assert_eq!(s.gpr(Gpr::Rax), 0x1122_3344_5566_bbcc);

        s.write_reg(
            Reg {
                gpr: Gpr::Rax,
                width: Width::W8,
                high8: true,
            },
            0x1ee,
        );
        assert_eq!(s.gpr(Gpr::Rax), 0x1122_3344_5566_eecc);

        s.write_reg(reg(Gpr::Rax, Width::W32), 0xdead_beef_0000_0001);
        assert_eq!(s.gpr(Gpr::Rax), 0x0000_0001);
    }

    #[test]
    fn high_byte_reads() {
        let mut s = CpuState::new();
        s.set_gpr(Gpr::Rbx, 0xabcd);
        let bh = Reg {
            gpr: Gpr::Rbx,
            width: Width::W8,
            high8: true,
        };
        assert_eq!(s.read_reg(bh), 0xab);
        assert_eq!(s.read_reg(reg(Gpr::Rbx, Width::W8)), 0xcd);
    }

    #[test]
    fn reserved_flag_bit_always_reads_one() {
        let mut s = CpuState::new();
        assert_eq!(s.rflags(), RFLAGS_RESERVED1);
        s.set_rflags(0);
        assert_eq!(s.rflags(), RFLAGS_RESERVED1);
        s.set_flag(RFlags::RESERVED1, false);
        assert!(s.flag(RFlags::RESERVED1));
        s.set_flag(RFlags::ZF, true);
        assert_eq!(s.rflags(), 0x42);
    }

    #[test]
    fn signed_conditions() {
        let mut s = CpuState::new();
        s.set_flag(RFlags::SF, true);
        assert!(s.cond(Cond::L));
        s.set_flag(RFlags::OF, true);
        assert!(s.cond(Cond::Ge));
        assert!(s.cond(Cond::G));
        s.set_flag(RFlags::ZF, true);
        assert!(s.cond(Cond::Le));
        assert!(!s.cond(Cond::G));
    }

    #[test]
    fn snapshot_materializes_and_restores() {
        let mut s = CpuState::new();
        s.set_rip(0x40_1000);
        s.set_gpr(Gpr::R15, 7);
        s.set_fs_base(0x7000);
        s.vec_mut(3).set_xmm(u128::MAX);
        s.vec_mut(3).set_f32(1.0);

        let snap = s.snapshot();
        assert_eq!(snap.vectors.len(), VECTOR_REGS);
        assert_eq!(snap.vectors[3][0], 0xffff_ffff_3f80_0000);
        assert_eq!(snap.gpr(Gpr::R15), 7);

        let mut restored = CpuState::new();
        restored.restore(&snap);
        assert_eq!(restored, s);

        let json = serde_json::to_string(&snap).unwrap();
        let back: CpuSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
