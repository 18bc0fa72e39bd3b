use core::fmt;

use vx64_types::{Gpr, Width};

/// A general-purpose register viewed at a given width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub gpr: Gpr,
    pub width: Width,
    /// Legacy `AH`/`CH`/`DH`/`BH` (bits 8..16 of `gpr`).
    pub high8: bool,
}

impl Reg {
    #[must_use]
    pub const fn new(gpr: Gpr, width: Width) -> Self {
        Self {
            gpr,
            width,
            high8: false,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const R8: [&str; 16] = [
            "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b",
            "r12b", "r13b", "r14b", "r15b",
        ];
        const R8H: [&str; 4] = ["ah", "ch", "dh", "bh"];
        const R16: [&str; 16] = [
            "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w",
            "r13w", "r14w", "r15w",
        ];
        const R32: [&str; 16] = [
            "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
            "r12d", "r13d", "r14d", "r15d",
        ];
        let i = self.gpr.index();
        let s = match self.width {
            Width::W8 if self.high8 => R8H[i & 3],
            Width::W8 => R8[i],
            Width::W16 => R16[i],
            Width::W32 => R32[i],
            Width::W64 => self.gpr.name(),
        };
        f.write_str(s)
    }
}

/// Vector register view size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VecSize {
    Xmm,
    Ymm,
}

/// A vector register (`xmm0`..`xmm15`, `ymm0`..`ymm15`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VecReg {
    pub index: u8,
    pub size: VecSize,
}

impl VecReg {
    #[must_use]
    pub const fn xmm(index: u8) -> Self {
        Self {
            index,
            size: VecSize::Xmm,
        }
    }

    #[must_use]
    pub const fn ymm(index: u8) -> Self {
        Self {
            index,
            size: VecSize::Ymm,
        }
    }
}

impl fmt::Display for VecReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            VecSize::Xmm => write!(f, "xmm{}", self.index),
            VecSize::Ymm => write!(f, "ymm{}", self.index),
        }
    }
}

/// Segment override that matters in 64-bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegOverride {
    Fs,
    Gs,
}

impl fmt::Display for SegOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SegOverride::Fs => "fs",
            SegOverride::Gs => "gs",
        })
    }
}

/// Memory addressing expression `seg:[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub disp: i32,
    /// `disp` is relative to the address of the next instruction.
    pub rip_relative: bool,
    pub segment: Option<SegOverride>,
    /// `0x67` prefix: the effective address is truncated to 32 bits.
    pub addr32: bool,
}

impl Address {
    #[must_use]
    pub const fn base_disp(base: Gpr, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            disp,
            rip_relative: false,
            segment: None,
            addr32: false,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(seg) = self.segment {
            write!(f, "{seg}:")?;
        }
        f.write_str("[")?;
        let mut first = true;
        let reg_name = |gpr: Gpr| {
            if self.addr32 {
                Reg::new(gpr, Width::W32).to_string()
            } else {
                gpr.name().to_string()
            }
        };
        if self.rip_relative {
            f.write_str(if self.addr32 { "eip" } else { "rip" })?;
            first = false;
        }
        if let Some(base) = self.base {
            f.write_str(&reg_name(base))?;
            first = false;
        }
        if let Some(index) = self.index {
            if !first {
                f.write_str("+")?;
            }
            f.write_str(&reg_name(index))?;
            if self.scale != 1 {
                write!(f, "*{}", self.scale)?;
            }
            first = false;
        }
        if self.disp != 0 || first {
            if first {
                write!(f, "0x{:x}", self.disp as u32)?;
            } else if self.disp < 0 {
                write!(f, "-0x{:x}", (self.disp as i64).unsigned_abs())?;
            } else {
                write!(f, "+0x{:x}", self.disp)?;
            }
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Vec(VecReg),
    Mem(Address),
    /// Immediate, already sign- or zero-extended to 64 bits as the encoding requires.
    Imm(u64),
}

impl Operand {
    #[must_use]
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Vec(v) => write!(f, "{v}"),
            Operand::Mem(addr) => write!(f, "{addr}"),
            Operand::Imm(v) => write!(f, "0x{v:x}"),
        }
    }
}
