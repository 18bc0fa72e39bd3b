#![forbid(unsafe_code)]

//! Small architectural vocabulary types shared by the decoder and the interpreter.

use core::fmt;

/// General-purpose register, numbered by its architectural encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Maps a 4-bit register number (ModRM/REX combined) to a register.
    #[must_use]
    pub fn from_u4(v: u8) -> Option<Gpr> {
        Self::ALL.get(v as usize).copied()
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// 64-bit register name as printed in disassembly.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer operation width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    #[inline]
    #[must_use]
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    #[inline]
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    #[inline]
    #[must_use]
    pub const fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    #[inline]
    #[must_use]
    pub const fn truncate(self, v: u64) -> u64 {
        v & self.mask()
    }

    /// Sign-extends the low `bits()` of `v` to 64 bits.
    #[inline]
    #[must_use]
    pub const fn sign_extend(self, v: u64) -> u64 {
        let shift = 64 - self.bits();
        (((v << shift) as i64) >> shift) as u64
    }

    #[must_use]
    pub const fn from_bytes(bytes: usize) -> Option<Width> {
        match bytes {
            1 => Some(Width::W8),
            2 => Some(Width::W16),
            4 => Some(Width::W32),
            8 => Some(Width::W64),
            _ => None,
        }
    }
}

/// Condition codes in `tttn` encoding order (`Jcc`/`SETcc`/`CMOVcc` low nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    #[must_use]
    pub fn from_cc(cc: u8) -> Cond {
        match cc & 0x0f {
            0 => Cond::O,
            1 => Cond::No,
            2 => Cond::B,
            3 => Cond::Ae,
            4 => Cond::E,
            5 => Cond::Ne,
            6 => Cond::Be,
            7 => Cond::A,
            8 => Cond::S,
            9 => Cond::Ns,
            10 => Cond::P,
            11 => Cond::Np,
            12 => Cond::L,
            13 => Cond::Ge,
            14 => Cond::Le,
            _ => Cond::G,
        }
    }

    /// Mnemonic suffix (`e` in `je`, `sete`, `cmove`).
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_helpers() {
        assert_eq!(Width::W8.mask(), 0xff);
        assert_eq!(Width::W64.mask(), u64::MAX);
        assert_eq!(Width::W16.sign_bit(), 0x8000);
        assert_eq!(Width::W8.sign_extend(0x80), 0xffff_ffff_ffff_ff80);
        assert_eq!(Width::W32.sign_extend(0x7fff_ffff), 0x7fff_ffff);
        assert_eq!(Width::W32.truncate(0x1_2345_6789), 0x2345_6789);
        assert_eq!(Width::from_bytes(4), Some(Width::W32));
        assert_eq!(Width::from_bytes(3), None);
    }

    #[test]
    fn gpr_encoding_roundtrip() {
        for (i, gpr) in Gpr::ALL.iter().enumerate() {
            assert_eq!(Gpr::from_u4(i as u8), Some(*gpr));
            assert_eq!(gpr.index(), i);
        }
        assert_eq!(Gpr::from_u4(16), None);
        assert_eq!(Gpr::R12.to_string(), "r12");
    }

    #[test]
    fn cond_from_cc_uses_low_nibble() {
        assert_eq!(Cond::from_cc(0x74), Cond::E);
        assert_eq!(Cond::from_cc(0x8f), Cond::G);
        assert_eq!(Cond::Be.suffix(), "be");
    }
}
