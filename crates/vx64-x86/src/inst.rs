use core::fmt;

use vx64_types::{Cond, Width};

use crate::error::RawBytes;
use crate::operand::{Address, Operand, Reg, VecReg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
}

impl AluOp {
    /// Maps the `/digit` of the `0x80`..`0x83` group (and bits 3..6 of `00`..`3F`). `/7` is `cmp`.
    #[must_use]
    pub fn from_digit(digit: u8) -> Option<AluOp> {
        Some(match digit & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => return None,
        })
    }

    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::Adc => "adc",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Rol,
    Ror,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            ShiftOp::Rol => "rol",
            ShiftOp::Ror => "ror",
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sar => "sar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftCount {
    Imm(u8),
    Cl,
}

/// One-operand multiply/divide group (`F6`/`F7` `/4`..`/7`), implicit `rDX:rAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulDivOp {
    Mul,
    Imul,
    Div,
    Idiv,
}

impl MulDivOp {
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            MulDivOp::Mul => "mul",
            MulDivOp::Imul => "imul",
            MulDivOp::Div => "div",
            MulDivOp::Idiv => "idiv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagOp {
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepMode {
    None,
    /// `F3` on `movs`/`stos`/`lods`.
    Rep,
    /// `F3` on `cmps`/`scas`.
    Repe,
    /// `F2` on `cmps`/`scas`.
    Repne,
}

/// Legacy-encoded SSE/SSE2 operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SseOp {
    Movaps,
    Movups,
    Movapd,
    Movupd,
    Movdqa,
    Movdqu,
    Movss,
    Movsd,
    Movd,
    Movq,
    Pxor,
    Pand,
    Pandn,
    Por,
    Xorps,
    Xorpd,
    Andps,
    Andpd,
    Orps,
    Orpd,
    Paddb,
    Paddw,
    Paddd,
    Paddq,
    Psubb,
    Psubw,
    Psubd,
    Psubq,
    Pcmpeqb,
    Pcmpeqw,
    Pcmpeqd,
    Pmovmskb,
    Psllw,
    Pslld,
    Psllq,
    Psrlw,
    Psrld,
    Psrlq,
    Psraw,
    Psrad,
    Pslldq,
    Psrldq,
    Addss,
    Addsd,
    Subss,
    Subsd,
    Mulss,
    Mulsd,
    Divss,
    Divsd,
    Sqrtss,
    Sqrtsd,
    Comiss,
    Ucomiss,
    Comisd,
    Ucomisd,
    /// Integer source width in the payload.
    Cvtsi2ss(Width),
    Cvtsi2sd(Width),
    /// Integer destination width in the payload.
    Cvttss2si(Width),
    Cvttsd2si(Width),
    Cvtss2sd,
    Cvtsd2ss,
}

impl SseOp {
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            SseOp::Movaps => "movaps",
            SseOp::Movups => "movups",
            SseOp::Movapd => "movapd",
            SseOp::Movupd => "movupd",
            SseOp::Movdqa => "movdqa",
            SseOp::Movdqu => "movdqu",
            SseOp::Movss => "movss",
            SseOp::Movsd => "movsd",
            SseOp::Movd => "movd",
            SseOp::Movq => "movq",
            SseOp::Pxor => "pxor",
            SseOp::Pand => "pand",
            SseOp::Pandn => "pandn",
            SseOp::Por => "por",
            SseOp::Xorps => "xorps",
            SseOp::Xorpd => "xorpd",
            SseOp::Andps => "andps",
            SseOp::Andpd => "andpd",
            SseOp::Orps => "orps",
            SseOp::Orpd => "orpd",
            SseOp::Paddb => "paddb",
            SseOp::Paddw => "paddw",
            SseOp::Paddd => "paddd",
            SseOp::Paddq => "paddq",
            SseOp::Psubb => "psubb",
            SseOp::Psubw => "psubw",
            SseOp::Psubd => "psubd",
            SseOp::Psubq => "psubq",
            SseOp::Pcmpeqb => "pcmpeqb",
            SseOp::Pcmpeqw => "pcmpeqw",
            SseOp::Pcmpeqd => "pcmpeqd",
            SseOp::Pmovmskb => "pmovmskb",
            SseOp::Psllw => "psllw",
            SseOp::Pslld => "pslld",
            SseOp::Psllq => "psllq",
            SseOp::Psrlw => "psrlw",
            SseOp::Psrld => "psrld",
            SseOp::Psrlq => "psrlq",
            SseOp::Psraw => "psraw",
            SseOp::Psrad => "psrad",
            SseOp::Pslldq => "pslldq",
            SseOp::Psrldq => "psrldq",
            SseOp::Addss => "addss",
            SseOp::Addsd => "addsd",
            SseOp::Subss => "subss",
            SseOp::Subsd => "subsd",
            SseOp::Mulss => "mulss",
            SseOp::Mulsd => "mulsd",
            SseOp::Divss => "divss",
            SseOp::Divsd => "divsd",
            SseOp::Sqrtss => "sqrtss",
            SseOp::Sqrtsd => "sqrtsd",
            SseOp::Comiss => "comiss",
            SseOp::Ucomiss => "ucomiss",
            SseOp::Comisd => "comisd",
            SseOp::Ucomisd => "ucomisd",
            SseOp::Cvtsi2ss(_) => "cvtsi2ss",
            SseOp::Cvtsi2sd(_) => "cvtsi2sd",
            SseOp::Cvttss2si(_) => "cvttss2si",
            SseOp::Cvttsd2si(_) => "cvttsd2si",
            SseOp::Cvtss2sd => "cvtss2sd",
            SseOp::Cvtsd2ss => "cvtsd2ss",
        }
    }
}

/// VEX-encoded three-operand integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VexOp {
    Vpxor,
    Vpaddq,
}

impl VexOp {
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            VexOp::Vpxor => "vpxor",
            VexOp::Vpaddq => "vpaddq",
        }
    }
}

/// Hand-written replacement routines installed at guest addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntrinsicId {
    Strlen,
    Strchrnul,
    Memcpy,
    Memset,
}

impl IntrinsicId {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            IntrinsicId::Strlen => "strlen",
            IntrinsicId::Strchrnul => "strchrnul",
            IntrinsicId::Memcpy => "memcpy",
            IntrinsicId::Memset => "memset",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<IntrinsicId> {
        Some(match name {
            "strlen" => IntrinsicId::Strlen,
            "strchrnul" => IntrinsicId::Strchrnul,
            "memcpy" => IntrinsicId::Memcpy,
            "memset" => IntrinsicId::Memset,
            _ => return None,
        })
    }
}

/// Semantic class of a decoded instruction together with its operand descriptors.
///
/// Operands listed by [`InstKind::operands`] come in a fixed order per variant (destination
/// first); implicit operands such as `rAX` for `cqo` or `rSI`/`rDI` for string instructions are
/// not listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    Alu {
        op: AluOp,
        dst: Operand,
        src: Operand,
        width: Width,
    },
    Cmp {
        lhs: Operand,
        rhs: Operand,
        width: Width,
    },
    Test {
        lhs: Operand,
        rhs: Operand,
        width: Width,
    },
    Inc {
        dst: Operand,
        width: Width,
    },
    Dec {
        dst: Operand,
        width: Width,
    },
    Neg {
        dst: Operand,
        width: Width,
    },
    Not {
        dst: Operand,
        width: Width,
    },
    MulDiv {
        op: MulDivOp,
        src: Operand,
        width: Width,
    },
    /// Two- and three-operand `imul`; `imm` is sign-extended.
    Imul {
        dst: Reg,
        src: Operand,
        imm: Option<u64>,
        width: Width,
    },
    Shift {
        op: ShiftOp,
        dst: Operand,
        count: ShiftCount,
        width: Width,
    },
    Mov {
        dst: Operand,
        src: Operand,
        width: Width,
    },
    Movzx {
        dst: Reg,
        src: Operand,
        src_width: Width,
    },
    /// `movsx` and `movsxd`.
    Movsx {
        dst: Reg,
        src: Operand,
        src_width: Width,
    },
    Lea {
        dst: Reg,
        addr: Address,
    },
    Xchg {
        a: Operand,
        b: Operand,
        width: Width,
    },
    Push {
        src: Operand,
        width: Width,
    },
    Pop {
        dst: Operand,
        width: Width,
    },
    /// `cbw`/`cwde`/`cdqe`: sign-extends the lower half of `rAX` into `width`.
    SignExtendAcc {
        width: Width,
    },
    /// `cwd`/`cdq`/`cqo`: sign-fills `rDX` from `rAX` at `width`.
    SignFillDx {
        width: Width,
    },
    JmpRel {
        target: u64,
    },
    JccRel {
        cond: Cond,
        target: u64,
    },
    CallRel {
        target: u64,
    },
    JmpInd {
        target: Operand,
    },
    CallInd {
        target: Operand,
    },
    Ret {
        pop: u16,
    },
    Setcc {
        cond: Cond,
        dst: Operand,
    },
    Cmovcc {
        cond: Cond,
        dst: Reg,
        src: Operand,
        width: Width,
    },
    Flag(FlagOp),
    String {
        op: StringOp,
        width: Width,
        rep: RepMode,
        addr32: bool,
    },
    Nop,
    Hlt,
    Syscall,
    Ud2,
    Sse {
        op: SseOp,
        dst: Operand,
        src: Operand,
    },
    /// `vmovdqa`/`vmovdqu` (VEX.128 and VEX.256).
    VexMov {
        aligned: bool,
        dst: Operand,
        src: Operand,
    },
    VexBinary {
        op: VexOp,
        dst: VecReg,
        src1: VecReg,
        src2: Operand,
    },
    Vzeroupper,
    /// Host-implemented routine; has no guest encoding and zero length.
    Intrinsic(IntrinsicId),
}

impl InstKind {
    /// Explicit operands in binding order.
    #[must_use]
    pub fn operands(&self) -> Vec<Operand> {
        match *self {
            InstKind::Alu { dst, src, .. } | InstKind::Mov { dst, src, .. } => vec![dst, src],
            InstKind::Cmp { lhs, rhs, .. } | InstKind::Test { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Inc { dst, .. }
            | InstKind::Dec { dst, .. }
            | InstKind::Neg { dst, .. }
            | InstKind::Not { dst, .. }
            | InstKind::Shift { dst, .. }
            | InstKind::Pop { dst, .. }
            | InstKind::Setcc { dst, .. } => vec![dst],
            InstKind::MulDiv { src, .. } | InstKind::Push { src, .. } => vec![src],
            InstKind::Imul { dst, src, .. }
            | InstKind::Movzx { dst, src, .. }
            | InstKind::Movsx { dst, src, .. }
            | InstKind::Cmovcc { dst, src, .. } => vec![Operand::Reg(dst), src],
            InstKind::Lea { dst, addr } => vec![Operand::Reg(dst), Operand::Mem(addr)],
            InstKind::Xchg { a, b, .. } => vec![a, b],
            InstKind::JmpInd { target } | InstKind::CallInd { target } => vec![target],
            InstKind::Sse { dst, src, .. } | InstKind::VexMov { dst, src, .. } => vec![dst, src],
            InstKind::VexBinary {
                dst, src1, src2, ..
            } => vec![Operand::Vec(dst), Operand::Vec(src1), src2],
            InstKind::SignExtendAcc { .. }
            | InstKind::SignFillDx { .. }
            | InstKind::JmpRel { .. }
            | InstKind::JccRel { .. }
            | InstKind::CallRel { .. }
            | InstKind::Ret { .. }
            | InstKind::Flag(_)
            | InstKind::String { .. }
            | InstKind::Nop
            | InstKind::Hlt
            | InstKind::Syscall
            | InstKind::Ud2
            | InstKind::Vzeroupper
            | InstKind::Intrinsic(_) => Vec::new(),
        }
    }

    /// Whether executing this instruction may leave RIP somewhere other than the next
    /// sequential instruction, or hand control back to the embedder.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            InstKind::JmpRel { .. }
                | InstKind::JccRel { .. }
                | InstKind::CallRel { .. }
                | InstKind::JmpInd { .. }
                | InstKind::CallInd { .. }
                | InstKind::Ret { .. }
                | InstKind::Hlt
                | InstKind::Syscall
                | InstKind::Ud2
                | InstKind::Intrinsic(_)
        )
    }

    fn mnemonic(&self) -> String {
        let s: &str = match *self {
            InstKind::Alu { op, .. } => op.mnemonic(),
            InstKind::Cmp { .. } => "cmp",
            InstKind::Test { .. } => "test",
            InstKind::Inc { .. } => "inc",
            InstKind::Dec { .. } => "dec",
            InstKind::Neg { .. } => "neg",
            InstKind::Not { .. } => "not",
            InstKind::MulDiv { op, .. } => op.mnemonic(),
            InstKind::Imul { .. } => "imul",
            InstKind::Shift { op, .. } => op.mnemonic(),
            InstKind::Mov { .. } => "mov",
            InstKind::Movzx { .. } => "movzx",
            InstKind::Movsx {
                src_width: Width::W32,
                ..
            } => "movsxd",
            InstKind::Movsx { .. } => "movsx",
            InstKind::Lea { .. } => "lea",
            InstKind::Xchg { .. } => "xchg",
            InstKind::Push { .. } => "push",
            InstKind::Pop { .. } => "pop",
            InstKind::SignExtendAcc { width } => match width {
                Width::W16 => "cbw",
                Width::W32 => "cwde",
                _ => "cdqe",
            },
            InstKind::SignFillDx { width } => match width {
                Width::W16 => "cwd",
                Width::W32 => "cdq",
                _ => "cqo",
            },
            InstKind::JmpRel { .. } | InstKind::JmpInd { .. } => "jmp",
            InstKind::JccRel { cond, .. } => return format!("j{}", cond.suffix()),
            InstKind::CallRel { .. } | InstKind::CallInd { .. } => "call",
            InstKind::Ret { .. } => "ret",
            InstKind::Setcc { cond, .. } => return format!("set{}", cond.suffix()),
            InstKind::Cmovcc { cond, .. } => return format!("cmov{}", cond.suffix()),
            InstKind::Flag(op) => match op {
                FlagOp::Clc => "clc",
                FlagOp::Stc => "stc",
                FlagOp::Cmc => "cmc",
                FlagOp::Cld => "cld",
                FlagOp::Std => "std",
            },
            InstKind::String { op, width, rep, .. } => {
                let prefix = match rep {
                    RepMode::None => "",
                    RepMode::Rep => "rep ",
                    RepMode::Repe => "repe ",
                    RepMode::Repne => "repne ",
                };
                let base = match op {
                    StringOp::Movs => "movs",
                    StringOp::Cmps => "cmps",
                    StringOp::Stos => "stos",
                    StringOp::Lods => "lods",
                    StringOp::Scas => "scas",
                };
                let suffix = match width {
                    Width::W8 => 'b',
                    Width::W16 => 'w',
                    Width::W32 => 'd',
                    Width::W64 => 'q',
                };
                return format!("{prefix}{base}{suffix}");
            }
            InstKind::Nop => "nop",
            InstKind::Hlt => "hlt",
            InstKind::Syscall => "syscall",
            InstKind::Ud2 => "ud2",
            InstKind::Sse { op, .. } => op.mnemonic(),
            InstKind::VexMov { aligned: true, .. } => "vmovdqa",
            InstKind::VexMov { aligned: false, .. } => "vmovdqu",
            InstKind::VexBinary { op, .. } => op.mnemonic(),
            InstKind::Vzeroupper => "vzeroupper",
            InstKind::Intrinsic(id) => return format!("<intrinsic {}>", id.name()),
        };
        s.to_string()
    }

    /// Operands as printed in disassembly (adds immediates and implicit counts).
    fn display_operands(&self) -> Vec<String> {
        let mut out: Vec<String> = self.operands().iter().map(ToString::to_string).collect();
        match *self {
            InstKind::Imul { imm: Some(imm), width, .. } => {
                out.push(format!("0x{:x}", width.truncate(imm)));
            }
            InstKind::Shift { count, .. } => out.push(match count {
                ShiftCount::Imm(n) => format!("0x{n:x}"),
                ShiftCount::Cl => "cl".to_string(),
            }),
            InstKind::JmpRel { target }
            | InstKind::JccRel { target, .. }
            | InstKind::CallRel { target } => out.push(format!("0x{target:x}")),
            InstKind::Ret { pop } if pop != 0 => out.push(format!("0x{pop:x}")),
            _ => {}
        }
        out
    }
}

/// An immutable decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub rip: u64,
    pub bytes: RawBytes,
    pub kind: InstKind,
}

impl Instruction {
    /// Builds the zero-length pseudo-instruction for an intrinsic installed at `rip`.
    #[must_use]
    pub fn intrinsic(rip: u64, id: IntrinsicId) -> Self {
        Self {
            rip,
            bytes: RawBytes::default(),
            kind: InstKind::Intrinsic(id),
        }
    }

    #[must_use]
    pub fn len(&self) -> u8 {
        self.bytes.len() as u8
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn next_rip(&self) -> u64 {
        self.rip.wrapping_add(self.len() as u64)
    }

    #[must_use]
    pub fn is_block_terminator(&self) -> bool {
        self.kind.is_control_flow()
    }

    /// Mnemonic and operand strings, e.g. `["paddq", "xmm9", "xmm1"]`.
    #[must_use]
    pub fn disassemble(&self) -> Vec<String> {
        let mut out = vec![self.kind.mnemonic()];
        out.extend(self.kind.display_operands());
        out
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind.mnemonic())?;
        let ops = self.kind.display_operands();
        if !ops.is_empty() {
            write!(f, "\t{}", ops.join(","))?;
        }
        Ok(())
    }
}
