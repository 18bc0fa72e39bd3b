//! Table-free x86-64 decoder for the implemented instruction subset.
//!
//! Only 64-bit mode is supported. The decoder walks legacy prefixes, an optional REX byte (which
//! must immediately precede the opcode) or a VEX prefix, then dispatches on the opcode map.

use vx64_types::{Cond, Gpr, Width};

use crate::error::{DecodeError, DecodeErrorKind, RawBytes, MAX_INST_LEN};
use crate::inst::{
    AluOp, FlagOp, InstKind, Instruction, MulDivOp, RepMode, ShiftCount, ShiftOp, SseOp, StringOp,
    VexOp,
};
use crate::operand::{Address, Operand, Reg, SegOverride, VecReg, VecSize};

type DResult<T> = Result<T, DecodeErrorKind>;

/// Decodes the instruction at `rip` from `bytes`.
///
/// At most [`MAX_INST_LEN`] bytes are examined. On success the instruction records the exact
/// bytes consumed, so the next sequential PC is [`Instruction::next_rip`].
pub fn decode(rip: u64, bytes: &[u8]) -> Result<Instruction, DecodeError> {
    let window = &bytes[..bytes.len().min(MAX_INST_LEN)];
    let mut d = Decoder {
        cur: Cursor {
            bytes: window,
            pos: 0,
            truncated: bytes.len() > MAX_INST_LEN,
        },
        p: Prefixes::default(),
        rip,
    };
    match d.decode_inst() {
        Ok(kind) => Ok(Instruction {
            rip,
            bytes: RawBytes::new(&window[..d.cur.pos]),
            kind,
        }),
        Err(kind) => {
            let end = d.cur.pos.max(1).min(window.len());
            Err(DecodeError {
                addr: rip,
                bytes: RawBytes::new(&window[..end]),
                kind,
            })
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// More bytes exist past the 15-byte window.
    truncated: bool,
}

impl Cursor<'_> {
    fn eof(&self) -> DecodeErrorKind {
        if self.truncated {
            DecodeErrorKind::TooLong
        } else {
            DecodeErrorKind::UnexpectedEof
        }
    }

    fn peek(&self) -> DResult<u8> {
        self.bytes.get(self.pos).copied().ok_or_else(|| self.eof())
    }

    fn u8(&mut self) -> DResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn le(&mut self, len: usize) -> DResult<u64> {
        if self.bytes.len() < self.pos + len {
            self.pos = self.bytes.len();
            return Err(self.eof());
        }
        let mut out = 0u64;
        for i in 0..len {
            out |= (self.bytes[self.pos + i] as u64) << (i * 8);
        }
        self.pos += len;
        Ok(out)
    }

    fn i8(&mut self) -> DResult<i8> {
        Ok(self.u8()? as i8)
    }

    fn i32(&mut self) -> DResult<i32> {
        Ok(self.le(4)? as u32 as i32)
    }

    /// Reads an immediate for an operation of `width`, sign-extended to 64 bits. 64-bit
    /// operations take a sign-extended imm32.
    fn imm(&mut self, width: Width) -> DResult<u64> {
        Ok(match width {
            Width::W8 => self.i8()? as i64 as u64,
            Width::W16 => self.le(2)? as u16 as i16 as i64 as u64,
            Width::W32 | Width::W64 => self.i32()? as i64 as u64,
        })
    }

    fn imm8s(&mut self) -> DResult<u64> {
        self.imm(Width::W8)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    present: bool,
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

impl Rex {
    fn from_byte(b: u8) -> Self {
        debug_assert!((0x40..=0x4f).contains(&b));
        Self {
            present: true,
            w: (b & 0x08) != 0,
            r: (b & 0x04) != 0,
            x: (b & 0x02) != 0,
            b: (b & 0x01) != 0,
        }
    }
}

/// SSE mandatory prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Simd {
    None,
    P66,
    F3,
    F2,
}

#[derive(Debug, Clone, Copy, Default)]
struct Prefixes {
    opsize: bool,
    addr32: bool,
    lock: bool,
    rep: Option<u8>,
    segment: Option<SegOverride>,
    rex: Rex,
}

impl Prefixes {
    fn width(&self) -> Width {
        if self.rex.w {
            Width::W64
        } else if self.opsize {
            Width::W16
        } else {
            Width::W32
        }
    }

    /// Width of `push`/`pop`: 64-bit unless overridden to 16.
    fn stack_width(&self) -> Width {
        if self.opsize && !self.rex.w {
            Width::W16
        } else {
            Width::W64
        }
    }

    fn simd(&self) -> Simd {
        match self.rep {
            Some(0xf3) => Simd::F3,
            Some(0xf2) => Simd::F2,
            _ if self.opsize => Simd::P66,
            _ => Simd::None,
        }
    }

    /// GPR width of SSE conversion/move operands (`REX.W` selects 64).
    fn gpr_width(&self) -> Width {
        if self.rex.w {
            Width::W64
        } else {
            Width::W32
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ModRm {
    /// `reg` field extended by `REX.R`.
    reg: u8,
    /// Raw 3-bit `reg` field, used as the opcode extension (`/digit`).
    digit: u8,
}

#[derive(Debug, Clone, Copy)]
enum Rm {
    Reg(u8),
    Mem(Address),
}

fn gpr(code: u8) -> Gpr {
    Gpr::ALL[(code & 0x0f) as usize]
}

struct Decoder<'a> {
    cur: Cursor<'a>,
    p: Prefixes,
    rip: u64,
}

impl Decoder<'_> {
    fn decode_inst(&mut self) -> DResult<InstKind> {
        self.prefixes()?;
        let op = self.cur.u8()?;
        let kind = match op {
            0xc4 | 0xc5 => self.vex(op)?,
            0x0f => {
                let op2 = self.cur.u8()?;
                self.two_byte(op2)?
            }
            _ => self.one_byte(op)?,
        };
        if self.p.lock && !lockable(&kind) {
            return Err(DecodeErrorKind::Invalid);
        }
        Ok(kind)
    }

    fn prefixes(&mut self) -> DResult<()> {
        loop {
            let b = self.cur.peek()?;
            match b {
                0x66 => self.p.opsize = true,
                0x67 => self.p.addr32 = true,
                0xf0 => self.p.lock = true,
                0xf2 | 0xf3 => self.p.rep = Some(b),
                // CS/SS/DS/ES overrides have no effect in 64-bit mode.
                0x26 | 0x2e | 0x36 | 0x3e => {}
                0x64 => self.p.segment = Some(SegOverride::Fs),
                0x65 => self.p.segment = Some(SegOverride::Gs),
                0x40..=0x4f => {
                    self.p.rex = Rex::from_byte(b);
                    self.cur.pos += 1;
                    continue;
                }
                _ => return Ok(()),
            }
            // A REX byte only counts when it immediately precedes the opcode.
            self.p.rex = Rex::default();
            self.cur.pos += 1;
        }
    }

    fn next_rip(&self) -> u64 {
        self.rip.wrapping_add(self.cur.pos as u64)
    }

    fn rel_target(&self, rel: i64) -> u64 {
        self.next_rip().wrapping_add(rel as u64)
    }

    fn reg(&self, code: u8, width: Width) -> Reg {
        if width == Width::W8 && !self.p.rex.present && (4..8).contains(&code) {
            Reg {
                gpr: gpr(code - 4),
                width,
                high8: true,
            }
        } else {
            Reg::new(gpr(code), width)
        }
    }

    fn reg_op(&self, code: u8, width: Width) -> Operand {
        Operand::Reg(self.reg(code, width))
    }

    fn rm_op(&self, rm: Rm, width: Width) -> Operand {
        match rm {
            Rm::Reg(code) => self.reg_op(code, width),
            Rm::Mem(addr) => Operand::Mem(addr),
        }
    }

    fn rm_vec(&self, rm: Rm, size: VecSize) -> Operand {
        match rm {
            Rm::Reg(code) => Operand::Vec(VecReg { index: code, size }),
            Rm::Mem(addr) => Operand::Mem(addr),
        }
    }

    fn xmm(code: u8) -> Operand {
        Operand::Vec(VecReg::xmm(code))
    }

    fn modrm(&mut self) -> DResult<(ModRm, Rm)> {
        let byte = self.cur.u8()?;
        let md = byte >> 6;
        let digit = (byte >> 3) & 7;
        let rm_low = byte & 7;
        let rex = self.p.rex;
        let modrm = ModRm {
            reg: digit | if rex.r { 8 } else { 0 },
            digit,
        };
        if md == 3 {
            return Ok((modrm, Rm::Reg(rm_low | if rex.b { 8 } else { 0 })));
        }

        let mut addr = Address {
            base: None,
            index: None,
            scale: 1,
            disp: 0,
            rip_relative: false,
            segment: self.p.segment,
            addr32: self.p.addr32,
        };
        if rm_low == 4 {
            let sib = self.cur.u8()?;
            let index = ((sib >> 3) & 7) | if rex.x { 8 } else { 0 };
            let base = (sib & 7) | if rex.b { 8 } else { 0 };
            addr.scale = 1 << (sib >> 6);
            if index != 4 {
                addr.index = Some(gpr(index));
            }
            if base & 7 == 5 && md == 0 {
                addr.disp = self.cur.i32()?;
            } else {
                addr.base = Some(gpr(base));
            }
        } else if rm_low == 5 && md == 0 {
            addr.rip_relative = true;
            addr.disp = self.cur.i32()?;
        } else {
            addr.base = Some(gpr(rm_low | if rex.b { 8 } else { 0 }));
        }

        match md {
            1 => addr.disp = addr.disp.wrapping_add(self.cur.i8()? as i32),
            2 => addr.disp = addr.disp.wrapping_add(self.cur.i32()?),
            _ => {}
        }
        Ok((modrm, Rm::Mem(addr)))
    }

    fn one_byte(&mut self, op: u8) -> DResult<InstKind> {
        let w = self.p.width();
        Ok(match op {
            0x00..=0x3f if op & 7 < 6 => self.alu_family(op)?,
            0x50..=0x57 | 0x58..=0x5f => {
                let code = (op & 7) | if self.p.rex.b { 8 } else { 0 };
                let width = self.p.stack_width();
                let operand = self.reg_op(code, width);
                if op < 0x58 {
                    InstKind::Push {
                        src: operand,
                        width,
                    }
                } else {
                    InstKind::Pop {
                        dst: operand,
                        width,
                    }
                }
            }
            0x63 => {
                let (m, rm) = self.modrm()?;
                InstKind::Movsx {
                    dst: self.reg(m.reg, w),
                    src: self.rm_op(rm, Width::W32),
                    src_width: Width::W32,
                }
            }
            0x68 | 0x6a => {
                let width = self.p.stack_width();
                let imm = if op == 0x6a {
                    self.cur.imm8s()?
                } else {
                    self.cur.imm(width)?
                };
                InstKind::Push {
                    src: Operand::Imm(imm),
                    width,
                }
            }
            0x69 | 0x6b => {
                let (m, rm) = self.modrm()?;
                let imm = if op == 0x6b {
                    self.cur.imm8s()?
                } else {
                    self.cur.imm(w)?
                };
                InstKind::Imul {
                    dst: self.reg(m.reg, w),
                    src: self.rm_op(rm, w),
                    imm: Some(imm),
                    width: w,
                }
            }
            0x70..=0x7f => {
                let rel = self.cur.i8()? as i64;
                InstKind::JccRel {
                    cond: Cond::from_cc(op),
                    target: self.rel_target(rel),
                }
            }
            0x80 | 0x81 | 0x83 => {
                let (m, rm) = self.modrm()?;
                let width = if op == 0x80 { Width::W8 } else { w };
                let imm = if op == 0x81 {
                    self.cur.imm(width)?
                } else {
                    self.cur.imm8s()?
                };
                alu_kind(m.digit, self.rm_op(rm, width), Operand::Imm(imm), width)
            }
            0x84 | 0x85 | 0x86 | 0x87 => {
                let width = if op & 1 == 0 { Width::W8 } else { w };
                let (m, rm) = self.modrm()?;
                let a = self.rm_op(rm, width);
                let b = self.reg_op(m.reg, width);
                if op <= 0x85 {
                    InstKind::Test {
                        lhs: a,
                        rhs: b,
                        width,
                    }
                } else {
                    InstKind::Xchg { a, b, width }
                }
            }
            0x88..=0x8b => {
                let width = if op & 1 == 0 { Width::W8 } else { w };
                let (m, rm) = self.modrm()?;
                let (dst, src) = if op & 2 == 0 {
                    (self.rm_op(rm, width), self.reg_op(m.reg, width))
                } else {
                    (self.reg_op(m.reg, width), self.rm_op(rm, width))
                };
                InstKind::Mov { dst, src, width }
            }
            0x8d => {
                let (m, rm) = self.modrm()?;
                let Rm::Mem(addr) = rm else {
                    return Err(DecodeErrorKind::Invalid);
                };
                InstKind::Lea {
                    dst: self.reg(m.reg, w),
                    addr,
                }
            }
            0x8f => {
                let (m, rm) = self.modrm()?;
                if m.digit != 0 {
                    return Err(DecodeErrorKind::Unsupported);
                }
                let width = self.p.stack_width();
                InstKind::Pop {
                    dst: self.rm_op(rm, width),
                    width,
                }
            }
            0x90..=0x97 => {
                let code = (op & 7) | if self.p.rex.b { 8 } else { 0 };
                if code == 0 {
                    InstKind::Nop
                } else {
                    InstKind::Xchg {
                        a: self.reg_op(0, w),
                        b: self.reg_op(code, w),
                        width: w,
                    }
                }
            }
            0x98 => InstKind::SignExtendAcc { width: w },
            0x99 => InstKind::SignFillDx { width: w },
            0xa4..=0xa7 | 0xaa..=0xaf => self.string(op),
            0xa8 | 0xa9 => {
                let width = if op == 0xa8 { Width::W8 } else { w };
                InstKind::Test {
                    lhs: self.reg_op(0, width),
                    rhs: Operand::Imm(self.cur.imm(width)?),
                    width,
                }
            }
            0xb0..=0xb7 => {
                let code = (op & 7) | if self.p.rex.b { 8 } else { 0 };
                InstKind::Mov {
                    dst: self.reg_op(code, Width::W8),
                    src: Operand::Imm(self.cur.u8()? as u64),
                    width: Width::W8,
                }
            }
            0xb8..=0xbf => {
                let code = (op & 7) | if self.p.rex.b { 8 } else { 0 };
                let imm = self.cur.le(w.bytes())?;
                InstKind::Mov {
                    dst: self.reg_op(code, w),
                    src: Operand::Imm(imm),
                    width: w,
                }
            }
            0xc0 | 0xc1 | 0xd0..=0xd3 => self.shift_group(op)?,
            0xc2 => InstKind::Ret {
                pop: self.cur.le(2)? as u16,
            },
            0xc3 => InstKind::Ret { pop: 0 },
            0xc6 | 0xc7 => {
                let width = if op == 0xc6 { Width::W8 } else { w };
                let (m, rm) = self.modrm()?;
                if m.digit != 0 {
                    return Err(DecodeErrorKind::Unsupported);
                }
                InstKind::Mov {
                    dst: self.rm_op(rm, width),
                    src: Operand::Imm(self.cur.imm(width)?),
                    width,
                }
            }
            0xe8 | 0xe9 => {
                let rel = self.cur.i32()? as i64;
                let target = self.rel_target(rel);
                if op == 0xe8 {
                    InstKind::CallRel { target }
                } else {
                    InstKind::JmpRel { target }
                }
            }
            0xeb => {
                let rel = self.cur.i8()? as i64;
                InstKind::JmpRel {
                    target: self.rel_target(rel),
                }
            }
            0xf4 => InstKind::Hlt,
            0xf5 => InstKind::Flag(FlagOp::Cmc),
            0xf6 | 0xf7 => self.group3(op)?,
            0xf8 => InstKind::Flag(FlagOp::Clc),
            0xf9 => InstKind::Flag(FlagOp::Stc),
            0xfc => InstKind::Flag(FlagOp::Cld),
            0xfd => InstKind::Flag(FlagOp::Std),
            0xfe => {
                let (m, rm) = self.modrm()?;
                let dst = self.rm_op(rm, Width::W8);
                match m.digit {
                    0 => InstKind::Inc {
                        dst,
                        width: Width::W8,
                    },
                    1 => InstKind::Dec {
                        dst,
                        width: Width::W8,
                    },
                    _ => return Err(DecodeErrorKind::Invalid),
                }
            }
            0xff => self.group5()?,
            // Opcodes removed in 64-bit mode.
            0x06 | 0x07 | 0x0e | 0x16 | 0x17 | 0x1e | 0x1f | 0x27 | 0x2f | 0x37 | 0x3f | 0x60
            | 0x61 | 0x62 | 0x82 | 0x9a | 0xce | 0xd4 | 0xd5 | 0xd6 | 0xea => {
                return Err(DecodeErrorKind::Invalid)
            }
            _ => return Err(DecodeErrorKind::Unsupported),
        })
    }

    fn alu_family(&mut self, op: u8) -> DResult<InstKind> {
        let digit = (op >> 3) & 7;
        let w = self.p.width();
        let (dst, src, width) = match op & 7 {
            0 | 1 | 2 | 3 => {
                let width = if op & 1 == 0 { Width::W8 } else { w };
                let (m, rm) = self.modrm()?;
                let rm = self.rm_op(rm, width);
                let reg = self.reg_op(m.reg, width);
                if op & 2 == 0 {
                    (rm, reg, width)
                } else {
                    (reg, rm, width)
                }
            }
            4 => (
                self.reg_op(0, Width::W8),
                Operand::Imm(self.cur.imm8s()?),
                Width::W8,
            ),
            _ => (self.reg_op(0, w), Operand::Imm(self.cur.imm(w)?), w),
        };
        Ok(alu_kind(digit, dst, src, width))
    }

    fn string(&self, op: u8) -> InstKind {
        let width = if op & 1 == 0 {
            Width::W8
        } else {
            self.p.width()
        };
        let op = match op {
            0xa4 | 0xa5 => StringOp::Movs,
            0xa6 | 0xa7 => StringOp::Cmps,
            0xaa | 0xab => StringOp::Stos,
            0xac | 0xad => StringOp::Lods,
            _ => StringOp::Scas,
        };
        let compares = matches!(op, StringOp::Cmps | StringOp::Scas);
        let rep = match (self.p.rep, compares) {
            (None, _) => RepMode::None,
            (Some(_), false) => RepMode::Rep,
            (Some(0xf3), true) => RepMode::Repe,
            (Some(_), true) => RepMode::Repne,
        };
        InstKind::String {
            op,
            width,
            rep,
            addr32: self.p.addr32,
        }
    }

    fn shift_group(&mut self, op: u8) -> DResult<InstKind> {
        let width = if op & 1 == 0 {
            Width::W8
        } else {
            self.p.width()
        };
        let (m, rm) = self.modrm()?;
        let shift = match m.digit {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            4 | 6 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            7 => ShiftOp::Sar,
            // rcl/rcr
            _ => return Err(DecodeErrorKind::Unsupported),
        };
        let count = match op {
            0xc0 | 0xc1 => ShiftCount::Imm(self.cur.u8()?),
            0xd0 | 0xd1 => ShiftCount::Imm(1),
            _ => ShiftCount::Cl,
        };
        Ok(InstKind::Shift {
            op: shift,
            dst: self.rm_op(rm, width),
            count,
            width,
        })
    }

    fn group3(&mut self, op: u8) -> DResult<InstKind> {
        let width = if op == 0xf6 {
            Width::W8
        } else {
            self.p.width()
        };
        let (m, rm) = self.modrm()?;
        let operand = self.rm_op(rm, width);
        Ok(match m.digit {
            0 | 1 => InstKind::Test {
                lhs: operand,
                rhs: Operand::Imm(self.cur.imm(width)?),
                width,
            },
            2 => InstKind::Not {
                dst: operand,
                width,
            },
            3 => InstKind::Neg {
                dst: operand,
                width,
            },
            digit => InstKind::MulDiv {
                op: match digit {
                    4 => MulDivOp::Mul,
                    5 => MulDivOp::Imul,
                    6 => MulDivOp::Div,
                    _ => MulDivOp::Idiv,
                },
                src: operand,
                width,
            },
        })
    }

    fn group5(&mut self) -> DResult<InstKind> {
        let w = self.p.width();
        let (m, rm) = self.modrm()?;
        Ok(match m.digit {
            0 => InstKind::Inc {
                dst: self.rm_op(rm, w),
                width: w,
            },
            1 => InstKind::Dec {
                dst: self.rm_op(rm, w),
                width: w,
            },
            2 => InstKind::CallInd {
                target: self.rm_op(rm, Width::W64),
            },
            4 => InstKind::JmpInd {
                target: self.rm_op(rm, Width::W64),
            },
            6 => {
                let width = self.p.stack_width();
                InstKind::Push {
                    src: self.rm_op(rm, width),
                    width,
                }
            }
            // far call/jmp
            3 | 5 => return Err(DecodeErrorKind::Unsupported),
            _ => return Err(DecodeErrorKind::Invalid),
        })
    }

    fn sse(&mut self, op: SseOp) -> DResult<InstKind> {
        let (m, rm) = self.modrm()?;
        Ok(InstKind::Sse {
            op,
            dst: Self::xmm(m.reg),
            src: self.rm_vec(rm, VecSize::Xmm),
        })
    }

    fn sse_store(&mut self, op: SseOp) -> DResult<InstKind> {
        let (m, rm) = self.modrm()?;
        Ok(InstKind::Sse {
            op,
            dst: self.rm_vec(rm, VecSize::Xmm),
            src: Self::xmm(m.reg),
        })
    }

    /// Packed-integer ops exist only with the `66` prefix here (no MMX forms).
    fn sse_66(&mut self, op: SseOp) -> DResult<InstKind> {
        if self.p.simd() != Simd::P66 {
            return Err(DecodeErrorKind::Unsupported);
        }
        self.sse(op)
    }

    fn two_byte(&mut self, op: u8) -> DResult<InstKind> {
        let w = self.p.width();
        let simd = self.p.simd();
        let unsupported = Err(DecodeErrorKind::Unsupported);
        match op {
            0x05 => Ok(InstKind::Syscall),
            0x0b => Ok(InstKind::Ud2),
            // Hint NOPs, including the multi-byte `0F 1F /0`.
            0x18..=0x1f => {
                self.modrm()?;
                Ok(InstKind::Nop)
            }
            0x10 | 0x11 => {
                let sse = match simd {
                    Simd::None => SseOp::Movups,
                    Simd::P66 => SseOp::Movupd,
                    Simd::F3 => SseOp::Movss,
                    Simd::F2 => SseOp::Movsd,
                };
                if op == 0x10 {
                    self.sse(sse)
                } else {
                    self.sse_store(sse)
                }
            }
            0x28 | 0x29 => {
                let sse = match simd {
                    Simd::None => SseOp::Movaps,
                    Simd::P66 => SseOp::Movapd,
                    _ => return Err(DecodeErrorKind::Invalid),
                };
                if op == 0x28 {
                    self.sse(sse)
                } else {
                    self.sse_store(sse)
                }
            }
            0x2a => {
                let gw = self.p.gpr_width();
                let sse = match simd {
                    Simd::F3 => SseOp::Cvtsi2ss(gw),
                    Simd::F2 => SseOp::Cvtsi2sd(gw),
                    _ => return unsupported,
                };
                let (m, rm) = self.modrm()?;
                Ok(InstKind::Sse {
                    op: sse,
                    dst: Self::xmm(m.reg),
                    src: self.rm_op(rm, gw),
                })
            }
            0x2c => {
                let gw = self.p.gpr_width();
                let sse = match simd {
                    Simd::F3 => SseOp::Cvttss2si(gw),
                    Simd::F2 => SseOp::Cvttsd2si(gw),
                    _ => return unsupported,
                };
                let (m, rm) = self.modrm()?;
                Ok(InstKind::Sse {
                    op: sse,
                    dst: self.reg_op(m.reg, gw),
                    src: self.rm_vec(rm, VecSize::Xmm),
                })
            }
            0x2e | 0x2f => {
                let sse = match (simd, op) {
                    (Simd::None, 0x2e) => SseOp::Ucomiss,
                    (Simd::None, _) => SseOp::Comiss,
                    (Simd::P66, 0x2e) => SseOp::Ucomisd,
                    (Simd::P66, _) => SseOp::Comisd,
                    _ => return Err(DecodeErrorKind::Invalid),
                };
                self.sse(sse)
            }
            0x40..=0x4f => {
                let (m, rm) = self.modrm()?;
                Ok(InstKind::Cmovcc {
                    cond: Cond::from_cc(op),
                    dst: self.reg(m.reg, w),
                    src: self.rm_op(rm, w),
                    width: w,
                })
            }
            0x51 | 0x58 | 0x59 | 0x5c | 0x5e => {
                let sse = match (op, simd) {
                    (0x51, Simd::F3) => SseOp::Sqrtss,
                    (0x51, Simd::F2) => SseOp::Sqrtsd,
                    (0x58, Simd::F3) => SseOp::Addss,
                    (0x58, Simd::F2) => SseOp::Addsd,
                    (0x59, Simd::F3) => SseOp::Mulss,
                    (0x59, Simd::F2) => SseOp::Mulsd,
                    (0x5c, Simd::F3) => SseOp::Subss,
                    (0x5c, Simd::F2) => SseOp::Subsd,
                    (0x5e, Simd::F3) => SseOp::Divss,
                    (0x5e, Simd::F2) => SseOp::Divsd,
                    // packed single/double forms
                    _ => return unsupported,
                };
                self.sse(sse)
            }
            0x54 | 0x56 | 0x57 => {
                let sse = match (op, simd) {
                    (0x54, Simd::None) => SseOp::Andps,
                    (0x54, Simd::P66) => SseOp::Andpd,
                    (0x56, Simd::None) => SseOp::Orps,
                    (0x56, Simd::P66) => SseOp::Orpd,
                    (0x57, Simd::None) => SseOp::Xorps,
                    (0x57, Simd::P66) => SseOp::Xorpd,
                    _ => return Err(DecodeErrorKind::Invalid),
                };
                self.sse(sse)
            }
            0x5a => match simd {
                Simd::F3 => self.sse(SseOp::Cvtss2sd),
                Simd::F2 => self.sse(SseOp::Cvtsd2ss),
                _ => unsupported,
            },
            0x6e => {
                if simd != Simd::P66 {
                    return unsupported;
                }
                let gw = self.p.gpr_width();
                let (m, rm) = self.modrm()?;
                Ok(InstKind::Sse {
                    op: if gw == Width::W64 {
                        SseOp::Movq
                    } else {
                        SseOp::Movd
                    },
                    dst: Self::xmm(m.reg),
                    src: self.rm_op(rm, gw),
                })
            }
            0x7e => match simd {
                Simd::P66 => {
                    let gw = self.p.gpr_width();
                    let (m, rm) = self.modrm()?;
                    Ok(InstKind::Sse {
                        op: if gw == Width::W64 {
                            SseOp::Movq
                        } else {
                            SseOp::Movd
                        },
                        dst: self.rm_op(rm, gw),
                        src: Self::xmm(m.reg),
                    })
                }
                Simd::F3 => self.sse(SseOp::Movq),
                _ => unsupported,
            },
            0xd6 => {
                if simd != Simd::P66 {
                    return unsupported;
                }
                self.sse_store(SseOp::Movq)
            }
            0x6f | 0x7f => {
                let sse = match simd {
                    Simd::P66 => SseOp::Movdqa,
                    Simd::F3 => SseOp::Movdqu,
                    _ => return unsupported,
                };
                if op == 0x6f {
                    self.sse(sse)
                } else {
                    self.sse_store(sse)
                }
            }
            0x71..=0x73 => {
                if simd != Simd::P66 {
                    return unsupported;
                }
                let (m, rm) = self.modrm()?;
                let Rm::Reg(code) = rm else {
                    return Err(DecodeErrorKind::Invalid);
                };
                let sse = match (op, m.digit) {
                    (0x71, 2) => SseOp::Psrlw,
                    (0x71, 4) => SseOp::Psraw,
                    (0x71, 6) => SseOp::Psllw,
                    (0x72, 2) => SseOp::Psrld,
                    (0x72, 4) => SseOp::Psrad,
                    (0x72, 6) => SseOp::Pslld,
                    (0x73, 2) => SseOp::Psrlq,
                    (0x73, 3) => SseOp::Psrldq,
                    (0x73, 6) => SseOp::Psllq,
                    (0x73, 7) => SseOp::Pslldq,
                    _ => return Err(DecodeErrorKind::Invalid),
                };
                Ok(InstKind::Sse {
                    op: sse,
                    dst: Self::xmm(code),
                    src: Operand::Imm(self.cur.u8()? as u64),
                })
            }
            0x74 => self.sse_66(SseOp::Pcmpeqb),
            0x75 => self.sse_66(SseOp::Pcmpeqw),
            0x76 => self.sse_66(SseOp::Pcmpeqd),
            0x80..=0x8f => {
                let rel = self.cur.i32()? as i64;
                Ok(InstKind::JccRel {
                    cond: Cond::from_cc(op),
                    target: self.rel_target(rel),
                })
            }
            0x90..=0x9f => {
                let (_, rm) = self.modrm()?;
                Ok(InstKind::Setcc {
                    cond: Cond::from_cc(op),
                    dst: self.rm_op(rm, Width::W8),
                })
            }
            0xaf => {
                let (m, rm) = self.modrm()?;
                Ok(InstKind::Imul {
                    dst: self.reg(m.reg, w),
                    src: self.rm_op(rm, w),
                    imm: None,
                    width: w,
                })
            }
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let src_width = if op & 1 == 0 { Width::W8 } else { Width::W16 };
                let (m, rm) = self.modrm()?;
                let dst = self.reg(m.reg, w);
                let src = self.rm_op(rm, src_width);
                Ok(if op < 0xbe {
                    InstKind::Movzx {
                        dst,
                        src,
                        src_width,
                    }
                } else {
                    InstKind::Movsx {
                        dst,
                        src,
                        src_width,
                    }
                })
            }
            0xd7 => {
                if simd != Simd::P66 {
                    return unsupported;
                }
                let (m, rm) = self.modrm()?;
                let Rm::Reg(code) = rm else {
                    return Err(DecodeErrorKind::Invalid);
                };
                Ok(InstKind::Sse {
                    op: SseOp::Pmovmskb,
                    dst: self.reg_op(m.reg, self.p.gpr_width()),
                    src: Self::xmm(code),
                })
            }
            0xd1 => self.sse_66(SseOp::Psrlw),
            0xd2 => self.sse_66(SseOp::Psrld),
            0xd3 => self.sse_66(SseOp::Psrlq),
            0xd4 => self.sse_66(SseOp::Paddq),
            0xdb => self.sse_66(SseOp::Pand),
            0xdf => self.sse_66(SseOp::Pandn),
            0xe1 => self.sse_66(SseOp::Psraw),
            0xe2 => self.sse_66(SseOp::Psrad),
            0xeb => self.sse_66(SseOp::Por),
            0xef => self.sse_66(SseOp::Pxor),
            0xf1 => self.sse_66(SseOp::Psllw),
            0xf2 => self.sse_66(SseOp::Pslld),
            0xf3 => self.sse_66(SseOp::Psllq),
            0xf8 => self.sse_66(SseOp::Psubb),
            0xf9 => self.sse_66(SseOp::Psubw),
            0xfa => self.sse_66(SseOp::Psubd),
            0xfb => self.sse_66(SseOp::Psubq),
            0xfc => self.sse_66(SseOp::Paddb),
            0xfd => self.sse_66(SseOp::Paddw),
            0xfe => self.sse_66(SseOp::Paddd),
            0xff => Err(DecodeErrorKind::Invalid),
            _ => unsupported,
        }
    }

    fn vex(&mut self, first: u8) -> DResult<InstKind> {
        if self.p.opsize || self.p.rep.is_some() || self.p.rex.present || self.p.lock {
            return Err(DecodeErrorKind::Invalid);
        }
        let b1 = self.cur.u8()?;
        // R, X, B and vvvv are stored inverted.
        let (rex, map, vvvv, l, pp) = if first == 0xc5 {
            let rex = Rex {
                present: false,
                w: false,
                r: b1 & 0x80 == 0,
                x: false,
                b: false,
            };
            (rex, 1, (!b1 >> 3) & 0x0f, b1 & 0x04 != 0, b1 & 0x03)
        } else {
            let b2 = self.cur.u8()?;
            let rex = Rex {
                present: false,
                w: b2 & 0x80 != 0,
                r: b1 & 0x80 == 0,
                x: b1 & 0x40 == 0,
                b: b1 & 0x20 == 0,
            };
            (rex, b1 & 0x1f, (!b2 >> 3) & 0x0f, b2 & 0x04 != 0, b2 & 0x03)
        };
        if map != 1 {
            return Err(DecodeErrorKind::Unsupported);
        }
        self.p.rex = rex;
        let size = if l { VecSize::Ymm } else { VecSize::Xmm };
        let op = self.cur.u8()?;
        match (op, pp) {
            (0x77, 0) => {
                if l {
                    // vzeroall
                    return Err(DecodeErrorKind::Unsupported);
                }
                if vvvv != 0 {
                    return Err(DecodeErrorKind::Invalid);
                }
                Ok(InstKind::Vzeroupper)
            }
            (0x6f | 0x7f, 1 | 2) => {
                if vvvv != 0 {
                    return Err(DecodeErrorKind::Invalid);
                }
                let (m, rm) = self.modrm()?;
                let reg = Operand::Vec(VecReg { index: m.reg, size });
                let rm = self.rm_vec(rm, size);
                let (dst, src) = if op == 0x6f { (reg, rm) } else { (rm, reg) };
                Ok(InstKind::VexMov {
                    aligned: pp == 1,
                    dst,
                    src,
                })
            }
            (0xef | 0xd4, 1) => {
                let (m, rm) = self.modrm()?;
                Ok(InstKind::VexBinary {
                    op: if op == 0xef {
                        VexOp::Vpxor
                    } else {
                        VexOp::Vpaddq
                    },
                    dst: VecReg { index: m.reg, size },
                    src1: VecReg { index: vvvv, size },
                    src2: self.rm_vec(rm, size),
                })
            }
            _ => Err(DecodeErrorKind::Unsupported),
        }
    }
}

fn alu_kind(digit: u8, dst: Operand, src: Operand, width: Width) -> InstKind {
    match AluOp::from_digit(digit) {
        Some(op) => InstKind::Alu {
            op,
            dst,
            src,
            width,
        },
        None => InstKind::Cmp {
            lhs: dst,
            rhs: src,
            width,
        },
    }
}

/// `LOCK` is only permitted on read-modify-write instructions with a memory destination.
fn lockable(kind: &InstKind) -> bool {
    match kind {
        InstKind::Alu { dst, .. }
        | InstKind::Inc { dst, .. }
        | InstKind::Dec { dst, .. }
        | InstKind::Neg { dst, .. }
        | InstKind::Not { dst, .. } => dst.is_mem(),
        InstKind::Xchg { a, b, .. } => a.is_mem() || b.is_mem(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(bytes: &[u8]) -> Instruction {
        decode(0x1000, bytes).unwrap()
    }

    #[test]
    fn rex_must_immediately_precede_opcode() {
        // 48 66 89 c8: the REX byte is followed by a legacy prefix and is ignored.
        let inst = d(&[0x48, 0x66, 0x89, 0xc8]);
        assert_eq!(
            inst.kind,
            InstKind::Mov {
                dst: Operand::Reg(Reg::new(Gpr::Rax, Width::W16)),
                src: Operand::Reg(Reg::new(Gpr::Rcx, Width::W16)),
                width: Width::W16,
            }
        );
    }

    #[test]
    fn high_byte_registers_without_rex() {
        // mov ah, bh
        let inst = d(&[0x88, 0xfc]);
        assert_eq!(inst.to_string(), "mov\tah,bh");
        // with REX: mov spl, dil
        let inst = d(&[0x40, 0x88, 0xfc]);
        assert_eq!(inst.to_string(), "mov\tspl,dil");
    }

    #[test]
    fn sib_without_base_and_r12_index() {
        // mov eax, [r12*4+0x10] with REX.X
        let inst = d(&[0x42, 0x8b, 0x04, 0xa5, 0x10, 0x00, 0x00, 0x00]);
        let InstKind::Mov {
            src: Operand::Mem(addr),
            ..
        } = inst.kind
        else {
            panic!("unexpected {inst:?}");
        };
        assert_eq!(addr.base, None);
        assert_eq!(addr.index, Some(Gpr::R12));
        assert_eq!(addr.scale, 4);
        assert_eq!(addr.disp, 0x10);
    }

    #[test]
    fn relative_targets_use_next_rip() {
        // jmp -2 (self loop)
        assert_eq!(d(&[0xeb, 0xfe]).kind, InstKind::JmpRel { target: 0x1000 });
        // call +0
        assert_eq!(
            d(&[0xe8, 0, 0, 0, 0]).kind,
            InstKind::CallRel { target: 0x1005 }
        );
        // jne rel32
        assert_eq!(
            d(&[0x0f, 0x85, 0x10, 0, 0, 0]).kind,
            InstKind::JccRel {
                cond: Cond::Ne,
                target: 0x1016
            }
        );
    }

    #[test]
    fn lock_requires_memory_destination() {
        // lock add [rax], ecx
        assert!(decode(0, &[0xf0, 0x01, 0x08]).is_ok());
        // lock add eax, ecx
        let err = decode(0, &[0xf0, 0x01, 0xc8]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Invalid);
    }

    #[test]
    fn prefix_flood_is_too_long() {
        let bytes = [0x66u8; 16];
        let err = decode(0x2000, &bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::TooLong);
        assert_eq!(err.addr, 0x2000);
        assert_eq!(err.bytes.len(), MAX_INST_LEN);
    }

    #[test]
    fn truncated_immediate_is_eof() {
        let err = decode(0, &[0xb8, 0x01, 0x02]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::UnexpectedEof);
        assert_eq!(err.bytes.as_slice(), &[0xb8, 0x01, 0x02]);
    }

    #[test]
    fn removed_opcodes_are_invalid() {
        let err = decode(0x10, &[0x06]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Invalid);
        assert_eq!(err.bytes.as_slice(), &[0x06]);
    }

    #[test]
    fn vex_with_legacy_prefix_is_invalid() {
        let err = decode(0, &[0x66, 0xc5, 0xf9, 0xef, 0xc1]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Invalid);
    }

    #[test]
    fn rep_prefix_on_ret_is_ignored() {
        assert_eq!(d(&[0xf3, 0xc3]).kind, InstKind::Ret { pop: 0 });
    }
}
