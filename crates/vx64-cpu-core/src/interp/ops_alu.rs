use vx64_types::{Gpr, Width};
use vx64_x86::{AluOp, FlagOp, InstKind, MulDivOp, Reg, ShiftCount, ShiftOp};

use super::alu::{
    add_with_flags, dec_with_flags, inc_with_flags, logic_with_flags, neg_with_flags, set_szp,
    sub_with_flags,
};
use super::invalid;
use crate::error::{CpuError, Result};
use crate::mem::CpuBus;
use crate::operand::Bound;
use crate::state::{CpuState, RFlags};

pub(super) fn exec<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    kind: &InstKind,
    ops: &Bound,
) -> Result<()> {
    let mut flags = state.flags();
    match *kind {
        InstKind::Alu { op, width, .. } => {
            let dst = ops.get(0);
            let a = dst.read(state, bus, width)?;
            let b = ops.get(1).read(state, bus, width)?;
            let cf = flags.contains(RFlags::CF);
            let r = match op {
                AluOp::Add => add_with_flags(&mut flags, a, b, false, width),
                AluOp::Adc => add_with_flags(&mut flags, a, b, cf, width),
                AluOp::Sub => sub_with_flags(&mut flags, a, b, false, width),
                AluOp::Sbb => sub_with_flags(&mut flags, a, b, cf, width),
                AluOp::And => logic_with_flags(&mut flags, a & b, width),
                AluOp::Or => logic_with_flags(&mut flags, a | b, width),
                AluOp::Xor => logic_with_flags(&mut flags, a ^ b, width),
            };
            dst.write(state, bus, width, r)?;
        }
        InstKind::Cmp { width, .. } => {
            let a = ops.get(0).read(state, bus, width)?;
            let b = ops.get(1).read(state, bus, width)?;
            sub_with_flags(&mut flags, a, b, false, width);
        }
        InstKind::Test { width, .. } => {
            let a = ops.get(0).read(state, bus, width)?;
            let b = ops.get(1).read(state, bus, width)?;
            logic_with_flags(&mut flags, a & b, width);
        }
        InstKind::Inc { width, .. } | InstKind::Dec { width, .. } | InstKind::Neg { width, .. } => {
            let dst = ops.get(0);
            let a = dst.read(state, bus, width)?;
            let r = match kind {
                InstKind::Inc { .. } => inc_with_flags(&mut flags, a, width),
                InstKind::Dec { .. } => dec_with_flags(&mut flags, a, width),
                _ => neg_with_flags(&mut flags, a, width),
            };
            dst.write(state, bus, width, r)?;
        }
        InstKind::Not { width, .. } => {
            let dst = ops.get(0);
            let a = dst.read(state, bus, width)?;
            dst.write(state, bus, width, !a)?;
        }
        InstKind::MulDiv { op, width, .. } => {
            let src = ops.get(0).read(state, bus, width)?;
            mul_div(state, &mut flags, op, src, width)?;
        }
        InstKind::Imul { dst, imm, width, .. } => {
            let b = ops.get(1).read(state, bus, width)?;
            let a = match imm {
                Some(imm) => width.truncate(imm),
                None => state.read_reg(dst),
            };
            let full = signed(width, a) * signed(width, b);
            let r = width.truncate(full as u64);
            let overflow = signed(width, r) != full;
            flags.set(RFlags::CF, overflow);
            flags.set(RFlags::OF, overflow);
            state.write_reg(dst, r);
        }
        InstKind::Shift {
            op, count, width, ..
        } => {
            let raw = match count {
                ShiftCount::Imm(n) => u32::from(n),
                ShiftCount::Cl => (state.gpr(Gpr::Rcx) & 0xff) as u32,
            };
            let masked = raw & if width == Width::W64 { 63 } else { 31 };
            let dst = ops.get(0);
            let a = dst.read(state, bus, width)?;
            let r = if masked == 0 {
                a
            } else {
                shift(&mut flags, op, a, masked, width)
            };
            dst.write(state, bus, width, r)?;
        }
        InstKind::Flag(op) => match op {
            FlagOp::Clc => flags.remove(RFlags::CF),
            FlagOp::Stc => flags.insert(RFlags::CF),
            FlagOp::Cmc => flags.toggle(RFlags::CF),
            FlagOp::Cld => flags.remove(RFlags::DF),
            FlagOp::Std => flags.insert(RFlags::DF),
        },
        _ => return Err(invalid(state)),
    }
    state.set_flags(flags);
    Ok(())
}

fn signed(width: Width, v: u64) -> i128 {
    i128::from(width.sign_extend(v) as i64)
}

fn acc(width: Width) -> Reg {
    Reg::new(Gpr::Rax, width)
}

fn data(width: Width) -> Reg {
    Reg::new(Gpr::Rdx, width)
}

/// One-operand `mul`/`imul`/`div`/`idiv` on `rDX:rAX` (`AX` for byte operands).
///
/// SF, ZF, AF and PF are architecturally undefined here and are left unchanged.
fn mul_div(
    state: &mut CpuState,
    flags: &mut RFlags,
    op: MulDivOp,
    src: u64,
    width: Width,
) -> Result<()> {
    let bits = width.bits();
    let a = state.read_reg(acc(width));
    match op {
        MulDivOp::Mul | MulDivOp::Imul => {
            let (lo, hi, overflow) = if op == MulDivOp::Mul {
                let full = u128::from(a) * u128::from(src);
                let hi = (full >> bits) as u64 & width.mask();
                (full as u64 & width.mask(), hi, hi != 0)
            } else {
                let full = signed(width, a) * signed(width, src);
                let lo = width.truncate(full as u64);
                let hi = width.truncate((full >> bits) as u64);
                (lo, hi, signed(width, lo) != full)
            };
            if width == Width::W8 {
                state.write_reg(acc(Width::W16), lo | (hi << 8));
            } else {
                state.write_reg(acc(width), lo);
                state.write_reg(data(width), hi);
            }
            flags.set(RFlags::CF, overflow);
            flags.set(RFlags::OF, overflow);
        }
        MulDivOp::Div | MulDivOp::Idiv => {
            let rip = state.rip();
            let dividend_hi = if width == Width::W8 {
                state.read_reg(Reg {
                    gpr: Gpr::Rax,
                    width: Width::W8,
                    high8: true,
                })
            } else {
                state.read_reg(data(width))
            };
            let dividend = (u128::from(dividend_hi) << bits) | u128::from(a);
            let divisor = width.truncate(src);
            if divisor == 0 {
                return Err(CpuError::DivideError { rip });
            }
            let (q, r) = if op == MulDivOp::Div {
                let q = dividend / u128::from(divisor);
                if q > u128::from(width.mask()) {
                    return Err(CpuError::DivideError { rip });
                }
                (q as u64, (dividend % u128::from(divisor)) as u64)
            } else {
                // Sign-extend the 2*bits-wide dividend.
                let shift = 128 - 2 * bits;
                let dividend = ((dividend << shift) as i128) >> shift;
                let divisor = signed(width, divisor);
                // i128::MIN / -1 at 64-bit width overflows the host division too.
                let (Some(q), Some(r)) = (
                    dividend.checked_div(divisor),
                    dividend.checked_rem(divisor),
                ) else {
                    return Err(CpuError::DivideError { rip });
                };
                let min = -(1i128 << (bits - 1));
                let max = (1i128 << (bits - 1)) - 1;
                if q < min || q > max {
                    return Err(CpuError::DivideError { rip });
                }
                (width.truncate(q as u64), width.truncate(r as u64))
            };
            if width == Width::W8 {
                state.write_reg(acc(Width::W16), q | (r << 8));
            } else {
                state.write_reg(acc(width), q);
                state.write_reg(data(width), r);
            }
        }
    }
    Ok(())
}

/// Shift/rotate by a non-zero masked count. AF is left unchanged.
fn shift(flags: &mut RFlags, op: ShiftOp, a: u64, count: u32, width: Width) -> u64 {
    let bits = width.bits();
    let a = width.truncate(a);
    let msb = |v: u64| v & width.sign_bit() != 0;
    match op {
        ShiftOp::Shl => {
            let wide = u128::from(a) << count;
            let r = width.truncate(wide as u64);
            let cf = (wide >> bits) & 1 != 0;
            flags.set(RFlags::CF, cf);
            flags.set(RFlags::OF, msb(r) != cf);
            set_szp(flags, width, r);
            r
        }
        ShiftOp::Shr => {
            let r = a >> count;
            flags.set(RFlags::CF, (a >> (count - 1)) & 1 != 0);
            flags.set(RFlags::OF, msb(a));
            set_szp(flags, width, r);
            r
        }
        ShiftOp::Sar => {
            let sa = width.sign_extend(a) as i64;
            let r = width.truncate((sa >> count.min(63)) as u64);
            flags.set(RFlags::CF, (sa >> (count - 1).min(63)) & 1 != 0);
            flags.remove(RFlags::OF);
            set_szp(flags, width, r);
            r
        }
        ShiftOp::Rol | ShiftOp::Ror => {
            let n = count % bits;
            let r = if n == 0 {
                a
            } else if op == ShiftOp::Rol {
                width.truncate((a << n) | (a >> (bits - n)))
            } else {
                width.truncate((a >> n) | (a << (bits - n)))
            };
            if op == ShiftOp::Rol {
                let cf = r & 1 != 0;
                flags.set(RFlags::CF, cf);
                flags.set(RFlags::OF, msb(r) != cf);
            } else {
                let second = r & (width.sign_bit() >> 1) != 0;
                flags.set(RFlags::CF, msb(r));
                flags.set(RFlags::OF, msb(r) != second);
            }
            r
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shl_carry_and_overflow() {
        let mut flags = RFlags::empty();
        assert_eq!(shift(&mut flags, ShiftOp::Shl, 0xc0, 1, Width::W8), 0x80);
        assert!(flags.contains(RFlags::CF));
        assert!(!flags.contains(RFlags::OF));
        assert!(flags.contains(RFlags::SF));

        // Byte shifts may exceed the operand width.
        assert_eq!(shift(&mut flags, ShiftOp::Shl, 0xff, 9, Width::W8), 0);
        assert!(!flags.contains(RFlags::CF));
        assert!(flags.contains(RFlags::ZF));
    }

    #[test]
    fn sar_fills_with_sign() {
        let mut flags = RFlags::empty();
        assert_eq!(shift(&mut flags, ShiftOp::Sar, 0x8000_0000, 31, Width::W32), 0xffff_ffff);
        assert!(!flags.contains(RFlags::CF));
        assert_eq!(shift(&mut flags, ShiftOp::Sar, 0x81, 1, Width::W8), 0xc0);
        assert!(flags.contains(RFlags::CF));
        assert!(!flags.contains(RFlags::OF));
    }

    #[test]
    fn rotates() {
        let mut flags = RFlags::empty();
        assert_eq!(shift(&mut flags, ShiftOp::Rol, 0x81, 1, Width::W8), 0x03);
        assert!(flags.contains(RFlags::CF));
        assert!(flags.contains(RFlags::OF));
        assert_eq!(
            shift(&mut flags, ShiftOp::Ror, 1, 1, Width::W64),
            0x8000_0000_0000_0000
        );
        assert!(flags.contains(RFlags::CF));
        // rol by a multiple of the width leaves the value but still updates CF.
        assert_eq!(shift(&mut flags, ShiftOp::Rol, 0x12, 8, Width::W8), 0x12);
        assert!(!flags.contains(RFlags::CF));
    }
}
