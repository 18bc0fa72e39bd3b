//! Legacy-encoded SSE/SSE2.
//!
//! Legacy 128-bit writes preserve register bits 128 and up. Scalar single/double arithmetic goes
//! through the cached f32/f64 representation of the destination so chains of scalar math never
//! touch the raw lanes.

use vx64_types::Width;
use vx64_x86::SseOp;

use super::invalid;
use crate::error::Result;
use crate::mem::CpuBus;
use crate::operand::{Bound, Loc};
use crate::state::{CpuState, RFlags};

const F32_DEFAULT_NAN: u32 = 0xffc0_0000;
const F64_DEFAULT_NAN: u64 = 0xfff8_0000_0000_0000;

pub(super) fn exec<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    op: SseOp,
    ops: &Bound,
) -> Result<()> {
    let (dst, src) = (ops.get(0), ops.get(1));
    match op {
        SseOp::Movaps
        | SseOp::Movups
        | SseOp::Movapd
        | SseOp::Movupd
        | SseOp::Movdqa
        | SseOp::Movdqu => {
            let v = src.read_xmm(state, bus)?;
            dst.write_xmm(state, bus, v)?;
        }
        SseOp::Movss => match (dst, src) {
            (Loc::Vec(d), Loc::Vec(s)) => {
                let v = state.vec_mut(s.index as usize).f32();
                state.vec_mut(d.index as usize).set_f32(v);
            }
            (Loc::Vec(d), Loc::Mem(m)) => {
                let v = bus.read_u32(m.effective_address(state))?;
                state.vec_mut(d.index as usize).set_xmm(u128::from(v));
            }
            (Loc::Mem(m), Loc::Vec(s)) => {
                let v = state.vec_mut(s.index as usize).f32();
                bus.write_u32(m.effective_address(state), v.to_bits())?;
            }
            _ => return Err(invalid(state)),
        },
        SseOp::Movsd => match (dst, src) {
            (Loc::Vec(d), Loc::Vec(s)) => {
                let v = state.vec_mut(s.index as usize).f64();
                state.vec_mut(d.index as usize).set_f64(v);
            }
            (Loc::Vec(d), Loc::Mem(m)) => {
                let v = bus.read_u64(m.effective_address(state))?;
                state.vec_mut(d.index as usize).set_xmm(u128::from(v));
            }
            (Loc::Mem(m), Loc::Vec(s)) => {
                let v = state.vec_mut(s.index as usize).f64();
                bus.write_u64(m.effective_address(state), v.to_bits())?;
            }
            _ => return Err(invalid(state)),
        },
        SseOp::Movd | SseOp::Movq => {
            let width = if op == SseOp::Movd {
                Width::W32
            } else {
                Width::W64
            };
            match (dst, src) {
                // Loads zero-extend into the low 128 bits.
                (Loc::Vec(d), Loc::Vec(s)) => {
                    let v = state.vec_mut(s.index as usize).xmm() as u64;
                    state
                        .vec_mut(d.index as usize)
                        .set_xmm(u128::from(width.truncate(v)));
                }
                (Loc::Vec(d), other) => {
                    let v = other.read(state, bus, width)?;
                    state.vec_mut(d.index as usize).set_xmm(u128::from(v));
                }
                (other, Loc::Vec(s)) => {
                    let v = state.vec_mut(s.index as usize).xmm() as u64;
                    other.write(state, bus, width, v)?;
                }
                _ => return Err(invalid(state)),
            }
        }

        SseOp::Pxor | SseOp::Xorps | SseOp::Xorpd => binary(state, bus, dst, src, |a, b| a ^ b)?,
        SseOp::Pand | SseOp::Andps | SseOp::Andpd => binary(state, bus, dst, src, |a, b| a & b)?,
        SseOp::Por | SseOp::Orps | SseOp::Orpd => binary(state, bus, dst, src, |a, b| a | b)?,
        SseOp::Pandn => binary(state, bus, dst, src, |a, b| !a & b)?,

        SseOp::Paddb | SseOp::Paddw | SseOp::Paddd | SseOp::Paddq => {
            let bytes = lane_bytes(op);
            binary(state, bus, dst, src, |a, b| {
                lanes(a, b, bytes, u64::wrapping_add)
            })?;
        }
        SseOp::Psubb | SseOp::Psubw | SseOp::Psubd | SseOp::Psubq => {
            let bytes = lane_bytes(op);
            binary(state, bus, dst, src, |a, b| {
                lanes(a, b, bytes, u64::wrapping_sub)
            })?;
        }
        SseOp::Pcmpeqb | SseOp::Pcmpeqw | SseOp::Pcmpeqd => {
            let bytes = lane_bytes(op);
            binary(state, bus, dst, src, |a, b| {
                lanes(a, b, bytes, |x, y| if x == y { u64::MAX } else { 0 })
            })?;
        }
        SseOp::Pmovmskb => {
            let v = src.read_xmm(state, bus)?;
            let mask = (0..16).fold(0u64, |m, i| m | (((v >> (i * 8 + 7)) & 1) as u64) << i);
            dst.write(state, bus, Width::W64, mask)?;
        }

        SseOp::Psllw
        | SseOp::Pslld
        | SseOp::Psllq
        | SseOp::Psrlw
        | SseOp::Psrld
        | SseOp::Psrlq
        | SseOp::Psraw
        | SseOp::Psrad => {
            // The count is the low 32 bits of the source, shared by every lane.
            let count = match src {
                Loc::Imm(n) => n,
                other => u64::from(other.read_xmm(state, bus)? as u32),
            };
            let v = dst.read_xmm(state, bus)?;
            dst.write_xmm(state, bus, shift_lanes(op, v, count))?;
        }
        SseOp::Pslldq | SseOp::Psrldq => {
            let Loc::Imm(count) = src else {
                return Err(invalid(state));
            };
            let v = dst.read_xmm(state, bus)?;
            let r = match count {
                0..=15 if op == SseOp::Pslldq => v << (count * 8),
                0..=15 => v >> (count * 8),
                _ => 0,
            };
            dst.write_xmm(state, bus, r)?;
        }

        SseOp::Addss | SseOp::Subss | SseOp::Mulss | SseOp::Divss | SseOp::Sqrtss => {
            let b = src_f32(state, bus, src)?;
            let d = vec_index(state, dst)?;
            let a = state.vec_mut(d).f32();
            let r = match op {
                SseOp::Addss => nan_rules_f32(a, b, a + b),
                SseOp::Subss => nan_rules_f32(a, b, a - b),
                SseOp::Mulss => nan_rules_f32(a, b, a * b),
                SseOp::Divss => nan_rules_f32(a, b, a / b),
                _ => nan_rules_f32(b, b, b.sqrt()),
            };
            state.vec_mut(d).set_f32(r);
        }
        SseOp::Addsd | SseOp::Subsd | SseOp::Mulsd | SseOp::Divsd | SseOp::Sqrtsd => {
            let b = src_f64(state, bus, src)?;
            let d = vec_index(state, dst)?;
            let a = state.vec_mut(d).f64();
            let r = match op {
                SseOp::Addsd => nan_rules_f64(a, b, a + b),
                SseOp::Subsd => nan_rules_f64(a, b, a - b),
                SseOp::Mulsd => nan_rules_f64(a, b, a * b),
                SseOp::Divsd => nan_rules_f64(a, b, a / b),
                _ => nan_rules_f64(b, b, b.sqrt()),
            };
            state.vec_mut(d).set_f64(r);
        }

        SseOp::Comiss | SseOp::Ucomiss => {
            let b = src_f32(state, bus, src)?;
            let d = vec_index(state, dst)?;
            let a = state.vec_mut(d).f32();
            compare(state, a.partial_cmp(&b));
        }
        SseOp::Comisd | SseOp::Ucomisd => {
            let b = src_f64(state, bus, src)?;
            let d = vec_index(state, dst)?;
            let a = state.vec_mut(d).f64();
            compare(state, a.partial_cmp(&b));
        }

        SseOp::Cvtsi2ss(width) => {
            let v = width.sign_extend(src.read(state, bus, width)?) as i64;
            let d = vec_index(state, dst)?;
            state.vec_mut(d).set_f32(v as f32);
        }
        SseOp::Cvtsi2sd(width) => {
            let v = width.sign_extend(src.read(state, bus, width)?) as i64;
            let d = vec_index(state, dst)?;
            state.vec_mut(d).set_f64(v as f64);
        }
        SseOp::Cvttss2si(width) => {
            let v = f64::from(src_f32(state, bus, src)?);
            dst.write(state, bus, width, truncate_to_int(v, width))?;
        }
        SseOp::Cvttsd2si(width) => {
            let v = src_f64(state, bus, src)?;
            dst.write(state, bus, width, truncate_to_int(v, width))?;
        }
        SseOp::Cvtss2sd => {
            let v = src_f32(state, bus, src)?;
            let d = vec_index(state, dst)?;
            state.vec_mut(d).set_f64(widen(v));
        }
        SseOp::Cvtsd2ss => {
            let v = src_f64(state, bus, src)?;
            let d = vec_index(state, dst)?;
            state.vec_mut(d).set_f32(narrow(v));
        }
    }
    Ok(())
}

/// `dst = f(dst, src)` on the low 128 bits.
fn binary<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    dst: Loc,
    src: Loc,
    f: impl Fn(u128, u128) -> u128,
) -> Result<()> {
    let b = src.read_xmm(state, bus)?;
    let a = dst.read_xmm(state, bus)?;
    dst.write_xmm(state, bus, f(a, b))
}

fn lane_bytes(op: SseOp) -> usize {
    match op {
        SseOp::Paddb | SseOp::Psubb | SseOp::Pcmpeqb => 1,
        SseOp::Paddw
        | SseOp::Psubw
        | SseOp::Pcmpeqw
        | SseOp::Psllw
        | SseOp::Psrlw
        | SseOp::Psraw => 2,
        SseOp::Paddd
        | SseOp::Psubd
        | SseOp::Pcmpeqd
        | SseOp::Pslld
        | SseOp::Psrld
        | SseOp::Psrad => 4,
        _ => 8,
    }
}

/// Applies `f` independently to each `bytes`-wide lane of `a` and `b`.
pub(super) fn lanes(a: u128, b: u128, bytes: usize, f: impl Fn(u64, u64) -> u64) -> u128 {
    let bits = bytes * 8;
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    (0..16 / bytes).fold(0u128, |out, i| {
        let sh = i * bits;
        let x = (a >> sh) as u64 & mask;
        let y = (b >> sh) as u64 & mask;
        out | (u128::from(f(x, y) & mask) << sh)
    })
}

/// Per-lane shift. Counts at or above the lane width clear the lane (or fill it with the sign
/// bit for arithmetic shifts).
fn shift_lanes(op: SseOp, v: u128, count: u64) -> u128 {
    let bytes = lane_bytes(op);
    let bits = (bytes * 8) as u64;
    let width = Width::from_bytes(bytes).unwrap_or(Width::W64);
    lanes(v, 0, bytes, |x, _| match op {
        SseOp::Psllw | SseOp::Pslld | SseOp::Psllq if count < bits => x << count,
        SseOp::Psrlw | SseOp::Psrld | SseOp::Psrlq if count < bits => x >> count,
        SseOp::Psraw | SseOp::Psrad => {
            let n = count.min(bits - 1);
            ((width.sign_extend(x) as i64) >> n) as u64
        }
        _ => 0,
    })
}

fn vec_index(state: &CpuState, loc: Loc) -> Result<usize> {
    match loc {
        Loc::Vec(v) => Ok(v.index as usize),
        _ => Err(invalid(state)),
    }
}

fn src_f32<B: CpuBus>(state: &mut CpuState, bus: &mut B, loc: Loc) -> Result<f32> {
    match loc {
        Loc::Vec(v) => Ok(state.vec_mut(v.index as usize).f32()),
        Loc::Mem(m) => Ok(f32::from_bits(bus.read_u32(m.effective_address(state))?)),
        _ => Err(invalid(state)),
    }
}

fn src_f64<B: CpuBus>(state: &mut CpuState, bus: &mut B, loc: Loc) -> Result<f64> {
    match loc {
        Loc::Vec(v) => Ok(state.vec_mut(v.index as usize).f64()),
        Loc::Mem(m) => Ok(f64::from_bits(bus.read_u64(m.effective_address(state))?)),
        _ => Err(invalid(state)),
    }
}

/// x86 NaN propagation: the first NaN operand wins (quieted); a NaN produced from non-NaN
/// inputs is the default negative quiet NaN.
fn nan_rules_f32(a: f32, b: f32, r: f32) -> f32 {
    if a.is_nan() {
        f32::from_bits(a.to_bits() | 0x0040_0000)
    } else if b.is_nan() {
        f32::from_bits(b.to_bits() | 0x0040_0000)
    } else if r.is_nan() {
        f32::from_bits(F32_DEFAULT_NAN)
    } else {
        r
    }
}

fn nan_rules_f64(a: f64, b: f64, r: f64) -> f64 {
    if a.is_nan() {
        f64::from_bits(a.to_bits() | 0x0008_0000_0000_0000)
    } else if b.is_nan() {
        f64::from_bits(b.to_bits() | 0x0008_0000_0000_0000)
    } else if r.is_nan() {
        f64::from_bits(F64_DEFAULT_NAN)
    } else {
        r
    }
}

fn widen(v: f32) -> f64 {
    if !v.is_nan() {
        return f64::from(v);
    }
    let b = u64::from(v.to_bits());
    f64::from_bits(((b & 0x8000_0000) << 32) | 0x7ff8_0000_0000_0000 | ((b & 0x003f_ffff) << 29))
}

fn narrow(v: f64) -> f32 {
    if !v.is_nan() {
        return v as f32;
    }
    let b = v.to_bits();
    f32::from_bits(
        ((b >> 32) as u32 & 0x8000_0000) | 0x7fc0_0000 | ((b >> 29) as u32 & 0x003f_ffff),
    )
}

/// Truncating conversion; NaN and out-of-range inputs give the integer indefinite value.
fn truncate_to_int(v: f64, width: Width) -> u64 {
    let limit = 2f64.powi(width.bits() as i32 - 1);
    let t = v.trunc();
    if t >= -limit && t < limit {
        width.truncate(t as i64 as u64)
    } else {
        width.sign_bit()
    }
}

/// `comis*`/`ucomis*` flag results.
fn compare(state: &mut CpuState, ord: Option<core::cmp::Ordering>) {
    use core::cmp::Ordering;

    let (zf, pf, cf) = match ord {
        None => (true, true, true),
        Some(Ordering::Greater) => (false, false, false),
        Some(Ordering::Less) => (false, false, true),
        Some(Ordering::Equal) => (true, false, false),
    };
    let mut flags = state.flags() - (RFlags::OF | RFlags::SF | RFlags::AF);
    flags.set(RFlags::ZF, zf);
    flags.set(RFlags::PF, pf);
    flags.set(RFlags::CF, cf);
    state.set_flags(flags);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_add_wraps_per_lane() {
        let a = 0x00ff_u128 | (0xffff_ffff_ffff_ffff_u128 << 64);
        let r = lanes(a, 1 | (1 << 64), 8, u64::wrapping_add);
        assert_eq!(r, 0x0100);
        assert_eq!(lanes(0xff, 0x01, 1, u64::wrapping_add), 0);
    }

    #[test]
    fn shift_counts_past_lane_width() {
        let v = 0x8000_u128 | (0x0001 << 16);
        assert_eq!(shift_lanes(SseOp::Psllw, v, 16), 0);
        assert_eq!(shift_lanes(SseOp::Psraw, v, 100), 0xffff);
        assert_eq!(shift_lanes(SseOp::Psrlw, v, 15), 0x0001);
        assert_eq!(shift_lanes(SseOp::Psllq, 1, 63), 1 << 63);
    }

    #[test]
    fn nan_propagation() {
        let snan = f32::from_bits(0x7f80_0001);
        assert_eq!(nan_rules_f32(1.0, snan, f32::NAN).to_bits(), 0x7fc0_0001);
        let inf = f32::INFINITY;
        assert_eq!(nan_rules_f32(inf, -inf, inf - inf).to_bits(), F32_DEFAULT_NAN);
        assert_eq!(nan_rules_f64(-1.0, -1.0, (-1.0f64).sqrt()).to_bits(), F64_DEFAULT_NAN);
    }

    #[test]
    fn truncation_indefinite() {
        assert_eq!(truncate_to_int(-1.9, Width::W32), 0xffff_ffff);
        assert_eq!(truncate_to_int(2147483648.0, Width::W32), 0x8000_0000);
        assert_eq!(truncate_to_int(f64::NAN, Width::W64), 1 << 63);
        assert_eq!(truncate_to_int(-9.223372036854775808e18, Width::W64), 1 << 63);
        assert_eq!(truncate_to_int(1e18, Width::W64), 1_000_000_000_000_000_000);
    }

    #[test]
    fn nan_width_conversions_keep_payload() {
        let n = f32::from_bits(0xff80_0001);
        assert_eq!(widen(n).to_bits(), 0xfff8_0000_2000_0000);
        assert_eq!(narrow(widen(n)).to_bits(), 0xffc0_0001);
    }
}
