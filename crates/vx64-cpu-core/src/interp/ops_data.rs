use vx64_types::{Gpr, Width};
use vx64_x86::{InstKind, Reg};

use super::invalid;
use crate::error::Result;
use crate::mem::CpuBus;
use crate::operand::{Bound, Loc};
use crate::state::CpuState;

pub(super) fn exec<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    kind: &InstKind,
    ops: &Bound,
) -> Result<()> {
    match *kind {
        InstKind::Mov { width, .. } => {
            let v = ops.get(1).read(state, bus, width)?;
            ops.get(0).write(state, bus, width, v)?;
        }
        InstKind::Movzx { dst, src_width, .. } => {
            let v = ops.get(1).read(state, bus, src_width)?;
            state.write_reg(dst, v);
        }
        InstKind::Movsx { dst, src_width, .. } => {
            let v = ops.get(1).read(state, bus, src_width)?;
            state.write_reg(dst, dst.width.truncate(src_width.sign_extend(v)));
        }
        InstKind::Lea { dst, .. } => {
            let Loc::Mem(m) = ops.get(1) else {
                return Err(invalid(state));
            };
            state.write_reg(dst, m.offset(state));
        }
        InstKind::Xchg { width, .. } => {
            let (a, b) = (ops.get(0), ops.get(1));
            let va = a.read(state, bus, width)?;
            let vb = b.read(state, bus, width)?;
            // Memory first so a faulting store leaves both registers intact.
            if matches!(b, Loc::Mem(_)) {
                b.write(state, bus, width, va)?;
                a.write(state, bus, width, vb)?;
            } else {
                a.write(state, bus, width, vb)?;
                b.write(state, bus, width, va)?;
            }
        }
        InstKind::Push { width, .. } => {
            let v = ops.get(0).read(state, bus, width)?;
            push(state, bus, width, v)?;
        }
        InstKind::Pop { width, .. } => {
            let rsp = state.gpr(Gpr::Rsp);
            let v = bus.read_sized(rsp, width.bytes())?;
            state.set_gpr(Gpr::Rsp, rsp.wrapping_add(width.bytes() as u64));
            // `pop [rsp+d]` addresses with the incremented RSP.
            if let Err(e) = ops.get(0).write(state, bus, width, v) {
                state.set_gpr(Gpr::Rsp, rsp);
                return Err(e);
            }
        }
        InstKind::SignExtendAcc { width } => {
            let half = half_width(width);
            let v = state.read_reg(Reg::new(Gpr::Rax, half));
            state.write_reg(Reg::new(Gpr::Rax, width), half.sign_extend(v));
        }
        InstKind::SignFillDx { width } => {
            let v = state.read_reg(Reg::new(Gpr::Rax, width));
            let fill = if v & width.sign_bit() != 0 { u64::MAX } else { 0 };
            state.write_reg(Reg::new(Gpr::Rdx, width), fill);
        }
        InstKind::Setcc { cond, .. } => {
            let v = u64::from(state.cond(cond));
            ops.get(0).write(state, bus, Width::W8, v)?;
        }
        InstKind::Cmovcc {
            cond, dst, width, ..
        } => {
            // The source is read even when the condition fails, and a 32-bit destination is
            // zero-extended either way.
            let v = ops.get(1).read(state, bus, width)?;
            let v = if state.cond(cond) {
                v
            } else {
                state.read_reg(dst)
            };
            state.write_reg(dst, v);
        }
        _ => return Err(invalid(state)),
    }
    Ok(())
}

fn half_width(width: Width) -> Width {
    match width {
        Width::W64 => Width::W32,
        Width::W32 => Width::W16,
        _ => Width::W8,
    }
}

/// Pushes `val` at `width`; RSP only moves once the store succeeded.
pub(crate) fn push<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    width: Width,
    val: u64,
) -> Result<()> {
    let rsp = state.gpr(Gpr::Rsp).wrapping_sub(width.bytes() as u64);
    bus.write_sized(rsp, width.bytes(), val)?;
    state.set_gpr(Gpr::Rsp, rsp);
    Ok(())
}

/// Pops a 64-bit value.
pub(crate) fn pop64<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<u64> {
    let rsp = state.gpr(Gpr::Rsp);
    let v = bus.read_u64(rsp)?;
    state.set_gpr(Gpr::Rsp, rsp.wrapping_add(8));
    Ok(v)
}
