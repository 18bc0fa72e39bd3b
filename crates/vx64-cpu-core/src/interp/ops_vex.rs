use vx64_x86::{InstKind, Operand, VecSize, VexOp};

use super::invalid;
use super::ops_sse::lanes;
use crate::error::Result;
use crate::mem::CpuBus;
use crate::operand::{Bound, Loc};
use crate::state::CpuState;

/// A 128- or 256-bit VEX operand value as little-endian 128-bit halves.
type Wide = [u128; 2];

pub(super) fn exec<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    kind: &InstKind,
    ops: &Bound,
) -> Result<()> {
    match *kind {
        InstKind::VexMov { dst, src, .. } => {
            let size = vec_size(&dst).or_else(|| vec_size(&src));
            let Some(size) = size else {
                return Err(invalid(state));
            };
            let v = read(state, bus, ops.get(1), size)?;
            write(state, bus, ops.get(0), size, v)?;
        }
        InstKind::VexBinary { op, dst, .. } => {
            let a = read(state, bus, ops.get(1), dst.size)?;
            let b = read(state, bus, ops.get(2), dst.size)?;
            let f = |x: u128, y: u128| match op {
                VexOp::Vpxor => x ^ y,
                VexOp::Vpaddq => lanes(x, y, 8, u64::wrapping_add),
            };
            write(state, bus, ops.get(0), dst.size, [f(a[0], b[0]), f(a[1], b[1])])?;
        }
        InstKind::Vzeroupper => {
            for reg in state.vectors_mut() {
                reg.zero_upper();
            }
        }
        _ => return Err(invalid(state)),
    }
    Ok(())
}

fn vec_size(op: &Operand) -> Option<VecSize> {
    match op {
        Operand::Vec(v) => Some(v.size),
        _ => None,
    }
}

fn read<B: CpuBus>(state: &mut CpuState, bus: &mut B, loc: Loc, size: VecSize) -> Result<Wide> {
    match (loc, size) {
        (Loc::Vec(v), VecSize::Xmm) => Ok([state.vec_mut(v.index as usize).xmm(), 0]),
        (Loc::Vec(v), VecSize::Ymm) => Ok(state.vec_mut(v.index as usize).ymm()),
        (Loc::Mem(m), _) => {
            let addr = m.effective_address(state);
            let lo = bus.read_u128(addr)?;
            let hi = match size {
                VecSize::Ymm => bus.read_u128(addr.wrapping_add(16))?,
                VecSize::Xmm => 0,
            };
            Ok([lo, hi])
        }
        _ => Err(invalid(state)),
    }
}

/// VEX register writes zero everything above the operation size.
fn write<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    loc: Loc,
    size: VecSize,
    v: Wide,
) -> Result<()> {
    match (loc, size) {
        (Loc::Vec(r), VecSize::Xmm) => state.vec_mut(r.index as usize).set_xmm_vex(v[0]),
        (Loc::Vec(r), VecSize::Ymm) => state.vec_mut(r.index as usize).set_ymm(v),
        (Loc::Mem(m), _) => {
            let addr = m.effective_address(state);
            bus.write_u128(addr, v[0])?;
            if size == VecSize::Ymm {
                bus.write_u128(addr.wrapping_add(16), v[1])?;
            }
        }
        _ => return Err(invalid(state)),
    }
    Ok(())
}
