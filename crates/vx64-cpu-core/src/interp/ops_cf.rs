use vx64_types::{Gpr, Width};
use vx64_x86::InstKind;

use super::ops_data::{pop64, push};
use super::{invalid, ExecOutcome};
use crate::error::Result;
use crate::mem::CpuBus;
use crate::operand::Bound;
use crate::state::CpuState;

pub(super) fn exec<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    kind: &InstKind,
    ops: &Bound,
    next: u64,
) -> Result<ExecOutcome> {
    let target = match *kind {
        InstKind::JmpRel { target } => target,
        InstKind::JccRel { cond, target } => {
            if state.cond(cond) {
                target
            } else {
                next
            }
        }
        InstKind::CallRel { target } => {
            push(state, bus, Width::W64, next)?;
            target
        }
        InstKind::JmpInd { .. } => ops.get(0).read(state, bus, Width::W64)?,
        InstKind::CallInd { .. } => {
            // Read the target before RSP moves: `call [rsp]` uses the old stack top.
            let target = ops.get(0).read(state, bus, Width::W64)?;
            push(state, bus, Width::W64, next)?;
            target
        }
        InstKind::Ret { pop } => {
            let rsp = state.gpr(Gpr::Rsp);
            let target = pop64(state, bus)?;
            state.set_gpr(Gpr::Rsp, rsp.wrapping_add(8 + u64::from(pop)));
            target
        }
        _ => return Err(invalid(state)),
    };
    Ok(ExecOutcome::Next(target))
}
