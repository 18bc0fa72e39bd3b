//! Instruction semantics.
//!
//! [`execute`] dispatches on the closed [`InstKind`] enum to one `ops_*` module per instruction
//! class. Every class reads its operands through the bound [`Loc`](crate::operand::Loc)s,
//! computes at its data width, writes back, updates the flags it defines and reports the next
//! RIP. Nothing here touches RIP; the caller commits it.

pub mod alu;

mod ops_alu;
mod ops_cf;
mod ops_data;
mod ops_sse;
mod ops_string;
mod ops_vex;

use vx64_x86::InstKind;

use crate::error::{CpuError, Result};
use crate::intrinsics;
use crate::mem::CpuBus;
use crate::operand::Inst;
use crate::state::CpuState;

/// How execution of one instruction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Continue at the given RIP.
    Next(u64),
    /// `hlt`; RIP is past the instruction.
    Halt(u64),
    /// `syscall`; RIP is past the instruction and the embedder services the call.
    Syscall(u64),
}

impl ExecOutcome {
    #[must_use]
    pub fn next_rip(self) -> u64 {
        match self {
            ExecOutcome::Next(rip) | ExecOutcome::Halt(rip) | ExecOutcome::Syscall(rip) => rip,
        }
    }
}

/// Executes one instruction, binding its operands first if this instance has not run yet.
///
/// `state.rip()` must equal the instruction address; it is used for fault reporting.
pub fn execute<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    inst: &mut Inst,
) -> Result<ExecOutcome> {
    let ops = *inst.bind();
    let decoded = inst.decoded();
    let kind = decoded.kind;
    let next = decoded.next_rip();

    match kind {
        InstKind::Alu { .. }
        | InstKind::Cmp { .. }
        | InstKind::Test { .. }
        | InstKind::Inc { .. }
        | InstKind::Dec { .. }
        | InstKind::Neg { .. }
        | InstKind::Not { .. }
        | InstKind::MulDiv { .. }
        | InstKind::Imul { .. }
        | InstKind::Shift { .. }
        | InstKind::Flag(_) => ops_alu::exec(state, bus, &kind, &ops)?,

        InstKind::Mov { .. }
        | InstKind::Movzx { .. }
        | InstKind::Movsx { .. }
        | InstKind::Lea { .. }
        | InstKind::Xchg { .. }
        | InstKind::Push { .. }
        | InstKind::Pop { .. }
        | InstKind::SignExtendAcc { .. }
        | InstKind::SignFillDx { .. }
        | InstKind::Setcc { .. }
        | InstKind::Cmovcc { .. } => ops_data::exec(state, bus, &kind, &ops)?,

        InstKind::JmpRel { .. }
        | InstKind::JccRel { .. }
        | InstKind::CallRel { .. }
        | InstKind::JmpInd { .. }
        | InstKind::CallInd { .. }
        | InstKind::Ret { .. } => return ops_cf::exec(state, bus, &kind, &ops, next),

        InstKind::String {
            op,
            width,
            rep,
            addr32,
        } => ops_string::exec(state, bus, op, width, rep, addr32)?,

        InstKind::Sse { op, .. } => ops_sse::exec(state, bus, op, &ops)?,

        InstKind::VexMov { .. } | InstKind::VexBinary { .. } | InstKind::Vzeroupper => {
            ops_vex::exec(state, bus, &kind, &ops)?
        }

        InstKind::Intrinsic(id) => {
            return Ok(ExecOutcome::Next(intrinsics::exec(id, state, bus)?));
        }

        InstKind::Nop => {}
        InstKind::Hlt => return Ok(ExecOutcome::Halt(next)),
        InstKind::Syscall => return Ok(ExecOutcome::Syscall(next)),
        InstKind::Ud2 => return Err(CpuError::InvalidOpcode { rip: state.rip() }),
    }
    Ok(ExecOutcome::Next(next))
}

/// Fault for an operand shape the instruction does not accept.
pub(crate) fn invalid(state: &CpuState) -> CpuError {
    CpuError::InvalidOpcode { rip: state.rip() }
}
