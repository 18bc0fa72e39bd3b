use vx64_x86::{decode, Instruction, MAX_INST_LEN};

use crate::error::{CpuError, Result};
use crate::interp::{execute, ExecOutcome};
use crate::intrinsics::IntrinsicTable;
use crate::mem::CpuBus;
use crate::operand::Inst;
use crate::state::CpuState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    Continue,
    /// `hlt` retired; RIP is past it.
    Halted,
    /// `syscall` retired; RIP is past it and the embedder services the call.
    Syscall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchExit {
    /// The instruction limit was reached.
    Completed,
    Halted,
    Syscall,
    /// RIP is left at the faulting instruction.
    Fault(CpuError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Instructions retired, including a final `hlt`/`syscall`.
    pub executed: u64,
    pub exit: BatchExit,
}

/// Fetches and decodes the instruction at `rip`, or yields the intrinsic registered there.
pub fn fetch<B: CpuBus>(
    bus: &mut B,
    rip: u64,
    intrinsics: &IntrinsicTable,
) -> Result<Instruction> {
    if let Some(id) = intrinsics.get(rip) {
        return Ok(Instruction::intrinsic(rip, id));
    }
    let mut buf = [0u8; MAX_INST_LEN];
    let n = bus.fetch(rip, &mut buf)?;
    Ok(decode(rip, &buf[..n])?)
}

/// One full Fetch → Bind → Execute → Advance cycle at the current RIP.
pub fn step<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    intrinsics: &IntrinsicTable,
) -> Result<StepExit> {
    let mut inst = Inst::new(fetch(bus, state.rip(), intrinsics)?);
    let outcome = execute(state, bus, &mut inst)?;
    state.set_rip(outcome.next_rip());
    Ok(match outcome {
        ExecOutcome::Next(_) => StepExit::Continue,
        ExecOutcome::Halt(_) => StepExit::Halted,
        ExecOutcome::Syscall(_) => StepExit::Syscall,
    })
}

/// Steps until `max_insts` retire or execution exits. Branches do not end a batch.
pub fn run_batch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    intrinsics: &IntrinsicTable,
    max_insts: u64,
) -> BatchResult {
    let mut executed = 0u64;
    while executed < max_insts {
        match step(state, bus, intrinsics) {
            Ok(StepExit::Continue) => executed += 1,
            Ok(StepExit::Halted) => {
                return BatchResult {
                    executed: executed + 1,
                    exit: BatchExit::Halted,
                };
            }
            Ok(StepExit::Syscall) => {
                return BatchResult {
                    executed: executed + 1,
                    exit: BatchExit::Syscall,
                };
            }
            Err(e) => {
                return BatchResult {
                    executed,
                    exit: BatchExit::Fault(e),
                };
            }
        }
    }

    BatchResult {
        executed,
        exit: BatchExit::Completed,
    }
}
