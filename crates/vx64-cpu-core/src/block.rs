use tracing::trace;

use crate::error::Result;
use crate::exec::{fetch, StepExit};
use crate::interp::{execute, ExecOutcome};
use crate::intrinsics::IntrinsicTable;
use crate::mem::CpuBus;
use crate::operand::Inst;
use crate::state::CpuState;

/// A straight-line run of decoded instructions ending at the first control-flow instruction.
///
/// Instructions keep their operand binding across executions, so re-running a block only pays
/// for effective-address arithmetic.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    start: u64,
    insts: Vec<Inst>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExit {
    pub executed: usize,
    pub exit: StepExit,
}

impl BasicBlock {
    /// Decodes from `start` until a block terminator or `max_len` instructions.
    ///
    /// A decode failure after the first instruction ends the block early; the failure surfaces
    /// when execution reaches that address.
    pub fn decode<B: CpuBus>(
        bus: &mut B,
        start: u64,
        intrinsics: &IntrinsicTable,
        max_len: usize,
    ) -> Result<Self> {
        let mut insts = Vec::new();
        let mut rip = start;
        while insts.len() < max_len.max(1) {
            let inst = match fetch(bus, rip, intrinsics) {
                Ok(inst) => inst,
                Err(e) if insts.is_empty() => return Err(e),
                Err(_) => break,
            };
            rip = inst.next_rip();
            let done = inst.is_block_terminator();
            insts.push(Inst::new(inst));
            if done {
                break;
            }
        }
        Ok(Self { start, insts })
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    #[must_use]
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    /// Address just past the last instruction.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.insts
            .last()
            .map_or(self.start, |i| i.decoded().next_rip())
    }

    /// Runs the block from its first instruction. `state.rip()` must equal [`BasicBlock::start`].
    ///
    /// On a fault RIP is left at the faulting instruction and the instructions before it have
    /// retired.
    pub fn execute<B: CpuBus>(&mut self, state: &mut CpuState, bus: &mut B) -> Result<BlockExit> {
        trace!(start = format_args!("{:#x}", self.start), len = self.insts.len(), "block");
        let mut executed = 0;
        for inst in &mut self.insts {
            let outcome = execute(state, bus, inst)?;
            state.set_rip(outcome.next_rip());
            executed += 1;
            let exit = match outcome {
                ExecOutcome::Next(_) => continue,
                ExecOutcome::Halt(_) => StepExit::Halted,
                ExecOutcome::Syscall(_) => StepExit::Syscall,
            };
            return Ok(BlockExit { executed, exit });
        }
        Ok(BlockExit {
            executed,
            exit: StepExit::Continue,
        })
    }
}
