use std::sync::Arc;

use tracing::debug;
use vx64_mem::{page_start, round_to_page_size, MemoryError, Permissions, Segment, VirtualMemory};
use vx64_types::Gpr;
use vx64_x86::IntrinsicId;

use crate::block::{BasicBlock, BlockExit};
use crate::error::Result;
use crate::exec::{run_batch, step, BatchResult, StepExit};
use crate::intrinsics::IntrinsicTable;
use crate::mem::CpuBus;
use crate::state::CpuState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Initial top of stack. RSP starts 16 bytes below it.
    ///
    /// [`Engine::new`] maps the stack, so contexts sharing one address space need distinct
    /// values here, or should be created with [`Engine::with_state`].
    pub stack_address: u64,
    /// Bytes mapped below `stack_address`, rounded up to whole pages.
    pub stack_size: u64,
    /// Upper bound on instructions per [`BasicBlock`].
    pub max_block_insts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stack_address: 0x7fff_ffff_f000,
            stack_size: 8 * 1024 * 1024,
            max_block_insts: 256,
        }
    }
}

/// One execution context: a CPU state, its intrinsics and a shared address space.
#[derive(Debug)]
pub struct Engine {
    state: CpuState,
    memory: Arc<VirtualMemory>,
    intrinsics: IntrinsicTable,
    config: EngineConfig,
}

impl Engine {
    /// Creates a context with zeroed registers and a fresh `[stack]` mapping.
    pub fn new(memory: Arc<VirtualMemory>, config: EngineConfig) -> Result<Self> {
        let top = round_to_page_size(config.stack_address);
        let bottom = page_start(top.saturating_sub(round_to_page_size(config.stack_size)));
        if bottom >= top {
            return Err(MemoryError::InvalidRange {
                start: bottom,
                end: top,
            }
            .into());
        }
        memory.map(Segment::new(bottom, top, Permissions::RW, "[stack]"))?;

        let mut state = CpuState::new();
        state.set_gpr(Gpr::Rsp, config.stack_address.wrapping_sub(16));
        debug!(
            stack = format_args!("{bottom:#x}-{top:#x}"),
            rsp = format_args!("{:#x}", state.gpr(Gpr::Rsp)),
            "engine created"
        );
        Ok(Self {
            state,
            memory,
            intrinsics: IntrinsicTable::new(),
            config,
        })
    }

    /// Creates a context around `state` without mapping a stack.
    ///
    /// For additional threads over a shared address space: the caller allocates the stack
    /// (e.g. with [`VirtualMemory::allocate`]) and sets RSP in `state`. The stack fields of
    /// `config` are ignored.
    #[must_use]
    pub fn with_state(memory: Arc<VirtualMemory>, state: CpuState, config: EngineConfig) -> Self {
        debug!(
            rsp = format_args!("{:#x}", state.gpr(Gpr::Rsp)),
            "engine attached"
        );
        Self {
            state,
            memory,
            intrinsics: IntrinsicTable::new(),
            config,
        }
    }

    #[must_use]
    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<VirtualMemory> {
        &self.memory
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn intrinsics(&self) -> &IntrinsicTable {
        &self.intrinsics
    }

    pub fn register_intrinsic(&mut self, addr: u64, id: IntrinsicId) -> Option<IntrinsicId> {
        debug!(addr = format_args!("{addr:#x}"), name = id.name(), "intrinsic registered");
        self.intrinsics.register(addr, id)
    }

    pub fn step(&mut self) -> Result<StepExit> {
        step(&mut self.state, &mut self.memory, &self.intrinsics)
    }

    /// Runs at most `max_insts` instructions.
    pub fn run(&mut self, max_insts: u64) -> BatchResult {
        run_batch(&mut self.state, &mut self.memory, &self.intrinsics, max_insts)
    }

    /// Like [`Engine::run`], routing every guest access through `bus`.
    ///
    /// `bus` must front this engine's memory for the results to be meaningful.
    pub fn run_with<B: CpuBus>(&mut self, bus: &mut B, max_insts: u64) -> BatchResult {
        run_batch(&mut self.state, bus, &self.intrinsics, max_insts)
    }

    /// Decodes the block at the current RIP.
    pub fn decode_block(&mut self) -> Result<BasicBlock> {
        BasicBlock::decode(
            &mut self.memory,
            self.state.rip(),
            &self.intrinsics,
            self.config.max_block_insts,
        )
    }

    /// Executes `block`, which must start at the current RIP.
    pub fn run_block(&mut self, block: &mut BasicBlock) -> Result<BlockExit> {
        block.execute(&mut self.state, &mut self.memory)
    }
}
