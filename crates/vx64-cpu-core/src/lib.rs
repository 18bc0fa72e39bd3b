#![forbid(unsafe_code)]

//! User-mode x86-64 interpreter.
//!
//! The pipeline per instruction is Fetch ([`exec::fetch`]) → Bind ([`Inst::bind`]) → Execute
//! ([`interp::execute`]) → Advance (the RIP update in [`exec::step`]). [`Engine`] bundles a
//! [`CpuState`], an [`IntrinsicTable`] and a shared [`vx64_mem::VirtualMemory`] behind the same
//! loop, and [`BasicBlock`] offers block granularity with bindings kept across runs.

pub mod block;
pub mod engine;
pub mod error;
pub mod exec;
pub mod interp;
pub mod intrinsics;
pub mod mem;
pub mod operand;
pub mod state;
pub mod vector;

pub use block::{BasicBlock, BlockExit};
pub use engine::{Engine, EngineConfig};
pub use error::{CpuError, Result};
pub use exec::{fetch, run_batch, step, BatchExit, BatchResult, StepExit};
pub use interp::{execute, ExecOutcome};
pub use intrinsics::IntrinsicTable;
pub use mem::CpuBus;
pub use operand::{Bound, Inst, Loc, MemRef};
pub use state::{CpuSnapshot, CpuState, RFlags, RFLAGS_RESERVED1, VECTOR_REGS};
pub use vector::{Repr, VectorReg};
