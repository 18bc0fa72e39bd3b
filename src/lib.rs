#![forbid(unsafe_code)]

//! vx64: a user-mode x86-64 emulator core.
//!
//! This crate re-exports the workspace members under one roof:
//!
//! - [`mem`]: the segmented, permissioned guest address space;
//! - [`x86`]: the instruction decoder;
//! - [`cpu`]: register file, interpreter, basic blocks and intrinsics;
//! - [`trace`]: binary trace record framing.

pub use vx64_cpu_core as cpu;
pub use vx64_mem as mem;
pub use vx64_trace as trace;
pub use vx64_types as types;
pub use vx64_x86 as x86;

pub use vx64_cpu_core::{BatchExit, CpuError, CpuState, Engine, EngineConfig};
pub use vx64_mem::{MemoryError, Permissions, Segment, VirtualMemory};
pub use vx64_types::{Gpr, Width};
