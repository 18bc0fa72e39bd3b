use thiserror::Error;
use vx64_mem::MemoryError;
use vx64_x86::DecodeError;

/// Faults raised while fetching or executing guest code.
///
/// RIP is left at the faulting instruction for every variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    /// The bytes at the current RIP could not be decoded. The embedder may register an intrinsic
    /// at `addr` and retry.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// `#DE`: division by zero or a quotient that does not fit the destination.
    #[error("divide error at 0x{rip:x}")]
    DivideError { rip: u64 },

    /// `#UD`: `ud2` or an operand combination the instruction does not accept.
    #[error("invalid opcode at 0x{rip:x}")]
    InvalidOpcode { rip: u64 },
}

impl CpuError {
    /// Guest address associated with the fault.
    #[must_use]
    pub fn addr(&self) -> Option<u64> {
        match self {
            CpuError::Decode(e) => Some(e.addr),
            CpuError::Memory(e) => e.addr(),
            CpuError::DivideError { rip } | CpuError::InvalidOpcode { rip } => Some(*rip),
        }
    }
}

pub type Result<T> = core::result::Result<T, CpuError>;
