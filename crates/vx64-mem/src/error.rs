use core::fmt;

use thiserror::Error;

/// Kind of access that was attempted when a permission check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    Execute,
    /// A permission change (`protect`) over a range containing an unmapped gap.
    Protect,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Execute => "execute",
            Access::Protect => "protect",
        })
    }
}

/// Errors produced by [`crate::VirtualMemory`].
///
/// Architectural faults carry the faulting address and the access width in bytes so the embedder
/// can deliver them to the guest (e.g. as `SIGSEGV`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("segmentation fault: {size}-byte access at 0x{addr:x}")]
    SegmentationFault { addr: u64, size: u64 },

    #[error("access violation: {access} of {size} byte(s) at 0x{addr:x}")]
    AccessViolation { addr: u64, size: u64, access: Access },

    #[error("out of address space: no free range of 0x{size:x} bytes")]
    OutOfAddressSpace { size: u64 },

    #[error("0x{addr:x} is not the start of a mapped segment")]
    NotMapped { addr: u64 },

    #[error("range 0x{start:x}-0x{end:x} overlaps an existing segment")]
    Overlap { start: u64, end: u64 },

    #[error("invalid range 0x{start:x}-0x{end:x}")]
    InvalidRange { start: u64, end: u64 },
}

impl MemoryError {
    /// Address associated with the error, if any.
    #[must_use]
    pub fn addr(&self) -> Option<u64> {
        match *self {
            MemoryError::SegmentationFault { addr, .. }
            | MemoryError::AccessViolation { addr, .. }
            | MemoryError::NotMapped { addr } => Some(addr),
            MemoryError::Overlap { start, .. } | MemoryError::InvalidRange { start, .. } => {
                Some(start)
            }
            MemoryError::OutOfAddressSpace { .. } => None,
        }
    }

    /// Whether this is a guest-visible fault as opposed to embedder misuse.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            MemoryError::SegmentationFault { .. } | MemoryError::AccessViolation { .. }
        )
    }
}

pub type Result<T> = core::result::Result<T, MemoryError>;
