#![forbid(unsafe_code)]

//! Emulated user-mode virtual address space.
//!
//! The address space is a set of named, permissioned [`Segment`]s kept in an ordered table keyed
//! by start address. See [`VirtualMemory`] for the access and lifecycle API.

mod error;
mod segment;
mod space;

pub use error::{Access, MemoryError, Result};
pub use segment::{Permissions, Segment};
pub use space::{MemoryConfig, VirtualMemory};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Rounds `addr` down to the start of its page.
#[inline]
#[must_use]
pub const fn page_start(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Rounds `size` up to a whole number of pages, saturating at the last page boundary.
#[inline]
#[must_use]
pub const fn round_to_page_size(size: u64) -> u64 {
    match checked_round_to_page_size(size) {
        Some(v) => v,
        None => page_start(u64::MAX),
    }
}

/// Rounds `size` up to a whole number of pages, or `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_round_to_page_size(size: u64) -> Option<u64> {
    match size.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}
