use core::fmt;

use bitflags::bitflags;

use crate::error::Access;

bitflags! {
    /// Page protection bits of a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Permissions {
    pub const RW: Permissions = Permissions::READ.union(Permissions::WRITE);
    pub const RX: Permissions = Permissions::READ.union(Permissions::EXEC);
    pub const RWX: Permissions = Permissions::RW.union(Permissions::EXEC);

    #[must_use]
    pub fn from_rwx(read: bool, write: bool, execute: bool) -> Permissions {
        let mut perms = Permissions::empty();
        perms.set(Permissions::READ, read);
        perms.set(Permissions::WRITE, write);
        perms.set(Permissions::EXEC, execute);
        perms
    }

    #[must_use]
    pub fn allows(self, access: Access) -> bool {
        match access {
            Access::Read => self.contains(Permissions::READ),
            Access::Write => self.contains(Permissions::WRITE),
            Access::Execute => self.contains(Permissions::EXEC),
            Access::Protect => true,
        }
    }
}

impl fmt::Display for Permissions {
    /// `/proc/<pid>/maps` style: `rw-p`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag, c| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}p",
            bit(Permissions::READ, 'r'),
            bit(Permissions::WRITE, 'w'),
            bit(Permissions::EXEC, 'x')
        )
    }
}

/// A contiguous, permissioned region `[start, end)` of the emulated address space.
///
/// Segments are plain values. The owning [`crate::VirtualMemory`] hands out copies; holding one
/// does not keep the mapping alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub permissions: Permissions,
    /// Offset into the backing object (file offset for loader-mapped images).
    pub offset: u64,
    pub name: String,
}

impl Segment {
    pub fn new(start: u64, end: u64, permissions: Permissions, name: impl Into<String>) -> Self {
        Self {
            start,
            end,
            permissions,
            offset: 0,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Unsigned containment test: `start <= addr < end`.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x} {} {:08x} {}",
            self.start, self.end, self.permissions, self.offset, self.name
        )
    }
}
