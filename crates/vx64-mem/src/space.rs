use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::error::{Access, MemoryError, Result};
use crate::segment::{Permissions, Segment};
use crate::{checked_round_to_page_size, page_start};

/// Placement window used by [`VirtualMemory::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Lowest address handed out by `allocate` (page aligned).
    pub alloc_base: u64,
    /// Exclusive upper bound for `allocate` placements.
    pub alloc_limit: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            alloc_base: 0x0000_7f00_0000_0000,
            alloc_limit: 0x0000_7fff_0000_0000,
        }
    }
}

struct Mapping {
    segment: Segment,
    data: Box<[u8]>,
}

impl Mapping {
    /// Splits `self` at `addr`, returning the upper half. `addr` must lie strictly inside.
    fn split_off(&mut self, addr: u64) -> Mapping {
        debug_assert!(self.segment.start < addr && addr < self.segment.end);
        let at = (addr - self.segment.start) as usize;
        let mut lower = std::mem::take(&mut self.data).into_vec();
        let upper = lower.split_off(at);
        self.data = lower.into_boxed_slice();

        let mut segment = self.segment.clone();
        segment.start = addr;
        segment.offset = self.segment.offset.wrapping_add(at as u64);
        self.segment.end = addr;

        Mapping {
            segment,
            data: upper.into_boxed_slice(),
        }
    }
}

/// Segment table keyed by segment start.
#[derive(Default)]
struct AddressSpace {
    map: BTreeMap<u64, Mapping>,
}

impl AddressSpace {
    fn lookup(&self, addr: u64) -> Option<&Mapping> {
        self.map
            .range(..=addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.segment.contains(addr))
    }

    fn lookup_mut(&mut self, addr: u64) -> Option<&mut Mapping> {
        self.map
            .range_mut(..=addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.segment.contains(addr))
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        // Segments are disjoint, so the one with the greatest start below `end` also has the
        // greatest end among them.
        self.map
            .range(..end)
            .next_back()
            .is_some_and(|(_, m)| m.segment.end > start)
    }

    /// First-fit search for `size` free bytes inside `[lo, hi)`.
    fn find_free(&self, size: u64, lo: u64, hi: u64) -> Option<u64> {
        let mut cursor = lo;
        for m in self.map.range(..hi).map(|(_, m)| m) {
            let seg = &m.segment;
            if seg.end <= cursor {
                continue;
            }
            if seg.start > cursor && seg.start - cursor >= size {
                return Some(cursor);
            }
            cursor = cursor.max(seg.end);
        }
        (hi.checked_sub(cursor)? >= size).then_some(cursor)
    }

    fn insert(&mut self, mapping: Mapping) {
        self.map.insert(mapping.segment.start, mapping);
    }

    /// Splits the segment covering `addr` so that a segment boundary falls on `addr`.
    fn split_at(&mut self, addr: u64) {
        let Some(mapping) = self.lookup_mut(addr) else {
            return;
        };
        if mapping.segment.start == addr {
            return;
        }
        let upper = mapping.split_off(addr);
        self.insert(upper);
    }

    /// Verifies that every byte of `[addr, addr+len)` is mapped and allows `access`.
    fn check(&self, addr: u64, len: u64, access: Access, enforce: bool) -> Result<()> {
        let mut cursor = addr;
        let mut remaining = len;
        while remaining > 0 {
            let m = self
                .lookup(cursor)
                .ok_or(MemoryError::SegmentationFault { addr, size: len })?;
            if enforce && !m.segment.permissions.allows(access) {
                return Err(MemoryError::AccessViolation {
                    addr,
                    size: len,
                    access,
                });
            }
            let chunk = (m.segment.end - cursor).min(remaining);
            remaining -= chunk;
            if remaining > 0 {
                cursor = m.segment.end;
            }
        }
        Ok(())
    }

    fn copy_out(&self, addr: u64, dst: &mut [u8], access: Access, enforce: bool) -> Result<()> {
        let size = dst.len() as u64;
        self.check(addr, size, access, enforce)?;
        let mut done = 0usize;
        while done < dst.len() {
            let cur = addr + done as u64;
            let m = self
                .lookup(cur)
                .ok_or(MemoryError::SegmentationFault { addr, size })?;
            let off = (cur - m.segment.start) as usize;
            let n = (m.data.len() - off).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&m.data[off..off + n]);
            done += n;
        }
        Ok(())
    }

    fn copy_in(&mut self, addr: u64, src: &[u8], access: Access, enforce: bool) -> Result<()> {
        let size = src.len() as u64;
        self.check(addr, size, access, enforce)?;
        let mut done = 0usize;
        while done < src.len() {
            let cur = addr + done as u64;
            let m = self
                .lookup_mut(cur)
                .ok_or(MemoryError::SegmentationFault { addr, size })?;
            let off = (cur - m.segment.start) as usize;
            let n = (m.data.len() - off).min(src.len() - done);
            m.data[off..off + n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        Ok(())
    }
}

fn zeroed(len: u64) -> Result<Box<[u8]>> {
    let out_of_space = MemoryError::OutOfAddressSpace { size: len };
    let len = usize::try_from(len).map_err(|_| out_of_space.clone())?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| out_of_space)?;
    buf.resize(len, 0);
    Ok(buf.into_boxed_slice())
}

fn validate_range(start: u64, end: u64) -> Result<()> {
    if start >= end {
        return Err(MemoryError::InvalidRange { start, end });
    }
    Ok(())
}

/// The emulated virtual address space.
///
/// Every access re-resolves its segment by address; callers never cache segments. The table sits
/// behind a single [`RwLock`] so that several CPU contexts can share one address space through an
/// `Arc<VirtualMemory>`: data reads take the shared lock, writes and structural changes take the
/// exclusive lock.
pub struct VirtualMemory {
    space: RwLock<AddressSpace>,
    config: MemoryConfig,
}

impl Default for VirtualMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMemory")
            .field("config", &self.config)
            .field("segments", &self.segments())
            .finish()
    }
}

impl VirtualMemory {
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            space: RwLock::new(AddressSpace::default()),
            config,
        }
    }

    pub fn config(&self) -> MemoryConfig {
        self.config
    }

    // The table is only mutated through complete operations, so a poisoned lock still guards a
    // consistent table.
    fn read_space(&self) -> RwLockReadGuard<'_, AddressSpace> {
        self.space.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_space(&self) -> RwLockWriteGuard<'_, AddressSpace> {
        self.space.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a zero-filled read/write segment of at least `size` bytes.
    pub fn allocate(&self, size: u64, name: &str) -> Result<Segment> {
        self.allocate_with(size, name, Permissions::RW)
    }

    /// Allocates a zero-filled segment with explicit permissions (e.g. `rwx` trampolines).
    pub fn allocate_with(&self, size: u64, name: &str, permissions: Permissions) -> Result<Segment> {
        if size == 0 {
            return Err(MemoryError::InvalidRange { start: 0, end: 0 });
        }
        let len = checked_round_to_page_size(size).ok_or(MemoryError::OutOfAddressSpace { size })?;

        let mut space = self.write_space();
        let start = space
            .find_free(len, page_start(self.config.alloc_base), self.config.alloc_limit)
            .ok_or(MemoryError::OutOfAddressSpace { size: len })?;
        let segment = Segment::new(start, start + len, permissions, name);
        space.insert(Mapping {
            segment: segment.clone(),
            data: zeroed(len)?,
        });
        debug!(%segment, "allocate");
        Ok(segment)
    }

    /// Inserts a zero-filled segment at a caller-chosen range.
    pub fn map(&self, segment: Segment) -> Result<()> {
        self.map_with_data(segment, &[])
    }

    /// Inserts a segment whose leading bytes are initialized from `data`.
    pub fn map_with_data(&self, segment: Segment, data: &[u8]) -> Result<()> {
        validate_range(segment.start, segment.end)?;
        if data.len() as u64 > segment.len() {
            return Err(MemoryError::InvalidRange {
                start: segment.start,
                end: segment.start.saturating_add(data.len() as u64),
            });
        }

        let mut storage = zeroed(segment.len())?;
        storage[..data.len()].copy_from_slice(data);

        let mut space = self.write_space();
        if space.overlaps(segment.start, segment.end) {
            return Err(MemoryError::Overlap {
                start: segment.start,
                end: segment.end,
            });
        }
        debug!(%segment, "map");
        space.insert(Mapping {
            segment,
            data: storage,
        });
        Ok(())
    }

    /// Removes the segment starting at `addr`.
    pub fn unmap(&self, addr: u64) -> Result<Segment> {
        let mapping = self
            .write_space()
            .map
            .remove(&addr)
            .ok_or(MemoryError::NotMapped { addr })?;
        debug!(segment = %mapping.segment, "unmap");
        Ok(mapping.segment)
    }

    /// Changes the permissions of every page overlapping `[addr, addr+len)`.
    ///
    /// Segments straddling the range boundaries are split. If any byte of the page-rounded range
    /// is unmapped the call fails with [`MemoryError::AccessViolation`] and nothing changes.
    pub fn protect(&self, addr: u64, len: u64, read: bool, write: bool, execute: bool) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let start = page_start(addr);
        let end = addr
            .checked_add(len)
            .and_then(checked_round_to_page_size)
            .ok_or(MemoryError::InvalidRange {
                start: addr,
                end: addr.wrapping_add(len),
            })?;
        let permissions = Permissions::from_rwx(read, write, execute);

        let mut space = self.write_space();
        space
            .check(start, end - start, Access::Protect, false)
            .map_err(|_| MemoryError::AccessViolation {
                addr,
                size: len,
                access: Access::Protect,
            })?;

        space.split_at(start);
        space.split_at(end);
        for (_, m) in space.map.range_mut(start..end) {
            m.segment.permissions = permissions;
        }
        debug!(
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            %permissions,
            "protect"
        );
        Ok(())
    }

    /// Reads `dst.len()` bytes; requires read permission on every byte.
    pub fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        self.read_space().copy_out(addr, dst, Access::Read, true)
    }

    /// Writes `src`; requires write permission on every byte. Nothing is written on failure.
    pub fn write_bytes(&self, addr: u64, src: &[u8]) -> Result<()> {
        self.write_space().copy_in(addr, src, Access::Write, true)
    }

    /// Fetches up to `dst.len()` bytes of executable code.
    ///
    /// Stops early at the first byte that is unmapped or not executable; fails only if the very
    /// first byte cannot be fetched. Returns the number of bytes fetched.
    pub fn fetch(&self, addr: u64, dst: &mut [u8]) -> Result<usize> {
        let space = self.read_space();
        let mut done = 0usize;
        while done < dst.len() {
            let Some(cur) = addr.checked_add(done as u64) else {
                break;
            };
            let Some(m) = space.lookup(cur) else {
                break;
            };
            if !m.segment.permissions.allows(Access::Execute) {
                if done == 0 {
                    return Err(MemoryError::AccessViolation {
                        addr,
                        size: 1,
                        access: Access::Execute,
                    });
                }
                break;
            }
            let off = (cur - m.segment.start) as usize;
            let n = (m.data.len() - off).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&m.data[off..off + n]);
            done += n;
        }
        if done == 0 && !dst.is_empty() {
            return Err(MemoryError::SegmentationFault { addr, size: 1 });
        }
        Ok(done)
    }

    /// Host-side read that ignores page permissions (loaders, debuggers, tracers).
    pub fn peek(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        self.read_space().copy_out(addr, dst, Access::Read, false)
    }

    /// Host-side write that ignores page permissions.
    pub fn poke(&self, addr: u64, src: &[u8]) -> Result<()> {
        self.write_space().copy_in(addr, src, Access::Write, false)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_u128(&self, addr: u64) -> Result<u128> {
        let mut buf = [0u8; 16];
        self.read_bytes(addr, &mut buf)?;
        Ok(u128::from_le_bytes(buf))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write_bytes(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn write_u128(&self, addr: u64, value: u128) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Returns a copy of the segment covering `addr`.
    pub fn segment_at(&self, addr: u64) -> Option<Segment> {
        self.read_space().lookup(addr).map(|m| m.segment.clone())
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.read_space().lookup(addr).is_some()
    }

    /// Snapshot of all segments in address order.
    pub fn segments(&self) -> Vec<Segment> {
        self.read_space()
            .map
            .values()
            .map(|m| m.segment.clone())
            .collect()
    }

    /// Renders the segment table in `/proc/<pid>/maps` format.
    pub fn maps(&self) -> String {
        let mut out = String::new();
        for seg in self.segments() {
            out.push_str(&seg.to_string());
            out.push('\n');
        }
        out
    }
}
