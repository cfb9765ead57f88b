//! Per-process address space
//!
//! A `BTreeMap` of non-overlapping regions keyed by base address. Metadata
//! changes take the write lock and bump `generation`, which invalidates
//! every TLB entry resolved before the change. Page contents live in
//! [`Backing`] and are touched without holding the map lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};

use super::span::Span;
use super::{
    is_page_aligned, page_align_down, AccessKind, Backing, GuestValue, MemoryAttribute, MemoryError,
    MemoryPermission, MemoryState, ADDRESS_SPACE_END, ADDRESS_SPACE_START, ALIAS_BASE, ALIAS_SIZE,
    PAGE_MASK, PAGE_SIZE,
};
use crate::lock;

/// Receives notifications about writes to pages holding translated code
pub trait CodeWriteObserver: Send + Sync {
    /// `[start, end)` was modified (or lost execute permission)
    fn on_code_write(&self, start: u32, end: u32);
}

/// Result of `query`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub base: u32,
    pub size: u32,
    pub perm: MemoryPermission,
    pub attr: MemoryAttribute,
    pub state: MemoryState,
}

impl MemoryInfo {
    #[inline]
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }
}

#[derive(Clone)]
struct Region {
    base: u32,
    size: u32,
    perm: MemoryPermission,
    attr: MemoryAttribute,
    state: MemoryState,
    backing: Arc<Backing>,
    /// Byte offset of `base` inside `backing`
    offset: usize,
}

impl Region {
    #[inline(always)]
    fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    #[inline(always)]
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr as u64) < self.end()
    }

    #[inline(always)]
    fn backing_offset(&self, addr: u32) -> usize {
        self.offset + (addr - self.base) as usize
    }

    fn info(&self) -> MemoryInfo {
        MemoryInfo {
            base: self.base,
            size: self.size,
            perm: self.perm,
            attr: self.attr,
            state: self.state,
        }
    }
}

/// Page resolved for an access
pub(super) struct Resolved {
    /// Guest page base
    pub page: u32,
    pub backing: Arc<Backing>,
    /// Backing offset of `page`
    pub offset: usize,
    /// Map generation the resolution is valid for
    pub generation: u64,
}

pub struct AddressSpace {
    regions: RwLock<BTreeMap<u32, Region>>,
    generation: AtomicU64,
    observer: RwLock<Option<Weak<dyn CodeWriteObserver>>>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            regions: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(1),
            observer: RwLock::new(None),
        }
    }

    /// Current map generation; changes on every metadata mutation
    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn set_code_observer(&self, observer: Weak<dyn CodeWriteObserver>) {
        *lock::write(&self.observer) = Some(observer);
    }

    // =========================================================================
    // Mapping
    // =========================================================================

    /// Map fresh zeroed pages
    pub fn map(
        &self,
        addr: u32,
        size: u32,
        perm: MemoryPermission,
        attr: MemoryAttribute,
        state: MemoryState,
    ) -> Result<(), MemoryError> {
        check_range(addr, size)?;
        let mut regions = lock::write(&self.regions);
        if overlaps(&regions, addr, size) {
            return Err(MemoryError::InvalidMemoryState);
        }
        let backing = Backing::new(size as usize);
        regions.insert(addr, Region { base: addr, size, perm, attr, state, backing, offset: 0 });
        self.bump();
        tracing::trace!(addr = format_args!("{addr:#010x}"), size, ?perm, ?state, "map");
        Ok(())
    }

    /// Map existing storage, sharing it with every other mapping of `backing`
    pub fn map_backing(
        &self,
        addr: u32,
        size: u32,
        backing: Arc<Backing>,
        offset: usize,
        perm: MemoryPermission,
        state: MemoryState,
    ) -> Result<(), MemoryError> {
        check_range(addr, size)?;
        if offset % PAGE_SIZE as usize != 0 || offset + size as usize > backing.len() {
            return Err(MemoryError::InvalidSize);
        }
        let mut regions = lock::write(&self.regions);
        if overlaps(&regions, addr, size) {
            return Err(MemoryError::InvalidMemoryState);
        }
        regions.insert(
            addr,
            Region { base: addr, size, perm, attr: MemoryAttribute::empty(), state, backing, offset },
        );
        self.bump();
        Ok(())
    }

    /// Remove a fully mapped range, splitting regions at the edges
    pub fn unmap(&self, addr: u32, size: u32) -> Result<(), MemoryError> {
        check_range(addr, size)?;
        let removed_code = {
            let mut regions = lock::write(&self.regions);
            ensure_covered(&regions, addr, size, |_| true)?;
            let removed = carve(&mut regions, addr, size);
            self.bump();
            removed.iter().any(|r| r.perm.contains(MemoryPermission::EXECUTE))
        };
        if removed_code {
            self.notify(addr, addr.wrapping_add(size));
        }
        Ok(())
    }

    /// Change the permission of a fully mapped range
    pub fn protect(&self, addr: u32, size: u32, perm: MemoryPermission) -> Result<(), MemoryError> {
        check_range(addr, size)?;
        let lost_execute = {
            let mut regions = lock::write(&self.regions);
            ensure_covered(&regions, addr, size, |_| true)?;
            let mut lost = false;
            for region in pieces_mut(&mut regions, addr, size) {
                lost |= region.perm.contains(MemoryPermission::EXECUTE)
                    && !perm.contains(MemoryPermission::EXECUTE);
                region.perm = perm;
            }
            coalesce(&mut regions, addr, size);
            self.bump();
            lost
        };
        if lost_execute {
            self.notify(addr, addr.wrapping_add(size));
        }
        Ok(())
    }

    /// Set the attribute bits selected by `mask` to `value`
    pub fn set_attribute(
        &self,
        addr: u32,
        size: u32,
        mask: MemoryAttribute,
        value: MemoryAttribute,
    ) -> Result<(), MemoryError> {
        check_range(addr, size)?;
        let mut regions = lock::write(&self.regions);
        ensure_covered(&regions, addr, size, |_| true)?;
        for region in pieces_mut(&mut regions, addr, size) {
            region.attr = (region.attr & !mask) | (value & mask);
        }
        coalesce(&mut regions, addr, size);
        self.bump();
        Ok(())
    }

    /// Mirror `src` at `dst` inside the alias region. The source becomes
    /// inaccessible and locked until `unmap_alias`.
    pub fn map_alias(&self, dst: u32, src: u32, size: u32) -> Result<(), MemoryError> {
        check_range(dst, size)?;
        check_range(src, size)?;
        if dst < ALIAS_BASE || dst as u64 + size as u64 > ALIAS_BASE as u64 + ALIAS_SIZE as u64 {
            return Err(MemoryError::InvalidMemoryState);
        }
        let mut regions = lock::write(&self.regions);
        ensure_covered(&regions, src, size, |r| {
            r.perm == MemoryPermission::READ_WRITE
                && matches!(r.state, MemoryState::Heap | MemoryState::Normal | MemoryState::Stack)
                && !r.attr.contains(MemoryAttribute::LOCKED)
        })?;
        if overlaps(&regions, dst, size) {
            return Err(MemoryError::InvalidMemoryState);
        }

        let mut mirrors = Vec::new();
        for region in pieces_mut(&mut regions, src, size) {
            mirrors.push(Region {
                base: dst + (region.base - src),
                size: region.size,
                perm: MemoryPermission::READ_WRITE,
                attr: MemoryAttribute::empty(),
                state: MemoryState::Alias,
                backing: region.backing.clone(),
                offset: region.offset,
            });
            region.perm = MemoryPermission::NONE;
            region.attr |= MemoryAttribute::LOCKED;
        }
        for mirror in mirrors {
            regions.insert(mirror.base, mirror);
        }
        self.bump();
        Ok(())
    }

    /// Undo `map_alias`, restoring the source to read/write
    pub fn unmap_alias(&self, dst: u32, src: u32, size: u32) -> Result<(), MemoryError> {
        check_range(dst, size)?;
        check_range(src, size)?;
        let mut regions = lock::write(&self.regions);
        ensure_covered(&regions, dst, size, |r| r.state == MemoryState::Alias)?;
        ensure_covered(&regions, src, size, |r| r.attr.contains(MemoryAttribute::LOCKED))?;

        // Both ranges must name the same storage
        let same = match (lookup(&regions, dst), lookup(&regions, src)) {
            (Some(d), Some(s)) => {
                Arc::ptr_eq(&d.backing, &s.backing) && d.backing_offset(dst) == s.backing_offset(src)
            }
            _ => false,
        };
        if !same {
            return Err(MemoryError::InvalidMemoryState);
        }

        carve(&mut regions, dst, size);
        for region in pieces_mut(&mut regions, src, size) {
            region.perm = MemoryPermission::READ_WRITE;
            region.attr.remove(MemoryAttribute::LOCKED);
        }
        coalesce(&mut regions, src, size);
        self.bump();
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Describe the region containing `addr`, or the free gap around it
    pub fn query(&self, addr: u32) -> MemoryInfo {
        let regions = lock::read(&self.regions);
        if let Some(region) = lookup(&regions, addr) {
            return region.info();
        }
        if addr >= ADDRESS_SPACE_END {
            return MemoryInfo {
                base: ADDRESS_SPACE_END,
                size: 0u32.wrapping_sub(ADDRESS_SPACE_END),
                perm: MemoryPermission::NONE,
                attr: MemoryAttribute::empty(),
                state: MemoryState::Inaccessible,
            };
        }
        let start = regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r.end() as u32)
            .unwrap_or(0);
        let end = regions
            .range(addr..)
            .next()
            .map(|(&base, _)| base)
            .unwrap_or(ADDRESS_SPACE_END);
        MemoryInfo {
            base: start,
            size: end - start,
            perm: MemoryPermission::NONE,
            attr: MemoryAttribute::empty(),
            state: MemoryState::Free,
        }
    }

    pub fn query_protection(&self, addr: u32) -> Result<MemoryPermission, MemoryError> {
        let regions = lock::read(&self.regions);
        lookup(&regions, addr)
            .map(|r| r.perm)
            .ok_or(MemoryError::InvalidAccess(addr))
    }

    /// All mapped regions in address order
    pub fn regions(&self) -> Vec<MemoryInfo> {
        lock::read(&self.regions).values().map(Region::info).collect()
    }

    /// Whether `[addr, addr + size)` is mapped entirely with `state`
    pub fn is_range_in_state(&self, addr: u32, size: u32, state: MemoryState) -> bool {
        let regions = lock::read(&self.regions);
        size > 0 && ensure_covered(&regions, addr, size, |r| r.state == state).is_ok()
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub(super) fn resolve(&self, addr: u32, kind: AccessKind) -> Result<Resolved, MemoryError> {
        // Read before the lock so a concurrent change can only make the
        // entry look older than it is
        let generation = self.generation();
        let regions = lock::read(&self.regions);
        let region = lookup(&regions, addr).ok_or(MemoryError::InvalidAccess(addr))?;
        if !region.perm.contains(kind.required()) {
            return Err(MemoryError::InvalidPermission(addr));
        }
        let page = page_align_down(addr);
        Ok(Resolved {
            page,
            backing: region.backing.clone(),
            offset: region.backing_offset(page),
            generation,
        })
    }

    pub fn read<T: GuestValue>(&self, addr: u32) -> Result<T, MemoryError> {
        let mut raw = [0u8; 8];
        self.read_bytes(addr, &mut raw[..T::SIZE])?;
        Ok(T::from_le(&raw))
    }

    pub fn write<T: GuestValue>(&self, addr: u32, value: T) -> Result<(), MemoryError> {
        let mut raw = [0u8; 8];
        value.write_le(&mut raw);
        self.write_bytes(addr, &raw[..T::SIZE])
    }

    pub fn read_bytes(&self, addr: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        let mut done = 0usize;
        while done < out.len() {
            let cur = add_offset(addr, done)?;
            let page = self.resolve(cur, AccessKind::Load)?;
            let in_page = (cur & PAGE_MASK) as usize;
            let n = (PAGE_SIZE as usize - in_page).min(out.len() - done);
            page.backing.read_into(page.offset + in_page, &mut out[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Write guest memory. Pages holding translated code are reported to the
    /// observer after the bytes land.
    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        // Validate the whole range first so a failing write leaves no partial effect
        let mut done = 0usize;
        while done < data.len() {
            let cur = add_offset(addr, done)?;
            self.resolve(cur, AccessKind::Store)?;
            done += (PAGE_SIZE - (cur & PAGE_MASK)) as usize;
        }

        let mut done = 0usize;
        while done < data.len() {
            let cur = add_offset(addr, done)?;
            let page = self.resolve(cur, AccessKind::Store)?;
            let in_page = (cur & PAGE_MASK) as usize;
            let n = (PAGE_SIZE as usize - in_page).min(data.len() - done);
            page.backing.write_from(page.offset + in_page, &data[done..done + n]);
            if page.backing.is_code(page.offset) {
                self.code_written(&page.backing, page.offset, page.page);
            }
            done += n;
        }
        Ok(())
    }

    /// Segment list covering `[addr, addr + size)`; readable pages only
    pub fn get_span(&self, addr: u32, size: u32) -> Result<Span, MemoryError> {
        let mut span = Span::default();
        let mut done = 0u32;
        while done < size {
            let cur = addr.checked_add(done).ok_or(MemoryError::InvalidAccess(addr))?;
            let page = self.resolve(cur, AccessKind::Load)?;
            let in_page = cur & PAGE_MASK;
            let n = (PAGE_SIZE - in_page).min(size - done);
            span.push(page.backing, page.offset + in_page as usize, n as usize);
            done += n;
        }
        Ok(span)
    }

    /// Atomic CAS on an aligned guest word that must be readable and writable
    pub fn compare_exchange_u32(&self, addr: u32, expected: u32, new: u32) -> Result<Result<u32, u32>, MemoryError> {
        if addr & 3 != 0 {
            return Err(MemoryError::InvalidAddress(addr));
        }
        self.resolve(addr, AccessKind::Load)?;
        let page = self.resolve(addr, AccessKind::Store)?;
        let offset = page.offset + (addr & PAGE_MASK) as usize;
        let result = page.backing.compare_exchange32(offset, expected, new);
        if result.is_ok() && page.backing.is_code(page.offset) {
            self.code_written(&page.backing, page.offset, page.page);
        }
        Ok(result)
    }

    /// Atomically apply `f` to an aligned guest word. `f` returning `None`
    /// leaves memory untouched. Returns `Ok(previous)` if a value was
    /// stored, `Err(current)` otherwise.
    pub fn fetch_update_u32(
        &self,
        addr: u32,
        mut f: impl FnMut(u32) -> Option<u32>,
    ) -> Result<Result<u32, u32>, MemoryError> {
        let mut current = self.read::<u32>(addr)?;
        loop {
            let Some(new) = f(current) else {
                return Ok(Err(current));
            };
            match self.compare_exchange_u32(addr, current, new)? {
                Ok(previous) => return Ok(Ok(previous)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Flag every page of `[start, end)` as holding translated code
    pub fn mark_code(&self, start: u32, end: u32) {
        let regions = lock::read(&self.regions);
        let mut page = page_align_down(start);
        while (page as u64) < end as u64 {
            if let Some(region) = lookup(&regions, page) {
                region.backing.mark_code(region.backing_offset(page));
            }
            match page.checked_add(PAGE_SIZE) {
                Some(next) => page = next,
                None => break,
            }
        }
    }

    /// Called after a store landed on a page whose code flag was observed set
    pub(super) fn code_written(&self, backing: &Backing, offset: usize, page: u32) {
        if backing.take_code(offset) {
            self.notify(page, page.wrapping_add(PAGE_SIZE));
        }
    }

    fn notify(&self, start: u32, end: u32) {
        let observer = lock::read(&self.observer).as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.on_code_write(start, end);
        }
    }

    #[inline(always)]
    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Map helpers (caller holds the lock)
// =============================================================================

fn check_range(addr: u32, size: u32) -> Result<(), MemoryError> {
    if size == 0 || !is_page_aligned(size) {
        return Err(MemoryError::InvalidSize);
    }
    if !is_page_aligned(addr) {
        return Err(MemoryError::InvalidAddress(addr));
    }
    if addr < ADDRESS_SPACE_START || addr as u64 + size as u64 > ADDRESS_SPACE_END as u64 {
        return Err(MemoryError::InvalidMemoryState);
    }
    Ok(())
}

fn add_offset(addr: u32, offset: usize) -> Result<u32, MemoryError> {
    u32::try_from(offset)
        .ok()
        .and_then(|o| addr.checked_add(o))
        .ok_or(MemoryError::InvalidAccess(addr))
}

fn lookup(regions: &BTreeMap<u32, Region>, addr: u32) -> Option<&Region> {
    regions
        .range(..=addr)
        .next_back()
        .map(|(_, r)| r)
        .filter(|r| r.contains(addr))
}

fn overlaps(regions: &BTreeMap<u32, Region>, addr: u32, size: u32) -> bool {
    // Callers validated the range, so the end fits in u32
    let end = addr + size;
    regions
        .range(..end)
        .next_back()
        .is_some_and(|(_, r)| r.end() > addr as u64)
}

/// Every byte of the range is mapped by regions satisfying `accept`
fn ensure_covered(
    regions: &BTreeMap<u32, Region>,
    addr: u32,
    size: u32,
    accept: impl Fn(&Region) -> bool,
) -> Result<(), MemoryError> {
    let end = addr as u64 + size as u64;
    let mut cursor = addr as u64;
    while cursor < end {
        let region = lookup(regions, cursor as u32).ok_or(MemoryError::InvalidMemoryState)?;
        if !accept(region) {
            return Err(MemoryError::InvalidMemoryState);
        }
        cursor = region.end();
    }
    Ok(())
}

/// Split the region straddling `addr` so a region begins exactly there
fn split_at(regions: &mut BTreeMap<u32, Region>, addr: u32) {
    let Some(region) = regions.range_mut(..addr).next_back().map(|(_, r)| r) else {
        return;
    };
    if !region.contains(addr) {
        return;
    }
    let left_size = addr - region.base;
    let mut right = region.clone();
    right.base = addr;
    right.size = region.size - left_size;
    right.offset = region.offset + left_size as usize;
    region.size = left_size;
    regions.insert(addr, right);
}

/// Regions lying exactly inside the range after splitting at its edges
fn pieces_mut(regions: &mut BTreeMap<u32, Region>, addr: u32, size: u32) -> impl Iterator<Item = &mut Region> {
    let end = addr as u64 + size as u64;
    split_at(regions, addr);
    if end <= u32::MAX as u64 {
        split_at(regions, end as u32);
    }
    regions.range_mut(addr..).take_while(move |&(&base, _)| (base as u64) < end).map(|(_, r)| r)
}

/// Remove and return everything inside the range
fn carve(regions: &mut BTreeMap<u32, Region>, addr: u32, size: u32) -> Vec<Region> {
    let bases: Vec<u32> = pieces_mut(regions, addr, size).map(|r| r.base).collect();
    bases.into_iter().filter_map(|base| regions.remove(&base)).collect()
}

/// Re-merge neighbours around a modified range when they are indistinguishable
fn coalesce(regions: &mut BTreeMap<u32, Region>, addr: u32, size: u32) {
    let end = addr as u64 + size as u64;
    let first = regions.range(..addr).next_back().map(|(&b, _)| b).unwrap_or(addr);
    let bases: Vec<u32> = regions
        .range(first..)
        .take_while(|&(&base, _)| base as u64 <= end)
        .map(|(&b, _)| b)
        .collect();

    let mut iter = bases.into_iter();
    let Some(mut current) = iter.next() else {
        return;
    };
    for next in iter {
        let mergeable = match (regions.get(&current), regions.get(&next)) {
            (Some(a), Some(b)) => {
                a.end() == b.base as u64
                    && a.perm == b.perm
                    && a.attr == b.attr
                    && a.state == b.state
                    && Arc::ptr_eq(&a.backing, &b.backing)
                    && a.offset + a.size as usize == b.offset
            }
            _ => false,
        };
        if mergeable {
            if let Some(b) = regions.remove(&next) {
                if let Some(a) = regions.get_mut(&current) {
                    a.size += b.size;
                }
            }
        } else {
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    const BASE: u32 = 0x0010_0000;

    fn rw() -> MemoryPermission {
        MemoryPermission::READ_WRITE
    }

    fn map_rw(space: &AddressSpace, addr: u32, size: u32) {
        space
            .map(addr, size, rw(), MemoryAttribute::empty(), MemoryState::Normal)
            .unwrap();
    }

    #[test]
    fn test_map_write_read() {
        let space = AddressSpace::new();
        map_rw(&space, BASE, 2 * PAGE_SIZE);
        space.write::<u32>(BASE + 0xFFE, 0xCAFE_F00D).unwrap();
        assert_eq!(space.read::<u32>(BASE + 0xFFE).unwrap(), 0xCAFE_F00D);
        assert_eq!(space.read::<u16>(BASE + 0x1000).unwrap(), 0xCAFE);
    }

    #[test]
    fn test_overlap_rejected() {
        let space = AddressSpace::new();
        map_rw(&space, BASE + PAGE_SIZE, PAGE_SIZE);
        let err = space.map(BASE, 2 * PAGE_SIZE, rw(), MemoryAttribute::empty(), MemoryState::Normal);
        assert_eq!(err, Err(MemoryError::InvalidMemoryState));
        let err = space.map(BASE + PAGE_SIZE, PAGE_SIZE, rw(), MemoryAttribute::empty(), MemoryState::Normal);
        assert_eq!(err, Err(MemoryError::InvalidMemoryState));
        // Adjacent is fine
        map_rw(&space, BASE, PAGE_SIZE);
        map_rw(&space, BASE + 2 * PAGE_SIZE, PAGE_SIZE);
    }

    #[test]
    fn test_unaligned_rejected() {
        let space = AddressSpace::new();
        assert_eq!(
            space.map(BASE + 1, PAGE_SIZE, rw(), MemoryAttribute::empty(), MemoryState::Normal),
            Err(MemoryError::InvalidAddress(BASE + 1))
        );
        assert_eq!(
            space.map(BASE, 100, rw(), MemoryAttribute::empty(), MemoryState::Normal),
            Err(MemoryError::InvalidSize)
        );
    }

    #[test]
    fn test_unmapped_access_fails() {
        let space = AddressSpace::new();
        map_rw(&space, BASE, PAGE_SIZE);
        assert_eq!(space.read::<u8>(BASE - 1), Err(MemoryError::InvalidAccess(BASE - 1)));
        assert_eq!(
            space.write::<u8>(BASE + PAGE_SIZE, 1),
            Err(MemoryError::InvalidAccess(BASE + PAGE_SIZE))
        );
    }

    #[test]
    fn test_protect_splits_and_merges() {
        let space = AddressSpace::new();
        map_rw(&space, BASE, 4 * PAGE_SIZE);
        space.write::<u32>(BASE + PAGE_SIZE, 7).unwrap();
        space.protect(BASE + PAGE_SIZE, PAGE_SIZE, MemoryPermission::READ).unwrap();
        assert_eq!(space.regions().len(), 3);
        assert_eq!(
            space.write::<u32>(BASE + PAGE_SIZE, 8),
            Err(MemoryError::InvalidPermission(BASE + PAGE_SIZE))
        );
        assert_eq!(space.read::<u32>(BASE + PAGE_SIZE).unwrap(), 7);

        space.protect(BASE + PAGE_SIZE, PAGE_SIZE, rw()).unwrap();
        assert_eq!(space.regions().len(), 1);
        assert_eq!(space.read::<u32>(BASE + PAGE_SIZE).unwrap(), 7);
    }

    #[test]
    fn test_unmap_middle() {
        let space = AddressSpace::new();
        map_rw(&space, BASE, 3 * PAGE_SIZE);
        space.write::<u32>(BASE + 2 * PAGE_SIZE, 0x55).unwrap();
        space.unmap(BASE + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert!(space.read::<u8>(BASE + PAGE_SIZE).is_err());
        assert_eq!(space.read::<u32>(BASE + 2 * PAGE_SIZE).unwrap(), 0x55);
        // Partially unmapped range cannot be unmapped again
        assert_eq!(space.unmap(BASE, 2 * PAGE_SIZE), Err(MemoryError::InvalidMemoryState));
    }

    #[test]
    fn test_query_free_gap() {
        let space = AddressSpace::new();
        map_rw(&space, BASE, PAGE_SIZE);
        map_rw(&space, BASE + 4 * PAGE_SIZE, PAGE_SIZE);
        let info = space.query(BASE + 2 * PAGE_SIZE + 5);
        assert_eq!(info.state, MemoryState::Free);
        assert_eq!(info.base, BASE + PAGE_SIZE);
        assert_eq!(info.size, 3 * PAGE_SIZE);
        let info = space.query(BASE + 10);
        assert_eq!(info.state, MemoryState::Normal);
        assert_eq!(info.base, BASE);
    }

    #[test]
    fn test_alias_shares_storage() {
        let space = AddressSpace::new();
        space
            .map(BASE, 2 * PAGE_SIZE, rw(), MemoryAttribute::empty(), MemoryState::Heap)
            .unwrap();
        space.write::<u32>(BASE + 8, 0x1234).unwrap();
        space.map_alias(ALIAS_BASE, BASE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(space.read::<u32>(ALIAS_BASE + 8).unwrap(), 0x1234);
        assert!(space.read::<u32>(BASE + 8).is_err());
        space.write::<u32>(ALIAS_BASE + 8, 0x9999).unwrap();

        // Outside the alias window
        assert_eq!(space.map_alias(BASE + 0x10_0000, BASE, PAGE_SIZE), Err(MemoryError::InvalidMemoryState));

        space.unmap_alias(ALIAS_BASE, BASE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(space.read::<u32>(BASE + 8).unwrap(), 0x9999);
        assert!(space.read::<u32>(ALIAS_BASE).is_err());
    }

    #[test]
    fn test_span_segments() {
        let space = AddressSpace::new();
        map_rw(&space, BASE, 2 * PAGE_SIZE);
        map_rw(&space, BASE + 2 * PAGE_SIZE, PAGE_SIZE);
        space.write_bytes(BASE + 0xFF0, &[0xAB; 0x20]).unwrap();
        let span = space.get_span(BASE + 0xFF0, 0x20).unwrap();
        assert!(span.is_contiguous());
        assert_eq!(span.to_vec(), vec![0xAB; 0x20]);
        let span = space.get_span(BASE + 0x1FF0, 0x20).unwrap();
        assert!(!span.is_contiguous());
        assert_eq!(span.len(), 0x20);
    }

    struct Recorder(Mutex<Vec<(u32, u32)>>);

    impl CodeWriteObserver for Recorder {
        fn on_code_write(&self, start: u32, end: u32) {
            self.0.lock().unwrap().push((start, end));
        }
    }

    #[test]
    fn test_code_write_notifies_once() {
        let space = AddressSpace::new();
        space
            .map(BASE, PAGE_SIZE, MemoryPermission::all(), MemoryAttribute::empty(), MemoryState::Code)
            .unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let observer: Arc<dyn CodeWriteObserver> = recorder.clone();
        space.set_code_observer(Arc::downgrade(&observer));

        space.write::<u32>(BASE, 1).unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());

        space.mark_code(BASE, BASE + 4);
        space.write::<u32>(BASE + 0x10, 2).unwrap();
        space.write::<u32>(BASE + 0x20, 3).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![(BASE, BASE + PAGE_SIZE)]);
    }

    #[test]
    fn test_fetch_update() {
        let space = AddressSpace::new();
        map_rw(&space, BASE, PAGE_SIZE);
        space.write::<u32>(BASE, 5).unwrap();
        assert_eq!(space.fetch_update_u32(BASE, |v| Some(v - 1)).unwrap(), Ok(5));
        assert_eq!(space.fetch_update_u32(BASE, |v| (v > 10).then_some(0)).unwrap(), Err(4));
        assert_eq!(space.fetch_update_u32(BASE + 2, Some), Err(MemoryError::InvalidAddress(BASE + 2)));
    }

    #[derive(Clone, Debug)]
    enum MapOp {
        Map(u32, u32),
        Unmap(u32, u32),
        Protect(u32, u32, bool),
    }

    fn map_op() -> impl Strategy<Value = MapOp> {
        let range = (0u32..16, 1u32..5);
        prop_oneof![
            range.clone().prop_map(|(p, n)| MapOp::Map(p, n)),
            range.clone().prop_map(|(p, n)| MapOp::Unmap(p, n)),
            (range, any::<bool>()).prop_map(|((p, n), w)| MapOp::Protect(p, n, w)),
        ]
    }

    proptest! {
        #[test]
        fn prop_map_stays_non_overlapping(ops in prop::collection::vec(map_op(), 1..40)) {
            let space = AddressSpace::new();
            // Shadow: one entry per page
            let mut shadow: [Option<bool>; 24] = [None; 24];
            for op in ops {
                match op {
                    MapOp::Map(p, n) => {
                        let ok = space
                            .map(BASE + p * PAGE_SIZE, n * PAGE_SIZE, rw(), MemoryAttribute::empty(), MemoryState::Normal)
                            .is_ok();
                        let free = (p..p + n).all(|i| shadow[i as usize].is_none());
                        prop_assert_eq!(ok, free);
                        if ok {
                            (p..p + n).for_each(|i| shadow[i as usize] = Some(true));
                        }
                    }
                    MapOp::Unmap(p, n) => {
                        let ok = space.unmap(BASE + p * PAGE_SIZE, n * PAGE_SIZE).is_ok();
                        let mapped = (p..p + n).all(|i| shadow[i as usize].is_some());
                        prop_assert_eq!(ok, mapped);
                        if ok {
                            (p..p + n).for_each(|i| shadow[i as usize] = None);
                        }
                    }
                    MapOp::Protect(p, n, writable) => {
                        let perm = if writable { rw() } else { MemoryPermission::READ };
                        let ok = space.protect(BASE + p * PAGE_SIZE, n * PAGE_SIZE, perm).is_ok();
                        let mapped = (p..p + n).all(|i| shadow[i as usize].is_some());
                        prop_assert_eq!(ok, mapped);
                        if ok {
                            (p..p + n).for_each(|i| shadow[i as usize] = Some(writable));
                        }
                    }
                }

                let regions = space.regions();
                for pair in regions.windows(2) {
                    prop_assert!(pair[0].end() <= pair[1].base as u64);
                }
                for (i, page) in shadow.iter().enumerate() {
                    let addr = BASE + i as u32 * PAGE_SIZE;
                    match page {
                        None => prop_assert_eq!(space.read::<u8>(addr), Err(MemoryError::InvalidAccess(addr))),
                        Some(writable) => {
                            prop_assert!(space.read::<u8>(addr).is_ok());
                            prop_assert_eq!(space.write::<u8>(addr, 1).is_ok(), *writable);
                        }
                    }
                }
            }
        }

        #[test]
        fn prop_write_then_read_round_trips(offset in 0u32..0x1F00, data in prop::collection::vec(any::<u8>(), 1..256)) {
            let space = AddressSpace::new();
            map_rw(&space, BASE, 2 * PAGE_SIZE);
            space.write_bytes(BASE + offset, &data).unwrap();
            let mut out = vec![0u8; data.len()];
            space.read_bytes(BASE + offset, &mut out).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
