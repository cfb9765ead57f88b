//! Per-core translation cache and the guest-facing `Bus`
//!
//! Single-entry TLBs per access type, validated against the address space
//! generation. A hit costs one atomic load and no lock.

use std::sync::Arc;

use super::address_space::Resolved;
use super::{AccessKind, AddressSpace, Backing, Bus, MemoryError, PAGE_BITS, PAGE_MASK};

struct TlbEntry {
    /// Guest page number
    vpn: u32,
    backing: Arc<Backing>,
    /// Backing offset of the page start
    offset: usize,
    generation: u64,
}

impl From<Resolved> for TlbEntry {
    fn from(r: Resolved) -> Self {
        TlbEntry {
            vpn: r.page >> PAGE_BITS,
            backing: r.backing,
            offset: r.offset,
            generation: r.generation,
        }
    }
}

/// Single-entry TLBs for fetch, load and store
#[derive(Default)]
pub struct Tlb {
    fetch: Option<TlbEntry>,
    load: Option<TlbEntry>,
    store: Option<TlbEntry>,

    /// Stats
    hits: u64,
    misses: u64,
}

impl Tlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush(&mut self) {
        self.fetch = None;
        self.load = None;
        self.store = None;
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    #[inline(always)]
    fn slot(&mut self, kind: AccessKind) -> &mut Option<TlbEntry> {
        match kind {
            AccessKind::Fetch => &mut self.fetch,
            AccessKind::Load => &mut self.load,
            AccessKind::Store => &mut self.store,
        }
    }
}

/// Guest memory as seen by one running core
pub struct MemoryAccessor<'a> {
    space: &'a AddressSpace,
    tlb: &'a mut Tlb,
    ticks: u64,
}

impl<'a> MemoryAccessor<'a> {
    pub fn new(space: &'a AddressSpace, tlb: &'a mut Tlb) -> Self {
        MemoryAccessor { space, tlb, ticks: 0 }
    }

    /// Value reported by the `time` counter
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    pub fn space(&self) -> &AddressSpace {
        self.space
    }

    /// Backing and byte offset for `addr`
    #[inline(always)]
    fn translate(&mut self, addr: u32, kind: AccessKind) -> Result<(&Backing, usize), MemoryError> {
        let generation = self.space.generation();
        let vpn = addr >> PAGE_BITS;
        let hit = matches!(self.tlb.slot(kind), Some(e) if e.vpn == vpn && e.generation == generation);
        if hit {
            self.tlb.hits += 1;
        } else {
            self.tlb.misses += 1;
            let resolved = self.space.resolve(addr, kind)?;
            *self.tlb.slot(kind) = Some(resolved.into());
        }
        match self.tlb.slot(kind) {
            Some(entry) => Ok((&*entry.backing, entry.offset + (addr & PAGE_MASK) as usize)),
            None => Err(MemoryError::InvalidAccess(addr)),
        }
    }

    #[inline(always)]
    fn crosses_page(addr: u32, size: u32) -> bool {
        (addr & PAGE_MASK) + size > PAGE_MASK + 1
    }

    /// Byte-wise read for accesses straddling two pages
    fn read_split(&mut self, addr: u32, size: u32) -> Result<u32, MemoryError> {
        // Both pages must be readable before anything is returned
        self.translate(addr, AccessKind::Load)?;
        self.translate(addr.wrapping_add(size - 1), AccessKind::Load)?;
        let mut value = 0u32;
        for i in 0..size {
            let (backing, offset) = self.translate(addr.wrapping_add(i), AccessKind::Load)?;
            value |= (backing.load8(offset) as u32) << (i * 8);
        }
        Ok(value)
    }

    fn write_split(&mut self, addr: u32, size: u32, value: u32) -> Result<(), MemoryError> {
        self.translate(addr, AccessKind::Store)?;
        self.translate(addr.wrapping_add(size - 1), AccessKind::Store)?;
        for i in 0..size {
            let byte_addr = addr.wrapping_add(i);
            let (backing, offset) = self.translate(byte_addr, AccessKind::Store)?;
            backing.store8(offset, (value >> (i * 8)) as u8);
            self.after_store(byte_addr);
        }
        Ok(())
    }

    /// Report the store to the code observer if it hit a code page
    #[inline(always)]
    fn after_store(&mut self, addr: u32) {
        if let Some(entry) = &self.tlb.store {
            let page_offset = entry.offset;
            if entry.backing.is_code(page_offset) {
                self.space.code_written(&entry.backing, page_offset, addr & !PAGE_MASK);
            }
        }
    }
}

impl Bus for MemoryAccessor<'_> {
    #[inline(always)]
    fn fetch16(&mut self, addr: u32) -> Result<u16, MemoryError> {
        if addr & 1 != 0 {
            return Err(MemoryError::InvalidAddress(addr));
        }
        let (backing, offset) = self.translate(addr, AccessKind::Fetch)?;
        Ok(backing.load16(offset))
    }

    #[inline(always)]
    fn read8(&mut self, addr: u32) -> Result<u8, MemoryError> {
        let (backing, offset) = self.translate(addr, AccessKind::Load)?;
        Ok(backing.load8(offset))
    }

    #[inline(always)]
    fn read16(&mut self, addr: u32) -> Result<u16, MemoryError> {
        if Self::crosses_page(addr, 2) {
            return self.read_split(addr, 2).map(|v| v as u16);
        }
        let (backing, offset) = self.translate(addr, AccessKind::Load)?;
        Ok(backing.load16(offset))
    }

    #[inline(always)]
    fn read32(&mut self, addr: u32) -> Result<u32, MemoryError> {
        if Self::crosses_page(addr, 4) {
            return self.read_split(addr, 4);
        }
        let (backing, offset) = self.translate(addr, AccessKind::Load)?;
        Ok(backing.load32(offset))
    }

    #[inline(always)]
    fn write8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        let (backing, offset) = self.translate(addr, AccessKind::Store)?;
        backing.store8(offset, value);
        self.after_store(addr);
        Ok(())
    }

    #[inline(always)]
    fn write16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        if Self::crosses_page(addr, 2) {
            return self.write_split(addr, 2, value as u32);
        }
        let (backing, offset) = self.translate(addr, AccessKind::Store)?;
        backing.store16(offset, value);
        self.after_store(addr);
        Ok(())
    }

    #[inline(always)]
    fn write32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        if Self::crosses_page(addr, 4) {
            return self.write_split(addr, 4, value);
        }
        let (backing, offset) = self.translate(addr, AccessKind::Store)?;
        backing.store32(offset, value);
        self.after_store(addr);
        Ok(())
    }

    fn compare_exchange32(&mut self, addr: u32, expected: u32, new: u32) -> Result<Result<u32, u32>, MemoryError> {
        if addr & 3 != 0 {
            return Err(MemoryError::InvalidAddress(addr));
        }
        self.translate(addr, AccessKind::Load)?;
        let (backing, offset) = self.translate(addr, AccessKind::Store)?;
        let result = backing.compare_exchange32(offset, expected, new);
        if result.is_ok() {
            self.after_store(addr);
        }
        Ok(result)
    }

    fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAttribute, MemoryPermission, MemoryState, PAGE_SIZE};

    const BASE: u32 = 0x0001_0000;

    fn space() -> AddressSpace {
        let space = AddressSpace::new();
        space
            .map(BASE, 2 * PAGE_SIZE, MemoryPermission::READ_WRITE, MemoryAttribute::empty(), MemoryState::Normal)
            .unwrap();
        space
    }

    #[test]
    fn test_tlb_hits_after_first_access() {
        let space = space();
        let mut tlb = Tlb::new();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        mem.write32(BASE, 1).unwrap();
        mem.write32(BASE + 4, 2).unwrap();
        assert_eq!(mem.read32(BASE + 4).unwrap(), 2);
        drop(mem);
        let (hits, misses) = tlb.stats();
        assert_eq!(misses, 2);
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_generation_invalidates_entries() {
        let space = space();
        let mut tlb = Tlb::new();
        {
            let mut mem = MemoryAccessor::new(&space, &mut tlb);
            mem.write32(BASE, 0x77).unwrap();
        }
        space.protect(BASE, PAGE_SIZE, MemoryPermission::READ).unwrap();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        assert_eq!(mem.write32(BASE, 1), Err(MemoryError::InvalidPermission(BASE)));
        assert_eq!(mem.read32(BASE).unwrap(), 0x77);
    }

    #[test]
    fn test_page_crossing_access() {
        let space = space();
        let mut tlb = Tlb::new();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        mem.write32(BASE + PAGE_SIZE - 2, 0xAABB_CCDD).unwrap();
        assert_eq!(mem.read32(BASE + PAGE_SIZE - 2).unwrap(), 0xAABB_CCDD);
        assert_eq!(mem.read16(BASE + PAGE_SIZE).unwrap(), 0xAABB);
        // Second page missing: nothing is written
        let end = BASE + 2 * PAGE_SIZE;
        assert_eq!(mem.write32(end - 2, 0xFFFF_FFFF), Err(MemoryError::InvalidAccess(end + 1)));
        assert_eq!(mem.read16(end - 2).unwrap(), 0);
    }

    #[test]
    fn test_fetch_requires_execute() {
        let space = space();
        let mut tlb = Tlb::new();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        assert_eq!(mem.fetch16(BASE), Err(MemoryError::InvalidPermission(BASE)));
        assert_eq!(mem.fetch16(BASE + 1), Err(MemoryError::InvalidAddress(BASE + 1)));
    }
}
