//! Per-process code cache
//!
//! Compiled blocks keyed by `(entry, mode)`. Lookups share a read lock;
//! a miss registers an in-flight slot so concurrent cores asking for the
//! same block wait for the first translation instead of duplicating it.
//!
//! Invalidation bumps a global epoch under the write lock. A translation
//! records the epoch it started under and only inserts if it is unchanged,
//! so a block built from bytes that were overwritten mid-translation is
//! never cached.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, trace};

use super::codegen::{default_backend, Codegen, CodegenError, CompiledCode};
use super::decode::ExecMode;
use super::ir::{Block, MAX_BLOCK_INSTS};
use super::translate::translate;
use crate::lock;
use crate::memory::{Bus, CodeWriteObserver, MemoryAccessor, PAGE_BITS};

/// Translation attempts before a block is handed out uncached
const MAX_ATTEMPTS: usize = 3;

/// A translated, compiled block
pub struct CompiledBlock {
    pub block: Block,
    pub code: CompiledCode,
    /// Invalidation epoch the block was built under
    pub generation: u64,
    /// Guest bytes the block was decoded from
    pub range: Range<u32>,
}

impl CompiledBlock {
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.range.start < end && start < self.range.end
    }
}

impl std::fmt::Debug for CompiledBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledBlock")
            .field("range", &self.range)
            .field("generation", &self.generation)
            .field("native", &self.code.is_native())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct BlockKey {
    addr: u32,
    mode: ExecMode,
}

#[derive(Default)]
struct Blocks {
    map: HashMap<BlockKey, Arc<CompiledBlock>>,
    /// Guest page number -> blocks touching it
    by_page: HashMap<u32, Vec<BlockKey>>,
}

impl Blocks {
    fn insert(&mut self, key: BlockKey, block: Arc<CompiledBlock>) {
        for page in pages(&block.range) {
            let keys = self.by_page.entry(page).or_default();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        self.map.insert(key, block);
    }

    fn remove(&mut self, key: BlockKey) -> bool {
        let Some(block) = self.map.remove(&key) else {
            return false;
        };
        for page in pages(&block.range) {
            if let Some(keys) = self.by_page.get_mut(&page) {
                keys.retain(|k| *k != key);
                if keys.is_empty() {
                    self.by_page.remove(&page);
                }
            }
        }
        true
    }
}

/// Page numbers covered by a byte range
fn pages(range: &Range<u32>) -> impl Iterator<Item = u32> {
    let first = range.start >> PAGE_BITS;
    let last = if range.end > range.start { (range.end - 1) >> PAGE_BITS } else { first };
    first..=last
}

type SlotResult = Result<Arc<CompiledBlock>, CodegenError>;

/// Rendezvous for callers waiting on an in-flight translation
#[derive(Default)]
struct Slot {
    result: Mutex<Option<SlotResult>>,
    ready: Condvar,
}

enum Claim {
    Cached(Arc<CompiledBlock>),
    Wait(Arc<Slot>),
    Build(Arc<Slot>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compiles: u64,
    pub invalidations: u64,
    /// Translations discarded because the code changed underneath them
    pub retries: u64,
    pub blocks: usize,
}

pub struct CodeCache {
    blocks: RwLock<Blocks>,
    inflight: Mutex<HashMap<BlockKey, Arc<Slot>>>,
    epoch: AtomicU64,
    backend: Arc<dyn Codegen>,
    max_block_insts: usize,

    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
    invalidations: AtomicU64,
    retries: AtomicU64,
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new(default_backend(), MAX_BLOCK_INSTS)
    }
}

impl CodeCache {
    pub fn new(backend: Arc<dyn Codegen>, max_block_insts: usize) -> Self {
        CodeCache {
            blocks: RwLock::new(Blocks::default()),
            inflight: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(1),
            backend,
            max_block_insts: max_block_insts.clamp(1, MAX_BLOCK_INSTS),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Current invalidation epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Cached block for `addr`, translating and compiling it on a miss
    pub fn get_or_translate(&self, mem: &mut MemoryAccessor<'_>, addr: u32, mode: ExecMode) -> SlotResult {
        let key = BlockKey { addr, mode };
        if let Some(block) = lock::read(&self.blocks).map.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let slot = match self.claim(key) {
            Claim::Cached(block) => return Ok(block),
            Claim::Wait(slot) => {
                let mut result = lock::lock(&slot.result);
                loop {
                    if let Some(result) = result.as_ref() {
                        return result.clone();
                    }
                    result = lock::wait(&slot.ready, result);
                }
            }
            Claim::Build(slot) => slot,
        };

        let result = self.build(mem, key);
        lock::lock(&self.inflight).remove(&key);
        *lock::lock(&slot.result) = Some(result.clone());
        slot.ready.notify_all();
        result
    }

    /// Join an in-flight translation of `key` or become its builder.
    /// The block map is checked again under the in-flight lock: a builder
    /// inserts its block before it gives up the slot.
    fn claim(&self, key: BlockKey) -> Claim {
        let mut inflight = lock::lock(&self.inflight);
        if let Some(slot) = inflight.get(&key) {
            return Claim::Wait(slot.clone());
        }
        if let Some(block) = lock::read(&self.blocks).map.get(&key) {
            return Claim::Cached(block.clone());
        }
        let slot = Arc::new(Slot::default());
        inflight.insert(key, slot.clone());
        Claim::Build(slot)
    }

    fn build(&self, mem: &mut MemoryAccessor<'_>, key: BlockKey) -> SlotResult {
        let mut attempt = 1;
        loop {
            let epoch = self.epoch();
            let block = translate(mem, key.addr, key.mode, self.max_block_insts);
            let code = self.backend.compile(&block)?;
            trace!(
                "compiled block {:#010x}: {} insts, {} ops ({})",
                block.entry,
                block.inst_count,
                block.ops.len(),
                self.backend.name()
            );
            let compiled = Arc::new(CompiledBlock {
                range: block.entry..block.end,
                block,
                code,
                generation: epoch,
            });
            if !compiled.block.cacheable || compiled.block.code.is_empty() {
                return Ok(compiled);
            }

            // Once the pages are flagged every later write notifies us; a
            // write that slipped in before that shows up as changed bytes.
            mem.space().mark_code(compiled.range.start, compiled.range.end);
            if self.epoch() == epoch && code_unchanged(mem, &compiled.block) {
                let mut blocks = lock::write(&self.blocks);
                if self.epoch() == epoch {
                    blocks.insert(key, compiled.clone());
                    self.compiles.fetch_add(1, Ordering::Relaxed);
                    return Ok(compiled);
                }
            }
            self.retries.fetch_add(1, Ordering::Relaxed);
            debug!("code at {:#010x} changed during translation (attempt {attempt})", key.addr);
            if attempt == MAX_ATTEMPTS {
                // Still correct for this one execution, just not kept
                return Ok(compiled);
            }
            attempt += 1;
        }
    }

    /// Drop every block whose bytes intersect `[start, end)`
    pub fn invalidate(&self, start: u32, end: u32) {
        let mut blocks = lock::write(&self.blocks);
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let range = start..end;
        let mut doomed = Vec::new();
        for page in pages(&range) {
            if let Some(keys) = blocks.by_page.get(&page) {
                for key in keys {
                    if blocks.map.get(key).is_some_and(|b| b.overlaps(start, end)) && !doomed.contains(key) {
                        doomed.push(*key);
                    }
                }
            }
        }
        let removed = doomed.into_iter().filter(|key| blocks.remove(*key)).count();
        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("invalidated {removed} blocks in {start:#010x}..{end:#010x}");
        }
    }

    /// Drop everything (`fence.i`)
    pub fn invalidate_all(&self) {
        let mut blocks = lock::write(&self.blocks);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let removed = blocks.map.len();
        blocks.map.clear();
        blocks.by_page.clear();
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Whether a block for `addr` is currently cached
    pub fn contains(&self, addr: u32, mode: ExecMode) -> bool {
        lock::read(&self.blocks).map.contains_key(&BlockKey { addr, mode })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            blocks: lock::read(&self.blocks).map.len(),
        }
    }
}

impl CodeWriteObserver for CodeCache {
    fn on_code_write(&self, start: u32, end: u32) {
        self.invalidate(start, end);
    }
}

/// Re-read the halfwords a block was decoded from
fn code_unchanged(mem: &mut MemoryAccessor<'_>, block: &Block) -> bool {
    let mut addr = block.entry;
    block.code.iter().all(|&half| {
        let same = mem.fetch16(addr).is_ok_and(|v| v == half);
        addr = addr.wrapping_add(2);
        same
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm::{self, reg::*};
    use crate::cpu::codegen::{execute_block, BlockResult, PortableCodegen};
    use crate::cpu::CpuContext;
    use crate::memory::{AddressSpace, MemoryAttribute, MemoryPermission, MemoryState, Tlb, PAGE_SIZE};
    use std::thread;

    const CODE: u32 = 0x0001_0000;

    fn setup(words: &[u32]) -> (Arc<AddressSpace>, Arc<CodeCache>) {
        let space = Arc::new(AddressSpace::new());
        space
            .map(CODE, 2 * PAGE_SIZE, MemoryPermission::all(), MemoryAttribute::empty(), MemoryState::Code)
            .unwrap();
        space.write_bytes(CODE, &asm::assemble(words)).unwrap();
        let cache = Arc::new(CodeCache::new(Arc::new(PortableCodegen), 64));
        let observer: Arc<dyn CodeWriteObserver> = cache.clone();
        space.set_code_observer(Arc::downgrade(&observer));
        (space, cache)
    }

    #[test]
    fn test_hit_after_miss() {
        let (space, cache) = setup(&[asm::addi(A0, A0, 1), asm::jal(0, -4)]);
        let mut tlb = Tlb::new();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        let a = cache.get_or_translate(&mut mem, CODE, ExecMode::COMPRESSED).unwrap();
        let b = cache.get_or_translate(&mut mem, CODE, ExecMode::COMPRESSED).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.compiles, stats.blocks), (1, 1, 1, 1));
        // Different mode is a different block
        cache.get_or_translate(&mut mem, CODE, ExecMode::empty()).unwrap();
        assert_eq!(cache.stats().blocks, 2);
    }

    #[test]
    fn test_write_to_code_retranslates() {
        let (space, cache) = setup(&[asm::addi(A0, A0, 1), asm::jal(0, 0)]);
        let mut tlb = Tlb::new();
        let mut ctx = CpuContext { pc: CODE, ..Default::default() };
        {
            let mut mem = MemoryAccessor::new(&space, &mut tlb);
            let block = cache.get_or_translate(&mut mem, CODE, ExecMode::COMPRESSED).unwrap();
            execute_block(&mut ctx, &mut mem, &block.block, &block.code);
            assert_eq!(ctx.read_reg(A0), 1);

            // Guest store patches the immediate
            mem.write32(CODE, asm::addi(A0, A0, 100)).unwrap();
        }
        assert!(!cache.contains(CODE, ExecMode::COMPRESSED));

        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        let block = cache.get_or_translate(&mut mem, CODE, ExecMode::COMPRESSED).unwrap();
        ctx.pc = CODE;
        assert_eq!(execute_block(&mut ctx, &mut mem, &block.block, &block.code), BlockResult::Continue(CODE + 4));
        assert_eq!(ctx.read_reg(A0), 101);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_write_to_other_page_keeps_block() {
        let (space, cache) = setup(&[asm::addi(A0, A0, 1), asm::jal(0, 0)]);
        let mut tlb = Tlb::new();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        cache.get_or_translate(&mut mem, CODE, ExecMode::COMPRESSED).unwrap();
        mem.write32(CODE + PAGE_SIZE, 0).unwrap();
        assert!(cache.contains(CODE, ExecMode::COMPRESSED));
    }

    #[test]
    fn test_fetch_fault_block_not_cached() {
        let (space, cache) = setup(&[]);
        let mut tlb = Tlb::new();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        let block = cache.get_or_translate(&mut mem, CODE + 2 * PAGE_SIZE, ExecMode::COMPRESSED).unwrap();
        assert!(!block.block.cacheable);
        assert_eq!(cache.stats().blocks, 0);
    }

    #[test]
    fn test_concurrent_lookups_compile_once() {
        let (space, cache) = setup(&[asm::addi(A0, A0, 1), asm::add(A1, A1, A0), asm::jal(0, -8)]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let space = space.clone();
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut tlb = Tlb::new();
                    let mut mem = MemoryAccessor::new(&space, &mut tlb);
                    cache.get_or_translate(&mut mem, CODE, ExecMode::COMPRESSED).unwrap()
                })
            })
            .collect();
        let blocks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(blocks.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.stats().compiles, 1);
    }

    #[test]
    fn test_late_miss_finds_finished_block() {
        let (space, cache) = setup(&[asm::addi(A0, A0, 1), asm::jal(0, -4)]);
        let key = BlockKey { addr: CODE, mode: ExecMode::COMPRESSED };

        // A core that missed before the builder inserted, and claims only
        // after the builder released its slot
        let builder = match cache.claim(key) {
            Claim::Build(slot) => slot,
            _ => panic!("first claim must build"),
        };
        match cache.claim(key) {
            Claim::Wait(slot) => assert!(Arc::ptr_eq(&slot, &builder)),
            _ => panic!("second claim must wait on the builder"),
        }
        let mut tlb = Tlb::new();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        let built = cache.build(&mut mem, key).unwrap();
        lock::lock(&cache.inflight).remove(&key);

        match cache.claim(key) {
            Claim::Cached(block) => assert!(Arc::ptr_eq(&block, &built)),
            _ => panic!("late claim must reuse the cached block"),
        }
        assert!(lock::lock(&cache.inflight).is_empty());
        assert_eq!(cache.stats().compiles, 1);
    }

    #[test]
    fn test_block_spanning_pages_invalidated_from_either() {
        let (space, cache) = setup(&[]);
        let start = CODE + PAGE_SIZE - 4;
        space.write::<u32>(start, asm::addi(A0, A0, 1)).unwrap();
        space.write::<u32>(CODE + PAGE_SIZE, asm::jal(0, 0)).unwrap();
        let mut tlb = Tlb::new();
        let mut mem = MemoryAccessor::new(&space, &mut tlb);
        let block = cache.get_or_translate(&mut mem, start, ExecMode::COMPRESSED).unwrap();
        assert_eq!(block.range, start..CODE + PAGE_SIZE + 4);
        cache.invalidate(CODE + PAGE_SIZE, CODE + 2 * PAGE_SIZE);
        assert!(!cache.contains(start, ExecMode::COMPRESSED));
        assert!(lock::read(&cache.blocks).by_page.is_empty());
    }
}
