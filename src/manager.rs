//! Block Cache Manager: the orchestrator. Creates, validates, invalidates
//! and reclaims blocks; publishes them into the Dispatch Table; drives
//! self-modifying-code detection via content hashing.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::arena::NativeCodeArena;
use crate::block::{Block, CallRetOpcode, Reclaimer};
use crate::config::CacheConfig;
use crate::dispatch::DispatchTable;
use crate::error::CacheError;
use crate::hash::x31;
use crate::hotpage::{AlternateBlockOracle, HotPageTracker, NoAlternateBlocks, TimedHotPageTracker};
use crate::mem::{segfault_guard, HostMemory, Prot};
use crate::oracle::ProtectionOracle;
use crate::registry::BlockRegistry;
use crate::translator::{FillRequest, FillResult, Translator};

/// Reads raw guest bytes for hashing. Kept separate from `Translator`
/// because hash validation must be possible without re-invoking the
/// translator itself.
pub trait GuestMemory: Send + Sync {
    /// Copy `len` bytes starting at `ga` into `out`. Returns `false` if the
    /// range is not currently mapped/readable (treated as an immediate
    /// stale/retire, never a panic).
    fn read(&self, ga: u64, len: u32, out: &mut [u8]) -> bool;
}

struct ArenaReclaimer<M: HostMemory> {
    arena: Arc<NativeCodeArena<M>>,
}

impl<M: HostMemory> Reclaimer for ArenaReclaimer<M> {
    fn reclaim(&self, region: crate::arena::Region) {
        self.arena.free(region);
    }
}

/// Mutable state guarded by the one process-wide translation mutex.
struct RegistryState {
    registry: BlockRegistry,
}

/// The block cache core. Owns the Native Code Arena, Dispatch Table,
/// Protection Oracle, and Block Registry; exposes `get_block` and friends
/// to the run loop.
pub struct BlockCacheManager<M: HostMemory, T: Translator, G: GuestMemory> {
    config: CacheConfig,
    arena: Arc<NativeCodeArena<M>>,
    dispatch: DispatchTable,
    oracle: Arc<ProtectionOracle<M>>,
    guest_memory: G,
    translator: T,
    hot_pages: Box<dyn HotPageTracker>,
    alternates: Box<dyn AlternateBlockOracle>,
    reclaimer: Arc<ArenaReclaimer<M>>,
    state: Mutex<RegistryState>,
}

impl<M: HostMemory + Clone, T: Translator, G: GuestMemory> BlockCacheManager<M, T, G> {
    pub fn new(config: CacheConfig, host: M, translator: T, guest_memory: G) -> Self {
        let arena = Arc::new(NativeCodeArena::new(host.clone(), config.native_page_size));
        let oracle = crate::oracle::shared(host, config.native_page_size);
        let reclaimer = Arc::new(ArenaReclaimer {
            arena: arena.clone(),
        });
        Self {
            config,
            arena,
            dispatch: DispatchTable::new(),
            oracle,
            guest_memory,
            translator,
            hot_pages: Box::new(TimedHotPageTracker::new(
                config.native_page_size,
                config.hot_page_window,
            )),
            alternates: Box::new(NoAlternateBlocks),
            reclaimer,
            state: Mutex::new(RegistryState {
                registry: BlockRegistry::new(),
            }),
        }
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn oracle(&self) -> &Arc<ProtectionOracle<M>> {
        &self.oracle
    }

    /// Exposes `has_alternate(ga)` to the run loop, so it can decide whether
    /// to call `get_alternate_block` at all before paying for the lookup.
    pub fn has_alternate(&self, ga: u64) -> bool {
        self.alternates.alternate_for(ga).is_some()
    }

    /// Install a harness-provided alternate-block predicate, replacing the
    /// default always-`false` one.
    pub fn set_alternate_oracle(&mut self, oracle: Box<dyn AlternateBlockOracle>) {
        self.alternates = oracle;
    }

    /// Install a harness-provided hot-page tracker, replacing the default
    /// time-windowed one.
    pub fn set_hot_page_tracker(&mut self, tracker: Box<dyn HotPageTracker>) {
        self.hot_pages = tracker;
    }

    /// Step 1-6 of the lookup/fill algorithm.
    #[instrument(skip(self), fields(ga = %format!("{ga:#x}")))]
    pub fn get_block(&self, ga: u64, create: bool) -> Option<Arc<Block>> {
        if self.hot_pages.is_hot(ga) {
            trace!("hot page suppression, declining to translate");
            return None;
        }

        if let Some(b) = self.try_fast_path(ga) {
            return Some(b);
        }

        let existing = self.state.lock().registry.get(ga);
        if existing.is_none() && !create {
            return None;
        }

        let mut guard = if self.config.dynarec_wait {
            self.state.lock()
        } else {
            self.state.try_lock()?
        };

        // Re-check now that we hold the lock: another thread may have
        // finished building/validating `ga` while we were acquiring it.
        let current = guard.registry.get(ga);
        if let Some(ref b) = current {
            if self.cached_block_is_valid(b, ga) {
                return Some(b.clone());
            }
        }

        match current {
            None => self.build_and_publish(&mut guard, ga, ga, create),
            Some(b) => {
                if !self.oracle.protection(ga).contains(Prot::R | Prot::X) {
                    // The guest revoked exec on this page; no amount of
                    // retranslating fixes that, so decline outright.
                    None
                } else if self.oracle.needs_test(ga) || !b.is_ready() {
                    self.revalidate_or_rebuild(&mut guard, b, ga)
                } else {
                    Some(b)
                }
            }
        }
    }

    /// Identical to `get_block` except the Translator fills from
    /// `fill_from_ga` instead of `ga`.
    #[instrument(skip(self), fields(ga = %format!("{ga:#x}"), fill_from = %format!("{fill_from_ga:#x}")))]
    pub fn get_alternate_block(&self, ga: u64, fill_from_ga: u64) -> Option<Arc<Block>> {
        let mut guard = if self.config.dynarec_wait {
            self.state.lock()
        } else {
            self.state.try_lock()?
        };
        self.build_and_publish(&mut guard, ga, fill_from_ga, true)
    }

    fn try_fast_path(&self, ga: u64) -> Option<Arc<Block>> {
        let b = self.state.lock().registry.get(ga)?;
        if self.cached_block_is_valid(&b, ga) {
            Some(b)
        } else {
            None
        }
    }

    /// A cached block may be dispatched as-is only if it's ready, not
    /// retired, doesn't need a hash re-test, and the guest page backing it
    /// is still host-executable. A guest `mprotect` that drops `PROT_EXEC`
    /// without writing to the page leaves `needs_test` false, so that check
    /// alone isn't enough to catch it.
    fn cached_block_is_valid(&self, b: &Block, ga: u64) -> bool {
        b.is_ready()
            && !b.is_retired()
            && !self.oracle.needs_test(ga)
            && self.oracle.protection(ga).contains(Prot::R | Prot::X)
    }

    fn revalidate_or_rebuild(
        &self,
        guard: &mut parking_lot::MutexGuard<RegistryState>,
        b: Arc<Block>,
        ga: u64,
    ) -> Option<Arc<Block>> {
        let mut buf = vec![0u8; b.guest_size as usize];
        if !self.guest_memory.read(b.guest_start, b.guest_size, &mut buf) {
            warn!("guest range unreadable during revalidation, retiring block");
            self.retire_locked(guard, &b);
            return self.build_and_publish(guard, ga, ga, true);
        }
        let hash = x31(&buf);
        if hash == b.hash {
            debug!("hash matches, revalidating block in place");
            let range_size = b.guest_size as u64;
            if b.always_validate {
                // Leaves needs_test set: this block must be re-hashed again
                // on its very next dispatch, not just this one.
                self.oracle.protect_db(b.guest_start, range_size);
            } else {
                self.oracle.protect_dbjumptable(
                    b.guest_start,
                    range_size,
                    b.guest_start,
                    b.native_entry,
                    b.native_resume,
                );
                self.oracle.note_validated(b.guest_start);
            }
            self.rewrite_call_return_sites(&b, CallRetOpcode::Live);
            b.mark_ready();
            Some(b)
        } else {
            warn!("hash mismatch, retiring stale block");
            self.hot_pages.note_invalidation(ga);
            self.retire_locked(guard, &b);
            let fresh = self.build_and_publish(guard, ga, ga, true);
            if let Some(ref new_block) = fresh {
                new_block.set_previous(b);
            }
            fresh
        }
    }

    fn build_and_publish(
        &self,
        guard: &mut parking_lot::MutexGuard<RegistryState>,
        ga: u64,
        fill_from_ga: u64,
        create: bool,
    ) -> Option<Arc<Block>> {
        if !create {
            return None;
        }
        let needs_test = self.oracle.needs_test(fill_from_ga);
        let request = FillRequest {
            guest_start: fill_from_ga,
            max_insts: self.config.max_insts,
            page_needs_test: needs_test,
        };

        let built = segfault_guard::protect(|| self.fill_block(ga, request))??;
        let (block, region) = built;

        let entry_point = if block.dirty {
            block.native_resume
        } else {
            block.native_entry
        };

        if !self.dispatch.publish_if_default(ga, entry_point) {
            // Someone else published first. Our block was never linked into
            // the Registry or Dispatch Table, so letting `block` drop here
            // frees its native region through `Reclaimer` exactly once —
            // the Arc-based reclamation scheme makes the source's explicit
            // "hand the loser to mark_block so it isn't leaked" step
            // unnecessary: there is nothing left reachable to leak.
            let _ = region;
            drop(block);
            let winner = guard.registry.get(ga);
            if winner.is_none() {
                // Lost-publish recovery: the winner has already been
                // retired and removed from the Registry before we noticed.
                trace!("publish race winner already retired, nothing to hand off");
            }
            return winner;
        }

        // The page(s) whose validation state this governs are `ga`'s, not
        // `fill_from_ga`'s: `get_block`'s fast path checks
        // `self.oracle.needs_test(ga)`, and for an alternate block the two
        // addresses can be on entirely different pages.
        if block.always_validate {
            // Leaves needs_test set so the very first subsequent dispatch
            // still goes through the hash-check path, not just future ones.
            self.oracle.protect_db(ga, block.guest_size as u64);
        } else {
            self.oracle.note_validated(ga);
        }
        guard.registry.insert(block.clone());
        block.mark_ready();
        Some(block)
    }

    /// `ga` is the guest address this block will be published and registered
    /// under; `request.guest_start` is only where the Translator starts
    /// reading guest instructions from. The two differ for an alternate
    /// block (`get_alternate_block`), where translation is seeded from a
    /// different address than the one it ultimately serves dispatch for.
    fn fill_block(&self, ga: u64, request: FillRequest) -> Option<(Arc<Block>, crate::arena::Region)> {
        let provisional_len = (self.config.max_insts as usize).saturating_mul(16).max(64);
        let region = match self.arena.alloc(provisional_len) {
            Ok(r) => r,
            Err(CacheError::NativeAlloc { bytes }) => {
                warn!(bytes, "native code arena exhausted");
                return None;
            }
            Err(_) => return None,
        };

        let fill_result: FillResult = match unsafe {
            self.translator.fill(region.addr, region.len, request)
        } {
            Ok(r) => r,
            Err(_) => {
                self.arena.free(region);
                return None;
            }
        };

        self.arena.clear_icache(region);
        if let Err(_) = self.arena.make_executable(region) {
            self.arena.free(region);
            return None;
        }

        // The hash always covers `ga`'s own guest bytes, not
        // `request.guest_start`'s: `revalidate_or_rebuild` re-reads at
        // `block.guest_start` (== `ga`), so the baseline hash has to be taken
        // from the same range or every revalidation would spuriously fail.
        let mut buf = vec![0u8; fill_result.guest_size as usize];
        let hash = if self.guest_memory.read(ga, fill_result.guest_size, &mut buf) {
            x31(&buf)
        } else {
            0
        };

        let block = Block::new(
            ga,
            fill_result.guest_size,
            region.addr as usize + fill_result.entry_offset,
            region.addr as usize + fill_result.resume_offset,
            region,
            hash,
            fill_result.always_validate,
            request.page_needs_test,
            fill_result.call_return_sites,
            self.reclaimer.clone(),
        );
        Some((block, region))
    }

    /// Patch every call-return stub in `block` to its `Live` or `Trap`
    /// encoding. The Translator supplies both byte sequences at fill time
    /// (same length by construction), so the Manager just copies the right
    /// one over the other and flushes the icache — it never has to know
    /// what the opcodes actually mean on the target architecture.
    fn rewrite_call_return_sites(&self, block: &Block, opcode: CallRetOpcode) {
        for site in &block.call_return_sites {
            let bytes: &[u8] = match opcode {
                CallRetOpcode::Live => &site.live_bytes,
                CallRetOpcode::Trap => &site.trap_bytes,
            };
            self.arena.patch(block.native_region, site.offset as usize, bytes);
        }
    }

    fn retire_locked(&self, guard: &mut parking_lot::MutexGuard<RegistryState>, block: &Arc<Block>) {
        self.dispatch.reset(block.guest_start);
        self.rewrite_call_return_sites(block, CallRetOpcode::Trap);
        self.arena.clear_icache(block.native_region);
        block.mark_retired();
        guard.registry.remove(block.guest_start);
        if block.take_size_accounting() {
            guard.registry.account_retire(block.guest_size);
        }
    }

    /// Invalidate every block intersecting `[start, start+size)` without
    /// freeing them: they stay in the Registry with `ready = false` so the
    /// next `get_block` naturally re-validates or rebuilds them.
    pub fn mark_range(&self, start: u64, size: u64) {
        let guard = self.state.lock();
        let hits = guard.registry.intersecting(start, size);
        drop(guard);
        for block in hits {
            self.mark_block(&block);
        }
    }

    /// Retire every block intersecting `[start, start+size)` through the
    /// full retire protocol, including the deferred-free of any `previous`
    /// chains once the last `Arc` drops.
    pub fn free_range(&self, start: u64, size: u64) {
        let mut guard = self.state.lock();
        let hits = guard.registry.intersecting(start, size);
        for block in hits {
            self.retire_locked(&mut guard, &block);
        }
    }

    /// Soft-invalidate a single block: reset its Dispatch entry, trap its
    /// call-return stubs, and clear `ready` so it stays registered but the
    /// next `get_block` on its guest address is forced through
    /// revalidation or a full rebuild instead of the cached fast path.
    pub fn mark_block(&self, block: &Arc<Block>) {
        self.dispatch.reset(block.guest_start);
        self.rewrite_call_return_sites(block, CallRetOpcode::Trap);
        self.arena.clear_icache(block.native_region);
        block.mark_needs_revalidate();
    }

    /// Fully retire a single block.
    pub fn free_block(&self, block: &Arc<Block>) {
        let mut guard = self.state.lock();
        self.retire_locked(&mut guard, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeHostMemory;
    use crate::translator::FillResult;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[derive(Clone)]
    struct FakeGuestMemory {
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    impl FakeGuestMemory {
        fn new(len: usize) -> Self {
            Self {
                bytes: Arc::new(Mutex::new(vec![0xAB; len])),
            }
        }

        fn write_byte(&self, offset: usize, value: u8) {
            self.bytes.lock()[offset] = value;
        }
    }

    impl GuestMemory for FakeGuestMemory {
        fn read(&self, ga: u64, len: u32, out: &mut [u8]) -> bool {
            let bytes = self.bytes.lock();
            let start = ga as usize;
            let end = start + len as usize;
            if end > bytes.len() {
                return false;
            }
            out.copy_from_slice(&bytes[start..end]);
            true
        }
    }

    struct CountingTranslator {
        calls: Arc<AtomicUsize>,
        size: u32,
    }

    impl Translator for CountingTranslator {
        unsafe fn fill(
            &self,
            _region: *mut u8,
            _region_len: usize,
            request: FillRequest,
        ) -> crate::error::Result<FillResult> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let _ = request;
            Ok(FillResult {
                guest_size: self.size,
                native_len: 16,
                entry_offset: 0,
                resume_offset: 0,
                always_validate: false,
                call_return_sites: Vec::new(),
            })
        }
    }

    fn manager(
        calls: Arc<AtomicUsize>,
        guest_mem: FakeGuestMemory,
    ) -> BlockCacheManager<FakeHostMemory, CountingTranslator, FakeGuestMemory> {
        BlockCacheManager::new(
            CacheConfig::default(),
            FakeHostMemory::new(),
            CountingTranslator { calls, size: 16 },
            guest_mem,
        )
    }

    struct CallSiteTranslator {
        size: u32,
    }

    impl Translator for CallSiteTranslator {
        unsafe fn fill(
            &self,
            _region: *mut u8,
            _region_len: usize,
            _request: FillRequest,
        ) -> crate::error::Result<FillResult> {
            Ok(FillResult {
                guest_size: self.size,
                native_len: 16,
                entry_offset: 0,
                resume_offset: 0,
                always_validate: false,
                call_return_sites: vec![crate::block::CallReturnSite {
                    offset: 4,
                    live_bytes: vec![0x90, 0x90],
                    trap_bytes: vec![0xCC, 0xCC],
                }],
            })
        }
    }

    #[test]
    fn cold_miss_translates_and_publishes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = manager(calls.clone(), FakeGuestMemory::new(4096));
        let block = mgr.get_block(0x100, true).expect("should build");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_ne!(mgr.dispatch().lookup(0x100), crate::dispatch::DEFAULT_SENTINEL);
        assert_eq!(block.guest_start, 0x100);
    }

    #[test]
    fn warm_hit_does_not_retranslate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = manager(calls.clone(), FakeGuestMemory::new(4096));
        mgr.get_block(0x100, true).unwrap();
        mgr.get_block(0x100, true).unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn smc_detection_retires_and_rebuilds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guest_mem = FakeGuestMemory::new(4096);
        let mgr = manager(calls.clone(), guest_mem.clone());
        let first = mgr.get_block(0x100, true).unwrap();
        mgr.oracle().on_write_fault(0x100, mgr.dispatch());
        guest_mem.write_byte(0x100, 0xFF);
        let second = mgr.get_block(0x100, true).unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert!(first.is_retired());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn revoked_exec_declines_cached_block_without_rewriting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = manager(calls.clone(), FakeGuestMemory::new(4096));
        mgr.get_block(0x100, true).unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        // Guest drops PROT_EXEC on the page without writing to it: needs_test
        // stays false, so only an explicit protection check can catch this.
        mgr.oracle().set_protection(0x100, 16, Prot::R | Prot::W);

        assert!(mgr.get_block(0x100, true).is_none());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn retire_patches_call_return_sites_to_trap_bytes() {
        let mgr = BlockCacheManager::new(
            CacheConfig::default(),
            FakeHostMemory::new(),
            CallSiteTranslator { size: 16 },
            FakeGuestMemory::new(4096),
        );
        let block = mgr.get_block(0x100, true).unwrap();
        let region = block.native_region;
        let live = unsafe { std::slice::from_raw_parts(region.addr.add(4), 2) }.to_vec();
        assert_eq!(live, vec![0x90, 0x90]);

        mgr.free_block(&block);

        let trapped = unsafe { std::slice::from_raw_parts(region.addr.add(4), 2) }.to_vec();
        assert_eq!(trapped, vec![0xCC, 0xCC]);
    }

    #[test]
    fn miss_without_create_returns_none() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = manager(calls.clone(), FakeGuestMemory::new(4096));
        assert!(mgr.get_block(0x100, false).is_none());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn alternate_block_publishes_under_ga_not_fill_from_ga() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = manager(calls.clone(), FakeGuestMemory::new(4096));
        let ga = 0x200u64;
        let fill_from_ga = 0x100u64;

        let block = mgr.get_alternate_block(ga, fill_from_ga).unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(block.guest_start, ga);

        // Dispatch and Registry must agree on `ga`, not `fill_from_ga`.
        assert_ne!(mgr.dispatch().lookup(ga), crate::dispatch::DEFAULT_SENTINEL);
        assert_eq!(mgr.dispatch().lookup(fill_from_ga), crate::dispatch::DEFAULT_SENTINEL);

        // A plain get_block(ga) must now see the alternate block, not miss
        // forever because it was registered under the wrong key.
        let fetched = mgr.get_block(ga, false).unwrap();
        assert!(Arc::ptr_eq(&block, &fetched));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn mark_range_forces_revalidation_not_blind_reuse() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = manager(calls.clone(), FakeGuestMemory::new(4096));
        let first = mgr.get_block(0x100, true).unwrap();
        assert!(first.is_ready());

        mgr.mark_range(0x100, 16);
        assert!(!first.is_ready());
        assert!(!first.is_retired());

        // Guest bytes are unchanged, so this re-validates the same block in
        // place rather than rebuilding it.
        let second = mgr.get_block(0x100, true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.is_ready());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn free_range_retires_and_empties_registry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = manager(calls.clone(), FakeGuestMemory::new(4096));
        let block = mgr.get_block(0x100, true).unwrap();
        mgr.free_range(0x100, 16);
        assert!(block.is_retired());
        assert!(mgr.get_block(0x100, false).is_none());
    }
}
