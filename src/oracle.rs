//! Protection Oracle: per-guest-page metadata telling the Manager whether a
//! page is currently executable and whether it may have been written since
//! the last translation or validation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dispatch::DispatchTable;
use crate::mem::{HostMemory, Prot};

const SHARDS: usize = 16;

pub type PageId = u64;

struct PageState {
    prot: Prot,
    needs_test: AtomicBool,
    /// `(guest_start, native_entry, native_resume)` tuples registered via
    /// `protect_dbjumptable` for blocks whose guest range covers this page.
    /// Consulted by `on_write_fault` to flip dispatch entries to their
    /// resume trampoline.
    jumptable_links: Vec<(u64, usize, usize)>,
}

impl PageState {
    fn new(prot: Prot) -> Self {
        Self {
            prot,
            needs_test: AtomicBool::new(false),
            jumptable_links: Vec::new(),
        }
    }
}

/// Tracks, per guest page, the current host protection and whether the page
/// needs re-validation before its cached translation may be reused.
pub struct ProtectionOracle<M: HostMemory> {
    shards: Vec<RwLock<HashMap<PageId, PageState>>>,
    host: M,
    page_size: usize,
}

fn shard_of(page: PageId) -> usize {
    (page as usize) % SHARDS
}

impl<M: HostMemory> ProtectionOracle<M> {
    pub fn new(host: M, page_size: usize) -> Self {
        let mut shards = Vec::with_capacity(SHARDS);
        for _ in 0..SHARDS {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self {
            shards,
            host,
            page_size,
        }
    }

    fn page_of(&self, ga: u64) -> PageId {
        ga / self.page_size as u64
    }

    fn entry_or_default(&self, page: PageId) -> Prot {
        self.shards[shard_of(page)]
            .read()
            .get(&page)
            .map(|s| s.prot)
            .unwrap_or(Prot::R | Prot::W | Prot::X)
    }

    /// Current host-enforced protection for the guest mapping backing `ga`.
    pub fn protection(&self, ga: u64) -> Prot {
        self.entry_or_default(self.page_of(ga))
    }

    /// True if any byte in the page containing `ga` was (or may have been)
    /// written since the last translation or validation.
    pub fn needs_test(&self, ga: u64) -> bool {
        let page = self.page_of(ga);
        self.shards[shard_of(page)]
            .read()
            .get(&page)
            .map(|s| s.needs_test.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    fn mark_needs_test(&self, page: PageId, value: bool) {
        let mut shard = self.shards[shard_of(page)].write();
        shard
            .entry(page)
            .or_insert_with(|| PageState::new(Prot::R | Prot::W | Prot::X))
            .needs_test
            .store(value, Ordering::Release);
    }

    /// Mark a page's translation as freshly created or freshly re-validated:
    /// clears `needs_test`.
    pub fn note_validated(&self, ga: u64) {
        self.mark_needs_test(self.page_of(ga), false);
    }

    fn pages_in_range(&self, start: u64, size: u64) -> impl Iterator<Item = PageId> {
        let first = self.page_of(start);
        let last = if size == 0 {
            first
        } else {
            self.page_of(start + size - 1)
        };
        first..=last
    }

    /// Write-protect `[start, start+size)` on the host and remember which
    /// Dispatch Table entries to flip to their resume address if a write
    /// fault lands on it. Used for blocks that can use the fast
    /// needs-test-via-page-fault path.
    pub fn protect_dbjumptable(
        &self,
        start: u64,
        size: u64,
        guest_start: u64,
        native_entry: usize,
        native_resume: usize,
    ) {
        for page in self.pages_in_range(start, size) {
            let mut shard = self.shards[shard_of(page)].write();
            let entry = shard
                .entry(page)
                .or_insert_with(|| PageState::new(Prot::R | Prot::X));
            entry.prot = Prot::R | Prot::X;
            entry.needs_test.store(false, Ordering::Release);
            entry
                .jumptable_links
                .push((guest_start, native_entry, native_resume));
            drop(shard);
            let page_addr = (page as usize) * self.page_size;
            let _ = self
                .host
                .mprotect(page_addr as *mut u8, self.page_size, Prot::R | Prot::X);
        }
    }

    /// Same as `protect_dbjumptable` but for `always_validate` blocks: marks
    /// the range executable without registering a jump-table flip, because
    /// write-protection cannot be achieved (e.g. large host pages). Leaves
    /// `needs_test` set so the Manager re-hashes on every dispatch instead of
    /// trusting a single validation forever.
    pub fn protect_db(&self, start: u64, size: u64) {
        for page in self.pages_in_range(start, size) {
            self.mark_needs_test(page, true);
        }
    }

    /// Record an externally observed protection change for
    /// `[start, start+size)` — e.g. the harness intercepting the guest's own
    /// `mprotect` syscall. Deliberately does not touch `needs_test`: a page
    /// losing `W` or `X` without anyone having written to it doesn't make its
    /// cached translation's bytes stale, it only changes whether that
    /// translation may still be dispatched.
    pub fn set_protection(&self, start: u64, size: u64, prot: Prot) {
        for page in self.pages_in_range(start, size) {
            let mut shard = self.shards[shard_of(page)].write();
            shard.entry(page).or_insert_with(|| PageState::new(prot)).prot = prot;
        }
    }

    /// Called by the harness's SIGSEGV/SIGBUS handler when a guest write
    /// traps on a page previously protected via `protect_dbjumptable`.
    /// Restores write access, sets `needs_test`, and best-effort flips any
    /// registered dispatch entries to their resume trampoline.
    pub fn on_write_fault(&self, ga: u64, dispatch: &DispatchTable) {
        let page = self.page_of(ga);
        let page_addr = (page as usize) * self.page_size;
        let _ = self
            .host
            .mprotect(page_addr as *mut u8, self.page_size, Prot::R | Prot::W | Prot::X);
        let links = {
            let mut shard = self.shards[shard_of(page)].write();
            let Some(state) = shard.get_mut(&page) else {
                return;
            };
            state.prot = Prot::R | Prot::W | Prot::X;
            state.needs_test.store(true, Ordering::Release);
            std::mem::take(&mut state.jumptable_links)
        };
        for (guest_start, entry, resume) in links {
            let _ = dispatch.publish_if_eq(guest_start, entry, resume);
        }
    }

    pub fn host(&self) -> &M {
        &self.host
    }
}

pub fn shared<M: HostMemory>(host: M, page_size: usize) -> Arc<ProtectionOracle<M>> {
    Arc::new(ProtectionOracle::new(host, page_size))
}
