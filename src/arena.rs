//! Native Code Arena: allocates and frees the executable host-memory
//! regions carrying translated blocks.

use parking_lot::Mutex;

use crate::error::Result;
use crate::mem::{HostMemory, Prot};

/// A single native-code allocation.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub addr: *mut u8,
    pub len: usize,
}

unsafe impl Send for Region {}

/// Allocates fresh, page-aligned executable regions from a private pool and
/// frees them. Safe to call from any thread.
pub struct NativeCodeArena<M: HostMemory> {
    host: M,
    page_size: usize,
    /// Small free list of already-unmapped-but-recorded regions is not kept
    /// here (munmap is cheap and immediate); this lock only serializes
    /// bookkeeping, matching spec's "thread-safe internally" requirement
    /// without adding a reuse cache that would complicate the deferred-free
    /// story in `manager`.
    stats: Mutex<ArenaStats>,
}

#[derive(Default)]
struct ArenaStats {
    live_bytes: usize,
    live_regions: usize,
}

impl<M: HostMemory> NativeCodeArena<M> {
    pub fn new(host: M, page_size: usize) -> Self {
        Self {
            host,
            page_size,
            stats: Mutex::new(ArenaStats::default()),
        }
    }

    fn round_up(&self, bytes: usize) -> usize {
        let mask = self.page_size - 1;
        (bytes + mask) & !mask
    }

    /// Allocate a writable region large enough for `bytes` of native code.
    /// The region is `R|W` so the Translator can fill it; the caller must
    /// call [`Self::make_executable`] (or rely on RWX, see below) before
    /// first entry.
    pub fn alloc(&self, bytes: usize) -> Result<Region> {
        let len = self.round_up(bytes.max(1));
        // On hosts with 4 KiB pages the Protection Oracle can track writes
        // per-page after the fact, so it is safe to map RWX directly and
        // skip a second mprotect round-trip per block; larger host pages
        // cannot mix R/W and X safely (`always_validate` blocks), so they go
        // through the W -> X transition explicitly via `make_executable`.
        let prot = if self.page_size <= 4096 {
            Prot::R | Prot::W | Prot::X
        } else {
            Prot::R | Prot::W
        };
        let addr = self.host.mmap(len, prot)?;
        let mut stats = self.stats.lock();
        stats.live_bytes += len;
        stats.live_regions += 1;
        Ok(Region { addr, len })
    }

    /// Transition a freshly filled region from writable to executable.
    /// A no-op on hosts where `alloc` already mapped RWX.
    pub fn make_executable(&self, region: Region) -> Result<()> {
        if self.page_size <= 4096 {
            return Ok(());
        }
        self.host.mprotect(region.addr, region.len, Prot::R | Prot::X)
    }

    /// Free a region. Safe to call from any thread; the caller (the Block
    /// Cache Manager) is responsible for guaranteeing no other thread still
    /// holds a pointer into it before calling this (see the deferred
    /// reclamation protocol in `manager`).
    pub fn free(&self, region: Region) {
        unsafe {
            self.host.munmap(region.addr, region.len);
        }
        let mut stats = self.stats.lock();
        stats.live_bytes = stats.live_bytes.saturating_sub(region.len);
        stats.live_regions = stats.live_regions.saturating_sub(1);
    }

    pub fn clear_icache(&self, region: Region) {
        self.host.clear_icache(region.addr, region.len);
    }

    /// Overwrite `bytes` at `region.addr + offset` and flush the icache over
    /// `region`. On hosts whose pages can't mix `W` and `X` (`alloc` maps
    /// those as `R|W` then `make_executable` drops to `R|X`), regains `W` for
    /// the duration of the write and drops back to `R|X` after — a call-site
    /// rewrite is, in effect, re-entering the same write/execute transition
    /// a block goes through once at fill time.
    pub fn patch(&self, region: Region, offset: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let large_pages = self.page_size > 4096;
        if large_pages {
            let _ = self.host.mprotect(region.addr, region.len, Prot::R | Prot::W);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.addr.add(offset), bytes.len());
        }
        if large_pages {
            let _ = self.host.mprotect(region.addr, region.len, Prot::R | Prot::X);
        }
        self.host.clear_icache(region.addr, region.len);
    }

    pub fn live_bytes(&self) -> usize {
        self.stats.lock().live_bytes
    }

    pub fn live_regions(&self) -> usize {
        self.stats.lock().live_regions
    }
}
