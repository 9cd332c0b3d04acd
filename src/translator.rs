//! The external contract this cache consumes: whatever turns a guest
//! instruction stream into native code. The cache itself never decodes
//! guest instructions; it only schedules, publishes, and invalidates the
//! Translator's output.

use crate::block::CallReturnSite;
use crate::error::Result;

/// What the Manager asks a Translator to do when it misses the cache.
#[derive(Debug, Clone, Copy)]
pub struct FillRequest {
    pub guest_start: u64,
    /// Upper bound on how many guest instructions may be folded into one
    /// block, per `CacheConfig::max_insts`.
    pub max_insts: u32,
    /// True if the page backing `guest_start` was already flagged dirty by
    /// the Protection Oracle; a translator may use this to decide whether to
    /// emit `always_validate` code defensively.
    pub page_needs_test: bool,
}

/// What a Translator hands back after successfully filling a region.
#[derive(Debug, Clone)]
pub struct FillResult {
    /// Number of guest bytes actually consumed — may be less than
    /// `max_insts` worth if a branch or page boundary cut the run short.
    pub guest_size: u32,
    /// Number of native bytes written into the region passed to `fill`.
    pub native_len: usize,
    /// Entry point offset (relative to the region base) for a cold first
    /// dispatch.
    pub entry_offset: usize,
    /// Entry point offset for re-dispatch after a validated resume (may
    /// equal `entry_offset` if the block has no distinct fast-resume path).
    pub resume_offset: usize,
    /// True if the translator determined, mid-fill, that the source page
    /// was dirty and the block must never be trusted without re-validation.
    pub always_validate: bool,
    pub call_return_sites: Vec<CallReturnSite>,
}

/// Turns guest code into native code. Implementations are expected to run
/// under the cache's translation mutex and must not retain references to
/// the region past returning.
pub trait Translator: Send + Sync {
    /// Fill `region` with a native translation of the guest run starting at
    /// `request.guest_start`. Returning `Err` aborts the fill; the Manager
    /// discards the partially written region.
    ///
    /// # Safety
    /// `region` must be writable for the translator's duration and the
    /// translator must not write past `region.len` bytes.
    unsafe fn fill(&self, region: *mut u8, region_len: usize, request: FillRequest) -> Result<FillResult>;
}
