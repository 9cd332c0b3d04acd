//! Hot-page suppression and the alternate-block escape hatch.
//!
//! A guest page that is rewritten and re-executed in a tight loop (JIT
//! warm-up code, self-checking packers) would otherwise cause the Manager to
//! retranslate it on every single hit. `HotPageTracker` lets the Manager
//! notice this pattern and fall back to a slower, validate-every-time block
//! instead of repeatedly paying full translation cost.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tracks recent invalidations per guest page to detect pages being
/// rewritten faster than the cache can usefully re-translate them.
pub trait HotPageTracker: Send + Sync {
    /// Record that the page containing `ga` was just invalidated.
    fn note_invalidation(&self, ga: u64);
    /// True if `ga`'s page has been invalidated often enough, recently
    /// enough, to be considered "hot" and worth an `always_validate` block.
    fn is_hot(&self, ga: u64) -> bool;
}

/// Time-windowed hot-page tracker: a page is hot if it was invalidated more
/// than once within `window`.
pub struct TimedHotPageTracker {
    page_size: usize,
    window: Duration,
    last_invalidation: Mutex<HashMap<u64, Instant>>,
}

impl TimedHotPageTracker {
    pub fn new(page_size: usize, window: Duration) -> Self {
        Self {
            page_size,
            window,
            last_invalidation: Mutex::new(HashMap::new()),
        }
    }

    fn page_of(&self, ga: u64) -> u64 {
        ga / self.page_size as u64
    }
}

impl HotPageTracker for TimedHotPageTracker {
    fn note_invalidation(&self, ga: u64) {
        let page = self.page_of(ga);
        self.last_invalidation.lock().insert(page, Instant::now());
    }

    fn is_hot(&self, ga: u64) -> bool {
        let page = self.page_of(ga);
        match self.last_invalidation.lock().get(&page) {
            Some(seen) => seen.elapsed() < self.window,
            None => false,
        }
    }
}

/// Decides, for a block that would otherwise require a fresh translation,
/// whether a pre-existing alternate (pre-validated, slower) translation
/// should be dispatched instead. The default implementation never offers
/// one; a host embedding this cache alongside a multi-ISA or multi-mode
/// guest can implement this to serve an alternate mode's block.
pub trait AlternateBlockOracle: Send + Sync {
    fn alternate_for(&self, guest_start: u64) -> Option<u64>;
}

pub struct NoAlternateBlocks;

impl AlternateBlockOracle for NoAlternateBlocks {
    fn alternate_for(&self, _guest_start: u64) -> Option<u64> {
        None
    }
}
