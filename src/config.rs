//! Tunable knobs for the block cache: a single plain struct with a
//! `default()` a caller can override piecemeal, constructed by the
//! embedding harness rather than parsed from disk or environment here.

use std::time::Duration;

/// Configuration for a [`crate::manager::BlockCacheManager`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// If true, the translation mutex is acquired with a blocking wait on
    /// every miss; if false (the default), a non-blocking `try_lock` is used
    /// and a contended miss simply returns "no block, fall back to the
    /// interpreter" rather than stalling the guest thread.
    pub dynarec_wait: bool,
    /// Maximum guest instructions folded into a single block by a Translator.
    pub max_insts: u32,
    /// Window within which a repeated invalidation marks a page "hot" and
    /// routes future blocks on it through the `always_validate` path.
    pub hot_page_window: Duration,
    /// Host page size in bytes, used by the Native Code Arena and
    /// Protection Oracle for rounding and page-id arithmetic.
    pub native_page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dynarec_wait: false,
            max_insts: 1024,
            hot_page_window: Duration::from_millis(50),
            native_page_size: 4096,
        }
    }
}
