//! `Block`: the central entity — one contiguous native-code translation of a
//! straight-line guest run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::arena::Region;

/// A position inside a block's native code where an indirect call/return
/// stub can be rewritten to redirect control flow out of a retired block.
///
/// The Translator supplies both encodings up front: `live_bytes` is what it
/// already emitted at `offset`, `trap_bytes` is an equal-length encoding that
/// traps back into the Manager's miss path. Same length is load-bearing —
/// patching in place must never shift any code that follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReturnSite {
    /// Byte offset within the block's native region.
    pub offset: u32,
    /// The opcode bytes already present at `offset` when the Translator
    /// filled the block.
    pub live_bytes: Vec<u8>,
    /// Equal-length opcode bytes that trap back into the miss path.
    pub trap_bytes: Vec<u8>,
}

/// The two opcodes a call-return stub can hold. There is deliberately no
/// third "NOP" state distinct from `Live`: once a block is confirmed live
/// again its stubs go back to exactly what the Translator emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRetOpcode {
    /// The translator's original opcode at this site.
    Live,
    /// Rewritten to trap back into the Manager's miss path.
    Trap,
}

/// Anything able to release a native code region back to its arena. Lets
/// `Block` free itself on drop without being generic over a `HostMemory`
/// implementation.
pub trait Reclaimer: Send + Sync {
    fn reclaim(&self, region: Region);
}

/// One contiguous native-code translation of a straight-line guest run.
pub struct Block {
    pub guest_start: u64,
    pub guest_size: u32,
    pub native_entry: usize,
    pub native_resume: usize,
    pub native_region: Region,
    pub hash: u32,
    pub ready: AtomicBool,
    pub retired: AtomicBool,
    pub always_validate: bool,
    /// Set when the Translator discovered, mid-fill, that the backing page
    /// was already dirty; the Manager publishes `native_resume` instead of
    /// `native_entry` for such a block's first dispatch.
    pub dirty: bool,
    pub call_return_sites: Vec<CallReturnSite>,
    /// Deferred-free chain: the retired predecessor for this `guest_start`,
    /// kept alive only as long as this block is.
    pub previous: parking_lot::Mutex<Option<Arc<Block>>>,
    /// Guards the `db_sizes` decrement so it happens exactly once regardless
    /// of which retirement path (`mark`/`free`) reaches this block first.
    pub size_accounted: AtomicBool,

    reclaimer: Arc<dyn Reclaimer>,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guest_start: u64,
        guest_size: u32,
        native_entry: usize,
        native_resume: usize,
        native_region: Region,
        hash: u32,
        always_validate: bool,
        dirty: bool,
        call_return_sites: Vec<CallReturnSite>,
        reclaimer: Arc<dyn Reclaimer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            guest_start,
            guest_size,
            native_entry,
            native_resume,
            native_region,
            hash,
            ready: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            always_validate,
            dirty,
            call_return_sites,
            previous: parking_lot::Mutex::new(None),
            size_accounted: AtomicBool::new(guest_size != 0),
            reclaimer,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn mark_retired(&self) {
        self.ready.store(false, Ordering::Release);
        self.retired.store(true, Ordering::Release);
    }

    /// Soft-invalidate: the block stays registered and not retired, but
    /// `is_ready()` goes false so the next `get_block` on its guest address
    /// can't take the cached fast path and instead falls through to
    /// revalidation or a full rebuild.
    pub fn mark_needs_revalidate(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Take ownership of the one-shot "still needs db_sizes decrement"
    /// permission. Returns `true` exactly once across the block's lifetime.
    pub fn take_size_accounting(&self) -> bool {
        self.size_accounted
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attach a retired predecessor to this block's deferred-free chain.
    pub fn set_previous(&self, prev: Arc<Block>) {
        *self.previous.lock() = Some(prev);
    }

    pub fn end(&self) -> u64 {
        self.guest_start + self.guest_size as u64
    }

    pub fn intersects(&self, start: u64, size: u64) -> bool {
        let query_end = start.saturating_add(size);
        self.guest_start < query_end && start < self.end()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // `previous` drops here too (field order), releasing the chain
        // transitively once nothing reaches this block any longer.
        self.reclaimer.reclaim(self.native_region);
    }
}

static_assertions::assert_impl_all!(Block: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Region;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct CountingReclaimer(Arc<StdAtomicUsize>);
    impl Reclaimer for CountingReclaimer {
        fn reclaim(&self, _region: Region) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_block(guest_start: u64, guest_size: u32, reclaimer: Arc<dyn Reclaimer>) -> Arc<Block> {
        Block::new(
            guest_start,
            guest_size,
            0x1000,
            0x1008,
            Region {
                addr: std::ptr::null_mut(),
                len: 64,
            },
            0,
            false,
            false,
            Vec::new(),
            reclaimer,
        )
    }

    #[test]
    fn drop_frees_exactly_once() {
        let count = Arc::new(StdAtomicUsize::new(0));
        let reclaimer: Arc<dyn Reclaimer> = Arc::new(CountingReclaimer(count.clone()));
        {
            let b = fake_block(0x400000, 16, reclaimer);
            assert!(!b.is_ready());
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn previous_chain_keeps_predecessor_alive() {
        let count = Arc::new(StdAtomicUsize::new(0));
        let reclaimer: Arc<dyn Reclaimer> = Arc::new(CountingReclaimer(count.clone()));
        let old = fake_block(0x400000, 16, reclaimer.clone());
        let new = fake_block(0x400000, 16, reclaimer);
        new.set_previous(old.clone());
        drop(old);
        // `new` still holds a strong ref via `previous`, so no free yet.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(new);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn size_accounting_is_claimed_exactly_once() {
        let count = Arc::new(StdAtomicUsize::new(0));
        let reclaimer: Arc<dyn Reclaimer> = Arc::new(CountingReclaimer(count));
        let b = fake_block(0x400000, 16, reclaimer);
        assert!(b.take_size_accounting());
        assert!(!b.take_size_accounting());
    }

    #[test]
    fn mark_needs_revalidate_clears_ready_but_not_retired() {
        let count = Arc::new(StdAtomicUsize::new(0));
        let reclaimer: Arc<dyn Reclaimer> = Arc::new(CountingReclaimer(count));
        let b = fake_block(0x400000, 16, reclaimer);
        b.mark_ready();
        assert!(b.is_ready());
        b.mark_needs_revalidate();
        assert!(!b.is_ready());
        assert!(!b.is_retired());
    }

    #[test]
    fn zero_size_block_has_no_size_accounting_to_claim() {
        let count = Arc::new(StdAtomicUsize::new(0));
        let reclaimer: Arc<dyn Reclaimer> = Arc::new(CountingReclaimer(count));
        let b = fake_block(0x400000, 0, reclaimer);
        assert!(!b.take_size_accounting());
    }
}
