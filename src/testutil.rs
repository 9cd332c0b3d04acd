//! Test-only fakes for the host-interaction traits, so the cache's
//! concurrency and bookkeeping logic can be exercised without a real mmap.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::mem::{HostMemory, Prot};

/// A `HostMemory` backed by ordinary heap allocations instead of mmap.
/// Protection changes are recorded but not enforced (no real page
/// protection is available on a plain heap allocation). Cloning shares the
/// same backing allocation table, the way every real `HostMemory` impl
/// shares one underlying address space regardless of how many handles to
/// it exist.
#[derive(Default, Clone)]
pub struct FakeHostMemory {
    regions: Arc<Mutex<HashMap<usize, Layout>>>,
}

impl FakeHostMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostMemory for FakeHostMemory {
    fn mmap(&self, len: usize, _prot: Prot) -> Result<*mut u8> {
        let layout = Layout::from_size_align(len.max(1), 64).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        self.regions.lock().unwrap().insert(ptr as usize, layout);
        Ok(ptr)
    }

    fn mprotect(&self, _addr: *mut u8, _len: usize, _prot: Prot) -> Result<()> {
        Ok(())
    }

    unsafe fn munmap(&self, addr: *mut u8, _len: usize) {
        if let Some(layout) = self.regions.lock().unwrap().remove(&(addr as usize)) {
            dealloc(addr, layout);
        }
    }

    fn clear_icache(&self, _addr: *mut u8, _len: usize) {}
}
