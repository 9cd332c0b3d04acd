//! Host memory primitives: the mmap/mprotect surface the Native Code Arena
//! and Protection Oracle build on, and the segfault guard used to recover
//! from a translator fault mid fill-in.

use bitflags::bitflags;

use crate::error::{CacheError, Result};

bitflags! {
    /// Host-enforced page protection, as reported by [`HostMemory::protection`]
    /// or requested of [`HostMemory::mprotect`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u8 {
        const R = 0b001;
        const W = 0b010;
        const X = 0b100;
    }
}

/// Abstraction over the native mmap/mprotect/munmap syscalls, so the rest of
/// the crate can be exercised against an in-process fake without touching
/// real host memory.
pub trait HostMemory: Send + Sync {
    /// Map `len` bytes of fresh host memory with the given protection.
    fn mmap(&self, len: usize, prot: Prot) -> Result<*mut u8>;
    /// Change the protection of an existing mapping in place.
    fn mprotect(&self, addr: *mut u8, len: usize, prot: Prot) -> Result<()>;
    /// Unmap a region previously returned by `mmap`.
    ///
    /// # Safety
    /// `addr`/`len` must exactly match a prior successful `mmap` call, and no
    /// other thread may still be executing code inside the region.
    unsafe fn munmap(&self, addr: *mut u8, len: usize);
    /// Flush the host instruction cache for a just-written range of native
    /// code, so other cores observe the new bytes before branching into them.
    fn clear_icache(&self, addr: *mut u8, len: usize);
}

/// Real mmap/mprotect-backed [`HostMemory`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapHostMemory;

impl MmapHostMemory {
    fn to_libc_prot(prot: Prot) -> libc::c_int {
        let mut out = 0;
        if prot.contains(Prot::R) {
            out |= libc::PROT_READ;
        }
        if prot.contains(Prot::W) {
            out |= libc::PROT_WRITE;
        }
        if prot.contains(Prot::X) {
            out |= libc::PROT_EXEC;
        }
        out
    }
}

impl HostMemory for MmapHostMemory {
    fn mmap(&self, len: usize, prot: Prot) -> Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                Self::to_libc_prot(prot),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CacheError::NativeAlloc { bytes: len });
        }
        Ok(ptr.cast())
    }

    fn mprotect(&self, addr: *mut u8, len: usize, prot: Prot) -> Result<()> {
        let rc = unsafe { libc::mprotect(addr.cast(), len, Self::to_libc_prot(prot)) };
        if rc != 0 {
            return Err(CacheError::Protect {
                addr: addr as usize,
                len,
            });
        }
        Ok(())
    }

    unsafe fn munmap(&self, addr: *mut u8, len: usize) {
        libc::munmap(addr.cast(), len);
    }

    fn clear_icache(&self, addr: *mut u8, len: usize) {
        // On AArch64 the I/D caches are not coherent; a rewritten
        // call-return stub or a freshly filled block must be flushed before
        // any core can safely branch into it.
        #[cfg(target_arch = "aarch64")]
        unsafe {
            let start = addr as usize;
            let end = start + len;
            // `__builtin___clear_cache`-equivalent: issue `dc cvau`/`ic ivau`
            // for every cache line in range, then a full barrier. Real
            // deployments call into the libc/compiler-rt intrinsic; we mirror
            // that contract here without depending on it directly.
            extern "C" {
                fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
            }
            __clear_cache(start as *mut libc::c_char, end as *mut libc::c_char);
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = (addr, len);
        }
    }
}

pub mod segfault_guard {
    //! Recover from a host-level SIGSEGV/SIGBUS raised while the Translator
    //! is filling a block, the way `examples/original_source/src/include/os.h`'s
    //! `NEW_JUMPBUFF`/`SigSetJmp`/`LongJmp` macros do in the original C.
    //!
    //! Cancellation is not supported once a guarded scope is entered for any
    //! reason other than a trapped signal: the closure either returns
    //! normally or the process longjmps back to the call site.

    use std::cell::Cell;
    use std::os::raw::{c_int, c_void};
    use std::sync::Once;

    // Opaque, oversized storage for a `sigjmp_buf`. The true layout is
    // platform-specific and private to libc; we only ever pass a pointer to
    // this storage to `sigsetjmp`/`siglongjmp`, never inspect it.
    #[repr(C, align(16))]
    struct SigJmpBuf([u8; 256]);

    impl SigJmpBuf {
        const fn zeroed() -> Self {
            Self([0; 256])
        }
    }

    extern "C" {
        #[link_name = "sigsetjmp"]
        fn sigsetjmp_raw(env: *mut SigJmpBuf, savesigs: c_int) -> c_int;
        fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
    }

    thread_local! {
        static JUMP_BUF: std::cell::UnsafeCell<SigJmpBuf> =
            std::cell::UnsafeCell::new(SigJmpBuf::zeroed());
        static GUARD_ACTIVE: Cell<bool> = Cell::new(false);
    }

    static INSTALL_HANDLER: Once = Once::new();

    extern "C" fn on_fault(_sig: c_int, _info: *mut c_void, _ctx: *mut c_void) {
        let active = GUARD_ACTIVE.with(|a| a.get());
        if !active {
            // Not inside a guarded fill; this is a real crash, restore the
            // default disposition and re-raise so the process dies normally
            // instead of looping on the same instruction.
            unsafe {
                libc::signal(_sig, libc::SIG_DFL);
            }
            return;
        }
        JUMP_BUF.with(|buf| unsafe {
            siglongjmp(buf.get(), 1);
        });
    }

    fn install_handler_once() {
        INSTALL_HANDLER.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_fault as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
            libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
        });
    }

    /// Run `f` under segfault protection. Returns `None` if `f` triggered a
    /// SIGSEGV/SIGBUS instead of returning normally.
    pub fn protect<T>(f: impl FnOnce() -> T) -> Option<T> {
        install_handler_once();
        let hit_fault = JUMP_BUF.with(|buf| unsafe { sigsetjmp_raw(buf.get(), 1) } != 0);
        if hit_fault {
            GUARD_ACTIVE.with(|a| a.set(false));
            return None;
        }
        GUARD_ACTIVE.with(|a| a.set(true));
        let result = f();
        GUARD_ACTIVE.with(|a| a.set(false));
        Some(result)
    }
}
