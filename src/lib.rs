//! # `dynablock`
//!
//! The dynamic block cache of a dynamic binary translator: lazy translation
//! of guest instruction runs into native code, guest-address to
//! native-entry dispatch, self-modifying-code detection by content hash,
//! and safe concurrent invalidation and reclamation.
//!
//! This crate does not decode guest instructions, allocate guest registers,
//! or parse configuration from disk or environment — those are the job of
//! the embedding harness, which constructs a [`BlockCacheManager`] from a
//! [`CacheConfig`] and its own [`Translator`]/[`GuestMemory`]/[`HostMemory`]
//! implementations.

mod arena;
mod block;
mod config;
mod dispatch;
mod error;
mod hash;
mod hotpage;
mod manager;
mod mem;
mod oracle;
mod registry;
mod translator;

#[cfg(test)]
mod testutil;

pub use arena::{NativeCodeArena, Region};
pub use block::{Block, CallReturnSite, CallRetOpcode, Reclaimer};
pub use config::CacheConfig;
pub use dispatch::{DispatchTable, DEFAULT_SENTINEL};
pub use error::{CacheError, Result};
pub use hash::x31;
pub use hotpage::{AlternateBlockOracle, HotPageTracker, NoAlternateBlocks, TimedHotPageTracker};
pub use manager::{BlockCacheManager, GuestMemory};
pub use mem::{segfault_guard, HostMemory, MmapHostMemory, Prot};
pub use oracle::ProtectionOracle;
pub use registry::BlockRegistry;
pub use translator::{FillRequest, FillResult, Translator};
