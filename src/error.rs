//! Error taxonomy.
//!
//! Almost nothing in this crate is fatal: a failed translation, a lost
//! publish race, or lock contention all downgrade to "no block" and the
//! caller falls back to interpretation. `CacheError` exists only for the
//! handful of operations with a caller-actionable failure mode below that
//! boundary (host memory exhaustion, a translator that returned a
//! self-contradictory fill result).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to map {bytes} bytes of native code memory")]
    NativeAlloc { bytes: usize },

    #[error("failed to change protection on native region {addr:#x} ({len} bytes)")]
    Protect { addr: usize, len: usize },

    #[error("translator returned a fill result with guest_size=0 but call_return_sites is non-empty")]
    MalformedFill,
}

pub type Result<T> = std::result::Result<T, CacheError>;
