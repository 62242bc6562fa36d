/*!
 * RAII Resource Guards
 *
 * Owned map handles with guaranteed release.
 *
 * ## Design Principles
 *
 * 1. **Ownership**: a handle is released by consuming it, so releasing twice
 *    does not compile
 * 2. **Scoped**: any handle still active when it goes out of scope is released
 *    by `Drop`, which covers every early return and `?`
 * 3. **Traced**: acquire and release each emit a debug event
 *
 * ## Example
 *
 * ```ignore
 * let inner = registry.create(&spec)?;
 * inner.update(12u32, 34u32, UpdateFlags::Any)?; // released by Drop on error
 * registry.release(inner)?;                      // or explicitly on success
 * ```
 */

mod handle;
mod traits;

pub use handle::{BorrowedMap, HandleOrigin, MapAccess, MapHandle};
pub use traits::{Guard, Lifecycle};

use nix::errno::Errno;

/// Result type for guard operations
pub type GuardResult<T> = Result<T, GuardError>;

/// Errors that can occur during guard operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("Resource already released")]
    AlreadyReleased,

    #[error("Kernel rejected release: {0}")]
    Kernel(Errno),
}

/// Guard metadata for observability
#[derive(Debug, Clone)]
pub struct GuardMetadata {
    pub resource_type: &'static str,
    pub creation_time: std::time::Instant,
}

impl GuardMetadata {
    #[inline]
    pub fn new(resource_type: &'static str) -> Self {
        Self {
            resource_type,
            creation_time: std::time::Instant::now(),
        }
    }

    #[inline]
    pub fn lifetime_micros(&self) -> u64 {
        self.creation_time.elapsed().as_micros() as u64
    }
}
