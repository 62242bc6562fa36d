/*!
 * Handle Ledger
 * Counts map handles acquired and released through the registry
 */

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free handle accounting
///
/// Every handle obtained by creation or id resolution is recorded once, and
/// every release once, so `outstanding()` is zero whenever all handles have
/// been given back.
#[derive(Debug, Default)]
pub struct HandleLedger {
    created: AtomicU64,
    resolved: AtomicU64,
    released: AtomicU64,
    release_failures: AtomicU64,
}

/// Point-in-time copy of the ledger counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub created: u64,
    pub resolved: u64,
    pub released: u64,
    pub release_failures: u64,
}

impl LedgerSnapshot {
    #[inline]
    pub fn acquired(&self) -> u64 {
        self.created + self.resolved
    }

    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released)
    }
}

impl HandleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a release; a failed close still gives the handle back
    #[inline]
    pub fn record_released(&self, ok: bool) {
        self.released.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.release_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            created: self.created.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.snapshot().outstanding()
    }
}
