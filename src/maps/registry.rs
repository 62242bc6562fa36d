/*!
 * Handle Registry
 * Create, resolve and release owned map handles
 */

use crate::core::errors::NestedMapError;
use crate::core::guard::{GuardError, HandleOrigin, MapHandle};
use crate::core::types::{MapId, MapSpec, NestedResult};
use crate::ebpf::BpfSyscalls;
use crate::monitoring::HandleLedger;
use nix::errno::Errno;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Hands out [`MapHandle`]s and keeps count of them
///
/// Every handle it returns is owned by the caller and released exactly once,
/// through [`release`](Self::release) or on drop.
#[derive(Clone)]
pub struct HandleRegistry {
    kernel: Arc<dyn BpfSyscalls>,
    ledger: Arc<HandleLedger>,
}

impl HandleRegistry {
    pub fn new(kernel: Arc<dyn BpfSyscalls>) -> Self {
        Self {
            kernel,
            ledger: Arc::new(HandleLedger::new()),
        }
    }

    /// Create a fresh map
    #[instrument(skip(self), fields(kind = %spec.kind, max_entries = spec.max_entries))]
    pub fn create(&self, spec: &MapSpec) -> NestedResult<MapHandle> {
        let fd = self
            .kernel
            .map_create(spec, None)
            .map_err(|errno| NestedMapError::CreationFailed { errno })?;
        debug!(fd, "map created");
        Ok(self.adopt(fd, HandleOrigin::Created))
    }

    /// Open an existing map by id
    #[instrument(skip(self))]
    pub fn resolve(&self, id: MapId) -> NestedResult<MapHandle> {
        let fd = self.kernel.map_get_fd_by_id(id).map_err(|errno| match errno {
            Errno::ENOENT => NestedMapError::not_found(format!("map id {id}")),
            errno => NestedMapError::syscall("map_get_fd_by_id", errno),
        })?;
        Ok(self.adopt(fd, HandleOrigin::Resolved))
    }

    /// Release a handle now and report the outcome
    pub fn release(&self, handle: MapHandle) -> NestedResult<()> {
        handle.close().map_err(|e| match e {
            GuardError::Kernel(errno) => NestedMapError::syscall("close", errno),
            GuardError::AlreadyReleased => NestedMapError::syscall("close", Errno::EBADF),
        })
    }

    /// Handles acquired through this registry and not yet released
    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.ledger.outstanding()
    }

    #[inline]
    pub fn ledger(&self) -> &Arc<HandleLedger> {
        &self.ledger
    }

    #[inline]
    pub fn kernel(&self) -> &Arc<dyn BpfSyscalls> {
        &self.kernel
    }

    fn adopt(&self, fd: std::os::fd::RawFd, origin: HandleOrigin) -> MapHandle {
        MapHandle::new(fd, origin, Arc::clone(&self.kernel), Arc::clone(&self.ledger))
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("platform", &self.kernel.platform())
            .field("ledger", &self.ledger.snapshot())
            .finish()
    }
}
