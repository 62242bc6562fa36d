/*!
 * Map Handle Guards
 *
 * RAII guards for map file descriptors with automatic release
 */

use super::traits::{Guard, Lifecycle};
use super::{GuardError, GuardMetadata, GuardResult};
use crate::core::types::{MapInfo, PlainValue, SysResult, UpdateFlags};
use crate::ebpf::BpfSyscalls;
use crate::monitoring::HandleLedger;
use nix::errno::Errno;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, error};

/// How a handle was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOrigin {
    /// Fresh map created by this process
    Created,
    /// Existing map opened from its id
    Resolved,
}

/// Element operations on anything backed by a map fd
pub trait MapAccess {
    fn raw_fd(&self) -> RawFd;

    fn kernel(&self) -> &dyn BpfSyscalls;

    fn update_raw(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> SysResult<()> {
        self.kernel().map_update(self.raw_fd(), key, value, flags)
    }

    fn lookup_raw(&self, key: &[u8], value_size: usize) -> SysResult<Vec<u8>> {
        let mut value = vec![0u8; value_size];
        self.kernel().map_lookup(self.raw_fd(), key, &mut value)?;
        Ok(value)
    }

    fn delete_raw(&self, key: &[u8]) -> SysResult<()> {
        self.kernel().map_delete(self.raw_fd(), key)
    }

    fn update<K: PlainValue, V: PlainValue>(&self, key: K, value: V, flags: UpdateFlags) -> SysResult<()>
    where
        Self: Sized,
    {
        self.update_raw(&key.to_ne_vec(), &value.to_ne_vec(), flags)
    }

    fn lookup<K: PlainValue, V: PlainValue>(&self, key: K) -> SysResult<V>
    where
        Self: Sized,
    {
        let bytes = self.lookup_raw(&key.to_ne_vec(), V::SIZE)?;
        V::from_ne_slice(&bytes).ok_or(Errno::EINVAL)
    }

    fn delete<K: PlainValue>(&self, key: K) -> SysResult<()>
    where
        Self: Sized,
    {
        self.delete_raw(&key.to_ne_vec())
    }

    fn info(&self) -> SysResult<MapInfo> {
        self.kernel().map_info(self.raw_fd())
    }
}

/// Owned map handle with automatic close
///
/// Non-`Clone`: exactly one owner releases it, either through
/// [`HandleRegistry::release`](crate::maps::HandleRegistry::release) or on drop.
pub struct MapHandle {
    fd: RawFd,
    origin: HandleOrigin,
    kernel: Arc<dyn BpfSyscalls>,
    ledger: Arc<HandleLedger>,
    metadata: GuardMetadata,
    active: bool,
}

impl MapHandle {
    /// Take ownership of a freshly obtained fd
    pub(crate) fn new(
        fd: RawFd,
        origin: HandleOrigin,
        kernel: Arc<dyn BpfSyscalls>,
        ledger: Arc<HandleLedger>,
    ) -> Self {
        match origin {
            HandleOrigin::Created => ledger.record_created(),
            HandleOrigin::Resolved => ledger.record_resolved(),
        }

        let guard = Self {
            fd,
            origin,
            kernel,
            ledger,
            metadata: GuardMetadata::new("bpf_map"),
            active: true,
        };

        guard.on_acquire();
        guard
    }

    /// Get the file descriptor
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn origin(&self) -> HandleOrigin {
        self.origin
    }

    /// Release now and report the kernel's answer
    pub fn close(mut self) -> GuardResult<()> {
        self.release()
    }
}

impl MapAccess for MapHandle {
    #[inline]
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    fn kernel(&self) -> &dyn BpfSyscalls {
        self.kernel.as_ref()
    }
}

impl Guard for MapHandle {
    fn resource_type(&self) -> &'static str {
        "bpf_map"
    }

    fn metadata(&self) -> &GuardMetadata {
        &self.metadata
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn release(&mut self) -> GuardResult<()> {
        if !self.active {
            return Err(GuardError::AlreadyReleased);
        }

        self.active = false;
        let result = self.kernel.close(self.fd);
        self.ledger.record_released(result.is_ok());
        result.map_err(GuardError::Kernel)?;

        self.on_release();
        Ok(())
    }
}

impl Lifecycle for MapHandle {
    fn on_acquire(&self) {
        debug!(fd = self.fd, origin = ?self.origin, "map handle acquired");
    }

    fn on_release(&self) {
        debug!(
            fd = self.fd,
            lifetime_micros = self.metadata.lifetime_micros(),
            "map handle released"
        );
    }

    fn on_release_error(&self, error: &GuardError) {
        error!(fd = self.fd, error = %error, "map handle release on drop failed");
    }
}

impl Drop for MapHandle {
    fn drop(&mut self) {
        self.release_on_drop();
    }
}

impl fmt::Debug for MapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapHandle")
            .field("fd", &self.fd)
            .field("origin", &self.origin)
            .field("active", &self.active)
            .finish()
    }
}

/// Non-owning view of a map fd held by a loaded extension object
///
/// Never closed through this view; the object closes it on unload.
#[derive(Clone, Copy)]
pub struct BorrowedMap<'a> {
    fd: RawFd,
    name: &'a str,
    kernel: &'a dyn BpfSyscalls,
}

impl<'a> BorrowedMap<'a> {
    pub(crate) fn new(fd: RawFd, name: &'a str, kernel: &'a dyn BpfSyscalls) -> Self {
        Self { fd, name, kernel }
    }

    #[inline]
    pub fn name(&self) -> &'a str {
        self.name
    }
}

impl MapAccess for BorrowedMap<'_> {
    #[inline]
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    fn kernel(&self) -> &dyn BpfSyscalls {
        self.kernel
    }
}

impl fmt::Debug for BorrowedMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedMap")
            .field("fd", &self.fd)
            .field("name", &self.name)
            .finish()
    }
}
