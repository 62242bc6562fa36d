/*!
 * eBPF Traits
 * Platform-agnostic abstraction over the kernel's map and program syscalls
 */

use super::types::{BpfPlatform, ProgramLoad};
use crate::core::types::{MapId, MapInfo, MapSpec, SysResult, UpdateFlags};
use std::os::fd::RawFd;

/// Kernel syscall interface
///
/// Each call is a single blocking syscall: it either completes or fails with
/// the errno the kernel reported. Returned fds are owned by the caller and
/// must be given back through [`close`](BpfSyscalls::close).
pub trait BpfSyscalls: Send + Sync {
    /// Which backend serves these calls
    fn platform(&self) -> BpfPlatform;

    /// `BPF_MAP_CREATE`; `inner_map_fd` is required for map-of-maps kinds
    fn map_create(&self, spec: &MapSpec, inner_map_fd: Option<RawFd>) -> SysResult<RawFd>;

    /// `BPF_MAP_UPDATE_ELEM`; map-of-maps values carry an inner map fd
    fn map_update(&self, fd: RawFd, key: &[u8], value: &[u8], flags: UpdateFlags) -> SysResult<()>;

    /// `BPF_MAP_LOOKUP_ELEM`; map-of-maps values come back as inner map ids
    fn map_lookup(&self, fd: RawFd, key: &[u8], value: &mut [u8]) -> SysResult<()>;

    /// `BPF_MAP_DELETE_ELEM`
    fn map_delete(&self, fd: RawFd, key: &[u8]) -> SysResult<()>;

    /// `BPF_MAP_GET_FD_BY_ID`
    fn map_get_fd_by_id(&self, id: MapId) -> SysResult<RawFd>;

    /// `BPF_OBJ_GET_INFO_BY_FD` for a map
    fn map_info(&self, fd: RawFd) -> SysResult<MapInfo>;

    /// `BPF_PROG_LOAD`
    fn prog_load(&self, program: &ProgramLoad) -> SysResult<RawFd>;

    /// Release an fd obtained from any of the calls above
    fn close(&self, fd: RawFd) -> SysResult<()>;
}
