/*!
 * Syscall-level release counting against a mocked kernel
 */

use mockall::mock;
use mockall::predicate::eq;
use nested_maps::core::types::{MapInfo, SysResult};
use nested_maps::ebpf::ProgramLoad;
use nested_maps::{BpfPlatform, BpfSyscalls, HandleRegistry, MapAccess, MapId, MapKind, MapSpec, NestedMapError, UpdateFlags};
use nix::errno::Errno;
use std::os::fd::RawFd;
use std::sync::Arc;

mock! {
    pub Kernel {}

    impl BpfSyscalls for Kernel {
        fn platform(&self) -> BpfPlatform;
        fn map_create(&self, spec: &MapSpec, inner_map_fd: Option<RawFd>) -> SysResult<RawFd>;
        fn map_update(&self, fd: RawFd, key: &[u8], value: &[u8], flags: UpdateFlags) -> SysResult<()>;
        fn map_lookup(&self, fd: RawFd, key: &[u8], value: &mut [u8]) -> SysResult<()>;
        fn map_delete(&self, fd: RawFd, key: &[u8]) -> SysResult<()>;
        fn map_get_fd_by_id(&self, id: MapId) -> SysResult<RawFd>;
        fn map_info(&self, fd: RawFd) -> SysResult<MapInfo>;
        fn prog_load(&self, program: &ProgramLoad) -> SysResult<RawFd>;
        fn close(&self, fd: RawFd) -> SysResult<()>;
    }
}

fn inner_spec() -> MapSpec {
    MapSpec::u32_to_u32(MapKind::Hash, 8)
}

#[test]
fn test_explicit_release_closes_once() {
    let mut kernel = MockKernel::new();
    kernel.expect_map_create().times(1).returning(|_, _| Ok(7));
    kernel.expect_close().with(eq(7)).times(1).returning(|_| Ok(()));

    let registry = HandleRegistry::new(Arc::new(kernel));
    let handle = registry.create(&inner_spec()).unwrap();
    registry.release(handle).unwrap();
    assert_eq!(registry.outstanding(), 0);
}

#[test]
fn test_error_path_closes_once_on_drop() {
    let mut kernel = MockKernel::new();
    kernel.expect_map_create().times(1).returning(|_, _| Ok(9));
    kernel
        .expect_map_update()
        .times(1)
        .returning(|_, _, _, _| Err(Errno::E2BIG));
    kernel.expect_close().with(eq(9)).times(1).returning(|_| Ok(()));

    let registry = HandleRegistry::new(Arc::new(kernel));
    let result = (|| -> Result<(), NestedMapError> {
        let handle = registry.create(&inner_spec())?;
        handle
            .update(1u32, 2u32, UpdateFlags::Any)
            .map_err(|errno| NestedMapError::syscall("map_update", errno))?;
        registry.release(handle)
    })();

    assert_eq!(result, Err(NestedMapError::syscall("map_update", Errno::E2BIG)));
    assert_eq!(registry.outstanding(), 0);
}

#[test]
fn test_resolved_handle_closes_its_own_fd() {
    let mut kernel = MockKernel::new();
    kernel
        .expect_map_get_fd_by_id()
        .with(eq(MapId(31)))
        .times(1)
        .returning(|_| Ok(11));
    kernel
        .expect_map_lookup()
        .times(1)
        .returning(|_, _, value: &mut [u8]| {
            value.copy_from_slice(&34u32.to_ne_bytes());
            Ok(())
        });
    kernel.expect_close().with(eq(11)).times(1).returning(|_| Ok(()));

    let registry = HandleRegistry::new(Arc::new(kernel));
    let handle = registry.resolve(MapId(31)).unwrap();
    assert_eq!(handle.lookup::<u32, u32>(12).unwrap(), 34);
    drop(handle);

    let snapshot = registry.ledger().snapshot();
    assert_eq!((snapshot.resolved, snapshot.released), (1, 1));
}

#[test]
fn test_failed_close_is_not_retried() {
    let mut kernel = MockKernel::new();
    kernel.expect_map_create().times(1).returning(|_, _| Ok(5));
    kernel.expect_close().times(1).returning(|_| Err(Errno::EIO));

    let registry = HandleRegistry::new(Arc::new(kernel));
    let handle = registry.create(&inner_spec()).unwrap();
    let err = registry.release(handle).unwrap_err();

    assert_eq!(err, NestedMapError::syscall("close", Errno::EIO));
    assert_eq!(registry.ledger().snapshot().release_failures, 1);
    assert_eq!(registry.outstanding(), 0);
}
