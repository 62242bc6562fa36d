/*!
 * Extension Object Tests
 */

use crate::common::{open_object, return_zero, ObjectBuilder};
use nested_maps::ebpf::{AttachType, ExtensionObject, ObjectState, ProgramType, SimOp};
use nested_maps::{NestedMapError, SimulatedKernel};
use nix::errno::Errno;
use std::sync::Arc;

#[test]
fn test_open_infers_program_types() {
    let builder = ObjectBuilder::standard()
        .program("cgroup_skb/ingress", "ingress", return_zero())
        .program("kprobe/do_sys_open", "probe", return_zero());
    let (_kernel, object) = open_object(&builder);

    assert_eq!(object.state(), ObjectState::Opened);
    assert_eq!(object.map_names().collect::<Vec<_>>(), ["outer_map"]);

    let programs: Vec<_> = object
        .programs()
        .map(|p| (p.name.as_str(), p.prog_type, p.expected_attach_type))
        .collect();
    assert_eq!(
        programs,
        [
            ("test_func", Some(ProgramType::SchedCls), None),
            ("ingress", Some(ProgramType::CgroupSkb), Some(AttachType::CgroupInetIngress)),
            ("probe", Some(ProgramType::Kprobe), None),
        ]
    );
}

#[test]
fn test_unknown_section_aborts_open() {
    let builder = ObjectBuilder::standard().program("mystery/handler", "handler", return_zero());
    let (_dir, path) = builder.write();

    let err = ExtensionObject::open(&path, Arc::new(SimulatedKernel::new())).unwrap_err();
    assert_eq!(
        err,
        NestedMapError::ProgramTypeInference {
            section: "mystery/handler".into()
        }
    );
}

#[test]
fn test_open_missing_file() {
    let err = ExtensionObject::open("/nonexistent/test_bpf.o", Arc::new(SimulatedKernel::new())).unwrap_err();
    assert!(matches!(err, NestedMapError::OpenFailed { .. }), "got {err:?}");
}

#[test]
fn test_open_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.o");
    std::fs::write(&path, b"this is not an object file, just some text").unwrap();

    let err = ExtensionObject::open(&path, Arc::new(SimulatedKernel::new())).unwrap_err();
    assert!(matches!(err, NestedMapError::OpenFailed { .. }), "got {err:?}");
}

#[test]
fn test_open_rejects_out_of_range_name_table() {
    let mut bytes = ObjectBuilder::standard().build();
    let shoff = u64::from_ne_bytes(bytes[40..48].try_into().unwrap()) as usize;
    let shstrndx = u16::from_ne_bytes(bytes[62..64].try_into().unwrap()) as usize;
    let header = shoff + shstrndx * 64;
    bytes[header + 24..header + 32].copy_from_slice(&u64::MAX.to_ne_bytes());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test_bpf.o");
    std::fs::write(&path, bytes).unwrap();

    let err = ExtensionObject::open(&path, Arc::new(SimulatedKernel::new())).unwrap_err();
    assert!(matches!(err, NestedMapError::OpenFailed { .. }), "got {err:?}");
}

#[test]
fn test_load_plain_maps_and_unload() {
    let builder = ObjectBuilder::new()
        .map("counters", crate::common::BPF_MAP_TYPE_HASH, 4, 8, 16)
        .program_with_map("xdp", "count", crate::common::load_map_then_return(), "counters");
    let (kernel, mut object) = open_object(&builder);

    object.load().unwrap();
    assert!(object.is_loaded());
    assert_eq!(kernel.loaded_programs(), ["count"]);
    assert_eq!(kernel.open_fds(), 2);

    object.unload().unwrap();
    assert_eq!(object.state(), ObjectState::Unloaded);
    assert_eq!(kernel.open_fds(), 0);

    let err = object.unload().unwrap_err();
    assert!(matches!(err, NestedMapError::UnloadFailed { .. }));
    let err = object.load().unwrap_err();
    assert!(matches!(err, NestedMapError::LoadFailed { .. }));
}

#[test]
fn test_map_of_maps_needs_template_before_load() {
    let (kernel, mut object) = open_object(&ObjectBuilder::standard());
    let err = object.load().unwrap_err();
    assert!(
        matches!(err, NestedMapError::LoadFailed { code, .. } if code == Errno::EINVAL as i32),
        "got {err:?}"
    );
    assert_eq!(object.state(), ObjectState::Opened);
    assert_eq!(kernel.open_fds(), 0);
}

#[test]
fn test_map_creation_failure_rolls_back() {
    let builder = ObjectBuilder::new()
        .map("a", crate::common::BPF_MAP_TYPE_HASH, 4, 4, 8)
        .map("b", crate::common::BPF_MAP_TYPE_HASH, 4, 4, 8)
        .program("xdp", "prog", return_zero());
    let (kernel, mut object) = open_object(&builder);

    kernel.inject_fault_after(SimOp::MapCreate, 1, Errno::ENOMEM);
    let err = object.load().unwrap_err();
    assert!(
        matches!(err, NestedMapError::LoadFailed { code, .. } if code == Errno::ENOMEM as i32),
        "got {err:?}"
    );
    assert_eq!(kernel.open_fds(), 0);
    assert_eq!(kernel.live_maps(), 0);
}

#[test]
fn test_dropping_loaded_object_closes_fds() {
    let builder = ObjectBuilder::new()
        .map("counters", crate::common::BPF_MAP_TYPE_HASH, 4, 4, 8)
        .program("xdp", "prog", return_zero());
    let (kernel, mut object) = open_object(&builder);
    object.load().unwrap();
    assert_eq!(kernel.open_fds(), 2);

    drop(object);
    assert_eq!(kernel.open_fds(), 0);
    assert_eq!(kernel.live_maps(), 0);
}
