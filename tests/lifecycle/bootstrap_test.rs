/*!
 * End-to-end runs of the staged bootstrap on the simulated kernel
 */

use crate::common::ObjectBuilder;
use nested_maps::ebpf::SimOp;
use nested_maps::{Bootstrap, BpfPlatform, Config, NestedMapError, SimulatedKernel, Stage};
use nix::errno::Errno;
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;

fn config(path: &Path) -> Config {
    Config::default()
        .with_object_path(path)
        .with_backend(BpfPlatform::Simulation)
}

#[test]
fn test_full_run_leaks_nothing() {
    let (_dir, path) = ObjectBuilder::standard().write();
    let kernel = Arc::new(SimulatedKernel::new());

    let report = Bootstrap::with_kernel(config(&path), kernel.clone()).run().unwrap();

    assert_eq!(report.value, 34);
    assert_eq!(report.backend, BpfPlatform::Simulation);
    assert_eq!(
        report.stages.iter().map(|s| s.stage).collect::<Vec<_>>(),
        [
            Stage::Config,
            Stage::Limits,
            Stage::Open,
            Stage::Bind,
            Stage::Load,
            Stage::Insert,
            Stage::Lookup,
            Stage::Delete,
            Stage::Unload,
        ]
    );
    assert_eq!(report.handles.outstanding(), 0);
    assert_eq!(report.handles.created, 2);
    assert_eq!(report.handles.resolved, 1);

    assert_eq!(kernel.open_fds(), 0);
    assert_eq!(kernel.live_maps(), 0);
    assert!(kernel.loaded_programs().is_empty());
    assert!(!kernel.map_exists(report.inner_map_id));
}

#[test]
fn test_backend_selected_from_config() {
    let (_dir, path) = ObjectBuilder::standard().write();
    let report = Bootstrap::new(config(&path)).run().unwrap();
    assert_eq!(report.value, 34);
    assert_eq!(report.outer_map, "outer_map");
}

#[test]
fn test_report_serializes() {
    let (_dir, path) = ObjectBuilder::standard().write();
    let report = Bootstrap::new(config(&path)).run().unwrap();

    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["value"], 34);
    assert_eq!(json["backend"], "simulation");
    assert_eq!(json["stages"][0]["stage"], "config");
    assert_eq!(json["inner_map_id"], report.inner_map_id.as_u32());
}

#[test]
fn test_custom_workload() {
    let (_dir, path) = ObjectBuilder::standard().write();
    let config = Config {
        outer_key: 1,
        inner_key: 2,
        inner_value: 3,
        ..config(&path)
    };
    let report = Bootstrap::new(config).run().unwrap();
    assert_eq!(report.value, 3);
}

/// Run with a fault armed and return the failing stage and error
fn failing_run(
    builder: ObjectBuilder,
    outer_map: &str,
    fault: Option<(SimOp, usize, Errno)>,
) -> (Stage, NestedMapError, Arc<SimulatedKernel>) {
    let (_dir, path) = builder.write();
    let kernel = Arc::new(SimulatedKernel::new());
    if let Some((op, skip, errno)) = fault {
        kernel.inject_fault_after(op, skip, errno);
    }
    let config = Config {
        outer_map: outer_map.to_string(),
        ..config(&path)
    };

    let failure = Bootstrap::with_kernel(config, kernel.clone()).run().unwrap_err();
    assert_eq!(failure.exit_code(), failure.stage.exit_code());
    (failure.stage, failure.source, kernel)
}

#[test]
fn test_missing_outer_table_fails_bind() {
    let (stage, error, kernel) = failing_run(ObjectBuilder::standard(), "no_such_map", None);
    assert_eq!(stage, Stage::Bind);
    assert_eq!(error, NestedMapError::TableNotFound { name: "no_such_map".into() });
    assert_eq!(kernel.open_fds(), 0);
}

#[test]
fn test_each_stage_reports_its_own_failure() {
    // Closes before unload: bind template, load transient template, insert
    // handle, lookup handle
    let cases = [
        (SimOp::MapCreate, 0, Stage::Bind),
        (SimOp::ProgLoad, 0, Stage::Load),
        (SimOp::MapUpdate, 0, Stage::Insert),
        (SimOp::MapGetFdById, 0, Stage::Lookup),
        (SimOp::MapDelete, 0, Stage::Delete),
        (SimOp::Close, 4, Stage::Unload),
    ];

    for (op, skip, expected) in cases {
        let (stage, error, kernel) =
            failing_run(ObjectBuilder::standard(), "outer_map", Some((op, skip, Errno::EIO)));
        assert_eq!(stage, expected, "fault in {op:?} gave {error:?}");
        assert_eq!(kernel.open_fds(), 0, "fds leaked after {expected} failure");
    }
}

#[test]
fn test_exit_codes_are_distinct() {
    let stages = [
        Stage::Config,
        Stage::Limits,
        Stage::Open,
        Stage::Bind,
        Stage::Load,
        Stage::Insert,
        Stage::Lookup,
        Stage::Delete,
        Stage::Unload,
    ];
    let mut codes: Vec<u8> = stages.iter().map(|s| s.exit_code()).collect();
    assert!(codes.iter().all(|&c| c != 0));
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), stages.len());
}

#[test]
fn test_unreadable_object_fails_open() {
    let kernel = Arc::new(SimulatedKernel::new());
    let failure = Bootstrap::with_kernel(config(Path::new("/nonexistent/test_bpf.o")), kernel)
        .run()
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Open);
    assert_eq!(failure.exit_code(), 4);
}
