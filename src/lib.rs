/*!
 * Nested Maps Library
 * Map-of-maps handle protocol over the kernel's bpf(2) interface
 */

pub mod config;
pub mod core;
pub mod ebpf;
pub mod lifecycle;
pub mod maps;
pub mod monitoring;

// Re-exports
pub use config::Config;
pub use crate::core::errors::{InsertStep, NestedMapError, Stage};
pub use crate::core::guard::{BorrowedMap, MapAccess, MapHandle};
pub use crate::core::types::{MapId, MapKind, MapSpec, NestedResult, UpdateFlags};
pub use ebpf::{select_backend, BpfPlatform, BpfSyscalls, ExtensionObject, SimulatedKernel};
pub use lifecycle::{Bootstrap, RunFailure, RunReport};
pub use maps::{HandleRegistry, NestedMapProtocol, OuterTableManager, ProtocolState};
pub use monitoring::{init_tracing, HandleLedger};
