/*!
 * Error Types
 * Centralized error handling with thiserror and miette diagnostics
 */

use super::types::MapId;
use miette::Diagnostic;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Run stage an error belongs to
///
/// Each stage has its own process exit code so a failed run tells the caller
/// where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Config,
    Limits,
    Open,
    Bind,
    Load,
    Insert,
    Lookup,
    Delete,
    Unload,
}

impl Stage {
    pub const fn exit_code(self) -> u8 {
        match self {
            Stage::Config => 2,
            Stage::Limits => 3,
            Stage::Open => 4,
            Stage::Bind => 5,
            Stage::Load => 6,
            Stage::Insert => 7,
            Stage::Lookup => 8,
            Stage::Delete => 9,
            Stage::Unload => 10,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Limits => "limits",
            Stage::Open => "open",
            Stage::Bind => "bind",
            Stage::Load => "load",
            Stage::Insert => "insert",
            Stage::Lookup => "lookup",
            Stage::Delete => "delete",
            Stage::Unload => "unload",
        };
        f.write_str(name)
    }
}

/// Sub-step of an insert that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertStep {
    /// Resolving the outer table's runtime handle
    ResolveOuter,
    /// Creating the inner table instance
    CreateInner,
    /// Writing into the inner table
    WriteInner,
    /// Registering the inner table under the outer key
    WriteOuter,
    /// Reading back the inner table's id
    QueryId,
}

impl fmt::Display for InsertStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InsertStep::ResolveOuter => "resolve outer map",
            InsertStep::CreateInner => "create inner map",
            InsertStep::WriteInner => "write inner map",
            InsertStep::WriteOuter => "write outer map",
            InsertStep::QueryId => "query inner map id",
        };
        f.write_str(name)
    }
}

/// Errors raised by the nested map protocol and its collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum NestedMapError {
    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(nested_maps::config),
        help("Check the NESTED_MAPS_* environment variables.")
    )]
    Config(String),

    #[error("Failed to raise locked-memory limit: {reason}")]
    #[diagnostic(
        code(nested_maps::resource_limit),
        help("Raising RLIMIT_MEMLOCK to unlimited needs CAP_SYS_RESOURCE or a high enough hard limit.")
    )]
    ResourceLimit { reason: String },

    #[error("Failed to open extension object {path}: {reason}")]
    #[diagnostic(
        code(nested_maps::open_failed),
        help("The object must be a BPF ELF relocatable (EM_BPF).")
    )]
    OpenFailed { path: String, reason: String },

    #[error("Failed to guess program type based on section name: {section}")]
    #[diagnostic(code(nested_maps::program_type_inference))]
    ProgramTypeInference { section: String },

    #[error("Map {name} not found")]
    #[diagnostic(
        code(nested_maps::table_not_found),
        help("The name must match a map declared in the object, and runtime handles exist only after load.")
    )]
    TableNotFound { name: String },

    #[error("Failed to bind inner map template to {table}: {reason}")]
    #[diagnostic(
        code(nested_maps::bind_failed),
        help("Templates bind only to map-of-maps tables, before the object is loaded.")
    )]
    BindFailed { table: String, reason: String },

    #[error("Failed to create map: {errno}")]
    #[diagnostic(
        code(nested_maps::creation_failed),
        help("EPERM or ENOMEM usually mean the locked-memory limit is too low.")
    )]
    CreationFailed { errno: Errno },

    #[error("Failed to load extension object ({code}): {reason}")]
    #[diagnostic(code(nested_maps::load_failed))]
    LoadFailed { code: i32, reason: String },

    #[error("Failed to {step}: {errno}")]
    #[diagnostic(code(nested_maps::insert_failed))]
    InsertFailed { step: InsertStep, errno: Errno },

    #[error("Failed to {step}: {source}")]
    #[diagnostic(code(nested_maps::insert_failed))]
    InsertAborted {
        step: InsertStep,
        #[source]
        source: Box<NestedMapError>,
    },

    #[error("{what} not found")]
    #[diagnostic(code(nested_maps::not_found))]
    NotFound { what: String },

    #[error("Inner map {id} is no longer held by the kernel")]
    #[diagnostic(
        code(nested_maps::stale_reference),
        help("The id was read from the outer map but the inner map has been reclaimed.")
    )]
    StaleReference { id: MapId },

    #[error("Failed to unload extension object: {reason}")]
    #[diagnostic(code(nested_maps::unload_failed))]
    UnloadFailed { reason: String },

    #[error("Cannot {operation} in state {state}")]
    #[diagnostic(
        code(nested_maps::invalid_state),
        help("Operations run strictly in order: bind, load, insert, lookup, delete, unload.")
    )]
    InvalidState { operation: &'static str, state: String },

    #[error("{op} failed: {errno}")]
    #[diagnostic(code(nested_maps::syscall))]
    Syscall { op: &'static str, errno: Errno },
}

impl NestedMapError {
    pub fn not_found(what: impl Into<String>) -> Self {
        NestedMapError::NotFound { what: what.into() }
    }

    pub fn syscall(op: &'static str, errno: Errno) -> Self {
        NestedMapError::Syscall { op, errno }
    }

    /// Stage that owns this error, if only one stage can raise it
    ///
    /// `TableNotFound`, `NotFound`, `InvalidState` and `Syscall` are shared
    /// by several stages and take the stage that was running.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            NestedMapError::Config(_) => Some(Stage::Config),
            NestedMapError::ResourceLimit { .. } => Some(Stage::Limits),
            NestedMapError::OpenFailed { .. } | NestedMapError::ProgramTypeInference { .. } => {
                Some(Stage::Open)
            }
            NestedMapError::BindFailed { .. } | NestedMapError::CreationFailed { .. } => {
                Some(Stage::Bind)
            }
            NestedMapError::LoadFailed { .. } => Some(Stage::Load),
            NestedMapError::InsertFailed { .. } | NestedMapError::InsertAborted { .. } => {
                Some(Stage::Insert)
            }
            NestedMapError::StaleReference { .. } => Some(Stage::Lookup),
            NestedMapError::UnloadFailed { .. } => Some(Stage::Unload),
            NestedMapError::TableNotFound { .. }
            | NestedMapError::NotFound { .. }
            | NestedMapError::InvalidState { .. }
            | NestedMapError::Syscall { .. } => None,
        }
    }
}
