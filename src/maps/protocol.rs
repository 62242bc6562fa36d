/*!
 * Nested Map Protocol
 *
 * Ordered bind / load / insert / lookup / delete / unload over a
 * map-of-maps outer table. The outer table stores inner map ids, so every
 * read resolves an id into a fresh handle and gives it back before returning.
 */

use super::outer::{OuterTableManager, TableRef};
use super::registry::HandleRegistry;
use crate::core::errors::{InsertStep, NestedMapError};
use crate::core::guard::MapAccess;
use crate::core::limits::{INNER_MAP_MAX_ENTRIES, INNER_MAP_NAME, TEMPLATE_MAX_ENTRIES};
use crate::core::types::{fd_value, MapId, MapKind, MapSpec, NestedResult, PlainValue, UpdateFlags};
use crate::ebpf::ExtensionObject;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument, warn};

/// Where the protocol is in its fixed sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Unbound,
    TemplateBound,
    Loaded,
    Populated,
    Cleared,
    Unloaded,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Unbound => "unbound",
            ProtocolState::TemplateBound => "template_bound",
            ProtocolState::Loaded => "loaded",
            ProtocolState::Populated => "populated",
            ProtocolState::Cleared => "cleared",
            ProtocolState::Unloaded => "unloaded",
        };
        f.write_str(name)
    }
}

/// Drives one extension object through the nested table protocol
pub struct NestedMapProtocol {
    object: ExtensionObject,
    registry: HandleRegistry,
    outer: OuterTableManager,
    table: Option<TableRef>,
    state: ProtocolState,
    template_spec: MapSpec,
    inner_spec: MapSpec,
}

impl NestedMapProtocol {
    /// Take ownership of an opened object; handles go through the object's
    /// own kernel backend
    pub fn new(object: ExtensionObject, outer_table: impl Into<String>) -> Self {
        let registry = HandleRegistry::new(object.kernel().clone());
        Self {
            object,
            registry,
            outer: OuterTableManager::new(outer_table),
            table: None,
            state: ProtocolState::Unbound,
            template_spec: MapSpec::u32_to_u32(MapKind::Hash, TEMPLATE_MAX_ENTRIES),
            inner_spec: MapSpec::u32_to_u32(MapKind::Hash, INNER_MAP_MAX_ENTRIES)
                .with_name(INNER_MAP_NAME),
        }
    }

    /// Override the template and per-insert inner map capacities
    pub fn with_capacities(mut self, template_entries: u32, inner_entries: u32) -> Self {
        self.template_spec.max_entries = template_entries;
        self.inner_spec.max_entries = inner_entries;
        self
    }

    #[inline]
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    #[inline]
    pub fn object(&self) -> &ExtensionObject {
        &self.object
    }

    #[inline]
    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    #[inline]
    pub fn table(&self) -> Option<&TableRef> {
        self.table.as_ref()
    }

    fn invalid(&self, operation: &'static str) -> NestedMapError {
        NestedMapError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    /// Bind a throwaway inner template to the outer table
    ///
    /// The template handle is released whether or not the bind succeeds.
    #[instrument(skip(self), fields(table = %self.outer.table_name()))]
    pub fn bind(&mut self) -> NestedResult<()> {
        if self.state != ProtocolState::Unbound {
            return Err(NestedMapError::BindFailed {
                table: self.outer.table_name().to_string(),
                reason: format!("protocol is {}", self.state),
            });
        }

        let table = self.outer.locate(&self.object)?;
        let template = self.registry.create(&self.template_spec)?;
        let bound = self
            .outer
            .bind_inner_template(&mut self.object, &table, &template);

        if let Err(e) = self.registry.release(template) {
            warn!(error = %e, "failed to release inner template");
        }
        bound?;

        self.table = Some(table);
        self.state = ProtocolState::TemplateBound;
        Ok(())
    }

    /// Load the object into the kernel
    pub fn load(&mut self) -> NestedResult<()> {
        if self.state != ProtocolState::TemplateBound {
            return Err(self.invalid("load"));
        }
        self.object.load()?;
        self.state = ProtocolState::Loaded;
        Ok(())
    }

    /// Create a fresh inner map holding `entries` and register it under
    /// `outer_key`, replacing whatever inner map the key pointed at before
    ///
    /// Returns the new inner map's id. The inner handle is released before
    /// returning on every path; the outer table keeps the map alive.
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub fn insert(&mut self, outer_key: u32, entries: &[(u32, u32)]) -> NestedResult<MapId> {
        if !matches!(self.state, ProtocolState::Loaded | ProtocolState::Populated) {
            return Err(self.invalid("insert"));
        }
        let failed = |step: InsertStep| move |errno: Errno| NestedMapError::InsertFailed { step, errno };

        let table = self.table.as_ref().ok_or_else(|| self.invalid("insert"))?;
        let outer = self
            .outer
            .fd(&self.object, table)
            .map_err(|e| NestedMapError::InsertAborted {
                step: InsertStep::ResolveOuter,
                source: Box::new(e),
            })?;

        let inner = self.registry.create(&self.inner_spec).map_err(|e| match e {
            NestedMapError::CreationFailed { errno } => failed(InsertStep::CreateInner)(errno),
            other => other,
        })?;

        for &(key, value) in entries {
            inner
                .update(key, value, UpdateFlags::Any)
                .map_err(failed(InsertStep::WriteInner))?;
        }
        outer
            .update_raw(&outer_key.to_ne_vec(), &fd_value(inner.fd()), UpdateFlags::Any)
            .map_err(failed(InsertStep::WriteOuter))?;
        self.state = ProtocolState::Populated;

        let id = inner.info().map_err(failed(InsertStep::QueryId))?.id;
        self.registry.release(inner)?;

        debug!(outer_key, inner_map_id = %id, "inner map registered");
        Ok(id)
    }

    /// Read `inner_key` from the inner map registered under `outer_key`
    #[instrument(skip(self))]
    pub fn lookup(&self, outer_key: u32, inner_key: u32) -> NestedResult<u32> {
        if !matches!(self.state, ProtocolState::Populated | ProtocolState::Cleared) {
            return Err(self.invalid("lookup"));
        }

        let table = self.table.as_ref().ok_or_else(|| self.invalid("lookup"))?;
        let outer = self.outer.fd(&self.object, table)?;
        let id: MapId = outer.lookup(outer_key).map_err(|errno| match errno {
            Errno::ENOENT => NestedMapError::not_found(format!("outer key {outer_key}")),
            errno => NestedMapError::syscall("map_lookup", errno),
        })?;

        let inner = self.registry.resolve(id).map_err(|e| match e {
            NestedMapError::NotFound { .. } => NestedMapError::StaleReference { id },
            other => other,
        })?;
        let value = inner.lookup::<u32, u32>(inner_key);
        let released = self.registry.release(inner);

        let value = value.map_err(|errno| match errno {
            Errno::ENOENT => NestedMapError::not_found(format!("inner key {inner_key}")),
            errno => NestedMapError::syscall("map_lookup", errno),
        })?;
        released?;

        debug!(inner_map_id = %id, value, "inner value read");
        Ok(value)
    }

    /// Remove `outer_key` from the outer table
    ///
    /// The orphaned inner map is reclaimed by the kernel once nothing else
    /// references it.
    #[instrument(skip(self))]
    pub fn delete(&mut self, outer_key: u32) -> NestedResult<()> {
        if !matches!(self.state, ProtocolState::Populated | ProtocolState::Cleared) {
            return Err(self.invalid("delete"));
        }

        let table = self.table.as_ref().ok_or_else(|| self.invalid("delete"))?;
        let outer = self.outer.fd(&self.object, table)?;
        outer.delete(outer_key).map_err(|errno| match errno {
            Errno::ENOENT => NestedMapError::not_found(format!("outer key {outer_key}")),
            errno => NestedMapError::syscall("map_delete", errno),
        })?;

        self.state = ProtocolState::Cleared;
        Ok(())
    }

    /// Release every kernel object held by the extension object; terminal
    pub fn unload(&mut self) -> NestedResult<()> {
        if self.state != ProtocolState::Cleared {
            return Err(self.invalid("unload"));
        }
        let result = self.object.unload();
        if !self.object.is_loaded() {
            self.state = ProtocolState::Unloaded;
        }
        result
    }
}

impl fmt::Debug for NestedMapProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedMapProtocol")
            .field("object", &self.object.path())
            .field("table", &self.table)
            .field("state", &self.state)
            .finish()
    }
}
