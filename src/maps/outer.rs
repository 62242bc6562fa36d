/*!
 * Outer Table Manager
 * Locate the map-of-maps table in an extension object and bind its inner shape
 */

use crate::core::errors::NestedMapError;
use crate::core::guard::{BorrowedMap, MapAccess, MapHandle};
use crate::core::types::NestedResult;
use crate::ebpf::ExtensionObject;
use tracing::{debug, instrument};

/// Position of a named map inside one extension object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    name: String,
    index: usize,
}

impl TableRef {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Finds the outer table by its configured name
#[derive(Debug, Clone)]
pub struct OuterTableManager {
    table_name: String,
}

impl OuterTableManager {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    #[inline]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Locate the configured outer table
    pub fn locate(&self, object: &ExtensionObject) -> NestedResult<TableRef> {
        Self::find(object, &self.table_name)
    }

    /// Locate any declared map by name
    pub fn find(object: &ExtensionObject, name: &str) -> NestedResult<TableRef> {
        object
            .find_map(name)
            .map(|(index, _)| TableRef {
                name: name.to_string(),
                index,
            })
            .ok_or_else(|| NestedMapError::TableNotFound {
                name: name.to_string(),
            })
    }

    /// Record the template's shape as the table's inner map shape
    ///
    /// Only the shape is kept, so the template can be released as soon as
    /// this returns.
    #[instrument(skip(self, object, template), fields(table = %table.name, template_fd = template.fd()))]
    pub fn bind_inner_template(
        &self,
        object: &mut ExtensionObject,
        table: &TableRef,
        template: &MapHandle,
    ) -> NestedResult<()> {
        let bind_failed = |reason: String| NestedMapError::BindFailed {
            table: table.name.clone(),
            reason,
        };

        let def = object
            .map_def(table.index)
            .filter(|def| def.name == table.name)
            .ok_or_else(|| NestedMapError::TableNotFound {
                name: table.name.clone(),
            })?;
        if !def.spec.kind.is_map_of_maps() {
            return Err(bind_failed(format!("{} is not a map-of-maps", def.spec.kind)));
        }
        if object.is_loaded() {
            return Err(bind_failed("object is already loaded".to_string()));
        }

        let shape = template
            .info()
            .map_err(|errno| bind_failed(format!("cannot query template: {errno}")))?
            .to_spec();
        object
            .set_inner_spec(table.index, shape)
            .map_err(|errno| bind_failed(errno.to_string()))?;

        debug!("inner template bound");
        Ok(())
    }

    /// Borrow the table's runtime handle; only available while loaded
    pub fn fd<'a>(&self, object: &'a ExtensionObject, table: &TableRef) -> NestedResult<BorrowedMap<'a>> {
        let not_found = || NestedMapError::TableNotFound {
            name: table.name.clone(),
        };
        let def = object
            .map_def(table.index)
            .filter(|def| def.name == table.name)
            .ok_or_else(not_found)?;
        let fd = object.map_fd(table.index).ok_or_else(not_found)?;
        Ok(BorrowedMap::new(fd, &def.name, object.kernel().as_ref()))
    }
}
