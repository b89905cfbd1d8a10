//! Records emitted by the scan engine.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::table::TableContext;
use crate::types::{Row, Value};

/// One scanned row as an ordered field map.
///
/// Field order is the table's record column order: key columns first, then
/// the remaining columns. Columns present in the row but unknown to the
/// table context (added after discovery) follow in result order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    table: String,
    fields: Vec<(String, Value)>,
}

impl Record {
    /// Create a record from already ordered fields
    pub fn new(table: impl Into<String>, fields: Vec<(String, Value)>) -> Self {
        Self {
            table: table.into(),
            fields,
        }
    }

    /// Materialize a result row in the table's column order
    pub fn from_row(table: &TableContext, row: &Row) -> Result<Self> {
        let mut fields = Vec::with_capacity(row.len());
        for name in table.columns() {
            let value = row.get_by_name(name).ok_or_else(|| Error::ColumnNotFound {
                table: table.qualified_name(),
                column: name.clone(),
            })?;
            fields.push((name.clone(), value.clone()));
        }

        for (name, value) in row.columns().iter().zip(row.values()) {
            if !table.columns().iter().any(|c| c.eq_ignore_ascii_case(name)) {
                fields.push((name.clone(), value.clone()));
            }
        }

        Ok(Self {
            table: table.qualified_name(),
            fields,
        })
    }

    /// Qualified name of the source table
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Fields in output order
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    /// Field names in output order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Get a field value by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Number of fields
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Take ownership of the fields
    pub fn into_fields(self) -> Vec<(String, Value)> {
        self.fields
    }
}
