//! Immutable description of one scanned table.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::key::{KeyCodec, KeyColumn, KeyTuple};
use crate::security::validate_where_clause;
use crate::types::{ColumnMetadata, TableMetadata};

/// Everything the scanner needs to know about a table for the whole run.
///
/// The key column list is non-empty, its columns are non-nullable with an
/// orderable type, and its order never changes once built. Record column
/// order is key columns first, then the remaining columns in table order.
#[derive(Debug, Clone)]
pub struct TableContext {
    schema: Option<String>,
    name: String,
    key_columns: Vec<KeyColumn>,
    columns: Vec<String>,
    extra_condition: Option<String>,
    initial_offset: Option<KeyTuple>,
    estimated_rows: Option<u64>,
}

impl TableContext {
    /// Build a context from catalog metadata.
    ///
    /// With `key_override` the given columns form the offset key instead of
    /// the primary key.
    pub fn from_metadata(meta: &TableMetadata, key_override: Option<&[String]>) -> Result<Self> {
        let qualified = meta.qualified_name();

        let key_metas = match key_override {
            Some(names) => {
                let mut cols: Vec<&ColumnMetadata> = Vec::with_capacity(names.len());
                for name in names {
                    let col = meta.column(name).ok_or_else(|| Error::ColumnNotFound {
                        table: qualified.clone(),
                        column: name.clone(),
                    })?;
                    if cols.iter().any(|c| c.name == col.name) {
                        return Err(Error::config(format!(
                            "key column '{}' listed twice for table {}",
                            col.name, qualified
                        )));
                    }
                    cols.push(col);
                }
                cols
            }
            None => meta.primary_key_columns(),
        };

        if key_metas.is_empty() {
            return Err(Error::config(format!(
                "table {} has no primary key; configure key columns to scan it",
                qualified
            )));
        }

        let mut key_columns = Vec::with_capacity(key_metas.len());
        for col in &key_metas {
            if col.nullable {
                return Err(Error::config(format!(
                    "key column '{}' of table {} is nullable; offset keys must be non-null",
                    col.name, qualified
                )));
            }
            key_columns.push(KeyColumn::new(&col.name, &col.type_name)?);
        }

        let mut columns: Vec<String> = key_columns.iter().map(|k| k.name.clone()).collect();
        for col in &meta.columns {
            if !key_columns.iter().any(|k| k.name == col.name) {
                columns.push(col.name.clone());
            }
        }

        Ok(Self {
            schema: meta.schema.clone(),
            name: meta.name.clone(),
            key_columns,
            columns,
            extra_condition: None,
            initial_offset: None,
            estimated_rows: meta.estimated_rows,
        })
    }

    /// AND a trusted condition into every scan query of this table
    pub fn with_extra_condition(mut self, condition: impl Into<String>) -> Result<Self> {
        let condition = condition.into();
        validate_where_clause(&condition)?;
        self.extra_condition = Some(condition);
        Ok(self)
    }

    /// Start the scan strictly after the given key, one literal per key column
    pub fn with_initial_offsets(mut self, literals: &HashMap<String, String>) -> Result<Self> {
        if literals.is_empty() {
            return Ok(self);
        }

        let mut values = Vec::with_capacity(self.key_columns.len());
        for col in &self.key_columns {
            let literal = literals
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&col.name))
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    Error::config(format!(
                        "initial offsets for table {} do not name key column '{}'",
                        self.qualified_name(),
                        col.name
                    ))
                })?;
            values.push(col.parse_literal(literal)?);
        }

        if let Some(extra) = literals
            .keys()
            .find(|name| !self.key_columns.iter().any(|c| c.name.eq_ignore_ascii_case(name)))
        {
            return Err(Error::config(format!(
                "initial offset column '{}' is not a key column of table {}",
                extra,
                self.qualified_name()
            )));
        }

        self.initial_offset = Some(KeyTuple::new(values));
        Ok(self)
    }

    /// Schema name
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `schema.table` identity used in offsets and logs
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(s) => format!("{}.{}", s, self.name),
            None => self.name.clone(),
        }
    }

    /// Offset key columns in key order
    pub fn key_columns(&self) -> &[KeyColumn] {
        &self.key_columns
    }

    /// Record column order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Columns that are not part of the key
    pub fn non_key_columns(&self) -> &[String] {
        &self.columns[self.key_columns.len()..]
    }

    /// Extra condition, if configured
    pub fn extra_condition(&self) -> Option<&str> {
        self.extra_condition.as_deref()
    }

    /// Configured starting key, if any
    pub fn initial_offset(&self) -> Option<&KeyTuple> {
        self.initial_offset.as_ref()
    }

    /// Estimated row count from the catalog
    pub fn estimated_rows(&self) -> Option<u64> {
        self.estimated_rows
    }

    /// Key codec bound to this table's key columns
    pub fn codec(&self) -> KeyCodec<'_> {
        KeyCodec::new(&self.key_columns)
    }
}
