//! Schema discovery for rivven-table-scan
//!
//! The registry resolves table patterns through a read-only
//! [`SchemaProvider`]: table listing with row estimates, column metadata with
//! primary-key ordinals, and foreign keys for referential ordering.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ColumnMetadata, TableMetadata};

/// Schema provider for read-only schema discovery
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// List the base tables of a schema.
    ///
    /// Returned metadata carries the name and, when known, the estimated row
    /// count. Columns may be left empty; use [`SchemaProvider::get_table`]
    /// for the full description.
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableMetadata>>;

    /// Get table metadata including columns
    async fn get_table(&self, schema: Option<&str>, table: &str) -> Result<Option<TableMetadata>>;

    /// Check if a table exists
    async fn table_exists(&self, schema: Option<&str>, table: &str) -> Result<bool> {
        Ok(self.get_table(schema, table).await?.is_some())
    }

    /// Get primary key columns for a table, in key order
    async fn get_primary_key(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnMetadata>> {
        let meta = self.get_table(schema, table).await?;
        Ok(meta
            .map(|t| t.primary_key_columns().into_iter().cloned().collect())
            .unwrap_or_default())
    }

    /// List foreign keys declared on a table
    async fn list_foreign_keys(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ForeignKeyMetadata>>;
}

/// Foreign key metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyMetadata {
    /// Constraint name
    pub name: String,
    /// Source (referencing) schema
    pub source_schema: Option<String>,
    /// Source table
    pub source_table: String,
    /// Source columns
    pub source_columns: Vec<String>,
    /// Target (referenced) schema
    pub target_schema: Option<String>,
    /// Target table
    pub target_table: String,
    /// Target columns
    pub target_columns: Vec<String>,
}

impl ForeignKeyMetadata {
    /// Create a foreign key from `source_table` to `target_table`
    pub fn new(
        name: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_schema: None,
            source_table: source_table.into(),
            source_columns: Vec::new(),
            target_schema: None,
            target_table: target_table.into(),
            target_columns: Vec::new(),
        }
    }

    /// Set both schemas
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        self.source_schema = Some(schema.clone());
        self.target_schema = Some(schema);
        self
    }

    /// Add a column pair
    pub fn with_columns(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_columns.push(source.into());
        self.target_columns.push(target.into());
        self
    }

    /// Qualified name of the referenced table, as `TableMetadata::qualified_name` renders it
    pub fn target_qualified_name(&self) -> String {
        match &self.target_schema {
            Some(s) => format!("{}.{}", s, self.target_table),
            None => self.target_table.clone(),
        }
    }

    /// Whether the key references its own table
    pub fn is_self_reference(&self) -> bool {
        self.source_schema == self.target_schema && self.source_table == self.target_table
    }
}
