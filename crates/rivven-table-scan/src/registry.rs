//! Table registry: resolves table patterns into an ordered table list.
//!
//! The visitation order is fixed for the run. It decides which table the
//! coordinator visits next, never the row order inside a table.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::schema::{ForeignKeyMetadata, SchemaProvider};
use crate::table::TableContext;

/// Table visitation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TableOrderStrategy {
    /// Discovery order: config entries in order, tables as the catalog lists them
    #[default]
    None,
    /// By qualified name
    Alphabetical,
    /// Smallest estimated row count first, unknown sizes last
    EstimatedSize,
    /// Referenced tables before the tables referencing them
    ReferentialConstraints,
}

impl TableOrderStrategy {
    /// Order tables in place. `foreign_keys` is only consulted by
    /// [`TableOrderStrategy::ReferentialConstraints`].
    pub fn apply(
        self,
        tables: &mut Vec<TableContext>,
        foreign_keys: &[ForeignKeyMetadata],
    ) -> Result<()> {
        match self {
            Self::None => {}
            Self::Alphabetical => tables.sort_by_key(|t| t.qualified_name()),
            Self::EstimatedSize => tables.sort_by(|a, b| {
                let size = |t: &TableContext| t.estimated_rows().unwrap_or(u64::MAX);
                size(a)
                    .cmp(&size(b))
                    .then_with(|| a.qualified_name().cmp(&b.qualified_name()))
            }),
            Self::ReferentialConstraints => {
                let ordered = referential_order(std::mem::take(tables), foreign_keys)?;
                *tables = ordered;
            }
        }
        Ok(())
    }
}

// Kahn's algorithm; among ready tables the smallest name goes first.
fn referential_order(
    tables: Vec<TableContext>,
    foreign_keys: &[ForeignKeyMetadata],
) -> Result<Vec<TableContext>> {
    let names: Vec<String> = tables.iter().map(|t| t.qualified_name()).collect();
    let known: HashSet<&str> = names.iter().map(String::as_str).collect();

    let mut parents: HashMap<String, HashSet<String>> = HashMap::new();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for fk in foreign_keys.iter().filter(|fk| !fk.is_self_reference()) {
        let child = match &fk.source_schema {
            Some(s) => format!("{}.{}", s, fk.source_table),
            None => fk.source_table.clone(),
        };
        let parent = fk.target_qualified_name();
        if !known.contains(child.as_str()) || !known.contains(parent.as_str()) {
            continue;
        }
        if parents
            .entry(child.clone())
            .or_default()
            .insert(parent.clone())
        {
            children.entry(parent).or_default().push(child);
        }
    }

    let mut ready: BTreeSet<String> = names
        .iter()
        .filter(|n| parents.get(*n).map_or(true, HashSet::is_empty))
        .cloned()
        .collect();
    let mut by_name: HashMap<String, TableContext> =
        names.iter().cloned().zip(tables).collect();
    let mut ordered = Vec::with_capacity(names.len());

    while let Some(name) = ready.pop_first() {
        if let Some(table) = by_name.remove(&name) {
            ordered.push(table);
        }
        for child in children.get(&name).into_iter().flatten() {
            if let Some(pending) = parents.get_mut(child) {
                pending.remove(&name);
                if pending.is_empty() {
                    ready.insert(child.clone());
                }
            }
        }
    }

    if !by_name.is_empty() {
        let mut cyclic: Vec<_> = by_name.into_keys().collect();
        cyclic.sort();
        return Err(Error::config(format!(
            "referential ordering impossible, foreign key cycle among: {}",
            cyclic.join(", ")
        )));
    }

    Ok(ordered)
}

/// Ordered set of tables to scan
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: Vec<TableContext>,
}

impl TableRegistry {
    /// Build a registry from already resolved tables
    pub fn from_tables(
        mut tables: Vec<TableContext>,
        strategy: TableOrderStrategy,
        foreign_keys: &[ForeignKeyMetadata],
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for t in &tables {
            if !seen.insert(t.qualified_name()) {
                return Err(Error::config(format!(
                    "table {} registered twice",
                    t.qualified_name()
                )));
            }
        }
        strategy.apply(&mut tables, foreign_keys)?;
        Ok(Self { tables })
    }

    /// Resolve table patterns against the live schema.
    ///
    /// A table matched by several entries is configured by the first one.
    /// Matching no table at all is a configuration error.
    pub async fn resolve(
        provider: &dyn SchemaProvider,
        configs: &[TableConfig],
        strategy: TableOrderStrategy,
    ) -> Result<Self> {
        let mut tables: Vec<TableContext> = Vec::new();
        let mut seen = HashSet::new();

        for config in configs {
            config.check()?;
            let pattern = config.pattern_regex()?;
            let exclusion = config.exclusion_regex()?;
            let schema = config.schema.as_deref();

            for listed in provider.list_tables(schema).await? {
                if !pattern.is_match(&listed.name) {
                    continue;
                }
                if exclusion.as_ref().is_some_and(|re| re.is_match(&listed.name)) {
                    debug!(table = %listed.qualified_name(), "Table excluded by pattern");
                    continue;
                }
                if !seen.insert(listed.qualified_name()) {
                    debug!(
                        table = %listed.qualified_name(),
                        pattern = %config.table_pattern,
                        "Table already configured by an earlier entry"
                    );
                    continue;
                }

                let table_schema = listed.schema.as_deref().or(schema);
                let Some(mut meta) = provider.get_table(table_schema, &listed.name).await? else {
                    warn!(table = %listed.qualified_name(), "Table disappeared during discovery");
                    continue;
                };
                if meta.estimated_rows.is_none() {
                    meta.estimated_rows = listed.estimated_rows;
                }

                let mut ctx = TableContext::from_metadata(&meta, config.key_override())?
                    .with_initial_offsets(&config.initial_offsets)?;
                if let Some(condition) = &config.extra_condition {
                    ctx = ctx.with_extra_condition(condition.clone())?;
                }
                tables.push(ctx);
            }
        }

        if tables.is_empty() {
            let patterns: Vec<_> = configs.iter().map(|c| c.table_pattern.as_str()).collect();
            return Err(Error::config(format!(
                "no tables match the configured patterns: {}",
                patterns.join(", ")
            )));
        }

        let mut foreign_keys = Vec::new();
        if strategy == TableOrderStrategy::ReferentialConstraints {
            for t in &tables {
                foreign_keys.extend(provider.list_foreign_keys(t.schema(), t.name()).await?);
            }
        }

        let registry = Self::from_tables(tables, strategy, &foreign_keys)?;
        info!(
            tables = registry.len(),
            strategy = ?strategy,
            "Resolved tables: {}",
            registry.names().join(", ")
        );
        Ok(registry)
    }

    /// Tables in visitation order
    pub fn tables(&self) -> &[TableContext] {
        &self.tables
    }

    /// Qualified names in visitation order
    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.qualified_name()).collect()
    }

    /// Position of a table in visitation order
    pub fn position(&self, qualified_name: &str) -> Option<usize> {
        self.tables
            .iter()
            .position(|t| t.qualified_name() == qualified_name)
    }

    /// Look up a table by qualified name
    pub fn get(&self, qualified_name: &str) -> Option<&TableContext> {
        self.position(qualified_name).map(|i| &self.tables[i])
    }

    /// Number of tables
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no table is registered
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Consume into the ordered table list
    pub fn into_tables(self) -> Vec<TableContext> {
        self.tables
    }
}
