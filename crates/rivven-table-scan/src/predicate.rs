//! Lower-bound predicate and ordering for gapless composite-key paging.
//!
//! For a previous key `(v1..vn)` over key columns `(k1..kn)` the predicate is
//! the lexicographic "strictly greater than":
//!
//! ```text
//! (k1 > v1) OR (k1 = v1 AND k2 > v2) OR ... OR (k1 = v1 AND ... AND kn > vn)
//! ```
//!
//! and rows are ordered by `k1, k2, ..., kn` ascending, which is the same
//! total order. Values are always bound as parameters.

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::key::KeyTuple;
use crate::table::TableContext;
use crate::types::Value;

/// WHERE condition, bound parameters and ORDER BY for one scan query
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPredicate {
    /// Condition without the `WHERE` keyword; `None` means no filtering
    pub condition: Option<String>,
    /// Parameters in placeholder order
    pub params: Vec<Value>,
    /// Key columns, ascending
    pub order_by: Vec<String>,
}

/// A complete scan statement
#[derive(Debug, Clone, PartialEq)]
pub struct ScanQuery {
    /// SQL text
    pub sql: String,
    /// Bound parameters
    pub params: Vec<Value>,
}

/// Builds scan predicates for a dialect
pub struct PredicateBuilder<'a> {
    dialect: &'a dyn SqlDialect,
}

impl<'a> PredicateBuilder<'a> {
    /// Create a builder for the given dialect
    pub fn new(dialect: &'a dyn SqlDialect) -> Self {
        Self { dialect }
    }

    /// Build the predicate for rows strictly after `after`.
    ///
    /// Without a previous key the key predicate is dropped; a configured
    /// extra condition still applies.
    pub fn build(&self, table: &TableContext, after: Option<&KeyTuple>) -> Result<ScanPredicate> {
        let keys = table.key_columns();
        let order_by = keys.iter().map(|k| k.name.clone()).collect();
        let mut params = Vec::new();

        let key_condition = match after {
            None => None,
            Some(key) => {
                if key.len() != keys.len() {
                    return Err(Error::config(format!(
                        "offset for table {} has {} values, key has {} columns",
                        table.qualified_name(),
                        key.len(),
                        keys.len()
                    )));
                }

                let numbered = self.dialect.supports_numbered_placeholders();
                if numbered {
                    params.extend(key.values().iter().cloned());
                }

                let mut bind = |idx: usize| -> String {
                    if numbered {
                        self.dialect.placeholder(idx + 1)
                    } else {
                        params.push(key.values()[idx].clone());
                        self.dialect.placeholder(params.len())
                    }
                };

                let mut disjuncts = Vec::with_capacity(keys.len());
                for (i, col) in keys.iter().enumerate() {
                    let mut terms = Vec::with_capacity(i + 1);
                    for (j, prefix) in keys[..i].iter().enumerate() {
                        terms.push(format!(
                            "{} = {}",
                            self.dialect.quote_identifier(&prefix.name),
                            bind(j)
                        ));
                    }
                    terms.push(format!(
                        "{} > {}",
                        self.dialect.quote_identifier(&col.name),
                        bind(i)
                    ));
                    disjuncts.push(format!("({})", terms.join(" AND ")));
                }

                Some(if disjuncts.len() == 1 {
                    disjuncts.remove(0)
                } else {
                    format!("({})", disjuncts.join(" OR "))
                })
            }
        };

        let condition = match (table.extra_condition(), key_condition) {
            (None, None) => None,
            (Some(extra), None) => Some(format!("({})", extra)),
            (None, Some(key)) => Some(key),
            (Some(extra), Some(key)) => Some(format!("({}) AND {}", extra, key)),
        };

        Ok(ScanPredicate {
            condition,
            params,
            order_by,
        })
    }

    /// Build `SELECT * FROM table WHERE <predicate> ORDER BY <keys> LIMIT n`
    pub fn build_query(
        &self,
        table: &TableContext,
        after: Option<&KeyTuple>,
        limit: u64,
    ) -> Result<ScanQuery> {
        let predicate = self.build(table, after)?;
        let order_by: Vec<(&str, bool)> = predicate
            .order_by
            .iter()
            .map(|c| (c.as_str(), true))
            .collect();

        let sql = self.dialect.build_select(
            table.schema(),
            table.name(),
            &[],
            predicate.condition.as_deref(),
            &order_by,
            Some(limit),
        );

        Ok(ScanQuery {
            sql,
            params: predicate.params,
        })
    }
}
