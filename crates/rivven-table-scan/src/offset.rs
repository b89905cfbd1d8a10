//! Combined offset token for all scanned tables.
//!
//! ```json
//! {"v":1,"next":"public.orders","tables":{
//!   "public.orders":{"key":[["id_1",{"Int32":1}],["id_2",{"Int32":4}]],"exhausted":false}}}
//! ```
//!
//! `next` is the table the coordinator visits first on the following call,
//! so a token alone is enough to resume. Tables are kept in a sorted map,
//! which makes equal states encode to equal strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::key::{EncodedKey, KeyTuple};
use crate::table::TableContext;

/// Current token format version
pub const TOKEN_VERSION: u32 = 1;

/// Stored position of one table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableOffset {
    /// Last delivered key, `null` before the first row
    pub key: Option<EncodedKey>,
    /// Finished in finite-table mode
    #[serde(default)]
    pub exhausted: bool,
}

/// Decoded combined offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetToken {
    /// Format version
    pub v: u32,
    /// Table to visit first on the next call
    pub next: Option<String>,
    /// Per-table positions by qualified name
    pub tables: BTreeMap<String, TableOffset>,
}

impl Default for OffsetToken {
    fn default() -> Self {
        Self {
            v: TOKEN_VERSION,
            next: None,
            tables: BTreeMap::new(),
        }
    }
}

impl OffsetToken {
    /// Parse a token; the empty string is the start of the run.
    ///
    /// Anything else that is not a well-formed token of the current version
    /// is a format error, never a silent restart.
    pub fn parse(token: &str) -> Result<Self> {
        if token.is_empty() {
            return Ok(Self::default());
        }

        let parsed: Self = serde_json::from_str(token).map_err(|e| Error::format(e.to_string()))?;
        if parsed.v != TOKEN_VERSION {
            return Err(Error::format(format!(
                "unsupported token version {} (expected {})",
                parsed.v, TOKEN_VERSION
            )));
        }
        Ok(parsed)
    }

    /// Serialize the token
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::internal(format!("failed to encode offset token: {}", e)))
    }

    /// Whether the token carries no state
    pub fn is_start(&self) -> bool {
        self.next.is_none() && self.tables.is_empty()
    }

    /// Stored position of a table
    pub fn table(&self, qualified_name: &str) -> Option<&TableOffset> {
        self.tables.get(qualified_name)
    }

    /// Decode the stored key of a table against its current key columns
    pub fn key_for(&self, table: &TableContext) -> Result<Option<KeyTuple>> {
        match self.tables.get(&table.qualified_name()) {
            Some(TableOffset { key: Some(entries), .. }) => {
                table.codec().from_entries(entries.clone()).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Whether a table is marked exhausted
    pub fn is_exhausted(&self, qualified_name: &str) -> bool {
        self.tables
            .get(qualified_name)
            .is_some_and(|t| t.exhausted)
    }

    /// Store the position of a table
    pub fn set_table(
        &mut self,
        table: &TableContext,
        key: Option<&KeyTuple>,
        exhausted: bool,
    ) -> Result<()> {
        let key = key.map(|k| table.codec().to_entries(k)).transpose()?;
        self.tables
            .insert(table.qualified_name(), TableOffset { key, exhausted });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnMetadata, TableMetadata, Value};

    fn table() -> TableContext {
        let meta = TableMetadata::new("t")
            .with_schema("s")
            .with_column(ColumnMetadata::new("a", "integer").primary_key(1))
            .with_column(ColumnMetadata::new("b", "text").primary_key(2));
        TableContext::from_metadata(&meta, None).unwrap()
    }

    #[test]
    fn test_empty_token_is_start() {
        let token = OffsetToken::parse("").unwrap();
        assert!(token.is_start());
        assert_eq!(token.v, TOKEN_VERSION);
    }

    #[test]
    fn test_encode_format() {
        let t = table();
        let mut token = OffsetToken::default();
        token
            .set_table(
                &t,
                Some(&KeyTuple::new(vec![Value::Int32(3), Value::from("x")])),
                false,
            )
            .unwrap();
        token.next = Some("s.t".into());

        assert_eq!(
            token.encode().unwrap(),
            r#"{"v":1,"next":"s.t","tables":{"s.t":{"key":[["a",{"Int32":3}],["b",{"String":"x"}]],"exhausted":false}}}"#
        );
    }

    #[test]
    fn test_key_for() {
        let t = table();
        let key = KeyTuple::new(vec![Value::Int32(3), Value::from("x")]);
        let mut token = OffsetToken::default();
        assert_eq!(token.key_for(&t).unwrap(), None);

        token.set_table(&t, Some(&key), true).unwrap();
        let decoded = OffsetToken::parse(&token.encode().unwrap()).unwrap();
        assert_eq!(decoded.key_for(&t).unwrap(), Some(key));
        assert!(decoded.is_exhausted("s.t"));
        assert!(!decoded.is_exhausted("s.other"));
    }

    #[test]
    fn test_malformed_tokens() {
        for bad in ["{", "null", "[]", "{}", "{\"v\":1}", "not json", " "] {
            assert!(
                matches!(OffsetToken::parse(bad), Err(Error::Format { .. })),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_version_mismatch() {
        let err = OffsetToken::parse(r#"{"v":2,"next":null,"tables":{}}"#).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_mismatched_key_is_configuration_error() {
        let token = OffsetToken::parse(
            r#"{"v":1,"next":null,"tables":{"s.t":{"key":[["a",{"Int32":3}]],"exhausted":false}}}"#,
        )
        .unwrap();
        assert!(matches!(
            token.key_for(&table()),
            Err(Error::Configuration { .. })
        ));
    }
}
