//! Key codec: typed composite keys and their persisted form.
//!
//! A table's offset is the key of the last delivered row, kept as a
//! [`KeyTuple`] of typed values. Persisting it keeps each value's variant
//! (`{"Int32":5}`), so a decoded tuple compares and binds exactly like the
//! one that was encoded.
//!
//! Decoding distinguishes two failures:
//! - the token is not a key at all (bad JSON) -> [`Error::Format`]
//! - the key does not fit the table's current key columns -> [`Error::Configuration`]

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Comparable type tag of a key column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Integral types
    Integer,
    /// Exact numerics
    Decimal,
    /// Character types
    String,
    /// Date, time and timestamp types
    Temporal,
}

impl KeyType {
    /// Map a SQL type name to a key type, `None` when the type has no usable
    /// total order (floats, booleans, binary, JSON, ...).
    pub fn from_sql_type(type_name: &str) -> Option<Self> {
        let lower = type_name.trim().to_ascii_lowercase();
        let base = lower.split('(').next().unwrap_or_default().trim();
        match base {
            "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" | "tinyint"
            | "mediumint" | "smallserial" | "serial" | "serial2" | "serial4" | "bigserial"
            | "serial8" | "int unsigned" | "bigint unsigned" | "integer unsigned" => {
                Some(Self::Integer)
            }
            "numeric" | "decimal" | "number" | "money" => Some(Self::Decimal),
            "char" | "character" | "varchar" | "character varying" | "text" | "bpchar"
            | "nchar" | "nvarchar" | "string" | "name" | "citext" => Some(Self::String),
            "date" | "time" | "time without time zone" | "timestamp"
            | "timestamp without time zone" | "timestamptz" | "timestamp with time zone"
            | "datetime" | "datetime2" | "smalldatetime" => Some(Self::Temporal),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Decimal => write!(f, "decimal"),
            Self::String => write!(f, "string"),
            Self::Temporal => write!(f, "temporal"),
        }
    }
}

/// One column of a table's offset key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    /// Column name
    pub name: String,
    /// SQL type name as reported by the catalog
    pub type_name: String,
    /// Comparable type tag
    pub key_type: KeyType,
}

impl KeyColumn {
    /// Create a key column from its catalog type. Fails for unorderable types.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let type_name = type_name.into();
        let key_type = KeyType::from_sql_type(&type_name).ok_or_else(|| {
            Error::config(format!(
                "column '{}' of type '{}' has no total order and cannot be an offset key",
                name, type_name
            ))
        })?;
        Ok(Self {
            name,
            type_name,
            key_type,
        })
    }

    /// Value variant the column's values decode to
    fn native(&self) -> Native {
        let type_name = self.type_name.trim().to_ascii_lowercase();
        let base = type_name.split('(').next().unwrap_or_default().trim();
        match self.key_type {
            KeyType::Integer => match base {
                "tinyint" => Native::Int8,
                "smallint" | "int2" | "smallserial" | "serial2" => Native::Int16,
                "bigint" | "int8" | "bigserial" | "serial8" | "int unsigned"
                | "integer unsigned" | "bigint unsigned" => Native::Int64,
                _ => Native::Int32,
            },
            KeyType::Decimal => Native::Decimal,
            KeyType::String => Native::String,
            KeyType::Temporal => {
                if base == "date" {
                    Native::Date
                } else if base.starts_with("time") && !base.starts_with("timestamp") {
                    Native::Time
                } else if base == "timestamptz" || type_name.contains("with time zone") {
                    Native::DateTimeTz
                } else {
                    Native::DateTime
                }
            }
        }
    }

    /// Whether a value has exactly the variant this column decodes to.
    ///
    /// An `Int64` does not fit an `integer` column: it would not bind as a
    /// parameter for it.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self.native(), value),
            (Native::Int8, Value::Int8(_))
                | (Native::Int16, Value::Int16(_))
                | (Native::Int32, Value::Int32(_))
                | (Native::Int64, Value::Int64(_))
                | (Native::Decimal, Value::Decimal(_))
                | (Native::String, Value::String(_))
                | (Native::Date, Value::Date(_))
                | (Native::Time, Value::Time(_))
                | (Native::DateTime, Value::DateTime(_))
                | (Native::DateTimeTz, Value::DateTimeTz(_))
        )
    }

    /// Parse a configured initial-offset literal into a value of this
    /// column's native width.
    pub fn parse_literal(&self, literal: &str) -> Result<Value> {
        let s = literal.trim();
        let bad = |e: &dyn fmt::Display| {
            Error::config(format!(
                "initial offset '{}' for column '{}' is not a valid {}: {}",
                literal, self.name, self.type_name, e
            ))
        };

        match self.native() {
            Native::Int8 => s.parse::<i8>().map(Value::Int8).map_err(|e| bad(&e)),
            Native::Int16 => s.parse::<i16>().map(Value::Int16).map_err(|e| bad(&e)),
            Native::Int32 => s.parse::<i32>().map(Value::Int32).map_err(|e| bad(&e)),
            Native::Int64 => s.parse::<i64>().map(Value::Int64).map_err(|e| bad(&e)),
            Native::Decimal => Decimal::from_str(s).map(Value::Decimal).map_err(|e| bad(&e)),
            Native::String => Ok(Value::String(literal.to_string())),
            Native::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| bad(&e)),
            Native::Time => NaiveTime::from_str(s).map(Value::Time).map_err(|e| bad(&e)),
            Native::DateTimeTz => DateTime::parse_from_rfc3339(s)
                .map(|dt| Value::DateTimeTz(dt.with_timezone(&Utc)))
                .map_err(|e| bad(&e)),
            Native::DateTime => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .map(Value::DateTime)
                .map_err(|e| bad(&e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Native {
    Int8,
    Int16,
    Int32,
    Int64,
    Decimal,
    String,
    Date,
    Time,
    DateTime,
    DateTimeTz,
}

/// Compare two key values by their native ordering.
///
/// Integers of any width compare numerically, integers against decimals
/// compare as decimals, strings compare by code point. Returns `None` for
/// pairs without a common order.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Decimal(x), Value::Decimal(y)) => Some(x.cmp(y)),
        (Value::Decimal(x), other) => integer(other).map(|y| x.cmp(&Decimal::from(y))),
        (other, Value::Decimal(y)) => integer(other).map(|x| Decimal::from(x).cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::DateTimeTz(x), Value::DateTimeTz(y)) => Some(x.cmp(y)),
        (x, y) => match (integer(x), integer(y)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        },
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => value.as_i64(),
        _ => None,
    }
}

/// Ordered key values of one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyTuple(Vec<Value>);

impl KeyTuple {
    /// Create a tuple from values in key-column order
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Extract the key of a result row.
    ///
    /// Fails when a key column is missing, NULL, or holds a value its key type
    /// does not accept.
    pub fn from_row(row: &Row, columns: &[KeyColumn]) -> Result<Self> {
        let mut values = Vec::with_capacity(columns.len());
        for col in columns {
            let value = row.get_by_name(&col.name).ok_or_else(|| {
                Error::schema(format!("key column '{}' missing from result row", col.name))
            })?;
            if value.is_null() {
                return Err(Error::config(format!(
                    "key column '{}' returned NULL; offset keys must be non-null",
                    col.name
                )));
            }
            if !col.accepts(value) {
                return Err(Error::type_conversion(format!(
                    "key column '{}' returned {} for a {} key",
                    col.name,
                    value.sql_type(),
                    col.type_name
                )));
            }
            values.push(value.clone());
        }
        Ok(Self(values))
    }

    /// Number of key values
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the tuple is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key values in column order
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Value at a key position
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    /// Lexicographic comparison, position by position.
    ///
    /// `None` when some position has no common order. String positions use
    /// code point order, which may differ from the database collation.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match compare_values(a, b)? {
                Ordering::Equal => continue,
                ord => return Some(ord),
            }
        }
        Some(self.0.len().cmp(&other.0.len()))
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match v.as_string() {
                Some(s) => write!(f, "{}", s)?,
                None => write!(f, "{:?}", v)?,
            }
        }
        write!(f, ")")
    }
}

/// Persisted key: `[[column, value], ...]` in key order
pub type EncodedKey = Vec<(String, Value)>;

/// Encodes and decodes one table's key against its key columns
#[derive(Debug, Clone, Copy)]
pub struct KeyCodec<'a> {
    columns: &'a [KeyColumn],
}

impl<'a> KeyCodec<'a> {
    /// Create a codec for the given key columns
    pub fn new(columns: &'a [KeyColumn]) -> Self {
        Self { columns }
    }

    /// Pair each key value with its column name
    pub fn to_entries(&self, key: &KeyTuple) -> Result<EncodedKey> {
        if key.len() != self.columns.len() {
            return Err(Error::internal(format!(
                "key has {} values for {} key columns",
                key.len(),
                self.columns.len()
            )));
        }
        Ok(self
            .columns
            .iter()
            .zip(key.values())
            .map(|(col, v)| (col.name.clone(), v.clone()))
            .collect())
    }

    /// Check persisted entries against the key columns and rebuild the tuple
    pub fn from_entries(&self, entries: EncodedKey) -> Result<KeyTuple> {
        if entries.len() != self.columns.len() {
            return Err(Error::config(format!(
                "stored offset has {} key columns, table key has {}",
                entries.len(),
                self.columns.len()
            )));
        }

        let mut values = Vec::with_capacity(entries.len());
        for (col, (name, value)) in self.columns.iter().zip(entries) {
            if !col.name.eq_ignore_ascii_case(&name) {
                return Err(Error::config(format!(
                    "stored offset names key column '{}' where '{}' is expected",
                    name, col.name
                )));
            }
            if value.is_null() || !col.accepts(&value) {
                return Err(Error::config(format!(
                    "stored offset value {} does not fit {} key column '{}'",
                    value.sql_type(),
                    col.type_name,
                    col.name
                )));
            }
            values.push(value);
        }
        Ok(KeyTuple(values))
    }

    /// Encode a key as a standalone token
    pub fn encode(&self, key: &KeyTuple) -> Result<String> {
        let entries = self.to_entries(key)?;
        serde_json::to_string(&entries)
            .map_err(|e| Error::internal(format!("failed to encode key: {}", e)))
    }

    /// Decode a standalone token; an empty token means "start of table"
    pub fn decode(&self, token: &str) -> Result<Option<KeyTuple>> {
        if token.trim().is_empty() {
            return Ok(None);
        }
        let entries: EncodedKey =
            serde_json::from_str(token).map_err(|e| Error::format(e.to_string()))?;
        self.from_entries(entries).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn int_columns(n: usize) -> Vec<KeyColumn> {
        (1..=n)
            .map(|i| KeyColumn::new(format!("id_{}", i), "integer").unwrap())
            .collect()
    }

    #[test]
    fn test_key_type_from_sql_type() {
        assert_eq!(KeyType::from_sql_type("INTEGER"), Some(KeyType::Integer));
        assert_eq!(KeyType::from_sql_type("bigint"), Some(KeyType::Integer));
        assert_eq!(KeyType::from_sql_type("numeric(10,2)"), Some(KeyType::Decimal));
        assert_eq!(
            KeyType::from_sql_type("character varying"),
            Some(KeyType::String)
        );
        assert_eq!(KeyType::from_sql_type("VARCHAR(255)"), Some(KeyType::String));
        assert_eq!(
            KeyType::from_sql_type("timestamp with time zone"),
            Some(KeyType::Temporal)
        );
        assert_eq!(KeyType::from_sql_type("double precision"), None);
        assert_eq!(KeyType::from_sql_type("boolean"), None);
        assert_eq!(KeyType::from_sql_type("jsonb"), None);
    }

    #[test]
    fn test_unorderable_key_column_rejected() {
        let err = KeyColumn::new("score", "real").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(
            compare_values(&Value::Int32(5), &Value::Int64(7)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&Value::Decimal(Decimal::new(15, 1)), &Value::Int16(1)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare_values(&Value::from("b"), &Value::from("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(compare_values(&Value::from("1"), &Value::Int32(1)), None);
    }

    #[test]
    fn test_lexicographic_compare() {
        let a = KeyTuple::new(vec![Value::Int32(1), Value::Int32(1), Value::Int32(5)]);
        let b = KeyTuple::new(vec![Value::Int32(1), Value::Int32(2), Value::Int32(1)]);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(b.compare(&a), Some(Ordering::Greater));
        assert_eq!(a.compare(&a.clone()), Some(Ordering::Equal));
    }

    #[test]
    fn test_from_row() {
        let columns = int_columns(2);
        let row = Row::new(
            vec!["stringcol".into(), "ID_2".into(), "id_1".into()],
            vec![Value::from("x"), Value::Int32(4), Value::Int32(3)],
        );
        let key = KeyTuple::from_row(&row, &columns).unwrap();
        assert_eq!(key.values(), &[Value::Int32(3), Value::Int32(4)]);
    }

    #[test]
    fn test_from_row_rejects_null_and_missing() {
        let columns = int_columns(2);
        let row = Row::new(
            vec!["id_1".into(), "id_2".into()],
            vec![Value::Int32(1), Value::Null],
        );
        assert!(matches!(
            KeyTuple::from_row(&row, &columns),
            Err(Error::Configuration { .. })
        ));

        let row = Row::new(vec!["id_1".into()], vec![Value::Int32(1)]);
        assert!(matches!(
            KeyTuple::from_row(&row, &columns),
            Err(Error::Schema { .. })
        ));
    }

    #[test]
    fn test_codec_keeps_integer_types() {
        let columns = int_columns(3);
        let codec = KeyCodec::new(&columns);
        let key = KeyTuple::new(vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]);

        let token = codec.encode(&key).unwrap();
        assert_eq!(
            token,
            r#"[["id_1",{"Int32":1}],["id_2",{"Int32":2}],["id_3",{"Int32":3}]]"#
        );
        assert_eq!(codec.decode(&token).unwrap(), Some(key));
    }

    #[test]
    fn test_codec_empty_token_is_start() {
        let columns = int_columns(1);
        assert_eq!(KeyCodec::new(&columns).decode("").unwrap(), None);
    }

    #[test]
    fn test_codec_errors() {
        let columns = int_columns(2);
        let codec = KeyCodec::new(&columns);

        assert!(matches!(
            codec.decode("[[\"id_1\""),
            Err(Error::Format { .. })
        ));
        assert!(matches!(
            codec.decode(r#"[["id_1",{"Int32":1}]]"#),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            codec.decode(r#"[["id_1",{"Int32":1}],["other",{"Int32":1}]]"#),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            codec.decode(r#"[["id_1",{"Int32":1}],["id_2",{"String":"1"}]]"#),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_codec_rejects_wrong_width() {
        let columns = vec![KeyColumn::new("id", "integer").unwrap()];
        let codec = KeyCodec::new(&columns);
        assert!(matches!(
            codec.decode(r#"[["id",{"Int64":5}]]"#),
            Err(Error::Configuration { .. })
        ));
        assert!(codec.decode(r#"[["id",{"Int32":5}]]"#).unwrap().is_some());

        let columns = vec![KeyColumn::new("total", "numeric").unwrap()];
        assert!(matches!(
            KeyCodec::new(&columns).decode(r#"[["total",{"Int32":5}]]"#),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_codec_rejects_wrong_temporal_variant() {
        let columns = vec![KeyColumn::new("at", "timestamp").unwrap()];
        let codec = KeyCodec::new(&columns);
        assert!(matches!(
            codec.decode(r#"[["at",{"Date":"2024-01-01"}]]"#),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            codec.decode(r#"[["at",{"DateTimeTz":"2024-01-01T10:00:00Z"}]]"#),
            Err(Error::Configuration { .. })
        ));
        assert!(codec
            .decode(r#"[["at",{"DateTime":"2024-01-01T10:00:00"}]]"#)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_from_row_rejects_wrong_width() {
        let columns = int_columns(1);
        let row = Row::new(vec!["id_1".into()], vec![Value::Int64(1)]);
        assert!(matches!(
            KeyTuple::from_row(&row, &columns),
            Err(Error::TypeConversion { .. })
        ));
    }

    #[test]
    fn test_parse_literal() {
        let col = KeyColumn::new("id", "integer").unwrap();
        assert_eq!(col.parse_literal("42").unwrap(), Value::Int32(42));
        assert!(col.parse_literal("4.2").is_err());

        let col = KeyColumn::new("id", "bigint").unwrap();
        assert_eq!(col.parse_literal(" 42 ").unwrap(), Value::Int64(42));

        let col = KeyColumn::new("amount", "numeric").unwrap();
        assert_eq!(
            col.parse_literal("10.50").unwrap(),
            Value::Decimal(Decimal::new(1050, 2))
        );

        let col = KeyColumn::new("day", "date").unwrap();
        assert_eq!(
            col.parse_literal("2024-02-29").unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );

        let col = KeyColumn::new("at", "timestamp").unwrap();
        assert!(matches!(
            col.parse_literal("2024-01-01 10:00:00").unwrap(),
            Value::DateTime(_)
        ));
        assert!(matches!(
            col.parse_literal("2024-01-01T10:00:00.5").unwrap(),
            Value::DateTime(_)
        ));

        let col = KeyColumn::new("at", "timestamp with time zone").unwrap();
        assert!(matches!(
            col.parse_literal("2024-01-01T10:00:00Z").unwrap(),
            Value::DateTimeTz(_)
        ));
    }

    fn key_value() -> impl Strategy<Value = (&'static str, Value)> {
        let date =
            (1i32..1_000_000).prop_map(|d| NaiveDate::from_num_days_from_ce_opt(d).unwrap());
        let datetime = (date.clone(), 0u32..86_400, 0u32..1_000_000_000).prop_map(|(d, s, n)| {
            d.and_time(NaiveTime::from_num_seconds_from_midnight_opt(s, n).unwrap())
        });
        prop_oneof![
            any::<i16>().prop_map(|v| ("smallint", Value::Int16(v))),
            any::<i32>().prop_map(|v| ("integer", Value::Int32(v))),
            any::<i64>().prop_map(|v| ("bigint", Value::Int64(v))),
            (any::<i64>(), 0u32..=12)
                .prop_map(|(m, s)| ("numeric", Value::Decimal(Decimal::new(m, s)))),
            "[a-zA-Z0-9 _'\"]{0,20}".prop_map(|v| ("text", Value::String(v))),
            date.prop_map(|v| ("date", Value::Date(v))),
            datetime.clone().prop_map(|v| ("timestamp", Value::DateTime(v))),
            datetime.prop_map(|v| ("timestamptz", Value::DateTimeTz(v.and_utc()))),
        ]
    }

    proptest! {
        #[test]
        fn prop_codec_roundtrip(parts in prop::collection::vec(key_value(), 1..5)) {
            let columns: Vec<KeyColumn> = parts
                .iter()
                .enumerate()
                .map(|(i, (type_name, _))| KeyColumn::new(format!("k{}", i), *type_name).unwrap())
                .collect();
            let key = KeyTuple::new(parts.into_iter().map(|(_, v)| v).collect());

            let codec = KeyCodec::new(&columns);
            let decoded = codec.decode(&codec.encode(&key).unwrap()).unwrap();
            prop_assert_eq!(decoded.as_ref(), Some(&key));
            prop_assert_eq!(decoded.and_then(|d| d.compare(&key)), Some(Ordering::Equal));
        }
    }
}
