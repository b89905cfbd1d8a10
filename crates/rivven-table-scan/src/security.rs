//! Validation of configuration values that end up inside SQL text.
//!
//! Key values are always bound as parameters. What cannot be bound is
//! checked here before any query is built:
//! - key column overrides and schema names (identifiers)
//! - table patterns (identifiers plus LIKE wildcards)
//! - the optional extra WHERE condition
//! - literals interpolated into catalog queries

use crate::error::Error;

const MAX_IDENTIFIER_LEN: usize = 255;
const MAX_CONDITION_LEN: usize = 4096;

/// Validate a SQL identifier (schema, table or column name).
///
/// Accepts `^[a-zA-Z_][a-zA-Z0-9_]{0,254}$`, checked by iterating chars.
///
/// # Examples
///
/// ```
/// use rivven_table_scan::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("id_1").is_ok());
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("123abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Validate a table name pattern in SQL LIKE syntax.
///
/// Same character set as identifiers, plus the `%` wildcard; `_` already
/// is an identifier character and doubles as the single-char wildcard.
///
/// ```
/// use rivven_table_scan::security::validate_table_pattern;
///
/// assert!(validate_table_pattern("%").is_ok());
/// assert!(validate_table_pattern("orders_%").is_ok());
/// assert!(validate_table_pattern("orders' OR 1=1").is_err());
/// ```
pub fn validate_table_pattern(pattern: &str) -> crate::Result<()> {
    if pattern.is_empty() {
        return Err(Error::config("table pattern cannot be empty"));
    }

    if pattern.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "table pattern too long: {} chars (max {})",
            pattern.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    if let Some(c) = pattern
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '%')
    {
        return Err(Error::config(format!(
            "Invalid table pattern '{}': contains invalid character '{}'",
            pattern, c
        )));
    }

    Ok(())
}

/// Escape a value for a single-quoted SQL string literal (`'` becomes `''`).
///
/// Only used for catalog queries that are returned as complete SQL strings.
///
/// ```
/// use rivven_table_scan::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("orders"), "orders");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Validate the extra WHERE condition of a table configuration.
///
/// The condition is inserted verbatim next to the key predicate, so it can
/// not be parameterized. Statement separators, comments and backslash
/// escapes are rejected. This is a deny-list, so the condition must still
/// come from trusted configuration only.
///
/// ```
/// use rivven_table_scan::security::validate_where_clause;
///
/// assert!(validate_where_clause("status = 'active'").is_ok());
/// assert!(validate_where_clause("1=1; DROP TABLE users").is_err());
/// assert!(validate_where_clause("1=1 -- bypass").is_err());
/// ```
pub fn validate_where_clause(clause: &str) -> crate::Result<()> {
    if clause.trim().is_empty() {
        return Err(Error::config("WHERE clause cannot be empty"));
    }

    if clause.len() > MAX_CONDITION_LEN {
        return Err(Error::config(format!(
            "WHERE clause too long: {} chars (max {})",
            clause.len(),
            MAX_CONDITION_LEN
        )));
    }

    let prohibited = [
        (";", "statement separator ';'"),
        ("--", "line comment '--'"),
        ("/*", "block comment"),
        ("*/", "block comment"),
        ("\\", "backslash escape"),
    ];
    for (needle, what) in prohibited {
        if clause.contains(needle) {
            return Err(Error::config(format!(
                "WHERE clause contains prohibited {}: {}",
                what, clause
            )));
        }
    }

    let mut depth = 0i32;
    for c in clause.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::config(format!(
            "WHERE clause has unbalanced parentheses: {}",
            clause
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        for name in ["users", "id_1", "_private", "a", "TABLE_123"] {
            assert!(validate_sql_identifier(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_identifier_length() {
        assert!(validate_sql_identifier(&"a".repeat(255)).is_ok());
        assert!(validate_sql_identifier(&"a".repeat(256)).is_err());
        assert!(validate_sql_identifier("").is_err());
    }

    #[test]
    fn test_identifier_injection_attempts() {
        assert!(validate_sql_identifier("x' OR '1'='1").is_err());
        assert!(validate_sql_identifier("x--").is_err());
        assert!(validate_sql_identifier("schema.table").is_err());
        assert!(validate_sql_identifier("user name").is_err());
        assert!(validate_sql_identifier("tabl\u{0435}").is_err());
        assert!(validate_sql_identifier("0abc").is_err());
    }

    #[test]
    fn test_table_patterns() {
        assert!(validate_table_pattern("%").is_ok());
        assert!(validate_table_pattern("MULTIPLE_INT_PRIMARY").is_ok());
        assert!(validate_table_pattern("t_%_2024").is_ok());
        assert!(validate_table_pattern("").is_err());
        assert!(validate_table_pattern("a.b").is_err());
        assert!(validate_table_pattern("a'b").is_err());
    }

    #[test]
    fn test_escape_string_literal() {
        assert_eq!(escape_string_literal(""), "");
        assert_eq!(escape_string_literal("'hello'"), "''hello''");
        assert_eq!(escape_string_literal("' OR '1'='1"), "'' OR ''1''=''1");
    }

    #[test]
    fn test_where_clause() {
        assert!(validate_where_clause("deleted = false AND (region = 'eu' OR region = 'us')").is_ok());
        assert!(validate_where_clause("   ").is_err());
        assert!(validate_where_clause("1=1 /* x */").is_err());
        assert!(validate_where_clause("name = 'a\\'").is_err());
        assert!(validate_where_clause("a = 1) OR (1 = 1").is_err());
        assert!(validate_where_clause("(a = 1").is_err());
        assert!(validate_where_clause(&"a".repeat(4097)).is_err());
    }
}
