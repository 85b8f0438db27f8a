//! Identifier quoting and row-filter screening.
//!
//! Identifiers (schema, table and column names) cannot be bound as query
//! parameters, so every one that reaches a SQL string goes through the
//! quoting functions here. Values such as cursor keys and batch limits are
//! always bound.
//!
//! Row filters are user-authored predicates in the source dialect. They are
//! passed through verbatim inside parentheses, after [`validate_filter`] has
//! rejected anything that could end the predicate and start another statement.

use crate::error::{ImportError, Result};

/// Maximum identifier length (SQL Server allows 128 characters, PostgreSQL 63 bytes).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Stored procedures that have no business inside a WHERE clause.
const DANGEROUS_PROCEDURES: &[&str] = &[
    "xp_cmdshell",
    "xp_regread",
    "xp_regwrite",
    "xp_regdelete",
    "xp_dirtree",
    "xp_fileexist",
    "xp_subdirs",
    "sp_executesql",
    "sp_execute",
    "sp_oacreate",
    "sp_oamethod",
    "sp_addextendedproc",
    "sp_configure",
];

/// Statement keywords that cannot appear in a boolean predicate.
const STATEMENT_KEYWORDS: &[&str] = &[
    "exec", "execute", "insert", "update", "delete", "drop", "alter", "create", "truncate",
    "merge", "grant", "revoke", "shutdown",
];

/// Validate an identifier before it is quoted.
///
/// Rejects empty names, names containing a null byte, and names longer than
/// the SQL Server limit.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ImportError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(ImportError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(ImportError::Config(format!(
            "Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("Customers")?, "[Customers]");
/// assert_eq!(quote_mssql("odd]name")?, "[odd]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Qualify a SQL Server table name with its schema.
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// Quote a PostgreSQL identifier.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL table name with its schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Screen a row filter before it is embedded in a query.
///
/// The filter is opaque to the engine, but it must stay a single boolean
/// expression. Rejected:
///
/// - statement separators (`;`)
/// - comment markers (`--`, `/*`, `*/`)
/// - unbalanced parentheses or quotes
/// - statement keywords outside string literals (`EXEC`, `DROP`, ...)
/// - known dangerous stored procedures
pub fn validate_filter(filter: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(ImportError::Config(format!(
            "Row filter {}: {:?}",
            reason, filter
        )))
    };

    if filter.trim().is_empty() {
        return reject("is empty");
    }
    if filter.contains('\0') {
        return reject("contains a null byte");
    }

    // Strip string literals so keywords inside 'quoted text' are allowed.
    let mut code = String::with_capacity(filter.len());
    let mut in_literal = false;
    let mut depth: i32 = 0;
    for ch in filter.chars() {
        if ch == '\'' {
            // A doubled quote toggles twice and stays inside the literal.
            in_literal = !in_literal;
            code.push(' ');
            continue;
        }
        if in_literal {
            continue;
        }
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return reject("has unbalanced parentheses");
                }
            }
            _ => {}
        }
        code.push(ch);
    }

    if in_literal {
        return reject("has an unterminated string literal");
    }
    if depth != 0 {
        return reject("has unbalanced parentheses");
    }
    if code.contains(';') {
        return reject("contains a statement separator");
    }
    if code.contains("--") || code.contains("/*") || code.contains("*/") {
        return reject("contains comment markers");
    }

    let lower = code.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();

    if let Some(word) = words.iter().find(|w| STATEMENT_KEYWORDS.contains(w)) {
        return reject(&format!("contains statement keyword '{}'", word.to_uppercase()));
    }
    if let Some(word) = words.iter().find(|w| DANGEROUS_PROCEDURES.contains(w)) {
        return reject(&format!("references stored procedure '{}'", word));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("Customers").is_ok());
        assert!(validate_identifier("Customer Name").is_ok());
        assert!(validate_identifier("日本語").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty_and_null() {
        assert!(validate_identifier("")
            .unwrap_err()
            .to_string()
            .contains("empty"));
        assert!(validate_identifier("a\0b")
            .unwrap_err()
            .to_string()
            .contains("null byte"));
    }

    #[test]
    fn test_validate_identifier_length_limit() {
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH)).is_ok());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_quote_mssql_escapes_bracket() {
        assert_eq!(quote_mssql("Customers").unwrap(), "[Customers]");
        assert_eq!(quote_mssql("odd]name").unwrap(), "[odd]]name]");
        assert_eq!(
            qualify_mssql("dbo", "Customers").unwrap(),
            "[dbo].[Customers]"
        );
    }

    #[test]
    fn test_quote_pg_escapes_double_quote() {
        assert_eq!(quote_pg("res_partner").unwrap(), "\"res_partner\"");
        assert_eq!(quote_pg("a\"b").unwrap(), "\"a\"\"b\"");
        assert_eq!(
            qualify_pg("public", "res_partner").unwrap(),
            "\"public\".\"res_partner\""
        );
    }

    #[test]
    fn test_validate_filter_accepts_predicates() {
        assert!(validate_filter("IsActive = 1").is_ok());
        assert!(validate_filter("Country IN ('FR', 'BE') AND (Balance > 0)").is_ok());
        assert!(validate_filter("Name LIKE 'O''Brien%'").is_ok());
        // Keywords inside literals are data, not statements.
        assert!(validate_filter("Note = 'please delete me'").is_ok());
        assert!(validate_filter("updated_at > '2020-01-01'").is_ok());
    }

    #[test]
    fn test_validate_filter_rejects_injection() {
        assert!(validate_filter("1=1; DROP TABLE Customers").is_err());
        assert!(validate_filter("1=1 -- trailing").is_err());
        assert!(validate_filter("1=1 /* x */").is_err());
        assert!(validate_filter("1=1) OR (1=1").is_err());
        assert!(validate_filter("Name = 'open").is_err());
        assert!(validate_filter("1=1 OR EXEC('x') = 1").is_err());
        assert!(validate_filter("xp_cmdshell('dir') = 0").is_err());
        assert!(validate_filter("   ").is_err());
    }
}
