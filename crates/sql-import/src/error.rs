//! Error types for the import engine.

use thiserror::Error;

use crate::mapping::ValidationIssue;

/// Main error type for import operations.
#[derive(Error, Debug)]
pub enum ImportError {
    /// Network or authentication failure talking to the source.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A table or column vanished upstream.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Mapping rules are inconsistent with the source or target schema.
    #[error("Mapping validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// One value could not be coerced by its transform.
    #[error("Transform error for field {field}: {message}")]
    Transform { field: String, message: String },

    /// Operation invoked from a state that does not allow it.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The target rejected a record.
    #[error("Write error: {0}")]
    Write(String),

    /// A row-scoped failure that escalated to the whole job.
    #[error("Row {key}: {source}")]
    Row {
        key: String,
        #[source]
        source: Box<ImportError>,
    },

    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential encryption or decryption failed.
    #[error("Credential error: {0}")]
    Crypto(String),

    /// Job state file error.
    #[error("Job state error: {0}")]
    State(String),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Source database protocol error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ImportError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        ImportError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transform error
    pub fn transform(field: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Transform {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Wrap a row-scoped error with the row's source key.
    pub fn row(key: impl Into<String>, source: ImportError) -> Self {
        ImportError::Row {
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error means the source could not be reached.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ImportError::Connectivity(_) | ImportError::Pool { .. } | ImportError::Source(_)
        )
    }

    /// Whether this error is scoped to a single row.
    pub fn is_row_scoped(&self) -> bool {
        matches!(
            self,
            ImportError::Transform { .. } | ImportError::Write(_) | ImportError::Row { .. }
        )
    }

    /// Single-line cause, suitable for `error_message` fields.
    pub fn summary(&self) -> String {
        self.to_string().lines().next().unwrap_or_default().to_string()
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ImportError::Config(_) | ImportError::Yaml(_) | ImportError::Crypto(_) => 2,
            ImportError::Connectivity(_) | ImportError::Pool { .. } | ImportError::Source(_) => 3,
            ImportError::Validation(_) => 4,
            ImportError::Precondition(_) => 5,
            ImportError::NotFound(_) => 6,
            ImportError::Transform { .. } | ImportError::Write(_) | ImportError::Row { .. } => 7,
            _ => 1,
        }
    }
}

/// Result type alias for import operations.
pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_error_chain() {
        let err = ImportError::row("42", ImportError::transform("active", "bad value"));
        assert_eq!(
            err.to_string(),
            "Row 42: Transform error for field active: bad value"
        );
        let detailed = err.format_detailed();
        assert!(detailed.contains("Caused by"));
        assert!(err.is_row_scoped());
    }

    #[test]
    fn test_summary_is_single_line() {
        let err = ImportError::pool("timed out", "checking out source connection");
        assert_eq!(err.summary(), "Pool error: timed out");
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        assert_eq!(ImportError::Config("x".into()).exit_code(), 2);
        assert_eq!(ImportError::Connectivity("x".into()).exit_code(), 3);
        assert_eq!(ImportError::Precondition("x".into()).exit_code(), 5);
        assert_eq!(ImportError::State("x".into()).exit_code(), 1);
    }
}
