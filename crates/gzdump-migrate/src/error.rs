//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, out-of-range values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid or corrupt gzip header
    #[error("Invalid gzip header: {0}")]
    Header(String),

    /// Gzip trailer checksum or size mismatch
    #[error("Gzip checksum mismatch: {0}")]
    Checksum(String),

    /// Attempt to seek before the beginning of the uncompressed stream
    #[error("Invalid seek to offset {0}")]
    InvalidSeek(i64),

    /// Seeking from the end of the stream is not supported
    #[error("Seeking from the end of the stream is not supported")]
    UnsupportedSeek,

    /// Serialized decompressor state has an unknown format version
    #[error("Unsupported decompressor state version {0}")]
    UnsupportedState(u8),

    /// A record exceeded the configured maximum length
    #[error("Record at offset {offset} exceeds maximum length of {limit} bytes")]
    OversizeRecord { offset: u64, limit: usize },

    /// A required mapping field was absent from the record (per-record)
    #[error("Required field '{0}' missing from record")]
    MissingRequiredField(String),

    /// A field value could not be converted to its target type (per-record)
    #[error("Cannot convert field '{field}': {reason}")]
    Conversion { field: String, reason: String },

    /// Destination schema does not match the mapping
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Destination write failed after exhausting retries
    #[error("Destination write failed: {0}")]
    DestinationWrite(String),

    /// A pipeline stage did not stop within its shutdown timeout
    #[error("Timed out waiting for {0} to shut down")]
    ShutdownTimeout(&'static str),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error
    #[error("MySQL error: {0}")]
    Mysql(#[from] sqlx::Error),
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// True for errors that drop a single record without stopping the pipeline.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            MigrateError::MissingRequiredField(_) | MigrateError::Conversion { .. }
        )
    }

    /// Process exit code: 0 success, 1 fatal error, 2 configuration error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            _ => 1,
        }
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
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("bad".into()).exit_code(), 2);
        assert_eq!(MigrateError::Cancelled.exit_code(), 1);
        assert_eq!(
            MigrateError::Checksum("crc mismatch".into()).exit_code(),
            1
        );
    }

    #[test]
    fn test_record_errors() {
        assert!(MigrateError::MissingRequiredField("a".into()).is_record_error());
        assert!(MigrateError::Conversion {
            field: "a".into(),
            reason: "not a number".into()
        }
        .is_record_error());
        assert!(!MigrateError::UnsupportedSeek.is_record_error());
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = MigrateError::Io(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
    }
}
