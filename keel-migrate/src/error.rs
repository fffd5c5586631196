//! Error types for the migration engine.

use keel_sqlite::SqliteError;
use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration failed on every attempt.
    #[error("Migration '{name}' failed after {attempts} attempt(s): {message}")]
    Execution {
        /// Migration name.
        name: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Last failure.
        message: String,
    },

    /// Every resource slot is taken.
    #[error("Resource limit reached for '{operation}': {active}/{max} slots in use")]
    ResourceExhausted {
        /// Operation that asked for a slot.
        operation: String,
        /// Slots in use.
        active: usize,
        /// Configured maximum.
        max: usize,
    },

    /// An attempt or a whole operation ran out of time.
    #[error("Operation '{operation}' timed out after {elapsed_ms}ms")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Time spent before giving up.
        elapsed_ms: u64,
    },

    /// Invalid migration file or format.
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another connection holds a lock on the database file.
    #[error("Database busy: {0}")]
    Busy(String),

    /// Database operation error.
    #[error("Database error: {0}")]
    Database(String),
}

impl From<SqliteError> for MigrationError {
    fn from(err: SqliteError) -> Self {
        if err.is_busy() {
            Self::Busy(err.to_string())
        } else {
            Self::Database(err.to_string())
        }
    }
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create an invalid migration error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidMigration(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Whether the caller can retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::Timeout { .. } | Self::Busy(_)
        )
    }

    /// A hint on how to resolve the error.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Execution { name, .. } => Some(format!(
                "Fix the SQL in '{}' and run migrate again; earlier migrations stay applied",
                name
            )),
            Self::ResourceExhausted { max, .. } => Some(format!(
                "Wait for a running migration to finish or raise max_concurrent above {}",
                max
            )),
            Self::Timeout { .. } => {
                Some("Raise attempt_timeout_ms / timeout_ms or split the migration".to_string())
            }
            Self::InvalidMigration(_) => {
                Some("Name migration files <14-digit timestamp>_<description>.sql".to_string())
            }
            Self::Io(_) => {
                Some("Check that the migrations directory exists and is readable".to_string())
            }
            Self::Busy(_) => Some(
                "Another process holds the database lock; raise busy_timeout or retry later"
                    .to_string(),
            ),
            Self::Database(_) => None,
        }
    }
}
