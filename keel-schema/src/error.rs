//! Error types for schema discovery and constraint checks.

use keel_sqlite::SqliteError;
use thiserror::Error;

/// Result type alias for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised by the schema layer.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// An introspection query failed.
    ///
    /// Discovery recovers from these locally; they only surface in logs and
    /// through [`SchemaError::is_recoverable`].
    #[error("Discovery of {facet} for table '{table}' failed: {message}")]
    Discovery {
        /// Table being introspected (`*` for the table listing).
        table: String,
        /// Facet that failed (columns, foreign keys, indexes, ...).
        facet: &'static str,
        /// Driver message.
        message: String,
    },

    /// A table name is not part of the current schema.
    #[error("Unknown table '{table}'{}", suggestion_text(.suggestion))]
    UnknownTable {
        /// Requested table.
        table: String,
        /// Closest known table name.
        suggestion: Option<String>,
        /// Every known table.
        alternatives: Vec<String>,
    },

    /// A column name is not part of the table.
    #[error("Unknown column '{column}' on table '{table}'{}", suggestion_text(.suggestion))]
    UnknownColumn {
        /// Table searched.
        table: String,
        /// Requested column.
        column: String,
        /// Closest known column name.
        suggestion: Option<String>,
        /// Every column of the table.
        alternatives: Vec<String>,
    },

    /// A record failed its rule table.
    #[error("Validation failed for table '{table}': {}", .failures.join("; "))]
    Validation {
        /// Table the record belongs to.
        table: String,
        /// One message per failed rule.
        failures: Vec<String>,
    },

    /// Underlying database error.
    #[error(transparent)]
    Database(#[from] SqliteError),
}

fn suggestion_text(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{}'?)", s))
        .unwrap_or_default()
}

impl SchemaError {
    /// Create a discovery error.
    pub fn discovery(
        table: impl Into<String>,
        facet: &'static str,
        message: impl ToString,
    ) -> Self {
        Self::Discovery {
            table: table.into(),
            facet,
            message: message.to_string(),
        }
    }

    /// Create an unknown-table error listing the known tables.
    pub fn unknown_table(table: impl Into<String>, known: Vec<String>) -> Self {
        let table = table.into();
        Self::UnknownTable {
            suggestion: closest_match(&table, &known),
            table,
            alternatives: known,
        }
    }

    /// Create an unknown-column error listing the table's columns.
    pub fn unknown_column(
        table: impl Into<String>,
        column: impl Into<String>,
        known: Vec<String>,
    ) -> Self {
        let column = column.into();
        Self::UnknownColumn {
            table: table.into(),
            suggestion: closest_match(&column, &known),
            column,
            alternatives: known,
        }
    }

    /// Whether the error is handled locally by degrading the result.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Discovery { .. })
    }

    /// Valid names the caller could have used instead, if any.
    pub fn alternatives(&self) -> &[String] {
        match self {
            Self::UnknownTable { alternatives, .. } | Self::UnknownColumn { alternatives, .. } => {
                alternatives
            }
            _ => &[],
        }
    }
}

/// Pick the candidate with the smallest edit distance, if it is close enough.
pub(crate) fn closest_match(name: &str, candidates: &[String]) -> Option<String> {
    let name = name.to_lowercase();
    candidates
        .iter()
        .map(|c| (edit_distance(&name, &c.to_lowercase()), c))
        .filter(|(d, c)| *d <= (c.len().max(name.len()) / 2).max(1))
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.clone())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }

    prev[b.len()]
}
