//! Row decoding traits for SQLite.

use rusqlite::Row;
use rusqlite::types::FromSql;
use serde_json::Value as JsonValue;

/// Trait for converting a SQLite row to a Rust type.
pub trait FromSqliteRow: Sized {
    /// Convert a SQLite row to this type.
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError>;
}

/// Error type for row decoding.
#[derive(Debug)]
pub struct FromSqliteRowError {
    /// The error message.
    pub message: String,
    /// The column that caused the error, if known.
    pub column: Option<String>,
}

impl FromSqliteRowError {
    /// Create a new error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            column: None,
        }
    }

    /// Create a new error with a column name.
    pub fn with_column(message: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            column: Some(column.into()),
        }
    }
}

impl std::fmt::Display for FromSqliteRowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref column) = self.column {
            write!(f, "column '{}': {}", column, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for FromSqliteRowError {}

impl From<rusqlite::Error> for FromSqliteRowError {
    fn from(err: rusqlite::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Read a named column, tagging failures with the column name.
pub fn column<T: FromSql>(row: &Row<'_>, name: &str) -> Result<T, FromSqliteRowError> {
    row.get::<_, T>(name)
        .map_err(|e| FromSqliteRowError::with_column(e.to_string(), name))
}

impl FromSqliteRow for JsonValue {
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError> {
        let stmt = row.as_ref();
        let mut map = serde_json::Map::new();

        for i in 0..stmt.column_count() {
            let name = stmt
                .column_name(i)
                .map_err(|e| FromSqliteRowError::new(e.to_string()))?
                .to_string();
            map.insert(name, crate::types::get_value_at_index(row, i));
        }

        Ok(JsonValue::Object(map))
    }
}

impl FromSqliteRow for String {
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError> {
        row.get::<_, String>(0)
            .map_err(|e| FromSqliteRowError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_sqlite_row_error_with_column() {
        let err = FromSqliteRowError::with_column("invalid type", "user_id");
        assert_eq!(err.message, "invalid type");
        assert_eq!(err.column, Some("user_id".to_string()));
        assert_eq!(err.to_string(), "column 'user_id': invalid type");
    }

    #[test]
    fn test_column_helper_reports_name() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT 'x' AS label", [], |row| {
                Ok(column::<i64>(row, "missing").unwrap_err())
            })
            .unwrap();
        assert_eq!(err.column.as_deref(), Some("missing"));
    }

    #[test]
    fn test_json_row() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let value = conn
            .query_row("SELECT 1 AS a, 'b' AS b", [], |row| {
                Ok(JsonValue::from_row(row).unwrap())
            })
            .unwrap();
        assert_eq!(value, serde_json::json!({"a": 1, "b": "b"}));
    }
}
