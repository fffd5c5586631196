//! Generic row lookup by column.

use keel_sqlite::types::json_to_sqlite;
use keel_sqlite::{Database, quote_ident};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{SchemaError, SchemaResult};
use crate::types::SchemaSnapshot;

/// Fetch rows of `table` where `column` equals `value`.
///
/// Both names are checked against the snapshot first; unknown names fail
/// with the valid alternatives instead of reaching SQL. A JSON `null` matches
/// rows where the column `IS NULL`.
pub async fn find_by_column(
    db: &Database,
    snapshot: &SchemaSnapshot,
    table: &str,
    column: &str,
    value: &JsonValue,
    limit: Option<usize>,
) -> SchemaResult<Vec<JsonValue>> {
    let schema = snapshot
        .table(table)
        .ok_or_else(|| SchemaError::unknown_table(table, snapshot.table_names()))?;
    let col = schema
        .column(column)
        .ok_or_else(|| SchemaError::unknown_column(&schema.name, column, schema.column_names()))?;

    let mut sql = format!(
        "SELECT * FROM {} WHERE {}",
        quote_ident(&schema.name),
        quote_ident(&col.name)
    );
    let params = if value.is_null() {
        sql.push_str(" IS NULL");
        Vec::new()
    } else {
        sql.push_str(" = ?");
        vec![json_to_sqlite(value)?]
    };
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    debug!(table = %schema.name, column = %col.name, "Lookup by column");
    Ok(db.query_json(&sql, params).await?)
}
