//! Introspection statements and their raw row shapes.
//!
//! Every PRAGMA is issued as its own statement with a quoted identifier
//! argument. Raw rows are decoded here and normalized by
//! [`crate::discovery`].

use keel_sqlite::row::column;
use keel_sqlite::{FromSqliteRow, FromSqliteRowError, quote_ident};
use rusqlite::Row;

/// List user tables with their DDL.
pub fn tables_query(include_internal: bool) -> String {
    let internal = if include_internal {
        ""
    } else {
        " AND name NOT LIKE 'sqlite_%'"
    };
    format!(
        "SELECT name, sql FROM sqlite_master WHERE type = 'table'{} ORDER BY name",
        internal
    )
}

/// `PRAGMA table_info` for one table.
pub fn columns_query(table: &str) -> String {
    format!("PRAGMA table_info({})", quote_ident(table))
}

/// `PRAGMA foreign_key_list` for one table.
pub fn foreign_keys_query(table: &str) -> String {
    format!("PRAGMA foreign_key_list({})", quote_ident(table))
}

/// `PRAGMA index_list` for one table.
pub fn indexes_query(table: &str) -> String {
    format!("PRAGMA index_list({})", quote_ident(table))
}

/// `PRAGMA index_info` for one index.
pub fn index_columns_query(index: &str) -> String {
    format!("PRAGMA index_info({})", quote_ident(index))
}

/// A `sqlite_master` table entry.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub name: String,
    pub sql: Option<String>,
}

impl FromSqliteRow for RawTable {
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError> {
        Ok(Self {
            name: column(row, "name")?,
            sql: column(row, "sql")?,
        })
    }
}

/// A `PRAGMA table_info` row.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub cid: i64,
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    /// 1-based position in the primary key, 0 when not part of it.
    pub pk: i64,
}

impl FromSqliteRow for RawColumn {
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError> {
        Ok(Self {
            cid: column(row, "cid")?,
            name: column(row, "name")?,
            declared_type: column::<Option<String>>(row, "type")?.unwrap_or_default(),
            not_null: column::<i64>(row, "notnull")? != 0,
            default_value: column(row, "dflt_value")?,
            pk: column(row, "pk")?,
        })
    }
}

/// A `PRAGMA foreign_key_list` row.
#[derive(Debug, Clone)]
pub struct RawForeignKey {
    pub id: i64,
    pub seq: i64,
    pub table: String,
    pub from: String,
    pub to: Option<String>,
    pub on_update: String,
    pub on_delete: String,
}

impl FromSqliteRow for RawForeignKey {
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError> {
        Ok(Self {
            id: column(row, "id")?,
            seq: column(row, "seq")?,
            table: column(row, "table")?,
            from: column(row, "from")?,
            to: column(row, "to")?,
            on_update: column(row, "on_update")?,
            on_delete: column(row, "on_delete")?,
        })
    }
}

/// A `PRAGMA index_list` row.
#[derive(Debug, Clone)]
pub struct RawIndex {
    pub name: String,
    pub unique: bool,
    pub origin: String,
    pub partial: bool,
}

impl FromSqliteRow for RawIndex {
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError> {
        Ok(Self {
            name: column(row, "name")?,
            unique: column::<i64>(row, "unique")? != 0,
            origin: column(row, "origin")?,
            partial: column::<i64>(row, "partial")? != 0,
        })
    }
}

/// A `PRAGMA index_info` row. `name` is NULL for expression terms.
#[derive(Debug, Clone)]
pub struct RawIndexColumn {
    pub seqno: i64,
    pub name: Option<String>,
}

impl FromSqliteRow for RawIndexColumn {
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError> {
        Ok(Self {
            seqno: column(row, "seqno")?,
            name: column(row, "name")?,
        })
    }
}

/// Whether a `CREATE TABLE` statement declares `AUTOINCREMENT`.
pub fn declares_autoincrement(sql: &str) -> bool {
    sql.to_ascii_uppercase().contains("AUTOINCREMENT")
}

/// Whether a `CREATE TABLE` statement carries the `WITHOUT ROWID` table option.
pub fn declares_without_rowid(sql: &str) -> bool {
    let Some(close) = sql.rfind(')') else {
        return false;
    };
    let options = sql[close + 1..]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    options.contains("WITHOUT ROWID")
}
