//! Normalized schema snapshot types.
//!
//! A [`SchemaSnapshot`] is immutable. Discovery builds a new one and swaps it
//! in wholesale; consumers hold `Arc<SchemaSnapshot>` clones and never patch
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything discovered about the database at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Tables, ordered by name.
    pub tables: Vec<TableSchema>,
    /// When the snapshot was taken.
    pub discovered_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    /// Create a snapshot from discovered tables.
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self {
            tables,
            discovered_at: Utc::now(),
        }
    }

    /// A snapshot with zero tables.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Look up a table by name (SQLite identifiers are case-insensitive).
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Names of every table in the snapshot.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the snapshot has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Information about a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnMetadata>,
    /// Primary key columns in key order.
    pub primary_key: Vec<String>,
    /// Foreign keys, one entry per referencing column.
    pub foreign_keys: Vec<ForeignKeyMetadata>,
    /// Indexes, including the automatic ones backing UNIQUE / PRIMARY KEY.
    pub indexes: Vec<IndexMetadata>,
    /// Whether the table was declared `WITHOUT ROWID`.
    pub without_rowid: bool,
}

impl TableSchema {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Whether the table has a column with this name.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Names of every column.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// The column aliasing the rowid, if the table has one.
    pub fn rowid_alias(&self) -> Option<&str> {
        if self.without_rowid || self.primary_key.len() != 1 {
            return None;
        }
        self.column(&self.primary_key[0])
            .filter(|c| c.declared_type.eq_ignore_ascii_case("INTEGER"))
            .map(|c| c.name.as_str())
    }

    /// Whether an existing index (or the primary key) already serves lookups
    /// on `columns`, i.e. `columns` equals or is a prefix of its column list.
    pub fn is_covered_by_index(&self, columns: &[String]) -> bool {
        if columns.is_empty() {
            return true;
        }

        let is_prefix = |existing: &[String]| {
            existing.len() >= columns.len()
                && existing
                    .iter()
                    .zip(columns)
                    .all(|(a, b)| a.eq_ignore_ascii_case(b))
        };

        if is_prefix(&self.primary_key) {
            return true;
        }

        // A bare rowid lookup is always indexed.
        if columns.len() == 1 && columns[0].eq_ignore_ascii_case("rowid") && !self.without_rowid {
            return true;
        }

        self.indexes
            .iter()
            .filter(|idx| !idx.partial)
            .any(|idx| is_prefix(&idx.columns))
    }

    /// Whether any index or the primary key starts with `column`.
    pub fn has_leading_index(&self, column: &str) -> bool {
        self.is_covered_by_index(&[column.to_string()])
    }
}

/// Information about a column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name.
    pub name: String,
    /// Declared type exactly as written in the DDL (may be empty).
    pub declared_type: String,
    /// Whether NULL is accepted.
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
    /// 1-based position inside the primary key, 0 if not part of it.
    pub primary_key_position: u32,
    /// Explicit `AUTOINCREMENT` or an implicit rowid alias.
    pub auto_increment: bool,
    /// Default value expression.
    pub default_value: Option<String>,
}

/// One referencing column of a foreign key constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyMetadata {
    /// Constraint id; composite keys share one id across several entries.
    pub id: i64,
    /// Position of this column inside the constraint.
    pub seq: i64,
    /// Referencing (child) column.
    pub column: String,
    /// Referenced (parent) table.
    pub referenced_table: String,
    /// Referenced (parent) column. Always populated; see
    /// [`ForeignKeyMetadata::referenced_column_implicit`].
    pub referenced_column: String,
    /// True when the DDL omitted the parent column and it was resolved to the
    /// parent's primary key (or `rowid`).
    pub referenced_column_implicit: bool,
    /// ON UPDATE action.
    pub on_update: ReferentialAction,
    /// ON DELETE action.
    pub on_delete: ReferentialAction,
}

/// Referential action for foreign keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Parse the action string reported by `PRAGMA foreign_key_list`.
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "RESTRICT" => Self::Restrict,
            "CASCADE" => Self::Cascade,
            "SET NULL" => Self::SetNull,
            "SET DEFAULT" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }

    /// SQL spelling of the action.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// How an index came to exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOrigin {
    /// `CREATE INDEX`.
    #[default]
    CreateIndex,
    /// Automatic index for a UNIQUE constraint.
    Unique,
    /// Automatic index for a PRIMARY KEY constraint.
    PrimaryKey,
}

impl IndexOrigin {
    /// Parse the `origin` column of `PRAGMA index_list`.
    pub fn parse(s: &str) -> Self {
        match s {
            "u" => Self::Unique,
            "pk" => Self::PrimaryKey,
            _ => Self::CreateIndex,
        }
    }
}

/// Information about an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index name.
    pub name: String,
    /// Indexed columns in key order (expression terms are omitted).
    pub columns: Vec<String>,
    /// Whether this is a unique index.
    pub unique: bool,
    /// Where the index came from.
    pub origin: IndexOrigin,
    /// Whether the index has a WHERE clause.
    pub partial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        TableSchema {
            name: "users".into(),
            columns: vec![
                ColumnMetadata {
                    name: "id".into(),
                    declared_type: "INTEGER".into(),
                    primary_key: true,
                    primary_key_position: 1,
                    auto_increment: true,
                    ..Default::default()
                },
                ColumnMetadata {
                    name: "email".into(),
                    declared_type: "TEXT".into(),
                    ..Default::default()
                },
                ColumnMetadata {
                    name: "created_at".into(),
                    declared_type: "TEXT".into(),
                    nullable: true,
                    ..Default::default()
                },
            ],
            primary_key: vec!["id".into()],
            indexes: vec![IndexMetadata {
                name: "idx_users_email_created".into(),
                columns: vec!["email".into(), "created_at".into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        let table = users();
        assert!(table.has_column("EMAIL"));
        assert!(!table.has_column("missing"));
        assert_eq!(table.rowid_alias(), Some("id"));
    }

    #[test]
    fn test_index_coverage_includes_prefixes() {
        let table = users();
        assert!(table.is_covered_by_index(&["email".into()]));
        assert!(table.is_covered_by_index(&["email".into(), "created_at".into()]));
        assert!(table.is_covered_by_index(&["id".into()]));
        assert!(!table.is_covered_by_index(&["created_at".into()]));
        assert!(!table.is_covered_by_index(&["email".into(), "id".into()]));
    }

    #[test]
    fn test_partial_index_does_not_cover() {
        let mut table = users();
        table.indexes[0].partial = true;
        assert!(!table.is_covered_by_index(&["email".into()]));
    }

    #[test]
    fn test_without_rowid_has_no_alias() {
        let mut table = users();
        table.without_rowid = true;
        assert_eq!(table.rowid_alias(), None);
    }

    #[test]
    fn test_referential_action_parse() {
        assert_eq!(ReferentialAction::parse("CASCADE"), ReferentialAction::Cascade);
        assert_eq!(ReferentialAction::parse("SET NULL"), ReferentialAction::SetNull);
        assert_eq!(ReferentialAction::parse("NO ACTION"), ReferentialAction::NoAction);
        assert_eq!(ReferentialAction::SetDefault.as_sql(), "SET DEFAULT");
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = SchemaSnapshot::new(vec![users()]);
        assert!(snapshot.table("Users").is_some());
        assert_eq!(snapshot.table_names(), vec!["users".to_string()]);
        assert!(SchemaSnapshot::empty().is_empty());
    }
}
