//! Referential integrity checks.
//!
//! [`ConstraintValidator::plan`] is read-only: it counts orphaned rows per
//! foreign key and lists foreign keys without a supporting index.
//! [`ConstraintValidator::apply_fixes`] turns a plan into statements and only
//! runs them when [`FixOptions::dry_run`] is off.

use std::collections::BTreeSet;

use keel_sqlite::{Database, Value, quote_ident};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use crate::error::SchemaResult;
use crate::queries::{self, RawColumn};
use crate::types::{ForeignKeyMetadata, SchemaSnapshot, TableSchema};

/// Rows with a non-null foreign key that points at nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanIssue {
    /// Child table.
    pub table: String,
    /// Foreign key id within the child table.
    pub foreign_key_id: i64,
    /// Child columns, in constraint order.
    pub columns: Vec<String>,
    /// Parent table.
    pub referenced_table: String,
    /// Parent columns, in constraint order.
    pub referenced_columns: Vec<String>,
    /// Number of orphaned rows.
    pub orphan_count: u64,
    /// Up to `sample_limit` orphaned rows.
    pub samples: Vec<JsonValue>,
    /// Statement that would delete the orphaned rows.
    pub cleanup_sql: String,
}

/// A foreign key whose child columns have no supporting index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingIndexIssue {
    pub table: String,
    pub columns: Vec<String>,
    pub index_name: String,
    pub create_sql: String,
}

/// Output of [`ConstraintValidator::plan`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintIssues {
    /// One entry per foreign key with at least one orphaned row.
    pub orphans: Vec<OrphanIssue>,
    /// Foreign keys lacking a supporting index.
    pub missing_indexes: Vec<MissingIndexIssue>,
    /// Whether `PRAGMA foreign_keys` is on for the connection.
    pub foreign_keys_enabled: bool,
    /// Number of foreign keys that were checked.
    pub checked_foreign_keys: usize,
    /// Foreign keys whose check query failed, as `table.fk_id: message`.
    pub skipped: Vec<String>,
}

impl ConstraintIssues {
    /// True when no orphaned rows were found.
    pub fn integrity_holds(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Total number of orphaned rows across all foreign keys.
    pub fn total_orphans(&self) -> u64 {
        self.orphans.iter().map(|o| o.orphan_count).sum()
    }

    /// True when nothing needs fixing.
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.missing_indexes.is_empty() && self.foreign_keys_enabled
    }
}

/// Which fixes to apply. The default only previews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixOptions {
    pub create_missing_indexes: bool,
    pub enable_foreign_key_enforcement: bool,
    /// Delete orphaned rows. Destructive.
    pub cleanup_orphaned_records: bool,
    /// Only build the statement list.
    pub dry_run: bool,
}

impl Default for FixOptions {
    fn default() -> Self {
        Self {
            create_missing_indexes: false,
            enable_foreign_key_enforcement: false,
            cleanup_orphaned_records: false,
            dry_run: true,
        }
    }
}

impl FixOptions {
    /// Every fix enabled, still in dry-run mode.
    pub fn all() -> Self {
        Self {
            create_missing_indexes: true,
            enable_foreign_key_enforcement: true,
            cleanup_orphaned_records: true,
            dry_run: true,
        }
    }

    /// Actually run the selected fixes.
    pub fn execute(mut self) -> Self {
        self.dry_run = false;
        self
    }
}

/// Orphaned rows that a cleanup would delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanPreview {
    pub table: String,
    pub orphan_count: u64,
    pub samples: Vec<JsonValue>,
}

/// Output of [`ConstraintValidator::apply_fixes`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixResult {
    pub dry_run: bool,
    /// Every statement the selected options produce, in execution order.
    pub statements: Vec<String>,
    /// Rows the cleanup would delete (or deleted).
    pub orphan_previews: Vec<OrphanPreview>,
    /// Statements that were actually run.
    pub executed: Vec<String>,
    pub indexes_created: usize,
    pub rows_deleted: u64,
    /// Enforcement state after the fixes.
    pub foreign_keys_enabled: bool,
}

/// Checks foreign key integrity against a schema snapshot.
#[derive(Debug, Clone)]
pub struct ConstraintValidator {
    db: Database,
    sample_limit: usize,
}

impl ConstraintValidator {
    /// Create a validator that samples up to 5 orphaned rows per foreign key.
    pub fn new(db: Database) -> Self {
        Self { db, sample_limit: 5 }
    }

    /// Set how many orphaned rows are sampled per foreign key.
    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }

    /// Check every foreign key in the snapshot.
    #[instrument(skip(self, snapshot), fields(tables = snapshot.len()))]
    pub async fn plan(&self, snapshot: &SchemaSnapshot) -> SchemaResult<ConstraintIssues> {
        let mut issues = ConstraintIssues {
            foreign_keys_enabled: self.foreign_keys_enabled().await?,
            ..Default::default()
        };
        let mut seen_indexes = BTreeSet::new();

        for table in &snapshot.tables {
            for fk in group_foreign_keys(&table.foreign_keys) {
                issues.checked_foreign_keys += 1;

                match self.check_orphans(table, &fk).await {
                    Ok(Some(orphan)) => {
                        warn!(
                            table = %orphan.table,
                            referenced_table = %orphan.referenced_table,
                            orphans = orphan.orphan_count,
                            "Orphaned rows found"
                        );
                        issues.orphans.push(orphan);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            table = %table.name,
                            foreign_key = fk.id,
                            error = %e,
                            "Orphan check failed, skipping"
                        );
                        issues.skipped.push(format!("{}.{}: {}", table.name, fk.id, e));
                    }
                }

                if !table.has_leading_index(&fk.columns[0])
                    && seen_indexes.insert((table.name.clone(), fk.columns.clone()))
                {
                    issues.missing_indexes.push(missing_index(table, &fk.columns));
                }
            }
        }

        info!(
            checked = issues.checked_foreign_keys,
            orphaned_keys = issues.orphans.len(),
            missing_indexes = issues.missing_indexes.len(),
            "Constraint plan built"
        );
        Ok(issues)
    }

    /// Apply (or preview) fixes for a plan.
    ///
    /// Order: index creation, then orphan deletion in one transaction, then
    /// enabling enforcement (a PRAGMA that is a no-op inside a transaction).
    #[instrument(skip(self, issues))]
    pub async fn apply_fixes(
        &self,
        issues: &ConstraintIssues,
        options: FixOptions,
    ) -> SchemaResult<FixResult> {
        let mut result = FixResult {
            dry_run: options.dry_run,
            foreign_keys_enabled: issues.foreign_keys_enabled,
            ..Default::default()
        };

        let index_statements: Vec<String> = if options.create_missing_indexes {
            issues.missing_indexes.iter().map(|i| i.create_sql.clone()).collect()
        } else {
            Vec::new()
        };
        let cleanup_statements: Vec<String> = if options.cleanup_orphaned_records {
            issues.orphans.iter().map(|o| o.cleanup_sql.clone()).collect()
        } else {
            Vec::new()
        };
        let enable_fk = options.enable_foreign_key_enforcement && !issues.foreign_keys_enabled;

        result.statements.extend(index_statements.iter().cloned());
        result.statements.extend(cleanup_statements.iter().cloned());
        if enable_fk {
            result.statements.push("PRAGMA foreign_keys = ON".to_string());
        }
        if options.cleanup_orphaned_records {
            result.orphan_previews = issues
                .orphans
                .iter()
                .map(|o| OrphanPreview {
                    table: o.table.clone(),
                    orphan_count: o.orphan_count,
                    samples: o.samples.clone(),
                })
                .collect();
        }

        if options.dry_run {
            debug!(statements = result.statements.len(), "Dry run, nothing executed");
            return Ok(result);
        }

        for sql in index_statements {
            self.db.execute_batch(&sql).await?;
            result.indexes_created += 1;
            result.executed.push(sql);
        }

        if !cleanup_statements.is_empty() {
            let statements = cleanup_statements.clone();
            result.rows_deleted = self
                .db
                .transaction(move |tx| {
                    let mut deleted = 0u64;
                    for sql in &statements {
                        deleted += tx.execute(sql, [])? as u64;
                    }
                    Ok(deleted)
                })
                .await?;
            result.executed.extend(cleanup_statements);
            warn!(rows = result.rows_deleted, "Orphaned rows deleted");
        }

        if enable_fk {
            self.db.execute_batch("PRAGMA foreign_keys = ON").await?;
            result.executed.push("PRAGMA foreign_keys = ON".to_string());
            result.foreign_keys_enabled = self.foreign_keys_enabled().await?;
        }

        info!(
            executed = result.executed.len(),
            indexes_created = result.indexes_created,
            rows_deleted = result.rows_deleted,
            "Constraint fixes applied"
        );
        Ok(result)
    }

    /// Whether the connection enforces foreign keys.
    pub async fn foreign_keys_enabled(&self) -> SchemaResult<bool> {
        let value = self.db.query_scalar("PRAGMA foreign_keys", vec![]).await?;
        Ok(matches!(value, Some(Value::Integer(1))))
    }

    /// Resolve the parent side of `fk` against the live database, which may
    /// hold tables the snapshot excludes or predates.
    async fn resolve_parent(&self, fk: &ForeignKeyGroup) -> SchemaResult<Parent> {
        let exists = self
            .db
            .query_scalar(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                vec![Value::Text(fk.referenced_table.clone())],
            )
            .await?;
        if exists.is_none() {
            debug!(table = %fk.referenced_table, "Referenced table does not exist");
            return Ok(Parent::Missing);
        }
        if !fk.implicit {
            return Ok(Parent::Columns(fk.referenced_columns.clone()));
        }

        // Unnamed parent columns mean the parent's primary key, else rowid.
        let mut primary_key: Vec<RawColumn> = self
            .db
            .query::<RawColumn>(&queries::columns_query(&fk.referenced_table), vec![])
            .await?
            .into_iter()
            .filter(|c| c.pk > 0)
            .collect();
        primary_key.sort_by_key(|c| c.pk);

        let columns = (0..fk.columns.len())
            .map(|i| {
                primary_key
                    .get(i)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| "rowid".to_string())
            })
            .collect();
        Ok(Parent::Columns(columns))
    }

    async fn check_orphans(
        &self,
        table: &TableSchema,
        fk: &ForeignKeyGroup,
    ) -> SchemaResult<Option<OrphanIssue>> {
        let parent = self.resolve_parent(fk).await?;
        let child = quote_ident(&table.name);
        let condition = orphan_condition("c", fk, &parent);

        let count_sql = format!("SELECT COUNT(*) FROM {} AS c WHERE {}", child, condition);
        let orphan_count = match self.db.query_scalar(&count_sql, vec![]).await? {
            Some(Value::Integer(n)) => n.max(0) as u64,
            _ => 0,
        };
        if orphan_count == 0 {
            return Ok(None);
        }

        let samples = if self.sample_limit > 0 {
            let sample_sql = format!(
                "SELECT c.* FROM {} AS c WHERE {} LIMIT {}",
                child, condition, self.sample_limit
            );
            self.db.query_json(&sample_sql, vec![]).await?
        } else {
            Vec::new()
        };

        Ok(Some(OrphanIssue {
            table: table.name.clone(),
            foreign_key_id: fk.id,
            columns: fk.columns.clone(),
            referenced_table: fk.referenced_table.clone(),
            referenced_columns: match &parent {
                Parent::Columns(columns) => columns.clone(),
                Parent::Missing => fk.referenced_columns.clone(),
            },
            orphan_count,
            samples,
            cleanup_sql: format!(
                "DELETE FROM {} WHERE {}",
                child,
                orphan_condition(&child, fk, &parent)
            ),
        }))
    }
}

/// All columns of one foreign key constraint.
#[derive(Debug, Clone)]
struct ForeignKeyGroup {
    id: i64,
    columns: Vec<String>,
    referenced_table: String,
    referenced_columns: Vec<String>,
    /// Parent columns were left unnamed in the DDL.
    implicit: bool,
}

/// The parent side of a foreign key as it exists right now.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Parent {
    /// No such table.
    Missing,
    /// Parent columns, in constraint order.
    Columns(Vec<String>),
}

fn group_foreign_keys(fks: &[ForeignKeyMetadata]) -> Vec<ForeignKeyGroup> {
    let mut groups: Vec<ForeignKeyGroup> = Vec::new();
    for fk in fks {
        match groups.iter_mut().find(|g| g.id == fk.id) {
            Some(group) => {
                group.columns.push(fk.column.clone());
                group.referenced_columns.push(fk.referenced_column.clone());
                group.implicit |= fk.referenced_column_implicit;
            }
            None => groups.push(ForeignKeyGroup {
                id: fk.id,
                columns: vec![fk.column.clone()],
                referenced_table: fk.referenced_table.clone(),
                referenced_columns: vec![fk.referenced_column.clone()],
                implicit: fk.referenced_column_implicit,
            }),
        }
    }
    groups
}

/// `WHERE` condition selecting orphaned child rows, with child columns
/// qualified by `child`.
fn orphan_condition(child: &str, fk: &ForeignKeyGroup, parent: &Parent) -> String {
    let not_null = fk
        .columns
        .iter()
        .map(|c| format!("{}.{} IS NOT NULL", child, quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");

    // A missing parent table means every non-null key dangles.
    let parent_columns = match parent {
        Parent::Missing => return not_null,
        Parent::Columns(columns) => columns,
    };

    let matches = fk
        .columns
        .iter()
        .zip(parent_columns)
        .map(|(child_col, parent_col)| {
            format!(
                "p.{} = {}.{}",
                parent_column_ref(parent_col),
                child,
                quote_ident(child_col)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    format!(
        "{} AND NOT EXISTS (SELECT 1 FROM {} AS p WHERE {})",
        not_null,
        quote_ident(&fk.referenced_table),
        matches
    )
}

fn parent_column_ref(column: &str) -> String {
    if column.eq_ignore_ascii_case("rowid") {
        "rowid".to_string()
    } else {
        quote_ident(column)
    }
}

fn missing_index(table: &TableSchema, columns: &[String]) -> MissingIndexIssue {
    let index_name = format!("idx_{}_{}", table.name, columns.join("_"));
    let create_sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index_name),
        quote_ident(&table.name),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
    );
    MissingIndexIssue {
        table: table.name.clone(),
        columns: columns.to_vec(),
        index_name,
        create_sql,
    }
}
