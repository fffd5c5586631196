//! Migration history tracking.

use chrono::{DateTime, Utc};
use keel_sqlite::row::column;
use keel_sqlite::{Database, FromSqliteRow, FromSqliteRowError, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{MigrateResult, MigrationError};

/// Name of the tracking table.
pub const MIGRATIONS_TABLE: &str = "_keel_migrations";

/// SQL for initializing the tracking table.
pub const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "_keel_migrations" (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL,
    checksum TEXT NOT NULL
);
"#;

const INSERT_SQL: &str =
    r#"INSERT INTO "_keel_migrations" (id, name, applied_at, checksum) VALUES (?1, ?2, ?3, ?4)"#;

/// A record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Random UUID.
    pub id: String,
    /// Migration name (file stem).
    pub name: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
    /// Checksum of the content that was applied.
    pub checksum: String,
}

impl MigrationRecord {
    /// A new record stamped now.
    pub fn new(name: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            applied_at: Utc::now(),
            checksum: checksum.into(),
        }
    }
}

impl FromSqliteRow for MigrationRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, FromSqliteRowError> {
        let applied_at: String = column(row, "applied_at")?;
        let applied_at = DateTime::parse_from_rfc3339(&applied_at)
            .map_err(|e| FromSqliteRowError::with_column(e.to_string(), "applied_at"))?
            .with_timezone(&Utc);

        Ok(Self {
            id: column(row, "id")?,
            name: column(row, "name")?,
            applied_at,
            checksum: column(row, "checksum")?,
        })
    }
}

/// Migration history repository.
#[async_trait::async_trait]
pub trait MigrationHistoryRepository: Send + Sync {
    /// Check connectivity and create the tracking table if needed.
    async fn initialize(&self) -> MigrateResult<()>;

    /// All applied migrations, ordered by name.
    async fn get_applied(&self) -> MigrateResult<Vec<MigrationRecord>>;

    /// Check if a migration has been applied.
    async fn is_applied(&self, name: &str) -> MigrateResult<bool>;

    /// Get the last applied migration.
    async fn get_last_applied(&self) -> MigrateResult<Option<MigrationRecord>>;

    /// Run `sql` and record `name` as applied, atomically.
    async fn apply(&self, name: &str, sql: &str, checksum: &str) -> MigrateResult<MigrationRecord>;
}

/// History stored in the `_keel_migrations` table.
#[derive(Debug, Clone)]
pub struct SqliteHistory {
    db: Database,
}

impl SqliteHistory {
    /// Create a repository on a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait::async_trait]
impl MigrationHistoryRepository for SqliteHistory {
    #[instrument(skip(self))]
    async fn initialize(&self) -> MigrateResult<()> {
        self.db.ping().await?;
        self.db.execute_batch(INIT_SQL).await?;
        debug!(table = MIGRATIONS_TABLE, "Tracking table ready");
        Ok(())
    }

    async fn get_applied(&self) -> MigrateResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT id, name, applied_at, checksum FROM \"{}\" ORDER BY name",
            MIGRATIONS_TABLE
        );
        Ok(self.db.query::<MigrationRecord>(&sql, vec![]).await?)
    }

    async fn is_applied(&self, name: &str) -> MigrateResult<bool> {
        let sql = format!("SELECT 1 FROM \"{}\" WHERE name = ?1", MIGRATIONS_TABLE);
        let found = self
            .db
            .query_scalar(&sql, vec![Value::Text(name.to_string())])
            .await?;
        Ok(found.is_some())
    }

    async fn get_last_applied(&self) -> MigrateResult<Option<MigrationRecord>> {
        let sql = format!(
            "SELECT id, name, applied_at, checksum FROM \"{}\" ORDER BY name DESC LIMIT 1",
            MIGRATIONS_TABLE
        );
        Ok(self.db.query::<MigrationRecord>(&sql, vec![]).await?.into_iter().next())
    }

    #[instrument(skip(self, sql, checksum))]
    async fn apply(&self, name: &str, sql: &str, checksum: &str) -> MigrateResult<MigrationRecord> {
        let record = MigrationRecord::new(name, checksum);
        let sql = sql.to_string();
        let row = record.clone();

        self.db
            .transaction(move |tx| {
                tx.execute_batch(&sql)?;
                tx.execute(
                    INSERT_SQL,
                    rusqlite::params![row.id, row.name, row.applied_at.to_rfc3339(), row.checksum],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| MigrationError::database(e.to_string()))?;

        info!(migration = %record.name, "Migration committed");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn history() -> SqliteHistory {
        let history = SqliteHistory::new(Database::open_in_memory().await.unwrap());
        history.initialize().await.unwrap();
        history
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let history = history().await;
        history.initialize().await.unwrap();
        assert!(history.get_applied().await.unwrap().is_empty());
        assert!(history.get_last_applied().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_records_once() {
        let history = history().await;
        let record = history
            .apply("20240101000000_init", "CREATE TABLE a (id INTEGER);", "abc")
            .await
            .unwrap();
        assert_eq!(record.name, "20240101000000_init");
        assert_eq!(uuid::Uuid::parse_str(&record.id).unwrap().get_version_num(), 4);
        assert!(history.is_applied("20240101000000_init").await.unwrap());

        let applied = history.get_applied().await.unwrap();
        assert_eq!(applied, vec![record.clone()]);

        // Re-applying the same name violates the UNIQUE constraint and rolls back.
        let err = history
            .apply("20240101000000_init", "CREATE TABLE b (id INTEGER);", "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Database(_)));
        let b_exists = history
            .database()
            .query_scalar("SELECT 1 FROM sqlite_master WHERE name = 'b'", vec![])
            .await
            .unwrap();
        assert!(b_exists.is_none());
    }

    #[tokio::test]
    async fn test_failed_sql_leaves_no_record() {
        let history = history().await;
        let err = history
            .apply("20240101000000_bad", "CREATE TABLE ok (id INTEGER); CREAT TABLE", "x")
            .await;
        assert!(err.is_err());
        assert!(!history.is_applied("20240101000000_bad").await.unwrap());
        let ok_exists = history
            .database()
            .query_scalar("SELECT 1 FROM sqlite_master WHERE name = 'ok'", vec![])
            .await
            .unwrap();
        assert!(ok_exists.is_none());
    }

    #[tokio::test]
    async fn test_last_applied_by_name() {
        let history = history().await;
        history.apply("20240102000000_b", "CREATE TABLE b (id INTEGER);", "b").await.unwrap();
        history.apply("20240101000000_a", "CREATE TABLE a (id INTEGER);", "a").await.unwrap();
        let last = history.get_last_applied().await.unwrap().unwrap();
        assert_eq!(last.name, "20240102000000_b");
    }
}
