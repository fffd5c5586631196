//! # keel
//!
//! Schema discovery, migrations, and query-driven index advice for an
//! embedded SQLite database.
//!
//! keel provides:
//! - A live, cached view of the schema read straight from SQLite
//! - Ordered, exactly-once migrations with retries, timeouts and a
//!   bounded number of concurrent runs
//! - Foreign key integrity checks with previewable fixes
//! - Index and PRAGMA recommendations from recorded query timings
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> keel::Result<()> {
//!     keel::logging::init();
//!
//!     let keel = Keel::open(KeelConfig::from_url("sqlite://./app.db")?).await?;
//!     keel.initialize().await?;
//!
//!     let report = keel.migrate().await;
//!     println!("applied {} migration(s)", report.executed);
//!
//!     keel.record_query("SELECT * FROM users WHERE email = ?", 1200.0, None);
//!     for rec in keel.index_recommendations().await {
//!         println!("{}", rec.ddl);
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

pub mod logging;

/// SQLite handle and configuration.
pub mod sqlite {
    pub use keel_sqlite::*;
}

/// Schema discovery and constraint validation.
pub mod schema {
    pub use keel_schema::*;
}

/// Migrations and resource management.
pub mod migrate {
    pub use keel_migrate::*;
}

/// Query recording, index recommendations and PRAGMA tuning.
pub mod optimize {
    pub use keel_optimize::*;
}

use keel_migrate::{
    MigrateReport, MigrationConfig, MigrationEngine, MigrationError, MigrationManager,
    MigrationPlan, MigrationStatus, ResourceConfig, ResourceManager, SqliteHistory,
};
use keel_optimize::{
    AutoIndexer, IndexRecommendation, PragmaSuggestion, QueryRecorder, RecommendOptions,
};
use keel_schema::{
    ConstraintIssues, ConstraintValidator, FixOptions, FixResult, IntrospectionConfig,
    SchemaDiscovery, SchemaError, SchemaSnapshot,
};
use keel_sqlite::{Database, SqliteConfig, SqliteError};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{Keel, KeelConfig};
    pub use keel_migrate::{MigrateReport, MigrationStatus};
    pub use keel_optimize::{IndexRecommendation, Priority, RecommendOptions};
    pub use keel_schema::{ConstraintIssues, FixOptions, SchemaSnapshot, TableSchema};
    pub use keel_sqlite::{Database, SqliteConfig};
}

/// Any error surfaced by the facade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Driver or connection failure.
    #[error(transparent)]
    Sqlite(#[from] SqliteError),
    /// Schema lookup or validation failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Migration failure.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Result type for facade operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Aggregate configuration for [`Keel::open`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    /// Connection settings.
    pub database: SqliteConfig,
    /// Schema discovery settings.
    pub introspection: IntrospectionConfig,
    /// Migration engine settings.
    pub migrations: MigrationConfig,
    /// Concurrency limits for migration runs.
    pub resources: ResourceConfig,
    /// Thresholds for [`Keel::index_recommendations`].
    pub recommend: RecommendOptions,
    /// Distinct query shapes the recorder keeps.
    pub max_patterns: usize,
    /// Orphaned rows sampled per foreign key.
    pub constraint_sample_limit: usize,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            database: SqliteConfig::default(),
            introspection: IntrospectionConfig::default(),
            migrations: MigrationConfig::default(),
            resources: ResourceConfig::default(),
            recommend: RecommendOptions::default(),
            max_patterns: keel_optimize::DEFAULT_MAX_PATTERNS,
            constraint_sample_limit: 5,
        }
    }
}

impl KeelConfig {
    /// Defaults with the database taken from a URL (see [`SqliteConfig::from_url`]).
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self {
            database: SqliteConfig::from_url(url)?,
            ..Default::default()
        })
    }

    /// Set the database configuration.
    pub fn database(mut self, database: SqliteConfig) -> Self {
        self.database = database;
        self
    }

    /// Set the migration configuration.
    pub fn migrations(mut self, migrations: MigrationConfig) -> Self {
        self.migrations = migrations;
        self
    }

    /// Set the resource configuration.
    pub fn resources(mut self, resources: ResourceConfig) -> Self {
        self.resources = resources;
        self
    }

    /// Set the recommendation thresholds.
    pub fn recommend(mut self, recommend: RecommendOptions) -> Self {
        self.recommend = recommend;
        self
    }

    /// Set the introspection configuration.
    pub fn introspection(mut self, introspection: IntrospectionConfig) -> Self {
        self.introspection = introspection;
        self
    }
}

/// Every keel component wired to one database.
#[derive(Debug)]
pub struct Keel {
    db: Database,
    discovery: SchemaDiscovery,
    validator: ConstraintValidator,
    migrations: MigrationManager<SqliteHistory>,
    recorder: QueryRecorder,
    recommend: RecommendOptions,
}

impl Keel {
    /// Open the database and build every component. Does not touch the
    /// migrations directory or tracking table; see [`Keel::initialize`].
    pub async fn open(config: KeelConfig) -> Result<Self> {
        let db = Database::open(config.database).await?;

        let discovery = SchemaDiscovery::with_config(db.clone(), config.introspection);
        let validator =
            ConstraintValidator::new(db.clone()).with_sample_limit(config.constraint_sample_limit);
        let engine = MigrationEngine::new(config.migrations, SqliteHistory::new(db.clone()));
        let migrations = MigrationManager::new(engine, ResourceManager::new(config.resources));

        Ok(Self {
            db,
            discovery,
            validator,
            migrations,
            recorder: QueryRecorder::new(config.max_patterns),
            recommend: config.recommend,
        })
    }

    /// The shared database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The schema discovery engine.
    pub fn discovery(&self) -> &SchemaDiscovery {
        &self.discovery
    }

    /// The migration manager.
    pub fn migrations(&self) -> &MigrationManager<SqliteHistory> {
        &self.migrations
    }

    /// The query recorder.
    pub fn recorder(&self) -> &QueryRecorder {
        &self.recorder
    }

    /// Check connectivity, create the migrations directory and the tracking table.
    pub async fn initialize(&self) -> Result<()> {
        self.migrations.initialize().await?;
        Ok(())
    }

    /// Apply pending migrations. A run that applied anything drops the
    /// cached schema snapshot.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> MigrateReport {
        let report = self.migrations.migrate().await;
        if report.executed > 0 {
            self.discovery.invalidate();
            info!(executed = report.executed, "Schema cache invalidated after migrations");
        }
        report
    }

    /// Migration progress and resource usage.
    pub async fn status(&self) -> Result<MigrationStatus> {
        Ok(self.migrations.status().await?)
    }

    /// Pending migrations, drift and missing files, without applying anything.
    pub async fn plan_migrations(&self) -> Result<MigrationPlan> {
        Ok(self.migrations.plan().await?)
    }

    /// The current schema snapshot (cached within the discovery TTL).
    pub async fn schema(&self) -> Arc<SchemaSnapshot> {
        self.discovery.snapshot().await
    }

    /// Record one executed statement. Returns `false` if the recorder is full.
    pub fn record_query(&self, sql: &str, duration_ms: f64, table: Option<&str>) -> bool {
        self.recorder.record_query(sql, duration_ms, table)
    }

    /// Index recommendations for everything recorded so far, using the
    /// configured thresholds.
    pub async fn index_recommendations(&self) -> Vec<IndexRecommendation> {
        self.index_recommendations_with(&self.recommend).await
    }

    /// Index recommendations with explicit thresholds, revalidated against
    /// a fresh snapshot.
    pub async fn index_recommendations_with(
        &self,
        options: &RecommendOptions,
    ) -> Vec<IndexRecommendation> {
        let snapshot = self.discovery.snapshot().await;
        let patterns = self.recorder.patterns();
        AutoIndexer::analyze_and_recommend(&snapshot, &patterns, options)
            .into_iter()
            .filter(|rec| AutoIndexer::revalidate(rec, &snapshot))
            .collect()
    }

    /// Orphaned rows and unindexed foreign keys.
    pub async fn constraint_issues(&self) -> Result<ConstraintIssues> {
        let snapshot = self.discovery.snapshot().await;
        Ok(self.validator.plan(&snapshot).await?)
    }

    /// Preview or apply fixes for `issues`. Created indexes drop the cached snapshot.
    pub async fn fix_constraints(
        &self,
        issues: &ConstraintIssues,
        options: FixOptions,
    ) -> Result<FixResult> {
        let result = self.validator.apply_fixes(issues, options).await?;
        if result.indexes_created > 0 {
            self.discovery.invalidate();
        }
        Ok(result)
    }

    /// PRAGMA changes suggested for the recorded workload.
    pub async fn pragma_suggestions(&self) -> Result<Vec<PragmaSuggestion>> {
        let settings = keel_optimize::read_pragma_settings(&self.db).await?;
        Ok(keel_optimize::suggest_pragmas(&settings, &self.recorder.patterns()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn keel_in(dir: &std::path::Path) -> Keel {
        let config = KeelConfig::default()
            .database(SqliteConfig::memory())
            .migrations(MigrationConfig::new().migrations_dir(dir.join("migrations")));
        Keel::open(config).await.unwrap()
    }

    #[test]
    fn test_config_from_partial_json() {
        let json = r#"{"max_patterns": 50, "resources": {"max_concurrent": 2}}"#;
        let config: KeelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_patterns, 50);
        assert_eq!(config.resources.max_concurrent, 2);
        assert_eq!(config.resources.slot_timeout_ms, 300_000);
        assert_eq!(config.constraint_sample_limit, 5);
        assert!(config.database.foreign_keys);
    }

    #[test]
    fn test_config_from_url() {
        let config = KeelConfig::from_url("sqlite::memory:").unwrap();
        assert!(config.database.path.is_memory());
        assert_eq!(config.max_patterns, keel_optimize::DEFAULT_MAX_PATTERNS);
    }

    #[tokio::test]
    async fn test_initialize_creates_migrations_dir() {
        let dir = tempfile::tempdir().unwrap();
        let keel = keel_in(dir.path()).await;
        keel.initialize().await.unwrap();
        assert!(dir.path().join("migrations").is_dir());

        let status = keel.status().await.unwrap();
        assert_eq!(status.total_files, 0);
        assert!(status.is_up_to_date());
        assert!(keel.schema().await.is_empty());
    }

    #[tokio::test]
    async fn test_fix_constraints_refreshes_schema() {
        let dir = tempfile::tempdir().unwrap();
        let keel = keel_in(dir.path()).await;
        keel.database()
            .execute_batch(
                "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE books (
                     id INTEGER PRIMARY KEY,
                     author_id INTEGER REFERENCES authors(id)
                 );",
            )
            .await
            .unwrap();

        let issues = keel.constraint_issues().await.unwrap();
        assert!(issues.integrity_holds());
        assert_eq!(issues.missing_indexes.len(), 1);
        assert!(keel.schema().await.table("books").unwrap().indexes.is_empty());

        let preview = keel.fix_constraints(&issues, FixOptions::default()).await.unwrap();
        assert!(preview.dry_run);
        assert!(preview.executed.is_empty());

        let mut options = FixOptions::default().execute();
        options.create_missing_indexes = true;
        let result = keel.fix_constraints(&issues, options).await.unwrap();
        assert_eq!(result.indexes_created, 1);

        let books = keel.schema().await.table("books").cloned().unwrap();
        assert!(books.has_leading_index("author_id"));
    }

    #[tokio::test]
    async fn test_recorded_queries_reach_recommendations() {
        let dir = tempfile::tempdir().unwrap();
        let keel = keel_in(dir.path()).await;
        keel.database()
            .execute("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT, at INTEGER)", vec![])
            .await
            .unwrap();

        for i in 0..6 {
            let sql = format!("SELECT * FROM events WHERE kind = 'k{i}'");
            assert!(keel.record_query(&sql, 1500.0, None));
        }
        assert_eq!(keel.recorder().len(), 1);

        let recs = keel.index_recommendations().await;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].table, "events");
        assert_eq!(recs[0].columns, vec!["kind".to_string()]);
        let stricter = RecommendOptions::default().min_frequency(7);
        assert!(keel.index_recommendations_with(&stricter).await.is_empty());

        let pragmas = keel.pragma_suggestions().await.unwrap();
        assert!(pragmas.iter().any(|s| s.name == "analyze"));
    }
}
