//! Ordered, exactly-once SQL migrations for SQLite.
//!
//! Migration files are plain SQL named `<14-digit timestamp>_<description>.sql`.
//! Each one runs in a single transaction together with its row in the
//! `_keel_migrations` tracking table.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_migrate::{
//!     MigrationConfig, MigrationEngine, MigrationManager, ResourceConfig, ResourceManager,
//!     SqliteHistory,
//! };
//! use keel_sqlite::Database;
//!
//! let db = Database::open_url("sqlite://./app.db").await?;
//! let engine = MigrationEngine::new(
//!     MigrationConfig::new().migrations_dir("./migrations"),
//!     SqliteHistory::new(db),
//! );
//! let manager = MigrationManager::new(engine, ResourceManager::new(ResourceConfig::default()));
//!
//! manager.initialize().await?;
//! let report = manager.migrate().await;
//! println!("{} applied", report.executed);
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod file;
pub mod history;
pub mod manager;
pub mod resource;

pub use engine::{
    BatchResult, ChecksumDrift, MigrationConfig, MigrationEngine, MigrationFailure,
    MigrationOutcome, MigrationPlan, MigrationState,
};
pub use error::{MigrateResult, MigrationError};
pub use file::{MigrationFile, MigrationFileManager, compute_checksum};
pub use history::{MIGRATIONS_TABLE, MigrationHistoryRepository, MigrationRecord, SqliteHistory};
pub use manager::{MigrateReport, MigrationManager, MigrationStatus};
pub use resource::{ResourceConfig, ResourceGuard, ResourceManager, ResourceMetrics};
