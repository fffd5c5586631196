//! Live schema discovery and referential-integrity checks for SQLite.
//!
//! - [`SchemaDiscovery`] builds an immutable [`SchemaSnapshot`] from
//!   `sqlite_master` and the table/index PRAGMAs, cached with a short TTL.
//! - [`ConstraintValidator`] finds orphaned rows and unindexed foreign keys,
//!   previews fixes and applies them on request.
//! - [`find_by_column`] and [`RuleSet`] check names and records against the
//!   discovered schema.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_schema::{ConstraintValidator, SchemaDiscovery};
//! use keel_sqlite::Database;
//!
//! let db = Database::open_url("sqlite://./app.db").await?;
//! let discovery = SchemaDiscovery::new(db.clone());
//! let snapshot = discovery.snapshot().await;
//!
//! let issues = ConstraintValidator::new(db).plan(&snapshot).await?;
//! println!("{} orphaned rows", issues.total_orphans());
//! ```

pub mod constraints;
pub mod discovery;
pub mod error;
pub mod lookup;
pub mod queries;
pub mod rules;
pub mod types;

pub use constraints::{
    ConstraintIssues, ConstraintValidator, FixOptions, FixResult, MissingIndexIssue, OrphanIssue,
    OrphanPreview,
};
pub use discovery::{DEFAULT_EXCLUDED_TABLES, IntrospectionConfig, SchemaDiscovery};
pub use error::{SchemaError, SchemaResult};
pub use lookup::find_by_column;
pub use rules::{Rule, RuleFn, RuleSet};
pub use types::{
    ColumnMetadata, ForeignKeyMetadata, IndexMetadata, IndexOrigin, ReferentialAction,
    SchemaSnapshot, TableSchema,
};
