//! SQLite access layer for keel.
//!
//! This crate wraps a single `tokio-rusqlite` connection behind a cloneable
//! [`Database`] handle. All schema discovery, migration, and optimizer
//! components talk to SQLite through it.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_sqlite::{Database, SqliteConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open(SqliteConfig::from_url("sqlite://./app.db")?).await?;
//!     db.ping().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod row;
pub mod types;

pub use config::{DatabasePath, JournalMode, SqliteConfig, SynchronousMode};
pub use connection::Database;
pub use error::{SqliteError, SqliteResult};
pub use row::{FromSqliteRow, FromSqliteRowError};

pub use rusqlite::types::Value;

/// Quote an identifier for interpolation into SQL (`"name"`, inner quotes doubled).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
