//! Shared SQLite connection handle.
//!
//! A single-file database serializes writers anyway, so keel keeps exactly one
//! `tokio_rusqlite` connection per database and hands out cheap clones of the
//! handle. Every call is executed in order on the connection's worker thread,
//! which gives migrations the one-transaction-at-a-time behaviour they need.

use std::sync::Arc;

use rusqlite::types::Value;
use serde_json::Value as JsonValue;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::config::SqliteConfig;
use crate::error::{SqliteError, SqliteResult};
use crate::row::{FromSqliteRow, FromSqliteRowError};

/// Cloneable handle to one SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Connection>,
    config: Arc<SqliteConfig>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.config.path_str())
            .finish()
    }
}

impl Database {
    /// Open a database with the given configuration and apply its pragmas.
    pub async fn open(config: SqliteConfig) -> SqliteResult<Self> {
        let conn = if config.path.is_memory() {
            Connection::open_in_memory().await?
        } else {
            Connection::open(config.path_str()).await?
        };

        let init_sql = config.init_sql();
        conn.call(move |conn| {
            conn.execute_batch(&init_sql)?;
            Ok(())
        })
        .await?;

        info!(path = %config.path_str(), "SQLite database opened");

        Ok(Self {
            conn: Arc::new(conn),
            config: Arc::new(config),
        })
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> SqliteResult<Self> {
        Self::open(SqliteConfig::memory()).await
    }

    /// Parse a URL (see [`SqliteConfig::from_url`]) and open it.
    pub async fn open_url(url: &str) -> SqliteResult<Self> {
        Self::open(SqliteConfig::from_url(url)?).await
    }

    /// The configuration this database was opened with.
    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Round-trip a trivial statement to verify the connection is alive.
    pub async fn ping(&self) -> SqliteResult<()> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
            .map_err(|e| SqliteError::connection(e.to_string()))
    }

    /// Run a query and decode every row with [`FromSqliteRow`].
    pub async fn query<T>(&self, sql: &str, params: Vec<Value>) -> SqliteResult<Vec<T>>
    where
        T: FromSqliteRow + Send + 'static,
    {
        let sql = sql.to_string();
        debug!(sql = %sql, "Executing query");

        let decoded = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let params_ref: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
                let mut rows = stmt.query(params_ref.as_slice())?;

                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    match T::from_row(row) {
                        Ok(value) => out.push(value),
                        Err(e) => return Ok(Err(e)),
                    }
                }
                Ok(Ok(out))
            })
            .await?;

        decoded.map_err(|e: FromSqliteRowError| SqliteError::decode(e.to_string()))
    }

    /// Run a query and return every row as a JSON object.
    pub async fn query_json(&self, sql: &str, params: Vec<Value>) -> SqliteResult<Vec<JsonValue>> {
        self.query::<JsonValue>(sql, params).await
    }

    /// Run a query and return the first column of the first row, if any.
    pub async fn query_scalar(&self, sql: &str, params: Vec<Value>) -> SqliteResult<Option<Value>> {
        let sql = sql.to_string();
        debug!(sql = %sql, "Executing scalar query");

        self.conn
            .call(move |conn| {
                let params_ref: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
                let result =
                    conn.query_row(&sql, params_ref.as_slice(), |row| row.get::<_, Value>(0));

                match result {
                    Ok(value) => Ok(Some(value)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(tokio_rusqlite::Error::Rusqlite(e)),
                }
            })
            .await
            .map_err(SqliteError::from)
    }

    /// Execute a statement with parameters and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> SqliteResult<usize> {
        let sql = sql.to_string();
        debug!(sql = %sql, "Executing statement");

        self.conn
            .call(move |conn| {
                let params_ref: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
                Ok(conn.execute(&sql, params_ref.as_slice())?)
            })
            .await
            .map_err(SqliteError::from)
    }

    /// Execute multiple statements in a batch.
    pub async fn execute_batch(&self, sql: &str) -> SqliteResult<()> {
        let sql = sql.to_string();
        debug!(sql = %sql, "Executing batch");

        self.conn
            .call(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
            .map_err(SqliteError::from)
    }

    /// Run `f` inside a transaction that commits only if `f` succeeds.
    ///
    /// Any error returned by `f` (or by the commit) rolls the transaction back
    /// when the transaction is dropped.
    pub async fn transaction<F, R>(&self, f: F) -> SqliteResult<R>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let out = f(&tx)?;
                tx.commit()?;
                Ok(out)
            })
            .await
            .map_err(SqliteError::from)
    }
}
