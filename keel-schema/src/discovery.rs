//! Live schema discovery.
//!
//! [`SchemaDiscovery`] introspects the database through `sqlite_master` and
//! the table/index PRAGMAs and caches the resulting [`SchemaSnapshot`] for a
//! bounded time. A facet that fails to load (columns, foreign keys, indexes)
//! is logged and left empty; the rest of the snapshot is still built.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_sqlite::{Database, FromSqliteRow};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{SchemaError, SchemaResult};
use crate::queries::{self, RawColumn, RawForeignKey, RawIndex, RawIndexColumn, RawTable};
use crate::types::{
    ColumnMetadata, ForeignKeyMetadata, IndexMetadata, IndexOrigin, ReferentialAction,
    SchemaSnapshot, TableSchema,
};

/// Tables hidden from discovery unless configured otherwise.
pub const DEFAULT_EXCLUDED_TABLES: &[&str] = &["_keel_migrations"];

/// Configuration for schema discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrospectionConfig {
    /// Tables to leave out of the snapshot.
    pub exclude_tables: Vec<String>,
    /// Include `sqlite_*` internal tables.
    pub include_internal: bool,
    /// How long a snapshot is served from cache.
    pub cache_ttl_ms: u64,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            exclude_tables: DEFAULT_EXCLUDED_TABLES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            include_internal: false,
            cache_ttl_ms: 5_000,
        }
    }
}

impl IntrospectionConfig {
    /// Exclude another table.
    pub fn exclude_table(mut self, table: impl Into<String>) -> Self {
        self.exclude_tables.push(table.into());
        self
    }

    /// Include or hide `sqlite_*` internal tables.
    pub fn include_internal(mut self, include: bool) -> Self {
        self.include_internal = include;
        self
    }

    /// Set the snapshot cache TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// The snapshot cache TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    fn is_excluded(&self, table: &str) -> bool {
        self.exclude_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
    }
}

struct CachedSnapshot {
    snapshot: Arc<SchemaSnapshot>,
    fetched_at: Instant,
}

/// Discovers and caches the live schema.
pub struct SchemaDiscovery {
    db: Database,
    config: IntrospectionConfig,
    cache: RwLock<Option<CachedSnapshot>>,
}

impl std::fmt::Debug for SchemaDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaDiscovery")
            .field("db", &self.db)
            .field("config", &self.config)
            .field("cached", &self.cache.read().is_some())
            .finish()
    }
}

impl SchemaDiscovery {
    /// Create a discovery engine with the default configuration.
    pub fn new(db: Database) -> Self {
        Self::with_config(db, IntrospectionConfig::default())
    }

    /// Create a discovery engine with a custom configuration.
    pub fn with_config(db: Database, config: IntrospectionConfig) -> Self {
        Self {
            db,
            config,
            cache: RwLock::new(None),
        }
    }

    /// The database being introspected.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The discovery configuration.
    pub fn config(&self) -> &IntrospectionConfig {
        &self.config
    }

    /// Return the cached snapshot if it is still fresh, otherwise rediscover.
    pub async fn snapshot(&self) -> Arc<SchemaSnapshot> {
        match self.cached() {
            Some(snapshot) => snapshot,
            None => self.discover().await,
        }
    }

    /// The cached snapshot, if present and younger than the TTL.
    pub fn cached(&self) -> Option<Arc<SchemaSnapshot>> {
        let ttl = self.config.ttl();
        self.cache
            .read()
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < ttl)
            .map(|c| Arc::clone(&c.snapshot))
    }

    /// Drop the cached snapshot so the next read rediscovers.
    pub fn invalidate(&self) {
        if self.cache.write().take().is_some() {
            debug!("Schema snapshot invalidated");
        }
    }

    /// Look up one table in the current snapshot.
    pub async fn table(&self, name: &str) -> SchemaResult<TableSchema> {
        let snapshot = self.snapshot().await;
        snapshot
            .table(name)
            .cloned()
            .ok_or_else(|| SchemaError::unknown_table(name, snapshot.table_names()))
    }

    /// Introspect the database and replace the cached snapshot.
    ///
    /// If the table listing itself fails, an empty snapshot is returned and
    /// the cache is left untouched.
    #[instrument(skip(self))]
    pub async fn discover(&self) -> Arc<SchemaSnapshot> {
        let raw_tables = match self
            .db
            .query::<RawTable>(&queries::tables_query(self.config.include_internal), vec![])
            .await
        {
            Ok(tables) => tables,
            Err(e) => {
                let err = SchemaError::discovery("*", "tables", e);
                warn!(error = %err, "Table listing failed, returning an empty schema");
                return Arc::new(SchemaSnapshot::empty());
            }
        };

        let mut tables = Vec::with_capacity(raw_tables.len());
        for raw in raw_tables {
            if self.config.is_excluded(&raw.name) {
                debug!(table = %raw.name, "Skipping excluded table");
                continue;
            }
            tables.push(self.discover_table(raw).await);
        }

        resolve_implicit_references(&mut tables);

        let snapshot = Arc::new(SchemaSnapshot::new(tables));
        info!(tables = snapshot.len(), "Schema discovered");

        *self.cache.write() = Some(CachedSnapshot {
            snapshot: Arc::clone(&snapshot),
            fetched_at: Instant::now(),
        });

        snapshot
    }

    async fn discover_table(&self, raw: RawTable) -> TableSchema {
        let name = raw.name;
        let ddl = raw.sql.unwrap_or_default();
        let without_rowid = queries::declares_without_rowid(&ddl);
        let explicit_autoincrement = queries::declares_autoincrement(&ddl);

        let raw_columns: Vec<RawColumn> = self
            .facet(&name, "columns", queries::columns_query(&name))
            .await;
        let raw_fks: Vec<RawForeignKey> = self
            .facet(&name, "foreign keys", queries::foreign_keys_query(&name))
            .await;
        let raw_indexes: Vec<RawIndex> = self
            .facet(&name, "indexes", queries::indexes_query(&name))
            .await;

        let mut pk_columns: Vec<&RawColumn> = raw_columns.iter().filter(|c| c.pk > 0).collect();
        pk_columns.sort_by_key(|c| c.pk);
        let primary_key: Vec<String> = pk_columns.iter().map(|c| c.name.clone()).collect();

        let rowid_alias = match pk_columns.as_slice() {
            [only] if !without_rowid && only.declared_type.eq_ignore_ascii_case("INTEGER") => {
                Some(only.name.clone())
            }
            _ => None,
        };

        let columns = raw_columns
            .iter()
            .map(|c| {
                let is_alias = rowid_alias.as_deref() == Some(c.name.as_str());
                let implied_not_null = is_alias || (without_rowid && c.pk > 0);
                ColumnMetadata {
                    name: c.name.clone(),
                    declared_type: c.declared_type.clone(),
                    nullable: !c.not_null && !implied_not_null,
                    primary_key: c.pk > 0,
                    primary_key_position: c.pk as u32,
                    auto_increment: is_alias
                        || (explicit_autoincrement && primary_key.len() == 1 && c.pk == 1),
                    default_value: c.default_value.clone(),
                }
            })
            .collect();

        let mut foreign_keys: Vec<ForeignKeyMetadata> = raw_fks
            .into_iter()
            .map(|fk| ForeignKeyMetadata {
                id: fk.id,
                seq: fk.seq,
                column: fk.from,
                referenced_table: fk.table,
                referenced_column_implicit: fk.to.is_none(),
                referenced_column: fk.to.unwrap_or_default(),
                on_update: ReferentialAction::parse(&fk.on_update),
                on_delete: ReferentialAction::parse(&fk.on_delete),
            })
            .collect();
        foreign_keys.sort_by_key(|fk| (fk.id, fk.seq));

        let mut indexes = Vec::with_capacity(raw_indexes.len());
        for idx in raw_indexes {
            let mut index_columns: Vec<RawIndexColumn> = self
                .facet(&name, "index columns", queries::index_columns_query(&idx.name))
                .await;
            index_columns.sort_by_key(|c| c.seqno);

            indexes.push(IndexMetadata {
                columns: index_columns.into_iter().filter_map(|c| c.name).collect(),
                unique: idx.unique,
                origin: IndexOrigin::parse(&idx.origin),
                partial: idx.partial,
                name: idx.name,
            });
        }

        debug!(
            table = %name,
            columns = raw_columns.len(),
            foreign_keys = foreign_keys.len(),
            indexes = indexes.len(),
            "Table introspected"
        );

        TableSchema {
            name,
            columns,
            primary_key,
            foreign_keys,
            indexes,
            without_rowid,
        }
    }

    async fn facet<T>(&self, table: &str, facet: &'static str, sql: String) -> Vec<T>
    where
        T: FromSqliteRow + Send + 'static,
    {
        match self.db.query::<T>(&sql, vec![]).await {
            Ok(rows) => rows,
            Err(e) => {
                let err = SchemaError::discovery(table, facet, e);
                warn!(error = %err, "Introspection facet failed, continuing without it");
                Vec::new()
            }
        }
    }
}

/// Fill in parent columns SQLite left unnamed: the parent's primary key
/// column at the same position, or `rowid` when it has none.
fn resolve_implicit_references(tables: &mut [TableSchema]) {
    let primary_keys: Vec<(String, Vec<String>)> = tables
        .iter()
        .map(|t| (t.name.clone(), t.primary_key.clone()))
        .collect();

    for table in tables.iter_mut() {
        for fk in table.foreign_keys.iter_mut().filter(|fk| fk.referenced_column_implicit) {
            let parent_pk = primary_keys
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&fk.referenced_table))
                .map(|(_, pk)| pk);

            fk.referenced_column = parent_pk
                .and_then(|pk| pk.get(fk.seq as usize))
                .cloned()
                .unwrap_or_else(|| "rowid".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn db_with(ddl: &str) -> Database {
        let db = Database::open_in_memory().await.unwrap();
        db.execute_batch(ddl).await.unwrap();
        db
    }

    /// Make every statement longer than `max` bytes fail to prepare.
    async fn cap_statement_length(db: &Database, max: i32) {
        db.transaction(move |tx| {
            let _ = tx.set_limit(rusqlite::limits::Limit::SQLITE_LIMIT_SQL_LENGTH, max);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_discovers_columns_and_keys() {
        let db = db_with(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL,
                nickname TEXT DEFAULT 'anon'
            );
            CREATE TABLE posts (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title TEXT
            );
            CREATE UNIQUE INDEX idx_users_email ON users(email);",
        )
        .await;

        let discovery = SchemaDiscovery::new(db);
        let snapshot = discovery.discover().await;
        assert_eq!(snapshot.table_names(), vec!["posts".to_string(), "users".to_string()]);

        let users = snapshot.table("users").unwrap();
        let id = users.column("id").unwrap();
        assert!(id.primary_key);
        assert!(id.auto_increment);
        assert!(!id.nullable);
        assert!(!users.column("email").unwrap().nullable);
        let nickname = users.column("nickname").unwrap();
        assert!(nickname.nullable);
        assert_eq!(nickname.default_value.as_deref(), Some("'anon'"));
        assert_eq!(users.primary_key, vec!["id".to_string()]);

        let index = users
            .indexes
            .iter()
            .find(|i| i.name == "idx_users_email")
            .unwrap();
        assert!(index.unique);
        assert_eq!(index.origin, IndexOrigin::CreateIndex);
        assert_eq!(index.columns, vec!["email".to_string()]);

        let posts = snapshot.table("posts").unwrap();
        assert!(posts.column("id").unwrap().auto_increment);
        assert_eq!(posts.foreign_keys.len(), 1);
        let fk = &posts.foreign_keys[0];
        assert_eq!(fk.column, "user_id");
        assert_eq!(fk.referenced_table, "users");
        assert_eq!(fk.referenced_column, "id");
        assert!(!fk.referenced_column_implicit);
        assert_eq!(fk.on_delete, ReferentialAction::Cascade);
    }

    #[tokio::test]
    async fn test_implicit_reference_resolution() {
        let db = db_with(
            "CREATE TABLE parents (code TEXT PRIMARY KEY);
             CREATE TABLE keyless (label TEXT);
             CREATE TABLE children (
                parent_code TEXT REFERENCES parents,
                keyless_ref INTEGER REFERENCES keyless
             );",
        )
        .await;

        let snapshot = SchemaDiscovery::new(db).discover().await;
        let children = snapshot.table("children").unwrap();

        let to_parent = children
            .foreign_keys
            .iter()
            .find(|fk| fk.column == "parent_code")
            .unwrap();
        assert_eq!(to_parent.referenced_column, "code");
        assert!(to_parent.referenced_column_implicit);

        let to_keyless = children
            .foreign_keys
            .iter()
            .find(|fk| fk.column == "keyless_ref")
            .unwrap();
        assert_eq!(to_keyless.referenced_column, "rowid");
    }

    #[tokio::test]
    async fn test_non_alias_primary_keys() {
        let db = db_with(
            "CREATE TABLE tags (name TEXT PRIMARY KEY, weight INT);
             CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID;
             CREATE TABLE pairs (a INTEGER, b INTEGER, PRIMARY KEY (b, a));",
        )
        .await;
        let snapshot = SchemaDiscovery::new(db).discover().await;

        let tags = snapshot.table("tags").unwrap();
        let name = tags.column("name").unwrap();
        assert!(name.primary_key);
        assert!(!name.auto_increment);
        assert!(name.nullable);
        assert!(tags.indexes.iter().any(|i| i.origin == IndexOrigin::PrimaryKey));

        let kv = snapshot.table("kv").unwrap();
        assert!(kv.without_rowid);
        assert!(!kv.column("k").unwrap().nullable);

        let pairs = snapshot.table("pairs").unwrap();
        assert_eq!(pairs.primary_key, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(pairs.column("a").unwrap().primary_key_position, 2);
        assert!(!pairs.column("a").unwrap().auto_increment);
    }

    #[tokio::test]
    async fn test_excludes_tracking_table_and_internals() {
        let db = db_with(
            "CREATE TABLE _keel_migrations (id TEXT PRIMARY KEY);
             CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT);",
        )
        .await;
        let snapshot = SchemaDiscovery::new(db.clone()).discover().await;
        assert_eq!(snapshot.table_names(), vec!["items".to_string()]);

        let config = IntrospectionConfig {
            exclude_tables: vec![],
            include_internal: true,
            ..Default::default()
        };
        let snapshot = SchemaDiscovery::with_config(db, config).discover().await;
        assert!(snapshot.table("sqlite_sequence").is_some());
        assert!(snapshot.table("_keel_migrations").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_cache_and_invalidate() {
        let db = db_with("CREATE TABLE a (id INTEGER PRIMARY KEY);").await;
        let discovery = SchemaDiscovery::with_config(
            db.clone(),
            IntrospectionConfig::default().cache_ttl(Duration::from_secs(60)),
        );

        let first = discovery.snapshot().await;
        db.execute_batch("CREATE TABLE b (id INTEGER PRIMARY KEY);")
            .await
            .unwrap();

        let cached = discovery.snapshot().await;
        assert!(Arc::ptr_eq(&first, &cached));
        assert_eq!(cached.len(), 1);

        discovery.invalidate();
        assert!(discovery.cached().is_none());
        let fresh = discovery.snapshot().await;
        assert_eq!(fresh.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_rediscovers() {
        let db = db_with("CREATE TABLE a (id INTEGER PRIMARY KEY);").await;
        let discovery = SchemaDiscovery::with_config(
            db,
            IntrospectionConfig::default().cache_ttl(Duration::ZERO),
        );
        let first = discovery.snapshot().await;
        let second = discovery.snapshot().await;
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_table_lookup_suggests_alternatives() {
        let db = db_with("CREATE TABLE users (id INTEGER PRIMARY KEY);").await;
        let discovery = SchemaDiscovery::new(db);
        assert!(discovery.table("USERS").await.is_ok());

        let err = discovery.table("user").await.unwrap_err();
        let SchemaError::UnknownTable { ref suggestion, .. } = err else {
            panic!("expected UnknownTable, got {err:?}");
        };
        assert_eq!(suggestion.as_deref(), Some("users"));
    }

    #[tokio::test]
    async fn test_failed_facets_degrade_to_empty() {
        let long = "t".repeat(120);
        let db = db_with(&format!(
            "CREATE TABLE short (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE \"{long}\" (
                 id INTEGER PRIMARY KEY,
                 short_id INTEGER REFERENCES short(id)
             );
             CREATE INDEX idx_long_short ON \"{long}\" (short_id);"
        ))
        .await;
        // Listing stays under the cap, PRAGMAs on the long name do not.
        cap_statement_length(&db, 110).await;

        let snapshot = SchemaDiscovery::new(db).discover().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.table("short").unwrap().column_names(),
            vec!["id".to_string(), "name".to_string()]
        );

        let degraded = snapshot.table(&long).unwrap();
        assert!(degraded.columns.is_empty());
        assert!(degraded.foreign_keys.is_empty());
        assert!(degraded.indexes.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_returns_empty_and_keeps_cache() {
        let db = db_with("CREATE TABLE users (id INTEGER PRIMARY KEY);").await;
        let discovery = SchemaDiscovery::new(db.clone());
        let first = discovery.discover().await;
        assert_eq!(first.len(), 1);

        cap_statement_length(&db, 40).await;
        let failed = discovery.discover().await;
        assert!(failed.is_empty());

        let cached = discovery.cached().unwrap();
        assert!(Arc::ptr_eq(&cached, &first));
        assert!(Arc::ptr_eq(&discovery.snapshot().await, &first));
    }
}
