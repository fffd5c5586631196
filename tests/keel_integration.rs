//! Integration tests for the `Keel` facade.
//!
//! Each test runs against a SQLite file in a temporary directory, with
//! migrations read from a sibling directory.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use keel::migrate::{MigrationConfig, MigrationError, ResourceConfig, ResourceManager};
use keel::prelude::*;
use keel::schema::ReferentialAction;
use pretty_assertions::assert_eq;

async fn open(dir: &Path, database: SqliteConfig) -> Keel {
    let config = KeelConfig::default()
        .database(database)
        .migrations(
            MigrationConfig::new()
                .migrations_dir(dir.join("migrations"))
                .max_retries(0)
                .retry_backoff(Duration::from_millis(1)),
        );
    let keel = Keel::open(config).await.expect("open");
    keel.initialize().await.expect("initialize");
    keel
}

async fn open_file(dir: &Path) -> Keel {
    open(dir, SqliteConfig::file(dir.join("app.db"))).await
}

fn write_migration(dir: &Path, file_name: &str, sql: &str) {
    let migrations = dir.join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    std::fs::write(migrations.join(file_name), sql).unwrap();
}

/// Discovered columns, keys and foreign keys match the DDL
#[tokio::test]
async fn test_discovery_matches_declared_schema() {
    let dir = tempfile::tempdir().unwrap();
    let keel = open_file(dir.path()).await;
    keel.database()
        .execute_batch(
            "CREATE TABLE users (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 email TEXT NOT NULL UNIQUE,
                 nickname TEXT DEFAULT 'anon'
             );
             CREATE TABLE memberships (
                 user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                 group_name TEXT NOT NULL,
                 PRIMARY KEY (user_id, group_name)
             );",
        )
        .await
        .unwrap();

    let schema = keel.schema().await;
    assert_eq!(schema.table_names(), vec!["memberships".to_string(), "users".to_string()]);

    let users = schema.table("users").unwrap();
    let id = users.column("id").unwrap();
    assert!(id.primary_key);
    assert!(id.auto_increment);
    assert_eq!(users.rowid_alias(), Some("id"));
    assert!(!users.column("email").unwrap().nullable);
    assert!(users.column("nickname").unwrap().nullable);
    assert_eq!(users.column("nickname").unwrap().default_value.as_deref(), Some("'anon'"));
    assert!(users.has_leading_index("email"));

    let memberships = schema.table("memberships").unwrap();
    assert_eq!(memberships.primary_key, vec!["user_id".to_string(), "group_name".to_string()]);
    assert_eq!(memberships.column("group_name").unwrap().primary_key_position, 2);

    let fk = &memberships.foreign_keys[0];
    assert_eq!(fk.column, "user_id");
    assert_eq!(fk.referenced_table, "users");
    assert_eq!(fk.referenced_column, "id");
    assert_eq!(fk.on_delete, ReferentialAction::Cascade);
}

/// An empty migrations directory reports zero pending and zero applied
#[tokio::test]
async fn test_no_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let keel = open_file(dir.path()).await;

    let status = keel.status().await.unwrap();
    assert_eq!(status.pending, 0);
    assert_eq!(status.applied, 0);
    assert!(status.last_applied.is_none());

    let report = keel.migrate().await;
    assert!(report.success);
    assert_eq!(report.executed, 0);
}

/// Migrations apply in name order, exactly once, and show up in the schema
#[tokio::test]
async fn test_migrations_apply_in_order_once() {
    let dir = tempfile::tempdir().unwrap();
    write_migration(
        dir.path(),
        "20240102000000_posts.sql",
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, author_id INTEGER REFERENCES authors(id));",
    );
    write_migration(
        dir.path(),
        "20240101000000_authors.sql",
        "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);",
    );
    let keel = open_file(dir.path()).await;
    assert!(keel.schema().await.is_empty());

    let report = keel.migrate().await;
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(
        report.executed_names,
        vec!["20240101000000_authors".to_string(), "20240102000000_posts".to_string()]
    );

    let schema = keel.schema().await;
    assert!(schema.table("authors").is_some());
    assert!(schema.table("posts").is_some());
    assert!(schema.table("_keel_migrations").is_none());

    let again = keel.migrate().await;
    assert!(again.success);
    assert_eq!(again.executed, 0);

    let status = keel.status().await.unwrap();
    assert_eq!(status.applied, 2);
    assert_eq!(status.last_applied.unwrap().name, "20240102000000_posts");
}

/// Editing an applied file is reported as a warning and nothing re-runs
#[tokio::test]
async fn test_checksum_drift_warns() {
    let dir = tempfile::tempdir().unwrap();
    write_migration(
        dir.path(),
        "20240101000000_tags.sql",
        "CREATE TABLE tags (id INTEGER PRIMARY KEY);",
    );
    let keel = open_file(dir.path()).await;
    assert!(keel.migrate().await.success);

    write_migration(
        dir.path(),
        "20240101000000_tags.sql",
        "CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT);",
    );
    keel.migrations().engine().invalidate_caches();

    let report = keel.migrate().await;
    assert!(report.success);
    assert_eq!(report.executed, 0);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("20240101000000_tags"));

    let status = keel.status().await.unwrap();
    assert_eq!(status.drift.len(), 1);
    assert_eq!(status.pending, 0);
}

/// Active slots never exceed the configured maximum
#[tokio::test]
async fn test_resource_limit_under_concurrency() {
    let resources = ResourceManager::new(ResourceConfig::default().max_concurrent(2));
    let peak = Arc::new(AtomicUsize::new(0));

    let runs = (0..8).map(|i| {
        let resources = resources.clone();
        let peak = Arc::clone(&peak);
        async move {
            resources
                .run(format!("job-{i}"), {
                    let resources = resources.clone();
                    async move {
                        peak.fetch_max(resources.metrics().active, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(i)
                    }
                })
                .await
        }
    });
    let results = join_all(runs).await;

    let completed = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(MigrationError::ResourceExhausted { .. })))
        .count();
    assert_eq!(completed, 2);
    assert_eq!(rejected, 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);

    let metrics = resources.metrics();
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.total, 2);
}

/// A slow, frequent lookup gets one high-priority index until the index exists
#[tokio::test]
async fn test_slow_lookup_recommendation() {
    let dir = tempfile::tempdir().unwrap();
    let keel = open_file(dir.path()).await;
    keel.database()
        .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, name TEXT);")
        .await
        .unwrap();

    for i in 0..10 {
        let sql = format!("SELECT * FROM users WHERE email = 'user{i}@example.com'");
        keel.record_query(&sql, 1200.0, None);
    }

    let options = RecommendOptions::default().min_frequency(3).slow_query_threshold_ms(1000.0);
    let recs = keel.index_recommendations_with(&options).await;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].priority, Priority::High);
    assert_eq!(recs[0].columns, vec!["email".to_string()]);
    assert_eq!(recs[0].frequency, 10);

    keel.database().execute_batch(&recs[0].ddl).await.unwrap();
    keel.discovery().invalidate();

    assert!(keel.index_recommendations_with(&options).await.is_empty());
}

/// A dangling reference is found, previewed, then cleaned up
#[tokio::test]
async fn test_orphan_detection_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let database = SqliteConfig::file(dir.path().join("app.db")).foreign_keys(false);
    let keel = open(dir.path(), database).await;
    keel.database()
        .execute_batch(
            "CREATE TABLE authors (id INTEGER PRIMARY KEY);
             CREATE TABLE books (id INTEGER PRIMARY KEY, author_id INTEGER REFERENCES authors(id));
             CREATE INDEX books_author ON books (author_id);
             INSERT INTO authors (id) VALUES (1);
             INSERT INTO books (author_id) VALUES (1), (NULL);",
        )
        .await
        .unwrap();

    let issues = keel.constraint_issues().await.unwrap();
    assert_eq!(issues.total_orphans(), 0);
    assert!(issues.missing_indexes.is_empty());
    assert!(!issues.foreign_keys_enabled);

    keel.database().execute("INSERT INTO books (author_id) VALUES (42)", vec![]).await.unwrap();

    let issues = keel.constraint_issues().await.unwrap();
    assert_eq!(issues.total_orphans(), 1);
    assert_eq!(issues.orphans[0].table, "books");
    assert_eq!(issues.orphans[0].samples.len(), 1);

    let preview = keel.fix_constraints(&issues, FixOptions::all()).await.unwrap();
    assert!(preview.executed.is_empty());
    assert_eq!(preview.orphan_previews[0].orphan_count, 1);

    let fixed = keel.fix_constraints(&issues, FixOptions::all().execute()).await.unwrap();
    assert_eq!(fixed.rows_deleted, 1);
    assert!(fixed.foreign_keys_enabled);

    let issues = keel.constraint_issues().await.unwrap();
    assert!(issues.is_clean());
}
