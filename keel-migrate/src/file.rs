//! Migration file management.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};

/// Width of the timestamp prefix in migration file names.
pub const TIMESTAMP_LEN: usize = 14;

/// A migration file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFile {
    /// File stem, `<timestamp>_<description>`. Unique and the ordering key.
    pub name: String,
    /// 14-digit timestamp prefix.
    pub timestamp: String,
    /// Description after the first underscore.
    pub description: String,
    /// SQL content.
    pub sql: String,
    /// SHA-256 hex digest of `sql`.
    pub checksum: String,
    /// Path to the file.
    pub path: PathBuf,
}

/// Compute the SHA-256 hex digest of migration content.
pub fn compute_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Split `<14 digits>_<description>.sql` into `(name, timestamp, description)`.
pub fn parse_migration_file_name(file_name: &str) -> Option<(String, String, String)> {
    let stem = file_name.strip_suffix(".sql")?;
    let (timestamp, description) = stem.split_once('_')?;

    if timestamp.len() != TIMESTAMP_LEN
        || !timestamp.bytes().all(|b| b.is_ascii_digit())
        || description.is_empty()
    {
        return None;
    }

    Some((stem.to_string(), timestamp.to_string(), description.to_string()))
}

/// Migration file reader.
pub struct MigrationFileManager {
    migrations_dir: PathBuf,
    checksums: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for MigrationFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationFileManager")
            .field("migrations_dir", &self.migrations_dir)
            .finish()
    }
}

impl MigrationFileManager {
    /// Create a new file manager.
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            checksums: Mutex::new(HashMap::new()),
        }
    }

    /// Get the migrations directory.
    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Ensure the migrations directory exists.
    pub async fn ensure_dir(&self) -> MigrateResult<()> {
        tokio::fs::create_dir_all(&self.migrations_dir).await?;
        Ok(())
    }

    /// Checksum of `content`, memoized per distinct content until the next
    /// directory scan.
    pub fn checksum(&self, content: &str) -> String {
        if let Some(sum) = self.checksums.lock().get(content) {
            return sum.clone();
        }
        let sum = compute_checksum(content);
        self.checksums
            .lock()
            .insert(content.to_string(), sum.clone());
        sum
    }

    /// List all migration files in ascending name order.
    ///
    /// A missing directory yields an empty list. Files whose names do not
    /// match the naming scheme are skipped. Memoized checksums for content
    /// no longer on disk are dropped.
    pub async fn list_migrations(&self) -> MigrateResult<Vec<MigrationFile>> {
        if !tokio::fs::try_exists(&self.migrations_dir).await? {
            self.checksums.lock().clear();
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.migrations_dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                debug!(path = ?entry.path(), "Skipping non UTF-8 file name");
                continue;
            };
            match parse_migration_file_name(file_name) {
                Some(parts) => found.push((parts, entry.path())),
                None => debug!(file = %file_name, "Skipping file that is not a migration"),
            }
        }

        // Fixed-width timestamps make lexicographic order chronological.
        found.sort_by(|a, b| a.0.0.cmp(&b.0.0));

        let mut migrations = Vec::with_capacity(found.len());
        for ((name, timestamp, description), path) in found {
            let sql = tokio::fs::read_to_string(&path).await?;
            migrations.push(MigrationFile {
                checksum: self.checksum(&sql),
                name,
                timestamp,
                description,
                sql,
                path,
            });
        }

        let live: HashSet<&str> = migrations.iter().map(|m| m.sql.as_str()).collect();
        self.checksums.lock().retain(|content, _| live.contains(content.as_str()));

        Ok(migrations)
    }

    /// Write a migration file named `<timestamp>_<description>.sql`.
    pub async fn write_migration(
        &self,
        timestamp: &str,
        description: &str,
        sql: &str,
    ) -> MigrateResult<PathBuf> {
        let file_name = format!("{}_{}.sql", timestamp, description);
        if parse_migration_file_name(&file_name).is_none() {
            return Err(MigrationError::invalid(format!(
                "'{}' does not match <14-digit timestamp>_<description>.sql",
                file_name
            )));
        }

        self.ensure_dir().await?;
        let path = self.migrations_dir.join(file_name);
        tokio::fs::write(&path, sql).await?;
        Ok(path)
    }

    /// Generate a timestamp prefix for a new migration.
    pub fn generate_timestamp(&self) -> String {
        chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_migration_file_name() {
        assert_eq!(
            parse_migration_file_name("20240101120000_create_users.sql"),
            Some((
                "20240101120000_create_users".to_string(),
                "20240101120000".to_string(),
                "create_users".to_string()
            ))
        );
        assert!(parse_migration_file_name("2024_create_users.sql").is_none());
        assert!(parse_migration_file_name("20240101120000_create_users.txt").is_none());
        assert!(parse_migration_file_name("20240101120000_.sql").is_none());
        assert!(parse_migration_file_name("2024010112000a_x.sql").is_none());
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            compute_checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let manager = MigrationFileManager::new("unused");
        let first = manager.checksum("CREATE TABLE t (id INTEGER);");
        assert_eq!(first, manager.checksum("CREATE TABLE t (id INTEGER);"));
        assert_eq!(first.len(), 64);
    }

    #[tokio::test]
    async fn test_list_migrations_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MigrationFileManager::new(dir.path());

        manager
            .write_migration("20240102000000", "add_posts", "CREATE TABLE posts (id INTEGER);")
            .await
            .unwrap();
        manager
            .write_migration("20240101000000", "create_users", "CREATE TABLE users (id INTEGER);")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("README.md"), "notes").await.unwrap();
        tokio::fs::create_dir(dir.path().join("20240103000000_dir.sql")).await.unwrap();

        let files = manager.list_migrations().await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["20240101000000_create_users", "20240102000000_add_posts"]);
        assert_eq!(files[0].description, "create_users");
        assert_eq!(files[0].checksum, compute_checksum("CREATE TABLE users (id INTEGER);"));
    }

    #[tokio::test]
    async fn test_checksum_memo_tracks_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MigrationFileManager::new(dir.path());
        manager.checksum("SELECT 1;");

        for i in 0..5 {
            let sql = format!("CREATE TABLE t{i} (id INTEGER);");
            manager.write_migration("20240101000000", "grow", &sql).await.unwrap();
            let files = manager.list_migrations().await.unwrap();
            assert_eq!(files[0].checksum, compute_checksum(&sql));
            assert_eq!(manager.checksums.lock().len(), 1);
        }

        tokio::fs::remove_dir_all(dir.path()).await.unwrap();
        assert!(manager.list_migrations().await.unwrap().is_empty());
        assert!(manager.checksums.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MigrationFileManager::new(dir.path().join("nope"));
        assert!(manager.list_migrations().await.unwrap().is_empty());

        manager.ensure_dir().await.unwrap();
        assert!(manager.migrations_dir().exists());
    }

    #[tokio::test]
    async fn test_write_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MigrationFileManager::new(dir.path());
        let err = manager.write_migration("2024", "x", "").await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidMigration(_)));
        assert_eq!(manager.generate_timestamp().len(), TIMESTAMP_LEN);
    }
}
