//! Migration engine implementation.
//!
//! The engine applies pending migration files in name order. Each file runs
//! in one transaction together with its tracking record, so a migration is
//! either fully applied and recorded or not at all.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::cache::TimedCache;
use crate::error::{MigrateResult, MigrationError};
use crate::file::{MigrationFile, MigrationFileManager};
use crate::history::{MigrationHistoryRepository, MigrationRecord};

/// Configuration for the migration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Path to the migrations directory.
    pub migrations_dir: PathBuf,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Base retry delay; attempt `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    /// Budget for a single attempt.
    pub attempt_timeout_ms: u64,
    /// Budget for one migration across all attempts.
    pub timeout_ms: u64,
    /// TTL of the file listing and applied-record caches.
    pub cache_ttl_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("./migrations"),
            max_retries: 3,
            retry_backoff_ms: 100,
            attempt_timeout_ms: 30_000,
            timeout_ms: 120_000,
            cache_ttl_ms: 2_000,
        }
    }
}

impl MigrationConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the migrations directory.
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Set the number of retries.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base retry delay.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the per-attempt budget.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the overall per-migration budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the cache TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = ttl.as_millis() as u64;
        self
    }
}

/// Lifecycle of one migration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    /// Found on disk.
    Discovered,
    /// Not yet recorded as applied.
    Pending,
    /// An attempt is running.
    Applying,
    /// Committed and recorded.
    Applied,
    /// Gave up after the last attempt.
    Failed,
}

impl MigrationState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Discovered, Pending)
                | (Discovered, Applied)
                | (Pending, Applying)
                | (Applying, Applying)
                | (Applying, Applied)
                | (Applying, Failed)
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Failed)
    }
}

/// Tracks the state of one migration and rejects illegal moves.
#[derive(Debug)]
struct StateTracker<'a> {
    name: &'a str,
    state: MigrationState,
}

impl<'a> StateTracker<'a> {
    fn pending(name: &'a str) -> Self {
        Self {
            name,
            state: MigrationState::Pending,
        }
    }

    fn advance(&mut self, next: MigrationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(migration = %self.name, from = ?self.state, to = ?next, "Migration state change");
        self.state = next;
    }
}

/// Result of applying one migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub name: String,
    pub state: MigrationState,
    /// Attempts made, including the first.
    pub attempts: u32,
    pub duration_ms: u64,
    /// The record was found already committed before a retry.
    pub already_applied: bool,
}

/// A file whose content changed after it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumDrift {
    pub name: String,
    /// Checksum stored in the tracking table.
    pub recorded: String,
    /// Checksum of the file on disk now.
    pub current: String,
}

impl std::fmt::Display for ChecksumDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Migration '{}' changed after it was applied (recorded {}, now {})",
            self.name, self.recorded, self.current
        )
    }
}

/// The migration that stopped a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationFailure {
    pub name: String,
    pub message: String,
}

/// Result of [`MigrationEngine::execute_all_migrations`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    /// Migrations committed in this run, in order.
    pub executed: Vec<MigrationOutcome>,
    /// The first failure, after which the batch stopped.
    pub failure: Option<MigrationFailure>,
    /// Applied files whose content changed.
    pub drift: Vec<ChecksumDrift>,
    pub duration_ms: u64,
}

impl BatchResult {
    /// Whether every pending migration was applied.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Names of the migrations committed in this run.
    pub fn executed_names(&self) -> Vec<String> {
        self.executed.iter().map(|o| o.name.clone()).collect()
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        match &self.failure {
            None if self.executed.is_empty() => "No migrations applied".to_string(),
            None => format!("{} applied in {}ms", self.executed.len(), self.duration_ms),
            Some(f) => format!(
                "{} applied, stopped at '{}': {}",
                self.executed.len(),
                f.name,
                f.message
            ),
        }
    }
}

/// Read-only view of what `migrate` would do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Files not yet applied, in execution order.
    pub pending: Vec<MigrationFile>,
    /// Records in the tracking table.
    pub applied: Vec<MigrationRecord>,
    /// Applied files whose content changed.
    pub drift: Vec<ChecksumDrift>,
    /// Applied names with no file on disk.
    pub missing_files: Vec<String>,
    /// Number of migration files on disk.
    pub total_files: usize,
}

impl MigrationPlan {
    /// Check if the plan is empty (nothing to apply).
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Names of pending migrations.
    pub fn pending_names(&self) -> Vec<String> {
        self.pending.iter().map(|f| f.name.clone()).collect()
    }

    /// Warnings worth surfacing to an operator.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings: Vec<String> = self.drift.iter().map(ToString::to_string).collect();
        warnings.extend(
            self.missing_files
                .iter()
                .map(|name| format!("Migration '{}' is recorded but its file is missing", name)),
        );
        warnings
    }
}

/// The migration engine.
pub struct MigrationEngine<H: MigrationHistoryRepository> {
    config: MigrationConfig,
    history: H,
    files: MigrationFileManager,
    file_cache: TimedCache<Arc<Vec<MigrationFile>>>,
    applied_cache: TimedCache<Arc<Vec<MigrationRecord>>>,
}

impl<H: MigrationHistoryRepository> std::fmt::Debug for MigrationEngine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("config", &self.config)
            .finish()
    }
}

impl<H: MigrationHistoryRepository> MigrationEngine<H> {
    /// Create a new migration engine.
    pub fn new(config: MigrationConfig, history: H) -> Self {
        let ttl = Duration::from_millis(config.cache_ttl_ms);
        Self {
            files: MigrationFileManager::new(&config.migrations_dir),
            history,
            file_cache: TimedCache::new(ttl),
            applied_cache: TimedCache::new(ttl),
            config,
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// The history repository.
    pub fn history(&self) -> &H {
        &self.history
    }

    /// The migration file manager.
    pub fn files(&self) -> &MigrationFileManager {
        &self.files
    }

    /// Check connectivity, create the migrations directory and the tracking table.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> MigrateResult<()> {
        self.history.initialize().await?;
        self.files.ensure_dir().await?;
        self.invalidate_caches();
        info!(dir = %self.config.migrations_dir.display(), "Migration engine initialized");
        Ok(())
    }

    /// SHA-256 hex checksum of `content`, memoized.
    pub fn checksum(&self, content: &str) -> String {
        self.files.checksum(content)
    }

    /// Migration files on disk in ascending order, served from cache when fresh.
    pub async fn list_migration_files(&self) -> MigrateResult<Arc<Vec<MigrationFile>>> {
        if let Some(files) = self.file_cache.get() {
            return Ok(files);
        }
        let files = Arc::new(self.files.list_migrations().await?);
        debug!(count = files.len(), "Scanned migrations directory");
        self.file_cache.set(Arc::clone(&files));
        Ok(files)
    }

    /// Applied records ordered by name, served from cache when fresh.
    pub async fn list_applied(&self) -> MigrateResult<Arc<Vec<MigrationRecord>>> {
        if let Some(applied) = self.applied_cache.get() {
            return Ok(applied);
        }
        let applied = Arc::new(self.history.get_applied().await?);
        self.applied_cache.set(Arc::clone(&applied));
        Ok(applied)
    }

    /// Drop both caches.
    pub fn invalidate_caches(&self) {
        self.file_cache.invalidate();
        self.applied_cache.invalidate();
    }

    /// Compare files on disk with the tracking table without changing anything.
    pub async fn plan(&self) -> MigrateResult<MigrationPlan> {
        let files = self.list_migration_files().await?;
        let applied = self.list_applied().await?;

        let applied_names: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();
        let file_names: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();

        Ok(MigrationPlan {
            pending: files
                .iter()
                .filter(|f| !applied_names.contains(f.name.as_str()))
                .cloned()
                .collect(),
            drift: detect_drift(&files, &applied),
            missing_files: applied
                .iter()
                .filter(|r| !file_names.contains(r.name.as_str()))
                .map(|r| r.name.clone())
                .collect(),
            applied: applied.to_vec(),
            total_files: files.len(),
        })
    }

    /// Apply one migration with retries, per-attempt timeouts and an overall deadline.
    #[instrument(skip(self, file), fields(migration = %file.name))]
    pub async fn execute_migration(&self, file: &MigrationFile) -> MigrateResult<MigrationOutcome> {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(self.config.timeout_ms);
        let attempt_budget = Duration::from_millis(self.config.attempt_timeout_ms);
        let operation = format!("migrate {}", file.name);

        let mut tracker = StateTracker::pending(&file.name);
        tracker.advance(MigrationState::Applying);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            // A timed-out attempt may still have committed.
            if attempt > 1 {
                match self.history.is_applied(&file.name).await {
                    Ok(true) => {
                        info!(attempt, "Migration found committed by an earlier attempt");
                        tracker.advance(MigrationState::Applied);
                        self.invalidate_caches();
                        return Ok(MigrationOutcome {
                            name: file.name.clone(),
                            state: tracker.state,
                            attempts: attempt - 1,
                            duration_ms: start.elapsed().as_millis() as u64,
                            already_applied: true,
                        });
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Could not check tracking table before retry"),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracker.advance(MigrationState::Failed);
                error!(attempts = attempt - 1, "Migration exceeded its overall timeout");
                return Err(MigrationError::timeout(operation, start.elapsed()));
            }
            let budget = attempt_budget.min(remaining);

            let attempt_result = tokio::time::timeout(
                budget,
                self.history.apply(&file.name, &file.sql, &file.checksum),
            )
            .await;

            let failure = match attempt_result {
                Ok(Ok(record)) => {
                    tracker.advance(MigrationState::Applied);
                    self.invalidate_caches();
                    let duration_ms = start.elapsed().as_millis() as u64;
                    info!(attempts = attempt, duration_ms, id = %record.id, "Migration applied");
                    return Ok(MigrationOutcome {
                        name: file.name.clone(),
                        state: tracker.state,
                        attempts: attempt,
                        duration_ms,
                        already_applied: false,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => MigrationError::timeout(operation.clone(), budget),
            };

            if attempt > self.config.max_retries {
                tracker.advance(MigrationState::Failed);
                error!(attempts = attempt, error = %failure, "Migration failed");
                return Err(MigrationError::Execution {
                    name: file.name.clone(),
                    attempts: attempt,
                    message: failure.to_string(),
                });
            }

            let backoff = Duration::from_millis(self.config.retry_backoff_ms) * attempt;
            warn!(
                attempt,
                error = %failure,
                backoff_ms = backoff.as_millis() as u64,
                "Migration attempt failed, retrying"
            );
            tracker.advance(MigrationState::Applying);
            tokio::time::sleep(backoff).await;
        }
    }

    /// Apply every pending migration in order, stopping at the first failure.
    ///
    /// Migrations committed before the failure stay applied.
    #[instrument(skip(self))]
    pub async fn execute_all_migrations(&self) -> MigrateResult<BatchResult> {
        let start = Instant::now();
        let files = self.list_migration_files().await?;
        let applied = self.list_applied().await?;

        let mut result = BatchResult {
            drift: detect_drift(&files, &applied),
            ..Default::default()
        };
        for drift in &result.drift {
            warn!(
                migration = %drift.name,
                recorded = %drift.recorded,
                current = %drift.current,
                "Checksum drift"
            );
        }

        let applied_names: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();
        let pending: Vec<&MigrationFile> = files
            .iter()
            .filter(|f| !applied_names.contains(f.name.as_str()))
            .collect();

        info!(pending = pending.len(), "Applying migrations");

        for file in pending {
            match self.execute_migration(file).await {
                Ok(outcome) => result.executed.push(outcome),
                Err(e) => {
                    result.failure = Some(MigrationFailure {
                        name: file.name.clone(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(summary = %result.summary(), "Migration batch finished");
        Ok(result)
    }
}

fn detect_drift(files: &[MigrationFile], applied: &[MigrationRecord]) -> Vec<ChecksumDrift> {
    applied
        .iter()
        .filter_map(|record| {
            let file = files.iter().find(|f| f.name == record.name)?;
            (file.checksum != record.checksum).then(|| ChecksumDrift {
                name: record.name.clone(),
                recorded: record.checksum.clone(),
                current: file.checksum.clone(),
            })
        })
        .collect()
}
