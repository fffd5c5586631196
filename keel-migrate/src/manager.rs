//! High-level migration entry points.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::engine::{ChecksumDrift, MigrationEngine, MigrationPlan};
use crate::error::MigrateResult;
use crate::history::{MigrationHistoryRepository, MigrationRecord};
use crate::resource::{ResourceManager, ResourceMetrics};

/// Outcome of [`MigrationManager::migrate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrateReport {
    pub success: bool,
    /// Number of migrations committed.
    pub executed: usize,
    /// Number of migrations that failed (0 or 1, the batch stops at the first).
    pub failed: usize,
    pub duration_ms: u64,
    pub executed_names: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Snapshot of migration progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub total_files: usize,
    pub applied: usize,
    pub pending: usize,
    pub last_applied: Option<MigrationRecord>,
    pub utilization_percent: f64,
    pub resources: ResourceMetrics,
    pub drift: Vec<ChecksumDrift>,
    pub missing_files: Vec<String>,
}

impl MigrationStatus {
    /// Whether every file on disk is applied.
    pub fn is_up_to_date(&self) -> bool {
        self.pending == 0
    }
}

/// Runs migrations through a [`ResourceManager`].
pub struct MigrationManager<H: MigrationHistoryRepository> {
    engine: Arc<MigrationEngine<H>>,
    resources: ResourceManager,
}

impl<H: MigrationHistoryRepository> Clone for MigrationManager<H> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            resources: self.resources.clone(),
        }
    }
}

impl<H: MigrationHistoryRepository> std::fmt::Debug for MigrationManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("engine", &self.engine)
            .field("resources", &self.resources)
            .finish()
    }
}

impl<H: MigrationHistoryRepository> MigrationManager<H> {
    /// Create a manager over an engine and a resource gate.
    pub fn new(engine: MigrationEngine<H>, resources: ResourceManager) -> Self {
        Self {
            engine: Arc::new(engine),
            resources,
        }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &MigrationEngine<H> {
        &self.engine
    }

    /// The resource gate.
    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Check connectivity, create the migrations directory and the tracking table.
    pub async fn initialize(&self) -> MigrateResult<()> {
        self.engine.initialize().await
    }

    /// Read-only plan.
    pub async fn plan(&self) -> MigrateResult<MigrationPlan> {
        self.engine.plan().await
    }

    /// Apply pending migrations.
    ///
    /// Failures are reported in the returned [`MigrateReport`], never as `Err`.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> MigrateReport {
        let start = Instant::now();
        let mut report = MigrateReport::default();

        let plan = match self.engine.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "Could not build migration plan");
                report.errors.push(e.to_string());
                report.duration_ms = start.elapsed().as_millis() as u64;
                return report;
            }
        };
        report.warnings = plan.warnings();

        if plan.is_empty() {
            info!("No pending migrations");
            report.success = true;
            report.duration_ms = start.elapsed().as_millis() as u64;
            return report;
        }

        let engine = Arc::clone(&self.engine);
        let outcome = self
            .resources
            .run("migrate", async move { engine.execute_all_migrations().await })
            .await;

        match outcome {
            Ok(batch) => {
                report.executed = batch.executed.len();
                report.executed_names = batch.executed_names();
                if let Some(failure) = &batch.failure {
                    report.failed = 1;
                    report.errors.push(format!("{}: {}", failure.name, failure.message));
                }
                report.success = batch.is_success();
            }
            Err(e) => {
                if let Some(hint) = e.suggestion() {
                    report.warnings.push(hint);
                }
                warn!(error = %e, "Migration run not started");
                report.errors.push(e.to_string());
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            success = report.success,
            executed = report.executed,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "Migrate finished"
        );
        report
    }

    /// Current progress and resource usage.
    pub async fn status(&self) -> MigrateResult<MigrationStatus> {
        let plan = self.engine.plan().await?;
        let resources = self.resources.metrics();

        Ok(MigrationStatus {
            total_files: plan.total_files,
            applied: plan.applied.len(),
            pending: plan.pending.len(),
            last_applied: plan.applied.iter().max_by(|a, b| a.name.cmp(&b.name)).cloned(),
            utilization_percent: resources.utilization_percent,
            resources,
            drift: plan.drift,
            missing_files: plan.missing_files,
        })
    }
}
