//! Bounded, non-queuing admission for migration runs.
//!
//! [`ResourceManager::acquire`] either hands out a slot immediately or fails
//! with [`MigrationError::ResourceExhausted`]. Every slot carries a timer
//! that force-releases it after `slot_timeout_ms`, so a leaked guard cannot
//! block later runs forever.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MigrateResult, MigrationError};

/// Resource manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Maximum slots held at once.
    pub max_concurrent: usize,
    /// How long a slot may be held before it is force-released.
    pub slot_timeout_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            slot_timeout_ms: 300_000,
        }
    }
}

impl ResourceConfig {
    /// Set the maximum number of concurrent slots.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the slot timeout.
    pub fn slot_timeout(mut self, timeout: Duration) -> Self {
        self.slot_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Point-in-time usage numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Slots currently held.
    pub active: usize,
    /// Configured maximum.
    pub max: usize,
    /// Slots handed out since creation.
    pub total: u64,
    /// Failed runs plus forced releases.
    pub failures: u64,
    /// `active / max` as a percentage.
    pub utilization_percent: f64,
}

struct Slot {
    operation: String,
    acquired_at: Instant,
    timer: JoinHandle<()>,
}

struct Inner {
    config: ResourceConfig,
    slots: Mutex<HashMap<u64, Slot>>,
    next_token: AtomicU64,
    total: AtomicU64,
    failures: AtomicU64,
}

impl Inner {
    /// Remove a slot. Returns false if it was already gone.
    fn release(&self, token: u64, forced: bool) -> bool {
        let Some(slot) = self.slots.lock().remove(&token) else {
            return false;
        };

        let held_ms = slot.acquired_at.elapsed().as_millis() as u64;
        if forced {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                operation = %slot.operation,
                held_ms,
                "Resource slot timed out and was force-released"
            );
        } else {
            slot.timer.abort();
            debug!(operation = %slot.operation, held_ms, "Resource slot released");
        }
        true
    }
}

/// Hands out a bounded number of slots without queueing.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("config", &self.inner.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl ResourceManager {
    /// Create a manager.
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slots: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                total: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    /// Take a slot for `operation`, or fail immediately if none is free.
    ///
    /// Must be called from within a Tokio runtime (the slot timer is a task).
    pub fn acquire(&self, operation: impl Into<String>) -> MigrateResult<ResourceGuard> {
        let operation = operation.into();
        let max = self.inner.config.max_concurrent;

        let mut slots = self.inner.slots.lock();
        if slots.len() >= max {
            return Err(MigrationError::ResourceExhausted {
                operation,
                active: slots.len(),
                max,
            });
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = Duration::from_millis(self.inner.config.slot_timeout_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.release(token, true);
            }
        });

        slots.insert(
            token,
            Slot {
                operation: operation.clone(),
                acquired_at: Instant::now(),
                timer,
            },
        );
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        debug!(operation = %operation, active = slots.len(), max, "Resource slot acquired");

        Ok(ResourceGuard {
            inner: Arc::clone(&self.inner),
            token,
            operation,
            released: false,
        })
    }

    /// Run `fut` while holding a slot. An `Err` result counts as a failure.
    pub async fn run<F, T>(&self, operation: impl Into<String>, fut: F) -> MigrateResult<T>
    where
        F: Future<Output = MigrateResult<T>>,
    {
        let guard = self.acquire(operation)?;
        let result = fut.await;
        if result.is_err() {
            self.inner.failures.fetch_add(1, Ordering::Relaxed);
        }
        guard.release();
        result
    }

    /// Current usage.
    pub fn metrics(&self) -> ResourceMetrics {
        let active = self.inner.slots.lock().len();
        let max = self.inner.config.max_concurrent;
        ResourceMetrics {
            active,
            max,
            total: self.inner.total.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            utilization_percent: if max == 0 {
                100.0
            } else {
                active as f64 * 100.0 / max as f64
            },
        }
    }
}

/// A held slot. Released on [`ResourceGuard::release`] or drop.
pub struct ResourceGuard {
    inner: Arc<Inner>,
    token: u64,
    operation: String,
    released: bool,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("token", &self.token)
            .field("operation", &self.operation)
            .finish()
    }
}

impl ResourceGuard {
    /// The operation this slot was taken for.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Whether the slot is still held (false once the timer fired).
    pub fn is_held(&self) -> bool {
        !self.released && self.inner.slots.lock().contains_key(&self.token)
    }

    /// Release the slot now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(self.token, false);
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}
