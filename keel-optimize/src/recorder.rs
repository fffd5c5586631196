//! In-memory query pattern recording.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fingerprint::{fingerprint, infer_table};

/// Default capacity of a [`QueryRecorder`].
pub const DEFAULT_MAX_PATTERNS: usize = 10_000;

/// Aggregated statistics for one statement shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPattern {
    /// Normalized statement.
    pub fingerprint: String,
    /// The first statement seen with this shape.
    pub sample_sql: String,
    /// Target table, given by the caller or inferred.
    pub table: Option<String>,
    /// Number of executions.
    pub count: u64,
    /// Running mean execution time.
    pub avg_duration_ms: f64,
    /// Slowest execution seen.
    pub max_duration_ms: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl QueryPattern {
    fn new(fingerprint: String, sql: &str, table: Option<String>, duration_ms: f64) -> Self {
        let now = Utc::now();
        Self {
            fingerprint,
            sample_sql: sql.to_string(),
            table,
            count: 1,
            avg_duration_ms: duration_ms,
            max_duration_ms: duration_ms,
            first_seen: now,
            last_seen: now,
        }
    }

    fn observe(&mut self, duration_ms: f64) {
        self.count += 1;
        self.avg_duration_ms += (duration_ms - self.avg_duration_ms) / self.count as f64;
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        self.last_seen = Utc::now();
    }

    /// `count * avg_duration_ms`.
    pub fn total_duration_ms(&self) -> f64 {
        self.count as f64 * self.avg_duration_ms
    }
}

/// Recorder statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderStats {
    /// Distinct fingerprints held.
    pub patterns: usize,
    /// Samples accepted.
    pub recorded: u64,
    /// Samples dropped because the recorder was full.
    pub dropped: u64,
}

/// Collects `(statement, duration, table)` samples keyed by fingerprint.
///
/// Recording is commutative: the aggregated counts do not depend on the
/// order samples arrive in. When `max_patterns` distinct shapes are held,
/// samples for new shapes are dropped; known shapes keep accumulating.
pub struct QueryRecorder {
    patterns: RwLock<HashMap<String, QueryPattern>>,
    max_patterns: usize,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for QueryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRecorder")
            .field("max_patterns", &self.max_patterns)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for QueryRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PATTERNS)
    }
}

impl QueryRecorder {
    /// Create a recorder holding at most `max_patterns` shapes.
    pub fn new(max_patterns: usize) -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
            max_patterns,
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Record one execution. Returns `false` if the sample was dropped.
    pub fn record_query(&self, sql: &str, duration_ms: f64, table: Option<&str>) -> bool {
        let key = fingerprint(sql);
        if key.is_empty() {
            return false;
        }
        let duration_ms = if duration_ms.is_finite() { duration_ms.max(0.0) } else { 0.0 };

        let accepted = {
            let mut patterns = self.patterns.write();
            if let Some(pattern) = patterns.get_mut(&key) {
                pattern.observe(duration_ms);
                if pattern.table.is_none() {
                    pattern.table = table.map(str::to_string);
                }
                true
            } else if patterns.len() < self.max_patterns {
                let table = table.map(str::to_string).or_else(|| infer_table(sql));
                let pattern = QueryPattern::new(key.clone(), sql, table, duration_ms);
                patterns.insert(key.clone(), pattern);
                true
            } else {
                false
            }
        };

        if !accepted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                fingerprint = %key,
                max = self.max_patterns,
                "Query recorder full, sample dropped"
            );
            return false;
        }
        self.recorded.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Every pattern, most frequent first.
    pub fn patterns(&self) -> Vec<QueryPattern> {
        let mut out: Vec<_> = self.patterns.read().values().cloned().collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.fingerprint.cmp(&b.fingerprint)));
        out
    }

    /// Look up a pattern by the fingerprint of `sql`.
    pub fn pattern_for(&self, sql: &str) -> Option<QueryPattern> {
        self.patterns.read().get(&fingerprint(sql)).cloned()
    }

    /// Patterns whose average is at least `threshold_ms`, slowest first.
    pub fn slow_patterns(&self, threshold_ms: f64) -> Vec<QueryPattern> {
        let mut out: Vec<_> = self
            .patterns
            .read()
            .values()
            .filter(|p| p.avg_duration_ms >= threshold_ms)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.avg_duration_ms.total_cmp(&a.avg_duration_ms));
        out
    }

    /// Current statistics.
    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            patterns: self.patterns.read().len(),
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of distinct shapes held.
    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.patterns.write().clear();
        self.recorded.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_aggregates_by_shape() {
        let recorder = QueryRecorder::default();
        recorder.record_query("SELECT * FROM users WHERE id = 1", 10.0, None);
        recorder.record_query("select * from users where id = 2", 30.0, None);
        recorder.record_query("SELECT * FROM users WHERE id = ?", 20.0, None);

        assert_eq!(recorder.len(), 1);
        let pattern = recorder.pattern_for("SELECT * FROM users WHERE id = 99").unwrap();
        assert_eq!(pattern.count, 3);
        assert!((pattern.avg_duration_ms - 20.0).abs() < 1e-9);
        assert_eq!(pattern.max_duration_ms, 30.0);
        assert_eq!(pattern.table.as_deref(), Some("users"));
        assert_eq!(pattern.sample_sql, "SELECT * FROM users WHERE id = 1");
        assert!(pattern.first_seen <= pattern.last_seen);
        assert!((pattern.total_duration_ms() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_table_wins() {
        let recorder = QueryRecorder::default();
        recorder.record_query("SELECT * FROM v_users", 1.0, Some("users"));
        assert_eq!(
            recorder.patterns()[0].table.as_deref(),
            Some("users")
        );
    }

    #[test]
    fn test_capacity_drops_new_shapes_only() {
        let recorder = QueryRecorder::new(2);
        assert!(recorder.record_query("SELECT * FROM a", 1.0, None));
        assert!(recorder.record_query("SELECT * FROM b", 1.0, None));
        assert!(!recorder.record_query("SELECT * FROM c", 1.0, None));
        assert!(recorder.record_query("SELECT * FROM a", 3.0, None));

        let stats = recorder.stats();
        assert_eq!(stats.patterns, 2);
        assert_eq!(stats.recorded, 3);
        assert_eq!(stats.dropped, 1);
        assert!(recorder.pattern_for("SELECT * FROM c").is_none());
    }

    #[test]
    fn test_slow_patterns_and_ordering() {
        let recorder = QueryRecorder::default();
        for _ in 0..3 {
            recorder.record_query("SELECT * FROM a WHERE x = 1", 5.0, None);
        }
        recorder.record_query("SELECT * FROM b WHERE y = 1", 1500.0, None);

        let all = recorder.patterns();
        assert_eq!(all[0].count, 3);
        let slow = recorder.slow_patterns(1000.0);
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].table.as_deref(), Some("b"));

        recorder.clear();
        assert!(recorder.is_empty());
        assert_eq!(recorder.stats().recorded, 0);
    }

    #[test]
    fn test_concurrent_recording_is_commutative() {
        let recorder = Arc::new(QueryRecorder::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let recorder = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        recorder.record_query(
                            &format!("SELECT * FROM t WHERE id = {}", i * 100 + j),
                            1.0,
                            None,
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let pattern = recorder.pattern_for("SELECT * FROM t WHERE id = 0").unwrap();
        assert_eq!(pattern.count, 800);
        assert!((pattern.avg_duration_ms - 1.0).abs() < 1e-9);
    }
}
