//! PRAGMA settings review.

use keel_sqlite::types::value_to_string;
use keel_sqlite::{Database, JournalMode, SqliteResult, SynchronousMode, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indexer::RecommendOptions;
use crate::recorder::QueryPattern;

/// Cache sizes below this many KiB get a suggestion.
const MIN_CACHE_KIB: i64 = 8 * 1024;
const SUGGESTED_CACHE_SIZE: i64 = -16_384;

/// Current values of the PRAGMAs the tuner looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PragmaSettings {
    pub journal_mode: Option<JournalMode>,
    pub synchronous: Option<SynchronousMode>,
    /// Raw `cache_size`: negative values are KiB, positive values are pages.
    pub cache_size: i64,
    pub page_size: i64,
    pub foreign_keys: bool,
    /// 0 default, 1 file, 2 memory.
    pub temp_store: i64,
    /// Whether `ANALYZE` statistics exist.
    pub has_statistics: bool,
}

impl PragmaSettings {
    /// Effective page cache size in KiB.
    pub fn cache_kib(&self) -> i64 {
        if self.cache_size < 0 {
            -self.cache_size
        } else {
            self.cache_size * self.page_size / 1024
        }
    }
}

/// One suggested change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PragmaSuggestion {
    /// PRAGMA name, or `analyze`.
    pub name: String,
    pub current: String,
    pub recommended: String,
    /// Statement that applies the change.
    pub statement: String,
    pub reason: String,
}

async fn pragma(db: &Database, name: &str) -> SqliteResult<Option<Value>> {
    db.query_scalar(&format!("PRAGMA {name}"), vec![]).await
}

async fn pragma_i64(db: &Database, name: &str) -> SqliteResult<i64> {
    Ok(match pragma(db, name).await? {
        Some(Value::Integer(i)) => i,
        Some(other) => value_to_string(&other).parse().unwrap_or(0),
        None => 0,
    })
}

async fn pragma_text(db: &Database, name: &str) -> SqliteResult<String> {
    Ok(pragma(db, name)
        .await?
        .map(|v| value_to_string(&v))
        .unwrap_or_default())
}

/// Read the current settings from `db`.
pub async fn read_pragma_settings(db: &Database) -> SqliteResult<PragmaSettings> {
    let journal_mode = JournalMode::from_pragma(&pragma_text(db, "journal_mode").await?);
    let synchronous = SynchronousMode::from_pragma(&pragma_text(db, "synchronous").await?);
    let cache_size = pragma_i64(db, "cache_size").await?;
    let page_size = pragma_i64(db, "page_size").await?;
    let foreign_keys = pragma_i64(db, "foreign_keys").await? == 1;
    let temp_store = pragma_i64(db, "temp_store").await?;
    let has_statistics = db
        .query_scalar(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_stat1'",
            vec![],
        )
        .await?
        .is_some();

    let settings = PragmaSettings {
        journal_mode,
        synchronous,
        cache_size,
        page_size,
        foreign_keys,
        temp_store,
        has_statistics,
    };
    debug!(?settings, "Read pragma settings");
    Ok(settings)
}

/// Suggest PRAGMA changes for the observed workload.
pub fn suggest_pragmas(
    settings: &PragmaSettings,
    patterns: &[QueryPattern],
) -> Vec<PragmaSuggestion> {
    let mut out = Vec::new();
    let mode = settings.journal_mode;

    if !matches!(mode, Some(JournalMode::Wal) | Some(JournalMode::Memory)) {
        out.push(PragmaSuggestion {
            name: "journal_mode".into(),
            current: mode.map(|m| m.as_pragma()).unwrap_or("unknown").into(),
            recommended: "WAL".into(),
            statement: "PRAGMA journal_mode = WAL".into(),
            reason: "write-ahead logging lets readers proceed while a writer commits".into(),
        });
    }

    if mode == Some(JournalMode::Wal)
        && matches!(
            settings.synchronous,
            Some(SynchronousMode::Full) | Some(SynchronousMode::Extra)
        )
    {
        out.push(PragmaSuggestion {
            name: "synchronous".into(),
            current: settings.synchronous.map(|s| s.as_pragma()).unwrap_or("unknown").into(),
            recommended: "NORMAL".into(),
            statement: "PRAGMA synchronous = NORMAL".into(),
            reason: "NORMAL is durable across application crashes in WAL mode and syncs far less"
                .into(),
        });
    }

    if settings.cache_kib() < MIN_CACHE_KIB {
        out.push(PragmaSuggestion {
            name: "cache_size".into(),
            current: settings.cache_size.to_string(),
            recommended: SUGGESTED_CACHE_SIZE.to_string(),
            statement: format!("PRAGMA cache_size = {SUGGESTED_CACHE_SIZE}"),
            reason: format!(
                "page cache is {} KiB; a larger cache keeps hot indexes in memory",
                settings.cache_kib()
            ),
        });
    }

    if !settings.foreign_keys {
        out.push(PragmaSuggestion {
            name: "foreign_keys".into(),
            current: "OFF".into(),
            recommended: "ON".into(),
            statement: "PRAGMA foreign_keys = ON".into(),
            reason: "foreign key constraints are declared but not enforced".into(),
        });
    }

    let sorts = patterns.iter().any(|p| {
        ["order by", "group by", "distinct"]
            .iter()
            .any(|clause| p.fingerprint.contains(clause))
    });
    if sorts && settings.temp_store != 2 {
        out.push(PragmaSuggestion {
            name: "temp_store".into(),
            current: settings.temp_store.to_string(),
            recommended: "MEMORY".into(),
            statement: "PRAGMA temp_store = MEMORY".into(),
            reason: "sorting and grouping queries build temporary b-trees".into(),
        });
    }

    let threshold = RecommendOptions::default().slow_query_threshold_ms;
    let slow = patterns.iter().filter(|p| p.avg_duration_ms >= threshold).count();
    if slow > 0 && !settings.has_statistics {
        out.push(PragmaSuggestion {
            name: "analyze".into(),
            current: "no statistics".into(),
            recommended: "ANALYZE".into(),
            statement: "ANALYZE".into(),
            reason: format!("{slow} slow query pattern(s) and the planner has no table statistics"),
        });
    }

    out
}
