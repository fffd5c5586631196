//! Query-driven optimization advice for SQLite.
//!
//! The host reports executed statements to a [`QueryRecorder`]; the
//! [`AutoIndexer`] turns the aggregated patterns into ranked index
//! recommendations against a schema snapshot, and [`suggest_pragmas`]
//! reviews connection settings. Nothing here changes the database.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_optimize::{AutoIndexer, QueryRecorder, RecommendOptions};
//!
//! let recorder = QueryRecorder::default();
//! recorder.record_query("SELECT * FROM users WHERE email = 'a@b.c'", 1200.0, None);
//!
//! let options = RecommendOptions::default();
//! let recs = AutoIndexer::analyze_and_recommend(&snapshot, &recorder.patterns(), &options);
//! for rec in recs.iter().filter(|r| AutoIndexer::revalidate(r, &snapshot)) {
//!     println!("{} -- {}", rec.ddl, rec.justification);
//! }
//! ```

pub mod fingerprint;
pub mod indexer;
pub mod recorder;
pub mod tuning;

pub use fingerprint::{fingerprint, infer_table};
pub use indexer::{
    AutoIndexer, ColumnUsage, IndexRecommendation, Priority, RecommendOptions, UsageKind,
    extract_column_usage,
};
pub use recorder::{DEFAULT_MAX_PATTERNS, QueryPattern, QueryRecorder, RecorderStats};
pub use tuning::{PragmaSettings, PragmaSuggestion, read_pragma_settings, suggest_pragmas};
