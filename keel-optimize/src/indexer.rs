//! Index recommendations from recorded query patterns.
//!
//! Each pattern's statement is tokenized and walked clause by clause.
//! Columns compared in `WHERE` or `JOIN ... ON`, and columns listed in
//! `ORDER BY` / `GROUP BY`, become candidate index keys on the table they
//! resolve to. Candidates are merged across patterns, checked against the
//! indexes that already exist, and ranked.

use std::collections::HashMap;
use std::sync::LazyLock;

use keel_schema::{SchemaSnapshot, TableSchema};
use keel_sqlite::quote_ident;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fingerprint::{fingerprint, unquote_ident};
use crate::recorder::QueryPattern;

/// Options for [`AutoIndexer::analyze_and_recommend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendOptions {
    /// Query patterns recorded fewer times than this are ignored.
    pub min_frequency: u64,
    /// Average duration at which a candidate becomes high priority.
    pub slow_query_threshold_ms: f64,
    /// Upper bound on the number of recommendations returned.
    pub max_recommendations: usize,
}

impl Default for RecommendOptions {
    fn default() -> Self {
        Self {
            min_frequency: 5,
            slow_query_threshold_ms: 1000.0,
            max_recommendations: 10,
        }
    }
}

impl RecommendOptions {
    /// Set the minimum frequency.
    pub fn min_frequency(mut self, min: u64) -> Self {
        self.min_frequency = min;
        self
    }

    /// Set the slow query threshold.
    pub fn slow_query_threshold_ms(mut self, ms: f64) -> Self {
        self.slow_query_threshold_ms = ms;
        self
    }

    /// Set the maximum number of recommendations.
    pub fn max_recommendations(mut self, max: usize) -> Self {
        self.max_recommendations = max;
        self
    }
}

/// How urgent a recommendation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A suggested index. Advice only; nothing is created automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecommendation {
    pub table: String,
    /// Key columns in index order.
    pub columns: Vec<String>,
    pub priority: Priority,
    /// Rough expected reduction of the supporting queries' time, 0-100.
    pub estimated_impact_percent: f64,
    /// `"high"`, `"moderate"` or `"low"`.
    pub impact: String,
    pub justification: String,
    /// `CREATE INDEX IF NOT EXISTS ...`
    pub ddl: String,
    pub index_name: String,
    /// Executions of the supporting patterns.
    pub frequency: u64,
    /// Execution-weighted mean duration of the supporting patterns.
    pub avg_duration_ms: f64,
    /// Fingerprints of the supporting patterns.
    pub supporting_queries: Vec<String>,
}

/// How a column is used by a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// `col = ?`, `col IN (...)`, `col IS ?`.
    Equality,
    /// `a.col = b.col` inside a join condition.
    Join,
    /// `<`, `>`, `BETWEEN`, `LIKE`, `GLOB`.
    Range,
    /// `ORDER BY` / `GROUP BY`.
    Ordering,
}

/// A column reference resolved against a schema snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnUsage {
    pub table: String,
    pub column: String,
    pub kind: UsageKind,
}

/// Turns query patterns into index recommendations.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoIndexer;

impl AutoIndexer {
    /// Build ranked, de-duplicated recommendations for `patterns`.
    pub fn analyze_and_recommend(
        snapshot: &SchemaSnapshot,
        patterns: &[QueryPattern],
        options: &RecommendOptions,
    ) -> Vec<IndexRecommendation> {
        let mut merged: Vec<Candidate> = Vec::new();
        let mut by_key: HashMap<(String, Vec<String>), usize> = HashMap::new();

        let frequent = patterns.iter().filter(|p| p.count >= options.min_frequency);
        for pattern in frequent {
            for (table, columns) in candidate_columns(pattern, snapshot) {
                let key = (
                    table.to_lowercase(),
                    columns.iter().map(|c| c.to_lowercase()).collect::<Vec<_>>(),
                );
                let candidate = Candidate::from_pattern(table, columns, pattern);
                match by_key.get(&key) {
                    Some(&idx) => merged[idx].absorb(candidate),
                    None => {
                        by_key.insert(key, merged.len());
                        merged.push(candidate);
                    }
                }
            }
        }

        let uncovered: Vec<Candidate> = merged
            .into_iter()
            .filter(|c| {
                let covered = snapshot
                    .table(&c.table)
                    .is_none_or(|t| t.is_covered_by_index(&c.columns));
                if covered {
                    debug!(
                        table = %c.table,
                        columns = ?c.columns,
                        "Candidate already covered by an index"
                    );
                }
                !covered
            })
            .collect();

        let mut recommendations: Vec<IndexRecommendation> = fold_prefixes(uncovered)
            .into_iter()
            .map(|c| c.into_recommendation(options))
            .collect();

        recommendations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| score(b).total_cmp(&score(a)))
                .then_with(|| a.index_name.cmp(&b.index_name))
        });
        recommendations.truncate(options.max_recommendations);

        info!(
            patterns = patterns.len(),
            recommendations = recommendations.len(),
            "Index analysis finished"
        );
        recommendations
    }

    /// Whether `recommendation` still applies to `snapshot`: the table and
    /// every column exist and no index covers the key yet.
    pub fn revalidate(recommendation: &IndexRecommendation, snapshot: &SchemaSnapshot) -> bool {
        let Some(table) = snapshot.table(&recommendation.table) else {
            return false;
        };
        recommendation.columns.iter().all(|c| table.has_column(c))
            && !table.is_covered_by_index(&recommendation.columns)
    }
}

fn score(rec: &IndexRecommendation) -> f64 {
    rec.frequency as f64 * rec.avg_duration_ms
}

#[derive(Debug, Clone)]
struct Candidate {
    table: String,
    columns: Vec<String>,
    frequency: u64,
    total_ms: f64,
    max_ms: f64,
    fingerprints: Vec<String>,
}

impl Candidate {
    fn from_pattern(table: String, columns: Vec<String>, pattern: &QueryPattern) -> Self {
        Self {
            table,
            columns,
            frequency: pattern.count,
            total_ms: pattern.total_duration_ms(),
            max_ms: pattern.max_duration_ms,
            fingerprints: vec![pattern.fingerprint.clone()],
        }
    }

    fn absorb(&mut self, other: Candidate) {
        self.frequency += other.frequency;
        self.total_ms += other.total_ms;
        self.max_ms = self.max_ms.max(other.max_ms);
        for fp in other.fingerprints {
            if !self.fingerprints.contains(&fp) {
                self.fingerprints.push(fp);
            }
        }
    }

    fn avg_ms(&self) -> f64 {
        if self.frequency == 0 {
            0.0
        } else {
            self.total_ms / self.frequency as f64
        }
    }

    /// `self.columns` is a strict prefix of `other.columns` on the same table.
    fn is_strict_prefix_of(&self, other: &Candidate) -> bool {
        self.table.eq_ignore_ascii_case(&other.table)
            && other.columns.len() > self.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    fn into_recommendation(self, options: &RecommendOptions) -> IndexRecommendation {
        let avg = self.avg_ms();
        let threshold = options.slow_query_threshold_ms;
        let priority = if avg >= threshold {
            Priority::High
        } else if avg >= threshold / 2.0
            || self.frequency >= options.min_frequency.saturating_mul(10)
        {
            Priority::Medium
        } else {
            Priority::Low
        };

        let estimated_impact_percent = estimate_impact(priority, avg, threshold);
        let impact = if estimated_impact_percent >= 60.0 {
            "high"
        } else if estimated_impact_percent >= 30.0 {
            "moderate"
        } else {
            "low"
        };

        let index_name = index_name(&self.table, &self.columns);
        let ddl = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&index_name),
            quote_ident(&self.table),
            self.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let justification = format!(
            "{} executions across {} statement shape(s) averaging {:.1} ms (max {:.1} ms); \
             no index on {} starts with ({})",
            self.frequency,
            self.fingerprints.len(),
            avg,
            self.max_ms,
            self.table,
            self.columns.join(", ")
        );

        IndexRecommendation {
            table: self.table,
            columns: self.columns,
            priority,
            estimated_impact_percent,
            impact: impact.to_string(),
            justification,
            ddl,
            index_name,
            frequency: self.frequency,
            avg_duration_ms: avg,
            supporting_queries: self.fingerprints,
        }
    }
}

/// Fold each candidate that is a strict prefix of a longer one on the same
/// table into the most frequent such longer candidate.
fn fold_prefixes(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by_key(|&i| candidates[i].columns.len());

    let mut removed = vec![false; candidates.len()];
    for &i in &order {
        let target = (0..candidates.len())
            .filter(|&j| j != i && !removed[j] && candidates[i].is_strict_prefix_of(&candidates[j]))
            .max_by_key(|&j| candidates[j].frequency);

        if let Some(j) = target {
            let folded = candidates[i].clone();
            debug!(
                table = %folded.table,
                from = ?folded.columns,
                into = ?candidates[j].columns,
                "Folding prefix candidate"
            );
            candidates[j].absorb(folded);
            removed[i] = true;
        }
    }

    candidates
        .into_iter()
        .zip(removed)
        .filter_map(|(c, gone)| (!gone).then_some(c))
        .collect()
}

fn estimate_impact(priority: Priority, avg_ms: f64, threshold_ms: f64) -> f64 {
    let base = match priority {
        Priority::High => 60.0,
        Priority::Medium => 35.0,
        Priority::Low => 10.0,
    };
    let ratio = if threshold_ms > 0.0 {
        (avg_ms / threshold_ms).min(3.0) / 3.0
    } else {
        1.0
    };
    (base + ratio * 30.0).min(95.0)
}

fn index_name(table: &str, columns: &[String]) -> String {
    let mut name = String::from("idx_");
    name.push_str(table);
    for column in columns {
        name.push('_');
        name.push_str(column);
    }
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Candidate key columns per table for one pattern.
///
/// Equality filters come first, then range filters, then ordering columns.
/// Join columns only form a candidate on their own, for tables the pattern
/// does not otherwise filter. A table whose whole primary key is matched by
/// equality is already a point lookup and yields nothing.
fn candidate_columns(
    pattern: &QueryPattern,
    snapshot: &SchemaSnapshot,
) -> Vec<(String, Vec<String>)> {
    let usages = extract_column_usage(&pattern.fingerprint, pattern.table.as_deref(), snapshot);

    let mut tables: Vec<String> = Vec::new();
    for usage in &usages {
        if !tables.contains(&usage.table) {
            tables.push(usage.table.clone());
        }
    }

    let mut out = Vec::new();
    for table_name in tables {
        let Some(table) = snapshot.table(&table_name) else {
            continue;
        };
        let of_kind = |kind: UsageKind| -> Vec<String> {
            let mut cols: Vec<String> = Vec::new();
            for u in usages.iter().filter(|u| u.table == table_name && u.kind == kind) {
                if !cols.contains(&u.column) {
                    cols.push(u.column.clone());
                }
            }
            cols
        };

        let equality = of_kind(UsageKind::Equality);
        if is_point_lookup(table, &equality) {
            continue;
        }

        let mut columns = equality;
        for column in of_kind(UsageKind::Range).into_iter().chain(of_kind(UsageKind::Ordering)) {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        if columns.is_empty() {
            columns = of_kind(UsageKind::Join)
                .into_iter()
                .filter(|c| !table.primary_key.iter().any(|k| k.eq_ignore_ascii_case(c)))
                .collect();
        }

        if !columns.is_empty() {
            out.push((table.name.clone(), columns));
        }
    }
    out
}

fn is_point_lookup(table: &TableSchema, equality: &[String]) -> bool {
    !table.primary_key.is_empty()
        && table
            .primary_key
            .iter()
            .all(|k| equality.iter().any(|c| c.eq_ignore_ascii_case(k)))
}

// ---------------------------------------------------------------------------
// Statement walking
// ---------------------------------------------------------------------------

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:[^"]|"")*"|`[^`]*`|[A-Za-z_][A-Za-z0-9_$]*|\?|<=|>=|<>|!=|==|\|\||\S"#)
        .expect("static regex")
});

const KEYWORDS: &[&str] = &[
    "abort", "all", "and", "as", "asc", "between", "by", "case", "cast", "collate", "cross",
    "default", "delete", "desc", "distinct", "else", "end", "escape", "except", "exists", "fail",
    "false", "first", "from", "full", "glob", "group", "having", "ignore", "in", "indexed", "inner",
    "insert", "intersect", "into", "is", "join", "last", "left", "like", "limit", "match",
    "natural", "not", "null", "nulls", "offset", "on", "or", "order", "outer", "over", "partition",
    "recursive", "regexp", "replace", "returning", "right", "rollback", "select", "set", "then",
    "true", "union", "update", "using", "values", "when", "where", "window", "with",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.binary_search(&word).is_ok()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Bare word, lowercased.
    Word(String),
    /// Quoted identifier, unquoted.
    Quoted(String),
    Placeholder,
    Symbol(String),
}

impl Token {
    fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Word(w) if w == word)
    }

    fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self, Token::Symbol(s) if s == symbol)
    }

    fn ident(&self) -> Option<&str> {
        match self {
            Token::Word(w) if !is_keyword(w) => Some(w),
            Token::Quoted(q) => Some(q),
            _ => None,
        }
    }
}

fn tokenize(sql: &str) -> Vec<Token> {
    TOKEN
        .find_iter(sql)
        .map(|m| {
            let s = m.as_str();
            if s.starts_with('"') || s.starts_with('`') {
                Token::Quoted(unquote_ident(s))
            } else if s == "?" {
                Token::Placeholder
            } else if s.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
                Token::Word(s.to_ascii_lowercase())
            } else {
                Token::Symbol(s.to_string())
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Other,
    From,
    Filter,
    Ordering,
}

#[derive(Debug, Clone)]
struct Scope {
    clause: Clause,
    tables: Vec<String>,
    aliases: HashMap<String, String>,
    has_from: bool,
    fallback: Option<String>,
}

impl Scope {
    fn root(table_hint: Option<&str>) -> Self {
        Self {
            clause: Clause::Other,
            tables: Vec::new(),
            aliases: HashMap::new(),
            has_from: false,
            fallback: table_hint.map(str::to_string),
        }
    }

    fn child(&self) -> Self {
        Self {
            clause: match self.clause {
                Clause::From => Clause::Other,
                other => other,
            },
            tables: self.tables.clone(),
            aliases: self.aliases.clone(),
            has_from: false,
            fallback: self.fallback.clone(),
        }
    }

    /// Parse `table [AS alias]` at `i`. Returns the index after it.
    fn add_table_ref(&mut self, tokens: &[Token], i: usize) -> Option<usize> {
        let first = tokens.get(i)?.ident()?;
        let (table, mut next) = if tokens.get(i + 1).is_some_and(|t| t.is_symbol(".")) {
            (tokens.get(i + 2)?.ident()?, i + 3)
        } else {
            (first, i + 1)
        };
        let table = table.to_string();

        let alias = match tokens.get(next) {
            Some(t) if t.is_word("as") => {
                let alias = tokens.get(next + 1).and_then(Token::ident).map(str::to_string);
                next += 2;
                alias
            }
            Some(t) => t.ident().map(|a| {
                next += 1;
                a.to_string()
            }),
            None => None,
        };

        if !self.has_from {
            self.tables.clear();
            self.has_from = true;
        }
        if let Some(alias) = alias {
            self.aliases.insert(alias.to_lowercase(), table.clone());
        }
        self.aliases.insert(table.to_lowercase(), table.clone());
        self.tables.push(table);
        Some(next)
    }

    fn resolve(
        &self,
        snapshot: &SchemaSnapshot,
        qualifier: Option<&str>,
        column: &str,
    ) -> Option<(String, String)> {
        if ["rowid", "oid", "_rowid_"].iter().any(|r| column.eq_ignore_ascii_case(r)) {
            return None;
        }

        let found = |table: &TableSchema| {
            table.column(column).map(|c| (table.name.clone(), c.name.clone()))
        };
        match qualifier {
            Some(q) => {
                let name = self.aliases.get(&q.to_lowercase()).map(String::as_str).unwrap_or(q);
                snapshot.table(name).and_then(found)
            }
            None => self
                .tables
                .iter()
                .chain(self.fallback.iter())
                .filter_map(|name| snapshot.table(name))
                .find_map(found),
        }
    }
}

/// Parse `[qualifier.]column` at `i`. Function calls are not column references.
fn parse_column_ref(tokens: &[Token], i: usize) -> Option<(Option<String>, String, usize)> {
    let first = tokens.get(i)?.ident()?;
    match tokens.get(i + 1) {
        Some(t) if t.is_symbol("(") => None,
        Some(t) if t.is_symbol(".") => {
            let column = tokens.get(i + 2)?.ident()?;
            if tokens.get(i + 3).is_some_and(|t| t.is_symbol("(")) {
                return None;
            }
            Some((Some(first.to_string()), column.to_string(), i + 3))
        }
        _ => Some((None, first.to_string(), i + 1)),
    }
}

/// The usage implied by the operator at `j`, when the left operand is a column.
fn comparison_at(tokens: &[Token], j: usize) -> Option<UsageKind> {
    match tokens.get(j)? {
        Token::Symbol(s) => match s.as_str() {
            "=" | "==" => Some(UsageKind::Equality),
            "<" | ">" | "<=" | ">=" => Some(UsageKind::Range),
            _ => None,
        },
        Token::Word(w) => match w.as_str() {
            "in" => Some(UsageKind::Equality),
            "is" if !tokens.get(j + 1).is_some_and(|t| t.is_word("not")) => {
                Some(UsageKind::Equality)
            }
            "between" | "like" | "glob" => Some(UsageKind::Range),
            _ => None,
        },
        _ => None,
    }
}

/// `? = col` and friends.
fn reversed_comparison(tokens: &[Token], i: usize) -> Option<UsageKind> {
    if i < 2 || tokens[i - 2] != Token::Placeholder {
        return None;
    }
    match &tokens[i - 1] {
        Token::Symbol(s) if s == "=" || s == "==" => Some(UsageKind::Equality),
        Token::Symbol(s) if matches!(s.as_str(), "<" | ">" | "<=" | ">=") => Some(UsageKind::Range),
        _ => None,
    }
}

/// Every index-relevant column reference in `sql`, resolved against `snapshot`.
///
/// Unqualified columns resolve to the first table in scope that has them,
/// falling back to `table_hint`. References to unknown tables or columns are
/// dropped.
pub fn extract_column_usage(
    sql: &str,
    table_hint: Option<&str>,
    snapshot: &SchemaSnapshot,
) -> Vec<ColumnUsage> {
    let tokens = tokenize(&fingerprint(sql));
    let mut usages = Vec::new();
    let mut stack: Vec<Scope> = Vec::new();
    let mut scope = Scope::root(table_hint);

    let mut push = |scope: &Scope, qualifier: Option<&str>, column: &str, kind: UsageKind| {
        if let Some((table, column)) = scope.resolve(snapshot, qualifier, column) {
            usages.push(ColumnUsage { table, column, kind });
        }
    };

    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Symbol(s) if s == "(" => {
                let child = scope.child();
                stack.push(std::mem::replace(&mut scope, child));
                i += 1;
                continue;
            }
            Token::Symbol(s) if s == ")" => {
                if let Some(parent) = stack.pop() {
                    scope = parent;
                }
                i += 1;
                continue;
            }
            Token::Symbol(s) if s == "," && scope.clause == Clause::From => {
                i = scope.add_table_ref(&tokens, i + 1).unwrap_or(i + 1);
                continue;
            }
            Token::Word(w) if is_keyword(w) => {
                match w.as_str() {
                    "from" | "join" => {
                        scope.clause = Clause::From;
                        if let Some(next) = scope.add_table_ref(&tokens, i + 1) {
                            i = next;
                            continue;
                        }
                    }
                    "update" | "into" => {
                        scope.clause = Clause::Other;
                        let mut at = i + 1;
                        if tokens.get(at).is_some_and(|t| t.is_word("or")) {
                            at += 2;
                        }
                        if let Some(next) = scope.add_table_ref(&tokens, at) {
                            i = next;
                            continue;
                        }
                    }
                    "where" | "on" => scope.clause = Clause::Filter,
                    "order" | "group" if tokens.get(i + 1).is_some_and(|t| t.is_word("by")) => {
                        scope.clause = Clause::Ordering;
                        i += 2;
                        continue;
                    }
                    "select" | "set" | "values" | "having" | "limit" | "offset" | "union"
                    | "except" | "intersect" | "returning" | "using" | "window" => {
                        scope.clause = Clause::Other;
                    }
                    _ => {}
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        let Some((qualifier, column, next)) = parse_column_ref(&tokens, i) else {
            i += 1;
            continue;
        };

        match scope.clause {
            Clause::Filter => {
                let kind = comparison_at(&tokens, next).or_else(|| reversed_comparison(&tokens, i));
                if let Some(kind) = kind {
                    let is_eq = tokens
                        .get(next)
                        .is_some_and(|t| t.is_symbol("=") || t.is_symbol("=="));
                    match parse_column_ref(&tokens, next + 1).filter(|_| is_eq) {
                        Some((other_qualifier, other_column, after)) => {
                            push(&scope, qualifier.as_deref(), &column, UsageKind::Join);
                            let other = other_qualifier.as_deref();
                            push(&scope, other, &other_column, UsageKind::Join);
                            i = after;
                            continue;
                        }
                        None => push(&scope, qualifier.as_deref(), &column, kind),
                    }
                }
            }
            Clause::Ordering => push(&scope, qualifier.as_deref(), &column, UsageKind::Ordering),
            Clause::Other | Clause::From => {}
        }
        i = next;
    }

    usages
}
