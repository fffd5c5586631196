//! Declarative per-table validation rules.
//!
//! A [`RuleSet`] maps field names to named checks. Sets are built once,
//! either derived from a discovered [`TableSchema`] or assembled by hand, and
//! then applied to JSON records before they are written.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::error::{SchemaError, SchemaResult};
use crate::types::{ColumnMetadata, TableSchema};

/// A single field check. Returns a human-readable reason on failure.
pub type RuleFn = Arc<dyn Fn(&JsonValue) -> Result<(), String> + Send + Sync>;

/// A named check on one field.
#[derive(Clone)]
pub struct Rule {
    name: String,
    check: RuleFn,
}

impl Rule {
    /// Create a rule from a closure.
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// The rule's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reject missing or null values.
    pub fn required() -> Self {
        Self::new("required", |v| {
            if v.is_null() {
                Err("is required".to_string())
            } else {
                Ok(())
            }
        })
    }

    /// Accept null or an integer (booleans count as 0/1).
    pub fn integer() -> Self {
        Self::new("integer", |v| match v {
            JsonValue::Null | JsonValue::Bool(_) => Ok(()),
            JsonValue::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
            _ => Err("must be an integer".to_string()),
        })
    }

    /// Accept null or any number.
    pub fn real() -> Self {
        Self::new("real", |v| match v {
            JsonValue::Null | JsonValue::Number(_) => Ok(()),
            _ => Err("must be a number".to_string()),
        })
    }

    /// Accept null or a string.
    pub fn text() -> Self {
        Self::new("text", |v| match v {
            JsonValue::Null | JsonValue::String(_) => Ok(()),
            _ => Err("must be a string".to_string()),
        })
    }

    /// Accept null or a string of at most `max` characters.
    pub fn max_length(max: usize) -> Self {
        Self::new(format!("max_length({})", max), move |v| match v {
            JsonValue::String(s) if s.chars().count() > max => {
                Err(format!("must be at most {} characters", max))
            }
            _ => Ok(()),
        })
    }

    fn check(&self, value: &JsonValue) -> Result<(), String> {
        (self.check)(value)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule").field("name", &self.name).finish()
    }
}

/// Field name to rules, for one table.
#[derive(Debug, Clone)]
pub struct RuleSet {
    table: String,
    rules: BTreeMap<String, Vec<Rule>>,
    allow_unknown_fields: bool,
}

impl RuleSet {
    /// An empty rule set.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rules: BTreeMap::new(),
            allow_unknown_fields: false,
        }
    }

    /// Derive required and type-affinity rules from a discovered table.
    ///
    /// A column is required when it is NOT NULL with no default and is not
    /// filled in by the rowid.
    pub fn from_table(table: &TableSchema) -> Self {
        let mut set = Self::new(&table.name);
        for column in &table.columns {
            let entry = set.rules.entry(column.name.clone()).or_default();
            if is_required(column) {
                entry.push(Rule::required());
            }
            if let Some(rule) = affinity_rule(&column.declared_type) {
                entry.push(rule);
            }
        }
        set
    }

    /// Add a rule to a field.
    pub fn rule(mut self, field: impl Into<String>, rule: Rule) -> Self {
        self.rules.entry(field.into()).or_default().push(rule);
        self
    }

    /// Whether fields without rules are accepted.
    pub fn allow_unknown_fields(mut self, allow: bool) -> Self {
        self.allow_unknown_fields = allow;
        self
    }

    /// The table this set validates.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Fields known to this set.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Rules registered for a field.
    pub fn rules_for(&self, field: &str) -> &[Rule] {
        self.rules.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check a record, collecting every failure.
    pub fn validate(&self, record: &Map<String, JsonValue>) -> SchemaResult<()> {
        let mut failures = Vec::new();

        if !self.allow_unknown_fields {
            for field in record.keys() {
                if !self.rules.keys().any(|k| k.eq_ignore_ascii_case(field)) {
                    failures.push(format!("{} is not a known field", field));
                }
            }
        }

        for (field, rules) in &self.rules {
            let value = record
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(field))
                .map(|(_, v)| v)
                .unwrap_or(&JsonValue::Null);

            for rule in rules {
                if let Err(reason) = rule.check(value) {
                    failures.push(format!("{} {}", field, reason));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Validation {
                table: self.table.clone(),
                failures,
            })
        }
    }
}

fn is_required(column: &ColumnMetadata) -> bool {
    !column.nullable && column.default_value.is_none() && !column.auto_increment
}

/// Type rule following SQLite's column affinity rules, if one applies.
fn affinity_rule(declared_type: &str) -> Option<Rule> {
    let upper = declared_type.to_ascii_uppercase();
    if upper.contains("INT") {
        Some(Rule::integer())
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        Some(Rule::text())
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        Some(Rule::real())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> TableSchema {
        TableSchema {
            name: "users".into(),
            columns: vec![
                ColumnMetadata {
                    name: "id".into(),
                    declared_type: "INTEGER".into(),
                    primary_key: true,
                    primary_key_position: 1,
                    auto_increment: true,
                    ..Default::default()
                },
                ColumnMetadata {
                    name: "email".into(),
                    declared_type: "VARCHAR(255)".into(),
                    ..Default::default()
                },
                ColumnMetadata {
                    name: "score".into(),
                    declared_type: "DOUBLE".into(),
                    nullable: true,
                    ..Default::default()
                },
                ColumnMetadata {
                    name: "status".into(),
                    declared_type: "TEXT".into(),
                    default_value: Some("'active'".into()),
                    ..Default::default()
                },
            ],
            primary_key: vec!["id".into()],
            ..Default::default()
        }
    }

    fn record(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_derived_rules_accept_valid_record() {
        let rules = RuleSet::from_table(&users());
        assert!(rules.validate(&record(json!({"email": "a@example.com"}))).is_ok());
        assert!(rules
            .validate(&record(json!({"id": 3, "email": "a@example.com", "score": 1.5})))
            .is_ok());
        assert_eq!(rules.rules_for("email").len(), 2);
        assert!(rules.rules_for("status").iter().all(|r| r.name() != "required"));
    }

    #[test]
    fn test_collects_every_failure() {
        let rules = RuleSet::from_table(&users());
        let err = rules
            .validate(&record(json!({"id": "x", "score": "high", "nickname": "z"})))
            .unwrap_err();
        match err {
            SchemaError::Validation { table, failures } => {
                assert_eq!(table, "users");
                assert_eq!(failures.len(), 4);
                assert!(failures.contains(&"nickname is not a known field".to_string()));
                assert!(failures.contains(&"email is required".to_string()));
                assert!(failures.contains(&"id must be an integer".to_string()));
                assert!(failures.contains(&"score must be a number".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_custom_rules() {
        let rules = RuleSet::from_table(&users())
            .rule("email", Rule::max_length(5))
            .rule(
                "email",
                Rule::new("contains_at", |v| match v.as_str() {
                    Some(s) if !s.contains('@') => Err("must contain '@'".to_string()),
                    _ => Ok(()),
                }),
            )
            .allow_unknown_fields(true);

        let err = rules
            .validate(&record(json!({"email": "nobody", "extra": 1})))
            .unwrap_err();
        assert!(err.to_string().contains("email must be at most 5 characters"));
        assert!(err.to_string().contains("email must contain '@'"));
        assert!(!err.to_string().contains("extra"));
    }
}
