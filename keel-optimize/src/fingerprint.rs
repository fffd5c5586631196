//! SQL shape normalization.
//!
//! Two statements that differ only in literal values, parameter style,
//! `IN (...)` list length, whitespace or keyword case produce the same
//! fingerprint. Quoted identifiers keep their case.

use std::sync::LazyLock;

use regex_lite::Regex;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\b[xX])?'(?:[^']|'')*'").expect("static regex"));

static PARAMETER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\?\d+|\$\d+|[:@$][A-Za-z_][A-Za-z0-9_]*").expect("static regex")
});

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b0x[0-9a-f]+\b|\b\d+(?:\.\d+)?(?:e[+-]?\d+)?\b").expect("static regex")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

static IN_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bin\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").expect("static regex")
});

static TABLE_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    let ident = r#"(?:"(?:[^"]|"")+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_$]*)"#;
    Regex::new(&format!(
        r"(?i)\b(?:from|update(?:\s+or\s+[a-z]+)?|into)\s+({ident})(?:\s*\.\s*({ident}))?"
    ))
    .expect("static regex")
});

/// Normalize a statement into its fingerprint.
///
/// ```
/// use keel_optimize::fingerprint;
///
/// assert_eq!(
///     fingerprint("SELECT * FROM users WHERE id IN (1, 2, 3) AND name = 'bob'"),
///     fingerprint("select *  from users where id in (?) and name = :name"),
/// );
/// ```
pub fn fingerprint(sql: &str) -> String {
    let masked = STRING_LITERAL.replace_all(sql, "?");

    let mut out = String::with_capacity(masked.len());
    for (quoted, segment) in split_quoted(&masked) {
        if quoted {
            out.push_str(segment);
        } else {
            let segment = PARAMETER.replace_all(segment, "?");
            let segment = NUMBER.replace_all(&segment, "?");
            let segment = WHITESPACE.replace_all(&segment, " ");
            out.push_str(&segment.to_lowercase());
        }
    }

    let out = IN_LIST.replace_all(&out, "in (?)");
    out.trim().trim_end_matches(';').trim_end().to_string()
}

/// The first `FROM` / `UPDATE` / `INTO` target of a statement.
pub fn infer_table(sql: &str) -> Option<String> {
    let masked = STRING_LITERAL.replace_all(sql, "?");
    let caps = TABLE_TARGET.captures(&masked)?;
    let name = caps.get(2).or_else(|| caps.get(1))?;
    Some(unquote_ident(name.as_str()))
}

/// Strip `"..."` or `` `...` `` quoting from an identifier.
pub fn unquote_ident(ident: &str) -> String {
    let bytes = ident.as_bytes();
    if ident.len() >= 2 {
        let (first, last) = (bytes[0], bytes[ident.len() - 1]);
        if first == b'"' && last == b'"' {
            return ident[1..ident.len() - 1].replace("\"\"", "\"");
        }
        if first == b'`' && last == b'`' {
            return ident[1..ident.len() - 1].to_string();
        }
    }
    ident.to_string()
}

/// Split into `(is_quoted_identifier, text)` segments.
fn split_quoted(sql: &str) -> Vec<(bool, &str)> {
    let mut segments = Vec::new();
    let mut open: Option<(char, usize)> = None;
    let mut start = 0;

    for (i, c) in sql.char_indices() {
        match open {
            None if c == '"' || c == '`' => {
                if start < i {
                    segments.push((false, &sql[start..i]));
                }
                open = Some((c, i));
            }
            Some((quote, from)) if c == quote => {
                segments.push((true, &sql[from..=i]));
                start = i + 1;
                open = None;
            }
            _ => {}
        }
    }

    match open {
        // Unterminated quote: keep the tail verbatim.
        Some((_, from)) => segments.push((true, &sql[from..])),
        None if start < sql.len() => segments.push((false, &sql[start..])),
        None => {}
    }
    segments
}
