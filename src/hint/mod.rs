//! Hint extraction and lightweight keyword classification (spec.md §4.A).
//!
//! Deliberately not a SQL parser: one regex pulls `/* ttl:N file:F line:N
//! batch:N */` out of the query text, and a handful of whole-word keyword
//! scans classify the statement. Anything more would be superfluous in the
//! hot path (spec.md §9).

use regex::Regex;
use std::sync::LazyLock;

/// Statement classification. `Unknown` covers DDL and anything else we
/// don't special-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Unknown,
    Select,
    Insert,
    Update,
    Delete,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Unknown => "UNKNOWN",
            QueryType::Select => "SELECT",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
        }
    }
}

/// Product of `Parse` (spec.md §3 ParsedQuery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub query_type: QueryType,
    pub ttl_secs: u64,
    pub batch_ms: u32,
    pub file: String,
    pub line: u32,
    pub db: String,
    /// Original text with the hint comment stripped and trimmed.
    pub query: String,
}

impl ParsedQuery {
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        self.query_type == QueryType::Select && self.ttl_secs > 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        matches!(
            self.query_type,
            QueryType::Insert | QueryType::Update | QueryType::Delete
        )
    }

    #[inline]
    pub fn is_batchable(&self) -> bool {
        self.is_writable() && self.batch_ms > 0
    }

    /// `BatchKey(p1) == BatchKey(p2)` whenever `p1.query == p2.query`,
    /// regardless of hint metadata (spec.md §8 invariant 7).
    #[inline]
    pub fn batch_key(&self) -> &str {
        &self.query
    }

    /// Whole-word, case-insensitive `RETURNING` detection for spec.md §9's
    /// `HasReturning` signal.
    pub fn has_returning(&self) -> bool {
        contains_whole_word(&self.query, "RETURNING")
    }
}

const MAX_BATCH_MS: u32 = 100;

static HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)/\*\s*(?:ttl:(?P<ttl>\S+)\s*)?(?:file:(?P<file>\S+)\s*)?(?:line:(?P<line>\S+)\s*)?(?:batch:(?P<batch>\S+)\s*)?\*/",
    )
    .expect("hint regex is a compile-time constant")
});

static KEYWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(SELECT|INSERT|UPDATE|DELETE)\b").expect("static regex"));

static SCHEMA_QUALIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\b(?:FROM|JOIN|INTO|UPDATE)\s+[`"]?(?P<db>[A-Za-z_][A-Za-z0-9_]*)[`"]?\.[`"]?[A-Za-z_][A-Za-z0-9_]*[`"]?"#)
        .expect("static regex")
});

fn contains_whole_word(haystack: &str, word: &str) -> bool {
    let lower_word = word.to_ascii_lowercase();
    let bytes = haystack.as_bytes();
    let lower = haystack.to_ascii_lowercase();
    let mut start = 0;
    while let Some(pos) = lower[start..].find(&lower_word) {
        let abs = start + pos;
        let before_ok = abs == 0 || !is_word_byte(bytes[abs - 1]);
        let end = abs + word.len();
        let after_ok = end >= bytes.len() || !is_word_byte(bytes[end]);
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Parse raw SQL (including any leading hint comment) into a `ParsedQuery`.
///
/// Idempotent: calling `parse` on an already-stripped `query` string yields
/// the same `query` back out (spec.md §8 invariant 6), since there is no
/// hint comment left to strip.
pub fn parse(text: &str) -> ParsedQuery {
    let (stripped, ttl_secs, file, line, batch_ms) = match HINT_RE.find(text) {
        Some(m) => {
            let caps = HINT_RE.captures(text).expect("find implies captures");
            let ttl = caps
                .name("ttl")
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .map(|v| if v < 0 { 0 } else { v as u64 })
                .unwrap_or(0);
            let file = caps
                .name("file")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let line = caps
                .name("line")
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0);
            let batch = caps
                .name("batch")
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .map(clamp_batch_ms)
                .unwrap_or(0);

            let mut s = String::with_capacity(text.len());
            s.push_str(&text[..m.start()]);
            s.push_str(&text[m.end()..]);
            (s, ttl, file, line, batch)
        }
        None => (text.to_string(), 0, String::new(), 0, 0),
    };

    let query = stripped.trim().to_string();
    let query_type = classify(&query);
    let db = extract_db(&query);

    // Writes are never cached (spec.md §3 invariant, §4.A).
    let ttl_secs = if query_type == QueryType::Select {
        ttl_secs
    } else {
        0
    };

    ParsedQuery {
        query_type,
        ttl_secs,
        batch_ms,
        file,
        line,
        db,
        query,
    }
}

fn clamp_batch_ms(v: i64) -> u32 {
    if v < 0 {
        0
    } else if v > MAX_BATCH_MS as i64 {
        MAX_BATCH_MS
    } else {
        v as u32
    }
}

fn classify(query: &str) -> QueryType {
    match KEYWORD_RE
        .find(query)
        .map(|m| m.as_str().to_ascii_uppercase())
        .as_deref()
    {
        Some("SELECT") => QueryType::Select,
        Some("INSERT") => QueryType::Insert,
        Some("UPDATE") => QueryType::Update,
        Some("DELETE") => QueryType::Delete,
        _ => QueryType::Unknown,
    }
}

fn extract_db(query: &str) -> String {
    SCHEMA_QUALIFIER_RE
        .captures(query)
        .and_then(|c| c.name("db"))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_all_hint_tokens() {
        let p = parse("/* ttl:60 file:handlers/users.go line:42 batch:10 */ SELECT 1");
        assert_eq!(p.query_type, QueryType::Select);
        assert_eq!(p.ttl_secs, 60);
        assert_eq!(p.file, "handlers/users.go");
        assert_eq!(p.line, 42);
        assert_eq!(p.batch_ms, 10);
        assert_eq!(p.query, "SELECT 1");
    }

    #[test]
    fn missing_tokens_default_to_zero() {
        let p = parse("/* ttl:60 */ SELECT 1");
        assert_eq!(p.ttl_secs, 60);
        assert_eq!(p.file, "");
        assert_eq!(p.line, 0);
        assert_eq!(p.batch_ms, 0);
    }

    #[test]
    fn no_hint_comment_yields_zero_values() {
        let p = parse("SELECT 1");
        assert_eq!(p.ttl_secs, 0);
        assert_eq!(p.batch_ms, 0);
        assert_eq!(p.query, "SELECT 1");
    }

    #[test]
    fn batch_ms_clamps_above_100() {
        let p = parse("/* batch:500 */ INSERT INTO t(v) VALUES (1)");
        assert_eq!(p.batch_ms, 100);
    }

    #[test]
    fn batch_ms_negative_or_invalid_yields_zero() {
        let p = parse("/* batch:-5 */ INSERT INTO t(v) VALUES (1)");
        assert_eq!(p.batch_ms, 0);
        let p2 = parse("/* batch:notanumber */ INSERT INTO t(v) VALUES (1)");
        assert_eq!(p2.batch_ms, 0);
    }

    #[test]
    fn writes_force_ttl_to_zero() {
        let p = parse("/* ttl:60 */ INSERT INTO t(v) VALUES (1)");
        assert_eq!(p.ttl_secs, 0);
        assert!(!p.is_cacheable());
    }

    #[test]
    fn classifies_each_keyword() {
        assert_eq!(parse("SELECT 1").query_type, QueryType::Select);
        assert_eq!(
            parse("INSERT INTO t VALUES (1)").query_type,
            QueryType::Insert
        );
        assert_eq!(parse("UPDATE t SET x = 1").query_type, QueryType::Update);
        assert_eq!(parse("DELETE FROM t").query_type, QueryType::Delete);
        assert_eq!(parse("BEGIN").query_type, QueryType::Unknown);
    }

    #[test]
    fn extracts_schema_qualifier_from_from_clause() {
        let p = parse("SELECT * FROM `shop`.`orders` WHERE id = 1");
        assert_eq!(p.db, "shop");
    }

    #[test]
    fn extracts_schema_qualifier_from_update() {
        let p = parse(r#"UPDATE "acct"."users" SET x = 1"#);
        assert_eq!(p.db, "acct");
    }

    #[test]
    fn no_qualifier_yields_empty_db() {
        let p = parse("SELECT * FROM orders");
        assert_eq!(p.db, "");
    }

    #[test]
    fn hint_stripping_is_idempotent() {
        let p = parse("/* ttl:60 file:f line:1 batch:5 */ SELECT 1");
        let q = parse(&p.query);
        assert_eq!(q.query, p.query);
    }

    #[test]
    fn batch_key_ignores_hint_metadata() {
        let p1 = parse("/* ttl:60 file:a line:1 batch:5 */ SELECT 1 FROM t");
        let p2 = parse("/* ttl:120 file:b line:99 batch:50 */ SELECT 1 FROM t");
        assert_eq!(p1.batch_key(), p2.batch_key());
    }

    #[test]
    fn has_returning_is_whole_word_case_insensitive() {
        let p = parse("INSERT INTO t(v) VALUES (1) returning id");
        assert!(p.has_returning());
        let p2 = parse("INSERT INTO t(returning_flag) VALUES (1)");
        assert!(!p2.has_returning());
    }
}
