//! `ConnectionState` (spec.md §3), owned by a front-end task for the
//! lifetime of one client connection. Never shared across tasks: each
//! front-end connection loop owns one of these outright, matching the
//! "parallel threads of execution" model in spec.md §5.

use crate::hint::ParsedQuery;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastBackend {
    Primary,
    Replica(usize),
    Cache,
    None,
}

impl LastBackend {
    pub fn as_str(&self) -> String {
        match self {
            LastBackend::Primary => "primary".to_string(),
            LastBackend::Replica(i) => format!("replicas[{i}]"),
            LastBackend::Cache => "cache".to_string(),
            LastBackend::None => "none".to_string(),
        }
    }
}

pub struct ConnectionState {
    pub shard_name: String,
    pub database: String,
    pub in_transaction: bool,
    /// Keyed by the protocol's statement identifier: a decimal string for
    /// MariaDB's numeric statement ids, the bare name for PostgreSQL's
    /// named/unnamed prepared statements.
    pub prepared_statements: HashMap<String, ParsedQuery>,
    pub last_backend_used: LastBackend,
    pub last_cache_hit: bool,
    pub batch_size_observed: usize,
}

impl ConnectionState {
    pub fn new(shard_name: String, database: String) -> Self {
        Self {
            shard_name,
            database,
            in_transaction: false,
            prepared_statements: HashMap::new(),
            last_backend_used: LastBackend::None,
            last_cache_hit: false,
            batch_size_observed: 0,
        }
    }

    /// `SHOW TQDB STATUS` / `pg_tqdb_status` two-row synthesis source.
    pub fn status_rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Backend", self.last_backend_used.as_str()),
            (
                "Cache_hit",
                if self.last_cache_hit { "1" } else { "0" }.to_string(),
            ),
        ]
    }
}

/// Case-insensitive whole-statement prefix trap for SQL-level transaction
/// boundaries (spec.md §4.E/§4.F).
pub fn transaction_trap(query: &str, in_transaction: &mut bool) {
    let trimmed = query.trim_start();
    let upper: String = trimmed.chars().take(24).collect::<String>().to_uppercase();
    if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
        *in_transaction = true;
    } else if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
        *in_transaction = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_sets_in_transaction() {
        let mut in_tx = false;
        transaction_trap("begin", &mut in_tx);
        assert!(in_tx);
    }

    #[test]
    fn commit_clears_in_transaction() {
        let mut in_tx = true;
        transaction_trap("COMMIT", &mut in_tx);
        assert!(!in_tx);
    }

    #[test]
    fn unrelated_statement_leaves_flag_unchanged() {
        let mut in_tx = true;
        transaction_trap("SELECT 1", &mut in_tx);
        assert!(in_tx);
    }

    #[test]
    fn status_rows_reflect_state() {
        let mut state = ConnectionState::new("s1".into(), "app".into());
        state.last_backend_used = LastBackend::Replica(2);
        state.last_cache_hit = true;
        let rows = state.status_rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&("Backend", "replicas[2]".to_string())));
        assert!(rows.contains(&("Cache_hit", "1".to_string())));
    }
}
