//! Immutable configuration snapshot consumed by the core.
//!
//! Loading this from an INI file is explicitly out of scope for the core
//! (see spec.md §1); this module owns the *shape* of the snapshot plus a
//! TOML-based loader for the ambient CLI/main-wiring, in the same style as
//! the teacher's `appconfig.rs` / `db/config.rs`.

use crate::error::{TqdbError, TqdbResult};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mariadb: Option<ProtocolConfig>,
    #[serde(default)]
    pub postgres: Option<ProtocolConfig>,

    pub shards: Vec<ShardConfig>,

    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    pub listen_addr: String,
    pub default_shard: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    pub name: String,
    pub primary: String,
    #[serde(default)]
    pub replicas: Vec<String>,
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default = "default_health_probe_interval_ms")]
    pub health_probe_interval_ms: u64,
}

fn default_health_probe_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_bytes: u64,
    pub stale_multiplier: f64,
    pub refresh_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            stale_multiplier: 2.0,
            refresh_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_wait_ms: u64,
    pub drain_grace_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_wait_ms: 30_000,
            drain_grace_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate the configuration snapshot from a TOML file.
    ///
    /// The path defaults to `TQDBPROXY_CONFIG`, falling back to
    /// `config/tqdbproxy.toml`, matching the teacher's env-var-override
    /// pattern in `db/config.rs::TimescaleDbConfig::load`.
    pub fn load() -> TqdbResult<Self> {
        let path = std::env::var("TQDBPROXY_CONFIG")
            .unwrap_or_else(|_| "config/tqdbproxy.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> TqdbResult<Self> {
        let raw = fs::read_to_string(path).map_err(TqdbError::ConfigIo)?;
        let cfg: Self = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> TqdbResult<()> {
        if self.mariadb.is_none() && self.postgres.is_none() {
            return Err(TqdbError::InvalidConfig(
                "at least one of [mariadb] or [postgres] must be configured".into(),
            ));
        }

        if self.shards.is_empty() {
            return Err(TqdbError::InvalidConfig(
                "must define at least one [[shards]]".into(),
            ));
        }

        let mut seen_names = HashSet::new();
        let mut db_owner: HashMap<String, String> = HashMap::new();

        for shard in &self.shards {
            if shard.name.trim().is_empty() {
                return Err(TqdbError::InvalidConfig(
                    "shard name must not be empty".into(),
                ));
            }
            if !seen_names.insert(shard.name.clone()) {
                return Err(TqdbError::InvalidConfig(format!(
                    "duplicate shard name '{}'",
                    shard.name
                )));
            }
            if shard.primary.trim().is_empty() {
                return Err(TqdbError::InvalidConfig(format!(
                    "shard '{}': primary address must not be empty",
                    shard.name
                )));
            }
            for db in &shard.databases {
                if let Some(existing) = db_owner.insert(db.clone(), shard.name.clone()) {
                    return Err(TqdbError::InvalidConfig(format!(
                        "database '{db}' mapped to both shard '{existing}' and '{}'",
                        shard.name
                    )));
                }
            }
        }

        if let Some(p) = &self.mariadb {
            validate_protocol("mariadb", p, &seen_names)?;
        }
        if let Some(p) = &self.postgres {
            validate_protocol("postgres", p, &seen_names)?;
        }

        if self.batch.max_batch_size == 0 {
            return Err(TqdbError::InvalidConfig(
                "batch.max_batch_size must be > 0".into(),
            ));
        }
        if self.cache.stale_multiplier < 1.0 {
            return Err(TqdbError::InvalidConfig(
                "cache.stale_multiplier must be >= 1.0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve a database name to its shard, falling back to the protocol's
    /// configured default shard when unmapped (spec.md §4.D ResolveShard).
    pub fn resolve_shard<'a>(&'a self, database: &str, default_shard: &'a str) -> &'a str {
        for shard in &self.shards {
            if shard.databases.iter().any(|d| d == database) {
                return &shard.name;
            }
        }
        default_shard
    }

    pub fn shard(&self, name: &str) -> Option<&ShardConfig> {
        self.shards.iter().find(|s| s.name == name)
    }
}

fn validate_protocol(
    label: &str,
    p: &ProtocolConfig,
    shard_names: &HashSet<String>,
) -> TqdbResult<()> {
    if p.listen_addr.trim().is_empty() {
        return Err(TqdbError::InvalidConfig(format!(
            "{label}.listen_addr must not be empty"
        )));
    }
    if !shard_names.contains(&p.default_shard) {
        return Err(TqdbError::InvalidConfig(format!(
            "{label}.default_shard '{}' is not a configured shard",
            p.default_shard
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        toml::from_str(
            r#"
            [mariadb]
            listen_addr = "0.0.0.0:3306"
            default_shard = "s1"

            [[shards]]
            name = "s1"
            primary = "10.0.0.1:3306"
            replicas = ["10.0.0.2:3306", "10.0.0.3:3306"]
            databases = ["app"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn validates_clean_config() {
        let cfg = sample();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_missing_protocols() {
        let mut cfg = sample();
        cfg.mariadb = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_shard_names() {
        let mut cfg = sample();
        let dup = cfg.shards[0].clone();
        cfg.shards.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_database_claimed_by_two_shards() {
        let mut cfg = sample();
        let mut other = cfg.shards[0].clone();
        other.name = "s2".into();
        other.primary = "10.0.0.9:3306".into();
        cfg.shards.push(other);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolve_shard_falls_back_to_default() {
        let cfg = sample();
        assert_eq!(cfg.resolve_shard("app", "s1"), "s1");
        assert_eq!(cfg.resolve_shard("unknown_db", "s1"), "s1");
    }

    #[test]
    fn default_shard_must_exist() {
        let mut cfg = sample();
        cfg.mariadb.as_mut().unwrap().default_shard = "missing".into();
        assert!(cfg.validate().is_err());
    }
}
