//! coherence.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::KeyError;
use crate::key::ConnectionKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherenceConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URI, e.g. `sqlite:db/trac.db`.
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
    pub idle_max_age_secs: u64,
    pub probe_on_checkout: bool,
    pub surface_rollback_failures: bool,
    pub drain_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout_ms: 20_000,
            idle_max_age_secs: 30,
            probe_on_checkout: true,
            surface_rollback_failures: false,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Name of the `(id, generation)` table in the backing store.
    pub table: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            table: "cache".to_string(),
        }
    }
}

impl CoherenceConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CoherenceConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parse `[database] uri` into a pooling key.
    pub fn connection_key(&self) -> Result<ConnectionKey, KeyError> {
        ConnectionKey::parse(&self.database.uri)
    }

    /// Minimal config pointing at a database URI, everything else defaulted.
    pub fn for_database(uri: &str) -> Self {
        Self {
            database: DatabaseConfig {
                uri: uri.to_string(),
            },
            pool: PoolSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = CoherenceConfig::from_toml_str(
            r#"
            [database]
            uri = "sqlite:db/trac.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.database.uri, "sqlite:db/trac.db");
        assert_eq!(config.pool, PoolSettings::default());
        assert_eq!(config.cache.table, "cache");
    }

    #[test]
    fn parse_partial_pool_section() {
        let config = CoherenceConfig::from_toml_str(
            r#"
            [database]
            uri = "postgres://trac@db.local/trac"

            [pool]
            max_size = 4
            surface_rollback_failures = true

            [cache]
            table = "trac_cache"
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_size, 4);
        assert!(config.pool.surface_rollback_failures);
        assert_eq!(config.pool.acquire_timeout_ms, 20_000);
        assert_eq!(config.cache.table, "trac_cache");
    }

    #[test]
    fn missing_database_section_is_an_error() {
        assert!(CoherenceConfig::from_toml_str("[pool]\nmax_size = 2\n").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = CoherenceConfig::for_database("sqlite:trac.db");
        let text = config.to_toml_string().unwrap();
        let parsed = CoherenceConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.database.uri, "sqlite:trac.db");
        assert_eq!(parsed.pool, config.pool);
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coherence.toml");
        std::fs::write(&path, "[database]\nuri = \"sqlite:x.db\"\n").unwrap();
        let config = CoherenceConfig::from_file(&path).unwrap();
        assert_eq!(config.connection_key().unwrap().params().database, "x.db");
    }
}
