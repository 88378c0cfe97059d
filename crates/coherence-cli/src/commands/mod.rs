pub mod check;
pub mod generations;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use coherence_cache::{CacheConfig, CacheManager};
use coherence_core::{Backend, CoherenceConfig, ConnectionKey};
use coherence_pool::{ConnectionPool, PoolConfig, SqliteConnector};

const DEFAULT_CONFIG: &str = "coherence.toml";

/// Resolve the configuration from `--config`, `./coherence.toml` and `--database`.
pub fn load_config(path: Option<&str>, database: Option<&str>) -> anyhow::Result<CoherenceConfig> {
    let path = path.or_else(|| Path::new(DEFAULT_CONFIG).exists().then_some(DEFAULT_CONFIG));
    let mut config = match (path, database) {
        (Some(path), _) => CoherenceConfig::from_file(Path::new(path))
            .with_context(|| format!("failed to load {path}"))?,
        (None, Some(uri)) => CoherenceConfig::for_database(uri),
        (None, None) => bail!("no database configured: pass --database or --config"),
    };
    if let Some(uri) = database {
        config.database.uri = uri.to_string();
    }
    Ok(config)
}

/// Pool and cache manager for one command invocation.
pub struct Context {
    pub key: ConnectionKey,
    pub pool: Arc<ConnectionPool>,
    pub cache: CacheManager,
}

impl Context {
    pub fn open(config: &CoherenceConfig) -> anyhow::Result<Self> {
        let key = config.connection_key()?;
        if key.backend() != Backend::Sqlite {
            bail!("coherencectl has no connector for {} databases", key.backend());
        }
        let pool = ConnectionPool::new(
            PoolConfig::from(&config.pool),
            Arc::new(SqliteConnector::new()),
        );
        let cache = CacheManager::new(
            Arc::clone(&pool),
            key.clone(),
            CacheConfig::from(&config.cache),
        )?;
        Ok(Self { key, pool, cache })
    }

    /// Close the pool, waiting for outstanding connections.
    pub fn finish(self) {
        let drain_timeout = self.pool.config().drain_timeout;
        self.pool.shutdown(drain_timeout);
    }
}
