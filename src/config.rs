//! Configuration management
//!
//! Loads the YAML config file plus `RELAY_*` environment overrides.
//! Runtime-mutable settings (instance name, whitelist switch, ...) live in
//! the database instead; see [`crate::data::RelayConfig`].

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// File-level application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// Public hostname, used in actor IRIs and the Host header
    pub domain: String,
    /// Bind address (e.g. "0.0.0.0")
    pub listen: String,
    /// Port number
    pub port: u16,
    /// Fan-out worker count; 0 means one per CPU
    pub workers: usize,
    pub database_type: DatabaseType,
    /// SQLite file, resolved relative to the config file's directory
    pub sqlite_path: PathBuf,
    #[serde(default, alias = "pg")]
    pub postgres: PostgresConfig,
    pub cache_type: CacheType,
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Store backend selector
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
    Postgres,
}

/// Cache backend selector
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Database,
    Redis,
}

/// PostgreSQL connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub pass: Option<String>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "relay".to_string(),
            user: "relay".to_string(),
            pass: None,
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub database: u8,
    /// Key prefix; must not contain `:` (it is the namespace separator)
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            user: None,
            pass: None,
            database: 0,
            prefix: "relay".to_string(),
        }
    }
}

impl FileConfig {
    /// Load configuration from a YAML file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. The YAML file at `path` (if it exists)
    /// 3. Environment variables (`RELAY__*`)
    ///
    /// # Errors
    /// Returns [`crate::error::AppError::Config`] if the configuration
    /// is missing required keys or fails validation.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        use config::{Config, Environment, File, FileFormat};

        let builder = Config::builder()
            .set_default("domain", "relay.example.com")?
            .set_default("listen", "0.0.0.0")?
            .set_default("port", 8080)?
            .set_default("workers", 0)?
            .set_default("database_type", "sqlite")?
            .set_default("sqlite_path", "relay.sqlite3")?
            .set_default("cache_type", "database")?
            .add_source(
                File::from(path)
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let mut file_config: Self = builder
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        file_config.resolve_paths(path);
        file_config.validate()?;
        Ok(file_config)
    }

    /// The relay's actor IRI
    pub fn actor(&self) -> String {
        format!("https://{}/actor", self.domain)
    }

    /// The relay's inbox IRI
    pub fn inbox(&self) -> String {
        format!("https://{}/inbox", self.domain)
    }

    /// The keyId advertised in outbound signatures
    pub fn keyid(&self) -> String {
        format!("{}#main-key", self.actor())
    }

    /// Effective fan-out worker count (0 in the file means CPU count)
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }

    fn resolve_paths(&mut self, config_path: &Path) {
        if self.sqlite_path.is_relative() {
            if let Some(parent) = config_path.parent() {
                self.sqlite_path = parent.join(&self.sqlite_path);
            }
        }
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.domain.is_empty() {
            return Err(crate::error::AppError::Config(
                "domain must not be empty".to_string(),
            ));
        }

        if self.redis.prefix.contains(':') {
            return Err(crate::error::AppError::Config(
                "redis.prefix must not contain ':'".to_string(),
            ));
        }

        Ok(())
    }
}
