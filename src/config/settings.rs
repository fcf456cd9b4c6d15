use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Storage backend: "memory", "sqlite" or "postgres"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Background poll period in milliseconds (0 disables the loop)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_url")]
    pub url: String,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// bcrypt cost factor (4..=31)
    #[serde(default = "default_password_hash_rounds")]
    pub password_hash_rounds: u32,
    /// Users created on start when no user exists yet
    #[serde(default)]
    pub initial_users: Vec<InitialUserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitialUserConfig {
    pub username: String,
    pub password: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Lower bound for a non-zero poll interval.
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;

fn default_backend() -> String {
    "memory".to_string()
}

fn default_poll_interval_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_sqlite_url() -> String {
    "sqlite://broker.db?mode=rwc".to_string()
}

fn default_busy_timeout() -> u32 {
    5
}

fn default_database_url() -> String {
    "postgres://localhost:5432/broker".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    600 // 10 minutes
}

fn default_password_hash_rounds() -> u32 {
    10
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("store.backend", default_backend())?
            .set_default("store.poll_interval_ms", default_poll_interval_ms())?
            .set_default("sqlite.url", default_sqlite_url())?
            .set_default("database.pool_size", default_pool_size())?
            .set_default("auth.password_hash_rounds", default_password_hash_rounds())?
            .set_default("log.format", default_log_format())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // STORE__BACKEND, SQLITE__URL, DATABASE__URL, DATABASE__POOL_SIZE, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }
}

impl StoreConfig {
    /// Effective poll interval, `None` when polling is disabled.
    pub fn poll_interval(&self) -> Option<std::time::Duration> {
        match self.poll_interval_ms {
            0 => None,
            ms => Some(std::time::Duration::from_millis(ms.max(MIN_POLL_INTERVAL_MS))),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: default_sqlite_url(),
            busy_timeout_seconds: default_busy_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password_hash_rounds: default_password_hash_rounds(),
            initial_users: vec![],
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.store.backend, "memory");
        assert_eq!(settings.store.poll_interval_ms, 30_000);
        assert_eq!(settings.database.pool_size, 10);
        assert_eq!(settings.auth.password_hash_rounds, 10);
        assert!(settings.auth.initial_users.is_empty());
        assert_eq!(settings.log.format, "text");
    }

    #[test]
    fn test_poll_interval_clamped() {
        let mut store = StoreConfig::default();
        assert_eq!(
            store.poll_interval(),
            Some(std::time::Duration::from_secs(30))
        );

        store.poll_interval_ms = 10;
        assert_eq!(
            store.poll_interval(),
            Some(std::time::Duration::from_millis(MIN_POLL_INTERVAL_MS))
        );

        store.poll_interval_ms = 0;
        assert_eq!(store.poll_interval(), None);
    }
}
