mod settings;

pub use settings::{
    AuthConfig, DatabaseConfig, InitialUserConfig, LogConfig, Settings, SqliteConfig,
    StoreConfig, MIN_POLL_INTERVAL_MS,
};
