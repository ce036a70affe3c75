//! Layered configuration for the watcher.
//!
//! Settings are resolved in order:
//! - Default values
//! - `etcdwatch.toml` in the working directory
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `EW_` and use double
//! underscores to separate nested levels:
//! - `EW_SERVER_URL=http://10.0.0.5:4001` sets `server_url`
//! - `EW_WATCH__FLUSH_PERIOD_SECS=30` sets `watch.flush_period_secs`
//! - `EW_LOGGING__DEFAULT=debug` sets `logging.default`

use std::collections::HashMap;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Base address of the store's HTTP endpoint
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Absolute key-space subtree to watch
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Poll engine tuning
    #[serde(default)]
    pub watch: WatchConfig,

    /// Logging levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Seconds between full resynchronizations; 0 disables them
    #[serde(default)]
    pub flush_period_secs: u64,

    /// Upper bound on any single request, long polls included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// First retry delay after a failed fetch
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Retry delay cap
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_server_url() -> String {
    "http://127.0.0.1:4001".to_string()
}

fn default_prefix() -> String {
    "/".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_backoff_initial() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    8000
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            prefix: default_prefix(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            flush_period_secs: 0,
            request_timeout_secs: default_request_timeout(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, `etcdwatch.toml`, and `EW_`-prefixed
    /// environment variables, in that order of precedence.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("etcdwatch.toml"))
            .merge(Env::prefixed("EW_").split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server_url, "http://127.0.0.1:4001");
        assert_eq!(settings.prefix, "/");
        assert_eq!(settings.watch.flush_period_secs, 0);
        assert_eq!(settings.watch.backoff_initial_ms, 500);
        assert_eq!(settings.watch.backoff_max_ms, 8000);
        assert_eq!(settings.logging.default, "warn");
    }
}
