use std::path::PathBuf;
use std::time::Duration;

use crate::limits::{DEFAULT_HORIZON_DAYS, MAX_HORIZON_DAYS};

/// Process configuration, read from `BOOKD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub settings_path: PathBuf,
    pub metrics_port: Option<u16>,
    pub google_api_base: String,
    /// Days listed when a request does not say.
    pub default_days: u32,
    /// Deadline for free/busy and calendar calls.
    pub provider_timeout: Duration,
    pub notify_timeout: Duration,
    pub compact_threshold: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind: std::env::var("BOOKD_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("BOOKD_PORT").unwrap_or(8080),
            data_dir: std::env::var("BOOKD_DATA_DIR")
                .unwrap_or_else(|_| "./data".into())
                .into(),
            settings_path: std::env::var("BOOKD_SETTINGS")
                .unwrap_or_else(|_| "./bookd.toml".into())
                .into(),
            metrics_port: env_parse("BOOKD_METRICS_PORT"),
            google_api_base: std::env::var("BOOKD_GOOGLE_API_BASE")
                .unwrap_or_else(|_| crate::adapters::google::GOOGLE_API_BASE.into()),
            default_days: env_parse("BOOKD_DEFAULT_DAYS")
                .unwrap_or(DEFAULT_HORIZON_DAYS)
                .clamp(1, MAX_HORIZON_DAYS),
            provider_timeout: Duration::from_millis(env_parse("BOOKD_PROVIDER_TIMEOUT_MS").unwrap_or(5_000)),
            notify_timeout: Duration::from_millis(env_parse("BOOKD_NOTIFY_TIMEOUT_MS").unwrap_or(10_000)),
            compact_threshold: env_parse("BOOKD_COMPACT_THRESHOLD").unwrap_or(1000),
        }
    }

    pub fn engine_options(&self) -> crate::engine::EngineOptions {
        crate::engine::EngineOptions {
            default_days: self.default_days,
            provider_timeout: self.provider_timeout,
            notify_timeout: self.notify_timeout,
        }
    }
}
