use serde::Deserialize;
use std::env;
use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub limits: LimitsConfig,
    pub chat: ChatConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Static token required by the admin reset endpoint. `None` disables it.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8787".to_string(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9999".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

/// One admission policy: a sliding window plus the cooldown imposed once the
/// window limit is hit. All durations are milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitConfig {
    pub max_attempts: u32,
    pub window_ms: u64,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub checkin: LimitConfig,
    pub chat_message: LimitConfig,
    pub rating: LimitConfig,
    pub login: LimitConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            checkin: LimitConfig {
                max_attempts: 5,
                window_ms: 60_000,
                cooldown_ms: 120_000,
            },
            chat_message: LimitConfig {
                max_attempts: 10,
                window_ms: 30_000,
                cooldown_ms: 60_000,
            },
            rating: LimitConfig {
                max_attempts: 3,
                window_ms: 60_000,
                cooldown_ms: 300_000,
            },
            login: LimitConfig {
                max_attempts: 5,
                window_ms: 300_000,
                cooldown_ms: 900_000,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub retention_hours: u64,
    pub history_limit: usize,
    pub max_message_chars: usize,
    pub sweep_interval_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            retention_hours: 72,
            history_limit: 50,
            max_message_chars: 280,
            sweep_interval_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    pub flush_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "playground_jam_state.json".to_string(),
            flush_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enable: bool,
    pub bind_addr: String,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            bind_addr: "127.0.0.1:9187".to_string(),
            path: "/metrics".to_string(),
        }
    }
}

/// Loads the configuration from `CONFIG_PATH` (default `config.toml`). A
/// missing file yields the built-in defaults; an unreadable or malformed file
/// is a startup error.
pub fn load_config() -> Result<Config> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let config_content = match fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("No config file at {}, using defaults", config_path);
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file: {}", config_path))
        }
    };

    let config: Config = toml::from_str(&config_content)
        .with_context(|| format!("Failed to parse configuration: {}", config_path))?;

    Ok(config)
}
