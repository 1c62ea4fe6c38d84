use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_groundstation::core::{DeliveryMode, Identifier};
use lib_groundstation::ingestors::IngestConfig;
use lib_groundstation::ingestors::telemetry_wss::{DEFAULT_KEY, DEFAULT_NAMESPACE, DEFAULT_WS_URL};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Ground-station telemetry gateway", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "GATEWAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_LEVEL", help = "Logging level or filter (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "GATEWAY_MODULES_PATH", help = "Path to the JSON5 module manifest.")]
    pub modules_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_WS_URL", help = "Telemetry source WebSocket URL.")]
    pub ws_url: Option<String>,

    #[clap(long, env = "GATEWAY_NAMESPACE", help = "Namespace of messages without an identifier.")]
    pub default_namespace: Option<String>,

    #[clap(long, env = "GATEWAY_KEY", help = "Key of messages without an identifier.")]
    pub default_key: Option<String>,

    #[clap(long, env = "GATEWAY_DISTRIBUTION_PERIOD_MS", help = "Delivery period to subscribers in milliseconds.")]
    pub distribution_period_ms: Option<u64>,

    #[clap(long, env = "GATEWAY_ON_CHANGE", help = "Only deliver samples a subscriber has not seen yet.")]
    pub on_change: Option<bool>,

    #[clap(long, env = "GATEWAY_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "GATEWAY_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "GATEWAY_MAX_RECONNECT_ATTEMPTS", help = "Consecutive failed connects before giving up (0 = never).")]
    pub max_reconnect_attempts: Option<u32>,

    #[clap(long, env = "GATEWAY_INACTIVITY_TIMEOUT_SECONDS", help = "Seconds of silence before the stream is reconnected (0 = off).")]
    pub inactivity_timeout_seconds: Option<u64>,
}

/// Fully resolved gateway settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub modules_path: PathBuf,
    pub ingest: IngestConfig,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            modules_path: other.modules_path.or(self.modules_path),
            ws_url: other.ws_url.or(self.ws_url),
            default_namespace: other.default_namespace.or(self.default_namespace),
            default_key: other.default_key.or(self.default_key),
            distribution_period_ms: other.distribution_period_ms.or(self.distribution_period_ms),
            on_change: other.on_change.or(self.on_change),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            inactivity_timeout_seconds: other.inactivity_timeout_seconds.or(self.inactivity_timeout_seconds),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            modules_path: Some(PathBuf::from("modules.json5")),
            ws_url: Some(DEFAULT_WS_URL.to_string()),
            default_namespace: Some(DEFAULT_NAMESPACE.to_string()),
            default_key: Some(DEFAULT_KEY.to_string()),
            distribution_period_ms: Some(1000),
            on_change: Some(false),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60000),
            max_reconnect_attempts: Some(0),
            inactivity_timeout_seconds: Some(0),
            ..Default::default()
        }
    }

    fn from_file(path: &Path) -> Option<Config> {
        if !path.exists() {
            log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
            return None;
        }
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Config>(&text) {
                Ok(config) => Some(config),
                Err(e) => {
                    log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        }
    }

    /// Layers defaults, the config file and the CLI/environment, in that order.
    pub fn resolve(cli: Config) -> Result<Settings> {
        let config_file_path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("telemetry_gateway.conf"));

        let mut current = Config::defaults();
        if let Some(file_config) = Config::from_file(&config_file_path) {
            current = current.merge(file_config);
        }
        current.merge(cli).into_settings()
    }

    fn into_settings(self) -> Result<Settings> {
        let ws_url = self.ws_url.context("ws_url is not set")?;
        let parsed = url::Url::parse(&ws_url).with_context(|| format!("invalid ws_url '{}'", ws_url))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            bail!("ws_url must use ws:// or wss://, got '{}'", ws_url);
        }

        let period_ms = self.distribution_period_ms.unwrap_or(1000);
        if period_ms == 0 {
            bail!("distribution_period_ms must be greater than zero");
        }
        let base_ms = self.reconnect_base_delay_ms.unwrap_or(1000).max(1);
        let max_ms = self.reconnect_max_delay_ms.unwrap_or(60000).max(base_ms);

        let ingest = IngestConfig {
            url: ws_url,
            default_identifier: Identifier::new(
                self.default_namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                self.default_key.unwrap_or_else(|| DEFAULT_KEY.to_string()),
            ),
            distribution_period: Duration::from_millis(period_ms),
            delivery_mode: if self.on_change.unwrap_or(false) {
                DeliveryMode::OnChange
            } else {
                DeliveryMode::EveryTick
            },
            reconnect_base_delay: Duration::from_millis(base_ms),
            reconnect_max_delay: Duration::from_millis(max_ms),
            max_reconnect_attempts: self.max_reconnect_attempts.filter(|n| *n > 0),
            inactivity_timeout: self
                .inactivity_timeout_seconds
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
        };

        Ok(Settings {
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            modules_path: self.modules_path.unwrap_or_else(|| PathBuf::from("modules.json5")),
            ingest,
        })
    }
}

pub fn load_config() -> Result<Settings> {
    Config::resolve(Config::parse())
}
