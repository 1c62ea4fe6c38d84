use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Telemetry relay: rebroadcasts every frame to all other clients", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RELAY_CHANNEL_CAPACITY", help = "Frames buffered per slow client before it starts skipping.")]
    pub channel_capacity: Option<usize>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            channel_capacity: other.channel_capacity.or(self.channel_capacity),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(256).max(1)
    }
}

pub fn resolve(cli: Config) -> Config {
    // 1. Load defaults (port 8080 is where the ground display connects)
    let default_config = Config {
        port: Some(8080),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        channel_capacity: Some(256),
        ..Default::default()
    };

    // 2. Load from config file (telemetry_relay.conf) if present.
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("telemetry_relay.conf"));

    let mut current_config = default_config;
    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path).map(|text| serde_json::from_str::<Config>(&text)) {
            Ok(Ok(file_config)) => current_config = current_config.merge(file_config),
            Ok(Err(e)) => log::warn!("Failed to parse config file {}: {}.", config_file_path.display(), e),
            Err(e) => log::warn!("Failed to read config file {}: {}.", config_file_path.display(), e),
        }
    }

    // 3. Override with environment variables and CLI arguments
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}
