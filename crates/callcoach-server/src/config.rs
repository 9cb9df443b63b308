//! Server configuration loading from file and environment variables.

use callcoach_media::MediaConfig;
use callcoach_pipeline::{LlmOptions, SttOptions};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Media plane settings.
    #[serde(default)]
    pub media: MediaConfig,

    /// Streaming transcription settings.
    #[serde(default)]
    pub stt: SttOptions,

    /// Coaching model settings.
    #[serde(default)]
    pub llm: LlmOptions,
}

/// Network configuration for the HTTP/WebSocket server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Development mode: error responses carry full detail instead of the
    /// masked production message.
    #[serde(default)]
    pub dev_mode: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "callcoach_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CALLCOACH_HOST` overrides `server.host`
/// - `CALLCOACH_PORT` overrides `server.port`
/// - `CALLCOACH_DEV` overrides `server.dev_mode` (set to "true" to enable)
/// - `CALLCOACH_LOG_LEVEL` overrides `logging.level`
/// - `CALLCOACH_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `CALLCOACH_ANNOUNCED_ADDRESS` overrides `media.announced_address`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("CALLCOACH_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("CALLCOACH_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(dev) = std::env::var("CALLCOACH_DEV") {
        config.server.dev_mode = dev == "true" || dev == "1";
    }
    if let Ok(level) = std::env::var("CALLCOACH_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("CALLCOACH_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(address) = std::env::var("CALLCOACH_ANNOUNCED_ADDRESS") {
        config.media.announced_address = address;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some("/nonexistent/callcoach.toml")).expect("defaults");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.stt.model, "nova-3");
        assert_eq!(config.llm.model, "gemini-2.0-flash-lite");
        assert!(!config.server.dev_mode);
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[server]\nport = 4001\ndev_mode = true\n\n[stt]\nlanguage = \"en-GB\"\n\n[media]\nannounced_address = \"198.51.100.4\"\n"
        )
        .unwrap();

        let config = load_config(file.path().to_str()).expect("parse");
        assert_eq!(config.server.port, 4001);
        assert!(config.server.dev_mode);
        assert_eq!(config.stt.language, "en-GB");
        assert_eq!(config.stt.model, "nova-3", "unset stt fields keep defaults");
        assert_eq!(config.media.announced_address, "198.51.100.4");
    }

    #[test]
    fn invalid_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "server = \"not a table\"").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }
}
