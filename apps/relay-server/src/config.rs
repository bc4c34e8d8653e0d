// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::Level;

const fn default_port() -> u16 {
    3000
}

fn default_hostname() -> String {
    "localhost".to_string()
}

const fn default_session_ttl_ms() -> u64 {
    900_000
}

fn default_recordings_dir() -> String {
    "./recordings".to_string()
}

const fn default_max_listeners() -> usize {
    200
}

fn default_cors_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "https://localhost".to_string(),
        "http://localhost:*".to_string(),
        "https://localhost:*".to_string(),
        "http://127.0.0.1".to_string(),
        "https://127.0.0.1".to_string(),
        "http://127.0.0.1:*".to_string(),
        "https://127.0.0.1:*".to_string(),
    ]
}

/// CORS configuration for cross-origin requests.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests.
    /// Supports wildcards: "http://localhost:*" matches any port on localhost.
    /// Set to `["*"]` to allow all origins.
    #[serde(default = "default_cors_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: default_cors_allowed_origins() }
    }
}

/// HTTP server bind settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Advertised hostname, used to build `listen_url` values returned from session creation.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// TCP port the HTTP/WebSocket listener binds to.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { hostname: default_hostname(), port: default_port(), cors: CorsConfig::default() }
    }
}

impl ServerConfig {
    /// Socket address to bind, e.g. `"0.0.0.0:3000"`.
    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

/// Session lifecycle limits.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionConfig {
    /// Time-to-live for a session from creation, in milliseconds.
    #[serde(default = "default_session_ttl_ms")]
    pub ttl_ms: u64,
    /// Hard cap on concurrently attached listeners for a single session.
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_ms: default_session_ttl_ms(), max_listeners: default_max_listeners() }
    }
}

/// Where recordings are written.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RecordingsConfig {
    #[serde(default = "default_recordings_dir")]
    pub dir: String,
}

impl Default for RecordingsConfig {
    fn default() -> Self {
        Self { dir: default_recordings_dir() }
    }
}

/// Console/file log verbosity.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead).
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation).
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: true,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./relay.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

/// Telemetry and observability configuration (OpenTelemetry OTLP export).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub tracing_enable: bool,
    pub otlp_endpoint: Option<String>,
    pub otlp_traces_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            tracing_enable: false,
            otlp_endpoint: None,
            otlp_traces_endpoint: None,
            otlp_headers: HashMap::new(),
        }
    }
}

/// Root configuration for the relay service.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub recordings: RecordingsConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads configuration from defaults, an optional TOML file, and environment
/// variables.
///
/// Two environment variable namespaces are honored, least to most specific:
/// the flat, unprefixed names from the external wire contract (`PORT`,
/// `HOSTNAME`, `SESSION_TTL_MS`, `RECORDINGS_DIR`,
/// `MAX_LISTENERS_PER_SESSION`), and `RELAY_`-prefixed structured overrides
/// (`RELAY_SERVER__PORT`, ...) for everything else, including the ambient
/// logging/telemetry knobs that have no unprefixed equivalent.
///
/// # Errors
///
/// Returns an error if the configuration file exists but fails to parse, or
/// if an environment variable holds a value of the wrong type.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

    let mut file_missing = None;

    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    figment = figment.merge(Env::prefixed("RELAY_").split("__"));

    let mut config: Config = figment.extract().map_err(Box::new)?;

    apply_unprefixed_env_fallbacks(&mut config);

    Ok(ConfigLoadResult { config, file_missing })
}

/// Applies the flat, unprefixed environment variables from the external wire
/// contract. Each one only takes effect if its `RELAY_`-namespaced
/// equivalent was not already set, so the structured namespace always wins
/// when both are present.
fn apply_unprefixed_env_fallbacks(config: &mut Config) {
    if std::env::var("RELAY_SERVER__PORT").is_err() {
        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            config.server.port = port;
        }
    }
    if std::env::var("RELAY_SERVER__HOSTNAME").is_err() {
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            config.server.hostname = hostname;
        }
    }
    if std::env::var("RELAY_SESSION__TTL_MS").is_err() {
        if let Some(ttl_ms) = std::env::var("SESSION_TTL_MS").ok().and_then(|v| v.parse().ok()) {
            config.session.ttl_ms = ttl_ms;
        }
    }
    if std::env::var("RELAY_RECORDINGS__DIR").is_err() {
        if let Ok(dir) = std::env::var("RECORDINGS_DIR") {
            config.recordings.dir = dir;
        }
    }
    if std::env::var("RELAY_SESSION__MAX_LISTENERS").is_err() {
        if let Some(max_listeners) =
            std::env::var("MAX_LISTENERS_PER_SESSION").ok().and_then(|v| v.parse().ok())
        {
            config.session.max_listeners = max_listeners;
        }
    }
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to
/// TOML. Extremely unlikely in practice; would indicate a programming error.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    let default_config = Config::default();
    toml::to_string_pretty(&default_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_external_contract() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.hostname, "localhost");
        assert_eq!(config.session.ttl_ms, 900_000);
        assert_eq!(config.recordings.dir, "./recordings");
        assert_eq!(config.session.max_listeners, 200);
    }

    #[test]
    fn bind_address_uses_configured_port() {
        let mut server = ServerConfig::default();
        server.port = 4545;
        assert_eq!(server.bind_address(), "0.0.0.0:4545");
    }

    #[test]
    fn missing_config_file_is_reported_but_not_fatal() {
        let result = load("/nonexistent/path/relay.toml").unwrap();
        assert!(result.file_missing.is_some());
        assert_eq!(result.config.server.port, 3000);
    }
}
