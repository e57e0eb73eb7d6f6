//! Layered configuration: a `config/cdn.toml`-style file (overridable via
//! `CDN_CONFIG`) composed with environment variables for the core keys,
//! following the teacher's serde + per-field-default-function pattern.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub usage: UsageConfig,

    #[serde(default = "default_false")]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            fetch: FetchConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            usage: UsageConfig::default(),
            debug: default_false(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_origin_mode")]
    pub mode: String,
    #[serde(default)]
    pub allowed_origins: String,
    #[serde(default)]
    pub blocked_origins: String,
    /// Which registry backend to bind, e.g. `"memory"`. `None` means no
    /// registry is bound at all — fine in `open`/`list` mode, where the
    /// registry is only ever consulted opportunistically, but in
    /// `registered` mode it means every host is denied with a logged
    /// configuration error rather than silently treated as unregistered.
    #[serde(default)]
    pub registry_backend: Option<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            mode: default_origin_mode(),
            allowed_origins: String::new(),
            blocked_origins: String::new(),
            registry_backend: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_false")]
    pub forward_client_ip: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
            timeout_ms: default_fetch_timeout_ms(),
            user_agent: default_user_agent(),
            forward_client_ip: default_false(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_usage_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default)]
    pub wal_path: Option<String>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_usage_flush_interval_secs(),
            wal_path: None,
        }
    }
}

fn default_origin_mode() -> String {
    "open".to_string()
}

fn default_max_file_size() -> u64 {
    500 * 1024 * 1024
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    "mediacache-proxy/1.0".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_usage_flush_interval_secs() -> u64 {
    60
}

fn default_false() -> bool {
    false
}

/// Parses human-friendly size strings like `500MB`, `50KB`, `2GB`, or a bare
/// byte count, matching the units used in SPEC_FULL.md §6's configuration
/// table.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split_at = raw.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split_at);
    let unit = unit.trim().to_ascii_uppercase();
    let base: u64 = digits.trim().parse().ok()?;
    let multiplier = match unit.as_str() {
        "" | "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(base * multiplier)
}

impl Config {
    /// Loads from `CDN_CONFIG` if set, else `config/cdn.toml` if present, else
    /// defaults; then applies the core environment variable overrides from
    /// §6's first table.
    pub fn load() -> PipelineResult<Self> {
        let path = env::var("CDN_CONFIG").unwrap_or_else(|_| "config/cdn.toml".to_string());
        let mut config = if Path::new(&path).exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| PipelineError::Config(format!("failed to read {path}: {e}")))?;
            toml::from_str(&contents)
                .map_err(|e| PipelineError::Config(format!("failed to parse {path}: {e}")))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = env::var("ORIGIN_MODE") {
            self.admission.mode = mode;
        }
        if let Ok(allowed) = env::var("ALLOWED_ORIGINS") {
            self.admission.allowed_origins = allowed;
        }
        if let Ok(blocked) = env::var("BLOCKED_ORIGINS") {
            self.admission.blocked_origins = blocked;
        }
        if let Ok(backend) = env::var("REGISTRY_BACKEND") {
            self.admission.registry_backend = if backend.is_empty() { None } else { Some(backend) };
        }
        if let Ok(max_size) = env::var("MAX_FILE_SIZE") {
            if let Some(bytes) = parse_size(&max_size) {
                self.fetch.max_file_size_bytes = bytes;
            }
        }
        if let Ok(timeout) = env::var("FETCH_TIMEOUT") {
            if let Ok(ms) = timeout.parse() {
                self.fetch.timeout_ms = ms;
            }
        }
        if let Ok(ua) = env::var("ORIGIN_USER_AGENT") {
            self.fetch.user_agent = ua;
        }
        if let Ok(forward) = env::var("FORWARD_CLIENT_IP") {
            self.fetch.forward_client_ip = forward.eq_ignore_ascii_case("true") || forward == "1";
        }
        if let Ok(debug) = env::var("DEBUG") {
            self.debug = debug.eq_ignore_ascii_case("true") || debug == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.admission.mode, "open");
        assert_eq!(config.fetch.max_file_size_bytes, 500 * 1024 * 1024);
        assert_eq!(config.fetch.timeout_ms, 30_000);
        assert!(!config.fetch.forward_client_ip);
        assert!(!config.debug);
    }

    #[test]
    fn parses_human_friendly_sizes() {
        assert_eq!(parse_size("500MB"), Some(500 * 1024 * 1024));
        assert_eq!(parse_size("50KB"), Some(50 * 1024));
        assert_eq!(parse_size("2GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("bogus"), None);
    }
}
