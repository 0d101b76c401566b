use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Matches `${VAR}` and `${VAR:default}` placeholders in raw YAML text.
static INTERPOLATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").unwrap());

/// Server-level HTTP listener settings (spec §6 "Server").
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub max_header_bytes: usize,
    /// Global cap enforced by the Connection Manager's `Add`, distinct from
    /// the per-user device cap enforced at the upgrade handler.
    pub max_connections: usize,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// WebSocket tuning parameters (spec §6 "WebSocket").
#[derive(Clone, Debug, Deserialize)]
pub struct WebSocketConfig {
    pub write_wait_secs: u64,
    pub pong_wait_secs: u64,
    pub ping_period_secs: u64,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    pub client_buffer_size: usize,
    pub cleanup_interval_secs: u64,
    pub stale_connection_timeout_secs: u64,
    pub register_buffer: usize,
    pub unregister_buffer: usize,
    pub broadcast_buffer: usize,
    pub max_connections_per_user: usize,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_secs: u64,
    pub check_origin: bool,
    pub allowed_origins: Vec<String>,
    pub enable_compression: bool,
    pub compression_level: i32,
    pub max_messages_per_second: u32,
    pub burst_size: u32,
    /// High/low watermarks for outbound queue backpressure (spec §4.2).
    pub queue_high_watermark: usize,
    pub queue_low_watermark: usize,
}

impl WebSocketConfig {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
    pub fn stale_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_connection_timeout_secs)
    }
}

/// Shutdown sequencing settings (spec §6 "Shutdown").
#[derive(Clone, Debug, Deserialize)]
pub struct ShutdownConfig {
    pub timeout_secs: u64,
    pub wait_for_connections: bool,
    pub drain_timeout_secs: u64,
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Auth for the internal `/broadcast` ingestion endpoint (spec §6).
#[derive(Clone, Debug, Deserialize)]
pub struct IngestionConfig {
    pub shared_secret: String,
}

/// Offline-bus producer settings (spec §4.12, §6).
#[derive(Clone, Debug, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub offline_topic: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
    pub shutdown: ShutdownConfig,
    pub ingestion: IngestionConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub is_dev: bool,
}

impl Config {
    /// Load configuration from a base YAML file overlaid by an
    /// environment-specific file, both under `CONFIG_PATH` (default
    /// `./config`), selected by `APP_ENV` (default `development`).
    ///
    /// `${VAR}` / `${VAR:default}` placeholders in either file are
    /// interpolated against the process environment before parsing.
    pub fn load() -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
        let config_dir = PathBuf::from(config_dir);

        let base = load_yaml_value(&config_dir.join("base.yaml"))?;
        let overlay = load_yaml_value(&config_dir.join(format!("{app_env}.yaml")))?;

        let merged = match (base, overlay) {
            (Some(b), Some(o)) => merge(b, o),
            (Some(b), None) => b,
            (None, Some(o)) => o,
            (None, None) => {
                return Err(AppError::Internal);
            }
        };

        let mut config: Config = serde_yaml::from_value(merged).map_err(|e| {
            tracing::error!(error = ?e, "failed to deserialize merged configuration");
            AppError::Internal
        })?;
        config.is_dev = app_env != "production";
        Ok(config)
    }
}

/// Read a YAML file, interpolate `${VAR:default}` placeholders against the
/// process environment, and parse it into a generic [`serde_yaml::Value`].
/// Returns `Ok(None)` if the file does not exist (the overlay file is
/// optional — not every environment needs its own overrides).
fn load_yaml_value(path: &Path) -> AppResult<Option<serde_yaml::Value>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            tracing::error!(path = %path.display(), error = ?e, "failed to read config file");
            return Err(AppError::Internal);
        }
    };

    let interpolated = interpolate(&raw);
    let value: serde_yaml::Value = serde_yaml::from_str(&interpolated).map_err(|e| {
        tracing::error!(path = %path.display(), error = ?e, "failed to parse config file");
        AppError::Internal
    })?;
    Ok(Some(value))
}

/// Substitute every `${VAR}` / `${VAR:default}` occurrence with the matching
/// environment variable, falling back to the literal default text (or an
/// empty string) when the variable is unset.
fn interpolate(input: &str) -> String {
    INTERPOLATION
        .replace_all(input, |caps: &regex::Captures| {
            let var = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Deep-merge two YAML mappings, with `overlay` taking precedence. Non-mapping
/// values (including sequences) are replaced wholesale rather than merged
/// element-wise.
fn merge(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged_value = match base_map.remove(&key) {
                    Some(base_value) => merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged_value);
            }
            Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolate_replaces_known_var() {
        std::env::set_var("RTG_TEST_VAR", "hello");
        assert_eq!(interpolate("value: ${RTG_TEST_VAR}"), "value: hello");
        std::env::remove_var("RTG_TEST_VAR");
    }

    #[test]
    fn interpolate_falls_back_to_default_when_unset() {
        std::env::remove_var("RTG_MISSING_VAR");
        assert_eq!(
            interpolate("value: ${RTG_MISSING_VAR:fallback}"),
            "value: fallback"
        );
    }

    #[test]
    fn interpolate_falls_back_to_empty_string_without_default() {
        std::env::remove_var("RTG_MISSING_VAR_2");
        assert_eq!(interpolate("value: ${RTG_MISSING_VAR_2}"), "value: ");
    }

    #[test]
    fn merge_overlay_overrides_scalar_and_keeps_untouched_keys() {
        let base: serde_yaml::Value = serde_yaml::from_str(
            "server:\n  host: 127.0.0.1\n  port: 8080\nwebsocket:\n  max_message_size: 1024\n",
        )
        .unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("server:\n  port: 9090\n").unwrap();

        let merged = merge(base, overlay);
        let merged_str = serde_yaml::to_string(&merged).unwrap();
        assert!(merged_str.contains("port: 9090"));
        assert!(merged_str.contains("host: 127.0.0.1"));
        assert!(merged_str.contains("max_message_size: 1024"));
    }

    #[test]
    fn load_yaml_value_returns_none_for_missing_file() {
        let result = load_yaml_value(Path::new("/nonexistent/does-not-exist.yaml")).unwrap();
        assert!(result.is_none());
    }
}
