//! Environment-driven configuration.
//!
//! Every `from_env` constructor has a `from_lookup` twin taking the variable lookup as a
//! closure, so parsing can be exercised without mutating the process environment.
//! Unparseable values are logged and replaced by the default.

use std::path::PathBuf;
use std::str::FromStr;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Enables the diagnostic sink (`1`, `true`, `yes`, `on`).
pub const ENV_LOG_PROXY: &str = "JAILPROXY_LOG_PROXY";
/// Diagnostic sink path.
pub const ENV_PROXY_LOG: &str = "JAILPROXY_PROXY_LOG";
/// Server binary used by the default spawner.
pub const ENV_SERVER_BIN: &str = "JAILPROXY_SERVER_BIN";
/// Default client call timeout, in seconds.
pub const ENV_CALL_TIMEOUT_SECS: &str = "JAILPROXY_CALL_TIMEOUT_SECS";
/// Maximum frame length in bytes, both directions.
pub const ENV_MAX_FRAME_BYTES: &str = "JAILPROXY_MAX_FRAME_BYTES";

pub const DEFAULT_PROXY_LOG_PATH: &str = "/tmp/proxy.log";

pub(crate) fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub(crate) fn parse_number<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value, "Ignoring unparseable configuration value");
            None
        }
    }
}

/// Where and whether the server appends its raw traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from(DEFAULT_PROXY_LOG_PATH),
        }
    }
}

impl DiagnosticsConfig {
    /// Enabled sink writing to `path`.
    pub fn enabled_at(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: path.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(flag) = lookup(ENV_LOG_PROXY) {
            config.enabled = parse_flag(&flag);
        }
        if let Some(path) = lookup(ENV_PROXY_LOG).filter(|p| !p.is_empty()) {
            config.path = PathBuf::from(path);
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub diagnostics: DiagnosticsConfig,
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            diagnostics: DiagnosticsConfig::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_frame_length = lookup(ENV_MAX_FRAME_BYTES)
            .and_then(|v| parse_number(ENV_MAX_FRAME_BYTES, &v))
            .unwrap_or(DEFAULT_MAX_FRAME_LENGTH);
        Self {
            diagnostics: DiagnosticsConfig::from_lookup(&lookup),
            max_frame_length,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsConfig) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}
