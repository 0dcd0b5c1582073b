//! Proxy configuration
//!
//! Mirrors the persisted document (`proxy_rules`, `https`, `port`,
//! `log_level`) plus the upstream and listener tuning knobs. Every field has
//! a default so partial documents load.

use crate::error::ProxyError;
use crate::rules::Rule;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Full proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub proxy_rules: BTreeMap<String, String>,
    pub https: HttpsConfig,
    pub port: u16,
    pub bind_address: String,
    pub log_level: LogLevel,
    pub upstream: UpstreamConfig,
    pub shutdown_grace_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_rules: BTreeMap::new(),
            https: HttpsConfig::default(),
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            log_level: LogLevel::Info,
            upstream: UpstreamConfig::default(),
            shutdown_grace_ms: 10_000,
        }
    }
}

impl ProxyConfig {
    /// Validated, normalized rules. Sources differing only by case collide.
    pub fn rules(&self) -> Result<Vec<Rule>, ProxyError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(self.proxy_rules.len());
        for (source, target) in &self.proxy_rules {
            let rule = Rule::new(source, target)?;
            if !seen.insert(rule.source.clone()) {
                return Err(ProxyError::InvalidRuleInput(format!(
                    "duplicate source '{}'",
                    rule.source
                )));
            }
            rules.push(rule);
        }
        Ok(rules)
    }

    /// Check everything except the loadability of TLS material, which the
    /// TLS terminator checks at bind time.
    pub fn validate(&self) -> Result<(), ProxyError> {
        self.rules()?;

        if self.bind_address.trim().is_empty() {
            return Err(ProxyError::InvalidConfig("bind_address must not be empty".into()));
        }
        if self.https.enabled && (self.https.cert_path.is_none() || self.https.key_path.is_none()) {
            return Err(ProxyError::TlsConfig(
                "https is enabled but cert_path/key_path are not set".into(),
            ));
        }
        self.upstream.validate()
    }

    /// `bind_address:port`
    pub fn listen_addr(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// True when going from `self` to `next` needs a new listening socket
    pub fn listener_changed(&self, next: &ProxyConfig) -> bool {
        self.port != next.port || self.bind_address != next.bind_address || self.https != next.https
    }
}

/// HTTPS settings for the listening side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "empty_path_as_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(deserialize_with = "empty_path_as_none")]
    pub key_path: Option<PathBuf>,
    /// Generate a self-signed pair when enabled without paths
    pub auto_generate: bool,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            auto_generate: true,
        }
    }
}

fn empty_path_as_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(PathBuf::from))
}

/// Scheme used to reach targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    Https,
    Http,
}

impl UpstreamScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Https => "https",
            UpstreamScheme::Http => "http",
        }
    }
}

/// Outbound connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub scheme: UpstreamScheme,
    pub connect_timeout_ms: u64,
    /// Idle-read timeout for buffered responses
    pub idle_timeout_ms: u64,
    /// Idle-read timeout for event streams, 0 disables it
    pub stream_idle_timeout_ms: u64,
    pub max_idle_per_host: usize,
    pub pool_idle_timeout_ms: u64,
    /// Soft cap on concurrent requests per target
    pub max_connections_per_target: usize,
    /// How long a request waits for a slot once the soft cap is reached
    pub queue_wait_ms: u64,
    pub accept_invalid_certs: bool,
    pub max_request_body_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            scheme: UpstreamScheme::Https,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            stream_idle_timeout_ms: 0,
            max_idle_per_host: 16,
            pool_idle_timeout_ms: 90_000,
            max_connections_per_target: 64,
            queue_wait_ms: 250,
            accept_invalid_certs: false,
            max_request_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl UpstreamConfig {
    fn validate(&self) -> Result<(), ProxyError> {
        if self.connect_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig("upstream.connect_timeout_ms must be > 0".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig("upstream.idle_timeout_ms must be > 0".into()));
        }
        if self.max_connections_per_target == 0 {
            return Err(ProxyError::InvalidConfig(
                "upstream.max_connections_per_target must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_ms > 0).then(|| Duration::from_millis(self.stream_idle_timeout_ms))
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_idle_timeout_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }
}

/// Log verbosity. Parsed case-insensitively, written uppercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_directive().to_ascii_uppercase())
    }
}

impl FromStr for LogLevel {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ProxyError::InvalidConfig(format!("unknown log level '{}'", other))),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
