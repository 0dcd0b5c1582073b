//! Error kinds surfaced by the forwarding core and the management API
//!
//! Every per-request error is turned into a response for that connection;
//! none of them escape the connection task.

use hyper::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The inbound host matched no rule
    #[error("no route configured for host '{host}'")]
    NoRoute { host: String, available: Vec<String> },

    /// Connect or TLS handshake to the target failed
    #[error("upstream {target} unreachable: {reason}")]
    UpstreamUnreachable { target: String, reason: String },

    /// No bytes from the target within the idle window
    #[error("upstream {target} sent nothing for {}ms", .after.as_millis())]
    UpstreamTimeout { target: String, after: Duration },

    #[error("invalid rule: {0}")]
    InvalidRuleInput(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("failed to persist config: {0}")]
    ConfigPersist(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Methods the proxy does not relay, such as CONNECT tunnels
    #[error("method not supported: {0}")]
    MethodNotSupported(String),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Upstream failed after the response head was relayed
    #[error("upstream body error: {0}")]
    UpstreamBody(String),

    #[error("certificate generation failed: {0}")]
    Certificate(String),
}

impl ProxyError {
    /// HTTP status used when this error is reported to a client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute { .. } => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnreachable { .. } | ProxyError::UpstreamBody(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRuleInput(_)
            | ProxyError::TlsConfig(_)
            | ProxyError::InvalidConfig(_)
            | ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Bind { .. } => StatusCode::CONFLICT,
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::MethodNotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            ProxyError::ConfigPersist(_) | ProxyError::Certificate(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable kind, also sent as `x-proxy-error`
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NoRoute { .. } => "no-route",
            ProxyError::UpstreamUnreachable { .. } => "upstream-unreachable",
            ProxyError::UpstreamTimeout { .. } => "upstream-timeout",
            ProxyError::InvalidRuleInput(_) => "invalid-rule",
            ProxyError::TlsConfig(_) => "tls-config",
            ProxyError::ConfigPersist(_) => "config-persist",
            ProxyError::InvalidConfig(_) => "invalid-config",
            ProxyError::Bind { .. } => "bind",
            ProxyError::BadRequest(_) => "bad-request",
            ProxyError::PayloadTooLarge { .. } => "payload-too-large",
            ProxyError::MethodNotSupported(_) => "method-not-supported",
            ProxyError::UpstreamBody(_) => "upstream-body",
            ProxyError::Certificate(_) => "certificate",
        }
    }

    /// JSON body for the error response
    pub fn to_json(&self) -> Value {
        match self {
            ProxyError::NoRoute { host, available } => json!({
                "error": "no route configured",
                "kind": self.kind(),
                "host": host,
                "available_rules": available,
            }),
            _ => json!({
                "error": self.to_string(),
                "kind": self.kind(),
            }),
        }
    }
}
