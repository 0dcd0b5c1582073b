//! devproxy - A development HTTP/HTTPS forwarding proxy
//!
//! Provides:
//! - Host-based forwarding through a live rule table
//! - Server-Sent Events relayed chunk by chunk
//! - Optional TLS termination with a self-signed certificate fallback
//! - A management API for rules and configuration, applied without restart

pub mod api;
pub mod certificate;
pub mod config;
pub mod error;
pub mod forward;
pub mod listener;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod response;
pub mod router;
pub mod rules;
pub mod store;
pub mod tls;

pub use certificate::CertificateManager;
pub use config::{HttpsConfig, LogLevel, ProxyConfig, UpstreamConfig, UpstreamScheme};
pub use error::ProxyError;
pub use forward::{ForwardEngine, ProbeReport};
pub use proxy::{Applied, LogLevelHook, ProxyServer, ServerOptions};
pub use rules::{Rule, RuleTable};
pub use store::{ConfigStore, JsonFileStore, StoreError};
