//! Forwarding engine
//!
//! Sends one inbound request to its target and relays the response back.
//! The request line, method, path, query and body are kept as-is; `Host`
//! is rewritten to the target and hop-by-hop headers are dropped in both
//! directions. Upstream redirects are relayed, never followed.

use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::pool::UpstreamPool;
use crate::relay::{RelayBody, RelayMode, ShutdownSignal};
use crate::response::ProxyBody;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST};
use hyper::{Request, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_SNIPPET_CHARS: usize = 500;
const PROBE_READ_LIMIT: usize = 64 * 1024;

/// Remove hop-by-hop headers, including any the `Connection` header names
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// `text/event-stream` responses are streamed, everything else buffered
pub fn classify(headers: &HeaderMap) -> RelayMode {
    let is_event_stream = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_event_stream {
        RelayMode::Streaming
    } else {
        RelayMode::Buffered
    }
}

/// Outcome of a one-off diagnostic GET
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub status: u16,
    pub latency_ms: u64,
    pub body_snippet: String,
    pub headers: BTreeMap<String, String>,
}

/// Error text with its whole source chain
fn describe(err: &dyn StdError) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn send_error(err: reqwest::Error, target: &str, after: Duration) -> ProxyError {
    if err.is_timeout() && !err.is_connect() {
        ProxyError::UpstreamTimeout {
            target: target.to_string(),
            after,
        }
    } else {
        ProxyError::UpstreamUnreachable {
            target: target.to_string(),
            reason: describe(&err),
        }
    }
}

pub struct ForwardEngine {
    pool: UpstreamPool,
    settings: UpstreamConfig,
}

impl ForwardEngine {
    pub fn new(settings: UpstreamConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            pool: UpstreamPool::new(&settings)?,
            settings,
        })
    }

    pub fn settings(&self) -> &UpstreamConfig {
        &self.settings
    }

    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    /// Forward `req` to `target` (`host[:port]`) and relay the response.
    ///
    /// `shutdown` ends an event stream when the connection's listener drains.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        target: &str,
        shutdown: ShutdownSignal,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let started = Instant::now();
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}://{}{}", self.settings.scheme.as_str(), target, path_and_query);
        let url = Url::parse(&url)
            .map_err(|e| ProxyError::BadRequest(format!("cannot build upstream url {}: {}", url, e)))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        let host = HeaderValue::from_str(target)
            .map_err(|_| ProxyError::InvalidRuleInput(format!("target '{}' is not a valid host", target)))?;
        headers.insert(HOST, host);

        let limit = self.settings.max_request_body_bytes;
        let body = Limited::new(body, limit)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProxyError::PayloadTooLarge { limit }
                } else {
                    ProxyError::BadRequest(format!("failed to read request body: {}", e))
                }
            })?
            .to_bytes();

        let method = parts.method;
        debug!(%method, %url, body_len = body.len(), "Forwarding");

        let slot = self.pool.acquire(target).await;
        let mut request = self.pool.client().request(method.clone(), url).headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }

        let idle = self.settings.idle_timeout();
        let upstream = match tokio::time::timeout(idle, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(send_error(e, target, idle)),
            Err(_) => {
                return Err(ProxyError::UpstreamTimeout {
                    target: target.to_string(),
                    after: idle,
                })
            }
        };

        let status = upstream.status();
        let mode = classify(upstream.headers());
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let idle_timeout = match mode {
            RelayMode::Buffered => Some(idle),
            RelayMode::Streaming => self.settings.stream_idle_timeout(),
        };
        let mut relay = RelayBody::new(upstream.bytes_stream(), mode, idle_timeout, target).with_slot(slot);
        if mode == RelayMode::Streaming {
            relay = relay.with_shutdown(shutdown);
        }

        info!(
            %method,
            path = %path_and_query,
            upstream = %target,
            status = status.as_u16(),
            mode = ?mode,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Forwarded"
        );

        let mut response = Response::new(relay.boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    /// Issue a GET to an arbitrary URL and report what came back
    pub async fn probe(&self, url: &str) -> Result<ProbeReport, ProxyError> {
        let parsed = Url::parse(url).map_err(|e| ProxyError::BadRequest(format!("invalid url '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProxyError::BadRequest(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        let target = parsed.host_str().unwrap_or_default().to_string();

        let started = Instant::now();
        let response = self
            .pool
            .client()
            .get(parsed)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| send_error(e, &target, PROBE_TIMEOUT))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut collected = Vec::new();
        let mut stream = Box::pin(response.bytes_stream());
        while collected.len() < PROBE_READ_LIMIT {
            match tokio::time::timeout(PROBE_TIMEOUT, stream.next()).await {
                Ok(Some(Ok(chunk))) => collected.extend_from_slice(&chunk),
                _ => break,
            }
        }
        let body_snippet = String::from_utf8_lossy(&collected)
            .chars()
            .take(PROBE_SNIPPET_CHARS)
            .collect();

        info!(%url, status, latency_ms, "Test forward");

        Ok(ProbeReport {
            status,
            latency_ms,
            body_snippet,
            headers,
        })
    }
}
