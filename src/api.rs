//! Management API
//!
//! Served on the proxy's own listener for requests whose host matches no
//! rule:
//!
//! | Method | Path                 | Result                                  |
//! |--------|----------------------|-----------------------------------------|
//! | GET    | `/health`            | `OK`                                    |
//! | GET    | `/api/config`        | current configuration                   |
//! | POST   | `/api/config`        | replace configuration                   |
//! | GET    | `/api/rules`         | rule list                               |
//! | POST   | `/api/rules`         | add/overwrite `{source, target}`        |
//! | DELETE | `/api/rules/{source}`| `{deleted}`                             |
//! | POST   | `/api/test`          | diagnostic GET of `{url}`               |
//!
//! Mutations that could not be persisted still answer 200, with a
//! `warning` field and an `x-proxy-warning` header.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::proxy::{Applied, ProxyServer};
use crate::response::{error_response, json_response, text_response, ProxyBody, X_PROXY_WARNING};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::error::Error as StdError;
use tracing::{debug, warn};

const RULES_PREFIX: &str = "/api/rules/";
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn is_management_path(path: &str) -> bool {
    path == "/health" || path == "/api" || path.starts_with("/api/")
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuleInput {
    source: String,
    target: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TestInput {
    url: String,
}

/// Answer one management request
pub async fn handle<B>(server: &ProxyServer, req: Request<B>) -> Response<ProxyBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Management request");

    match route(server, req, &method, &path).await {
        Ok(response) => response,
        Err(e) => {
            warn!("{} {} failed: {}", method, path, e);
            error_response(&e)
        }
    }
}

async fn route<B>(
    server: &ProxyServer,
    req: Request<B>,
    method: &Method,
    path: &str,
) -> Result<Response<ProxyBody>, ProxyError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    match (method, path) {
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "OK")),

        (&Method::GET, "/api/config") => Ok(json_response(StatusCode::OK, &server.config())),

        (&Method::POST, "/api/config") => {
            let next: ProxyConfig = read_json(req).await?;
            let applied = server.apply_config(next).await?;
            Ok(applied_response(applied))
        }

        (&Method::GET, "/api/rules") => Ok(json_response(StatusCode::OK, &server.list_rules())),

        (&Method::POST, "/api/rules") => {
            let input: RuleInput = read_json(req).await?;
            let applied = server.upsert_rule(&input.source, &input.target).await?;
            Ok(applied_response(applied))
        }

        (&Method::DELETE, p) if p.len() > RULES_PREFIX.len() && p.starts_with(RULES_PREFIX) => {
            let source = &p[RULES_PREFIX.len()..];
            let applied = server.delete_rule(source).await;
            Ok(applied_response(applied.map(|deleted| json!({ "deleted": deleted }))))
        }

        (&Method::POST, "/api/test") => {
            let input: TestInput = read_json(req).await?;
            if input.url.trim().is_empty() {
                return Err(ProxyError::BadRequest("url is required".into()));
            }
            let report = server.test_forward(input.url.trim()).await?;
            Ok(json_response(StatusCode::OK, &report))
        }

        (_, "/health" | "/api/config" | "/api/rules" | "/api/test") => Ok(json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({ "error": "method not allowed", "method": method.as_str(), "path": path }),
        )),

        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            &json!({ "error": "not found", "path": path }),
        )),
    }
}

async fn read_json<B, T>(req: Request<B>) -> Result<T, ProxyError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
    T: DeserializeOwned,
{
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| ProxyError::BadRequest(format!("failed to read body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| ProxyError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn applied_response<T: Serialize>(applied: Applied<T>) -> Response<ProxyBody> {
    let mut value = match serde_json::to_value(&applied.value) {
        Ok(value) => value,
        Err(e) => return error_response(&ProxyError::BadRequest(e.to_string())),
    };
    if let (Some(warning), Value::Object(object)) = (&applied.warning, &mut value) {
        object.insert("warning".to_string(), Value::String(warning.clone()));
    }

    let mut response = json_response(StatusCode::OK, &value);
    if applied.warning.is_some() {
        response
            .headers_mut()
            .insert(X_PROXY_WARNING.clone(), HeaderValue::from_static("config-persist"));
    }
    response
}
