//! Response body type and builders shared by the forwarding and management paths

use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

/// Body of every response the proxy produces
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

pub static X_PROXY_ERROR: HeaderName = HeaderName::from_static("x-proxy-error");
pub static X_PROXY_WARNING: HeaderName = HeaderName::from_static("x-proxy-warning");

/// Create full body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn with_content_type(status: StatusCode, content_type: &'static str, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    with_content_type(status, "text/plain", full_body(body.to_string()))
}

/// Create JSON response
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => with_content_type(status, "application/json", full_body(body)),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// Create error response, tagged with `x-proxy-error: <kind>`
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut response = json_response(err.status(), &err.to_json());
    response
        .headers_mut()
        .insert(X_PROXY_ERROR.clone(), HeaderValue::from_static(err.kind()));
    response
}
