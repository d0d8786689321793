use crate::error::GatewayError;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Client address of the inbound request, attached by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Session identifier used by the canary gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// Left-most `X-Forwarded-For` entry, then `X-Real-IP`.
pub fn client_ip_from_headers(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<IpAddr>().ok())
        })
}

pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Per-request bookkeeping for logging and metrics.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub rule_id: String,
    pub upstream: String,
    pub client_ip: Option<IpAddr>,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(method: String, path: String, rule_id: String, client_ip: Option<IpAddr>) -> Self {
        Self {
            method,
            path,
            rule_id,
            upstream: String::new(),
            client_ip,
            start: Instant::now(),
        }
    }

    /// Error page for a pipeline failure, recorded like any other response.
    pub fn error_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        self.status_response(err.status_code(), err.code())
    }

    pub fn status_response(&self, status: StatusCode, code: &str) -> hyper::Response<BoxBody> {
        self.finish(status);
        error_page(status, code)
    }

    /// Count the request and emit the access event.
    pub fn finish(&self, status: StatusCode) {
        metrics::counter!(
            "gateway_proxy_requests_total",
            "rule" => self.rule_id.clone(),
            "status" => status.as_str().to_owned(),
        )
        .increment(1);

        let client_ip = self
            .client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        tracing::info!(
            client_ip = %client_ip,
            method = %self.method,
            path = %self.path,
            status = status.as_u16(),
            rule = %self.rule_id,
            upstream = %self.upstream,
            latency_ms = %self.start.elapsed().as_millis(),
            "access"
        );
    }
}

/// JSON error body at `status`.
pub fn error_page(status: StatusCode, code: &str) -> hyper::Response<BoxBody> {
    let body = serde_json::json!({
        "error": code,
        "status": status.as_u16(),
    })
    .to_string();
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}
