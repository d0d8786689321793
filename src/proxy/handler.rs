use crate::config::ReverseProxyConfig;
use crate::error::GatewayError;
use crate::proxy::context::{
    client_ip_from_headers, empty_body, full_body, session_id_from_headers, BoxBody, ClientIp,
    RequestContext, SessionId,
};
use crate::proxy::headers::{
    append_forwarded_for, apply_extra_headers, forward_request_headers, response_headers,
};
use crate::routing::PathMatcher;
use crate::upstream::{Balancer, ConnectionPool, SelectionContext};
use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Forwarding pipeline for one proxy rule.
///
/// 1. BIND: a handler without a rule answers 500
/// 2. SELECT: canary gate + strategy; nothing healthy answers 503
/// 3. REWRITE: strip prefix, sanitize headers, X-Forwarded-For, extra headers
/// 4. FORWARD: one attempt under the rule's timeout
/// 5. MAP: connect failure 503, timeout 504 (both reported to passive
///    health), other transport errors 502, upstream 4xx/5xx passed through
///    as an error page, anything else relayed
/// 6. LOG: one `access` event per request
pub struct ReverseProxyHandler {
    binding: Option<Binding>,
    pool: ConnectionPool,
}

struct Binding {
    rule: Arc<ReverseProxyConfig>,
    balancer: Arc<Balancer>,
}

impl ReverseProxyHandler {
    pub fn new(rule: Arc<ReverseProxyConfig>, balancer: Arc<Balancer>, pool: ConnectionPool) -> Self {
        Self {
            binding: Some(Binding { rule, balancer }),
            pool,
        }
    }

    /// A handler with no rule behind it. Every request gets a 500.
    pub fn unbound(pool: ConnectionPool) -> Self {
        Self {
            binding: None,
            pool,
        }
    }

    pub fn rule(&self) -> Option<&Arc<ReverseProxyConfig>> {
        self.binding.as_ref().map(|b| &b.rule)
    }

    pub fn balancer(&self) -> Option<&Arc<Balancer>> {
        self.binding.as_ref().map(|b| &b.balancer)
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();

        let peer_ip = parts.extensions.get::<ClientIp>().map(|c| c.0);
        let client_ip = peer_ip.or_else(|| client_ip_from_headers(&parts.headers));
        let session_id = parts
            .extensions
            .get::<SessionId>()
            .map(|s| s.0.clone())
            .or_else(|| session_id_from_headers(&parts.headers));

        let rule_id = self
            .rule()
            .map(|r| r.id.clone())
            .unwrap_or_else(|| "_unbound".to_string());
        let mut ctx = RequestContext::new(
            parts.method.to_string(),
            parts.uri.path().to_string(),
            rule_id,
            client_ip,
        );

        let binding = match &self.binding {
            Some(b) => b,
            None => {
                let err = GatewayError::Misconfiguration("no proxy rule bound".into());
                warn!("proxy: {}, path={}", err, ctx.path);
                return ctx.error_response(&err);
            }
        };

        let selection = SelectionContext {
            client_ip,
            session_id: session_id.as_deref(),
        };
        let upstream = match binding.balancer.choose(&selection) {
            Some(u) => u,
            None => {
                warn!("proxy: no healthy upstream, rule={}", ctx.rule_id);
                return ctx.error_response(&GatewayError::NoHealthyUpstream);
            }
        };
        ctx.upstream.push_str(upstream.url());

        let target = target_uri(upstream.url(), &binding.rule, &parts.uri);

        let mut headers = forward_request_headers(&parts.headers);
        // A peer address from the listener extends the chain. An address read
        // from the headers is already in it.
        match (peer_ip, client_ip) {
            (Some(ip), _) => append_forwarded_for(&mut headers, ip),
            (None, Some(ip)) if !headers.contains_key("x-forwarded-for") => {
                append_forwarded_for(&mut headers, ip)
            }
            _ => {}
        }
        apply_extra_headers(&mut headers, &binding.rule.add_headers);

        let outbound_body = if carries_body(&parts.method) {
            match body.collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    if bytes.is_empty() {
                        empty_body()
                    } else {
                        full_body(bytes)
                    }
                }
                Err(e) => {
                    warn!(
                        "proxy: failed to read request body, rule={}, error={}",
                        ctx.rule_id, e
                    );
                    return ctx.status_response(StatusCode::BAD_REQUEST, "bad_request");
                }
            }
        } else {
            empty_body()
        };

        let mut builder = Request::builder().method(parts.method.clone()).uri(&target);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        let outbound = match builder.body(outbound_body) {
            Ok(r) => r,
            Err(e) => {
                let err = GatewayError::Internal(format!("building upstream request: {}", e));
                warn!("proxy: {}, rule={}, target={}", err, ctx.rule_id, target);
                return ctx.error_response(&err);
            }
        };

        let client = self.pool.get(upstream.url());
        let result = tokio::time::timeout(binding.rule.timeout(), client.request(outbound)).await;

        let resp = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let err = if e.is_connect() {
                    GatewayError::UpstreamUnreachable(e.to_string())
                } else {
                    GatewayError::Transport(e.to_string())
                };
                return fail(binding, &ctx, &target, err);
            }
            Err(_) => return fail(binding, &ctx, &target, GatewayError::UpstreamTimeout),
        };

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            debug!(
                "proxy: upstream error status, rule={}, upstream={}, status={}",
                ctx.rule_id,
                ctx.upstream,
                status.as_u16()
            );
            return ctx.error_response(&GatewayError::UpstreamStatus(status.as_u16()));
        }

        let (up_parts, up_body) = resp.into_parts();
        let mut downstream = Response::new(up_body.boxed());
        *downstream.status_mut() = up_parts.status;
        *downstream.headers_mut() = response_headers(&up_parts.headers);
        ctx.finish(status);
        downstream
    }
}

fn fail(
    binding: &Binding,
    ctx: &RequestContext,
    target: &str,
    err: GatewayError,
) -> Response<BoxBody> {
    warn!(
        "proxy: upstream failure, rule={}, target={}, error={}",
        ctx.rule_id, target, err
    );
    if err.reports_failure() {
        metrics::counter!(
            "gateway_upstream_failures_reported_total",
            "rule" => ctx.rule_id.clone(),
        )
        .increment(1);
        binding.balancer.report_failure(&ctx.upstream, SystemTime::now());
    }
    ctx.error_response(&err)
}

fn carries_body(method: &Method) -> bool {
    [
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ]
    .contains(method)
}

/// Upstream base URL + (optionally stripped) request path + query.
fn target_uri(base: &str, rule: &ReverseProxyConfig, uri: &Uri) -> String {
    let path = if rule.strip_prefix {
        PathMatcher::strip_prefix(&rule.path, uri.path())
    } else {
        uri.path().to_string()
    };
    let mut target = String::with_capacity(base.len() + path.len() + 16);
    target.push_str(base.trim_end_matches('/'));
    target.push_str(&path);
    if let Some(q) = uri.query() {
        target.push('?');
        target.push_str(q);
    }
    target
}
