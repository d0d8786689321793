#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use upstream_gateway::config::{
    HealthCheckMode, LoadBalancerConfig, ReverseProxyConfig, Strategy, UpstreamConfig,
};

/// Upstream that echoes what it received as JSON:
/// `{ "name", "method", "path", "query", "headers": {..}, "body" }`.
/// Status and response delay can be changed while it runs.
pub struct EchoUpstream {
    pub addr: SocketAddr,
    status: Arc<AtomicU16>,
    delay_ms: Arc<AtomicU64>,
    hits: Arc<AtomicUsize>,
}

impl EchoUpstream {
    pub async fn start(name: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status = Arc::new(AtomicU16::new(200));
        let delay_ms = Arc::new(AtomicU64::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        let (s, d, h) = (status.clone(), delay_ms.clone(), hits.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (s, d, h) = (s.clone(), d.clone(), h.clone());
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let (s, d, h) = (s.clone(), d.clone(), h.clone());
                        async move {
                            h.fetch_add(1, Ordering::SeqCst);
                            let delay = d.load(Ordering::SeqCst);
                            if delay > 0 {
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                            }
                            Ok::<_, Infallible>(echo(name, req, s.load(Ordering::SeqCst)).await)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });

        Self {
            addr,
            status,
            delay_ms,
            hits,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn echo(name: &str, req: Request<Incoming>, status: u16) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
    let headers: serde_json::Map<String, serde_json::Value> = parts
        .headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                serde_json::Value::String(v.to_str().unwrap_or("").to_string()),
            )
        })
        .collect();
    let json = serde_json::json!({
        "name": name,
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("vary", "accept")
        .header("vary", "origin")
        .header("connection", "keep-alive")
        .body(Full::new(Bytes::from(json.to_string())))
        .unwrap()
}

/// Accepts connections and answers with bytes that are not HTTP.
pub async fn garbage_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(b"THIS IS NOT HTTP\r\n\r\n").await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// A URL nothing listens on.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    format!("http://{}", listener.local_addr().unwrap())
}

pub fn upstreams(urls: &[String]) -> Vec<UpstreamConfig> {
    urls.iter()
        .map(|u| UpstreamConfig {
            url: u.clone(),
            weight: 1.0,
        })
        .collect()
}

pub fn rule(id: &str, path: &str, urls: &[String]) -> ReverseProxyConfig {
    ReverseProxyConfig {
        id: id.to_string(),
        path: path.to_string(),
        strip_prefix: true,
        timeout_ms: 2_000,
        lb_config: LoadBalancerConfig {
            strategy: Strategy::RoundRobin,
            health_check_mode: HealthCheckMode::PassiveCheck,
            upstreams: upstreams(urls),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn json_body(resp: Response<upstream_gateway::proxy::BoxBody>) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
