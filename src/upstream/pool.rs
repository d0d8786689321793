use crate::proxy::context::BoxBody;
use crate::upstream::instance::origin_of;
use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 64;

/// Pooled HTTP clients keyed by upstream origin (`scheme://authority`).
///
/// Cloning shares the map. Entries are created on first use, pre-warmed when
/// a refresh adds an upstream, and evicted either immediately (upstream
/// removed from config) or after `removal_delay` (upstream went unhealthy),
/// so requests that already hold a client finish on it.
#[derive(Clone)]
pub struct ConnectionPool {
    clients: Arc<DashMap<String, HttpClient>>,
    connect_timeout: Duration,
    removal_delay: Duration,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration, removal_delay: Duration) -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            connect_timeout,
            removal_delay,
        }
    }

    /// Client for the origin of `url`, created on first use.
    pub fn get(&self, url: &str) -> HttpClient {
        let origin = origin_of(url);
        if let Some(client) = self.clients.get(&origin) {
            return client.clone();
        }
        self.clients
            .entry(origin)
            .or_insert_with(|| build_http_client(self.connect_timeout))
            .clone()
    }

    pub fn prewarm(&self, url: &str) {
        let origin = origin_of(url);
        if !self.clients.contains_key(&origin) {
            tracing::debug!("pool: prewarm, origin={}", origin);
            self.clients
                .entry(origin)
                .or_insert_with(|| build_http_client(self.connect_timeout));
        }
    }

    pub fn remove(&self, url: &str) -> bool {
        let origin = origin_of(url);
        let removed = self.clients.remove(&origin).is_some();
        if removed {
            tracing::debug!("pool: client evicted, origin={}", origin);
        }
        removed
    }

    /// Evict after the grace delay. Needs a tokio runtime; without one the
    /// client is evicted immediately.
    pub fn remove_after(&self, url: &str) {
        let url = url.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                let delay = self.removal_delay;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    pool.remove(&url);
                });
            }
            Err(_) => {
                self.remove(&url);
            }
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.clients.contains_key(&origin_of(url))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Client over an `HttpsConnector` so that both `http://` and `https://`
/// upstreams work. HTTP/2 is negotiated through ALPN.
fn build_http_client(connect_timeout: Duration) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(POOL_IDLE_TIMEOUT));
    http.set_connect_timeout(Some(connect_timeout));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(removal_delay: Duration) -> ConnectionPool {
        ConnectionPool::new(Duration::from_secs(1), removal_delay)
    }

    #[tokio::test]
    async fn test_get_keys_by_origin() {
        let p = pool(Duration::ZERO);
        p.get("http://10.0.0.1:8080/a/b");
        p.get("http://10.0.0.1:8080");
        p.get("http://10.0.0.2:8080");
        assert_eq!(p.len(), 2);
        assert!(p.contains("http://10.0.0.1:8080/other"));
    }

    #[tokio::test]
    async fn test_prewarm_and_remove() {
        let p = pool(Duration::ZERO);
        p.prewarm("http://10.0.0.1:8080");
        p.prewarm("http://10.0.0.1:8080");
        assert_eq!(p.len(), 1);
        assert!(p.remove("http://10.0.0.1:8080"));
        assert!(!p.remove("http://10.0.0.1:8080"));
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn test_remove_after_waits_for_grace_delay() {
        let p = pool(Duration::from_millis(100));
        p.prewarm("http://10.0.0.1:8080");
        p.remove_after("http://10.0.0.1:8080");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(p.contains("http://10.0.0.1:8080"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!p.contains("http://10.0.0.1:8080"));
    }

    #[tokio::test]
    async fn test_clones_share_clients() {
        let p = pool(Duration::ZERO);
        let q = p.clone();
        q.prewarm("http://10.0.0.1:8080");
        assert!(p.contains("http://10.0.0.1:8080"));
    }
}
