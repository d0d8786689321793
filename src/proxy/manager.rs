use crate::config::{validate_proxies, ReverseProxyConfig, Tunables};
use crate::error::GatewayError;
use crate::proxy::context::{error_page, BoxBody, RequestContext};
use crate::proxy::handler::ReverseProxyHandler;
use crate::routing::RuleTable;
use crate::upstream::instance::origin_of;
use crate::upstream::{Balancer, ConnectionPool, HealthProbe, UpstreamGroup};
use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use http::StatusCode;
use hyper::body::Body;
use hyper::{Request, Response};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Registry of proxy rules and their handlers.
///
/// Handlers (and the balancer, health checker and passive recovery they
/// own) are built on first use and cached by rule id. `refresh` swaps the
/// rule set, reconciles the connection pool with the new upstream origins
/// and drops every cached handler so the next request rebuilds it.
pub struct ReverseProxyManager {
    rules: ArcSwap<RuleTable>,
    handlers: DashMap<String, CachedHandler>,
    pool: ConnectionPool,
    probe: HealthProbe,
    tunables: Tunables,
    /// Incremented on every refresh; new groups start at this version.
    generation: AtomicU64,
    cancel: CancellationToken,
}

struct CachedHandler {
    generation: u64,
    handler: Arc<ReverseProxyHandler>,
}

impl ReverseProxyManager {
    pub fn new(proxies: &[ReverseProxyConfig], tunables: Tunables) -> Result<Self, GatewayError> {
        validate_proxies(proxies).map_err(|e| GatewayError::Config(e.to_string()))?;
        let probe = HealthProbe::new(tunables.connect_timeout(), tunables.probe_timeout())
            .map_err(|e| GatewayError::Internal(format!("building health probe: {}", e)))?;
        let pool = ConnectionPool::new(tunables.connect_timeout(), tunables.pool_removal_delay());

        for origin in origins(proxies) {
            pool.prewarm(&origin);
        }

        Ok(Self {
            rules: ArcSwap::from_pointee(RuleTable::new(proxies)),
            handlers: DashMap::new(),
            pool,
            probe,
            tunables,
            generation: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn rules(&self) -> Arc<RuleTable> {
        self.rules.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cached handler for `id`, built on first use. `None` for unknown ids.
    pub fn handler(&self, id: &str) -> Option<Arc<ReverseProxyHandler>> {
        let generation = self.generation();
        if let Some(cached) = self.handlers.get(id) {
            if cached.generation == generation {
                return Some(cached.handler.clone());
            }
        }

        let rule = self.rules.load().get(id)?.clone();
        let entry = self
            .handlers
            .entry(id.to_string())
            .and_modify(|cached| {
                if cached.generation != generation {
                    *cached = self.build_handler(rule.clone(), generation);
                }
            })
            .or_insert_with(|| self.build_handler(rule.clone(), generation));
        Some(entry.handler.clone())
    }

    /// Handler of the rule whose pattern matches `path`, longest pattern
    /// first.
    pub fn route(&self, path: &str) -> Option<Arc<ReverseProxyHandler>> {
        let id = self.rules.load().match_path(path)?.id.clone();
        self.handler(&id)
    }

    /// Route and forward. Requests no rule matches get a 404.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        match self.route(req.uri().path()) {
            Some(handler) => handler.handle(req).await,
            None => {
                debug!("proxy: no rule matched, path={}", req.uri().path());
                let ctx = RequestContext::new(
                    req.method().to_string(),
                    req.uri().path().to_string(),
                    "_no_rule".to_string(),
                    None,
                );
                ctx.finish(StatusCode::NOT_FOUND);
                error_page(StatusCode::NOT_FOUND, "not_found")
            }
        }
    }

    /// Build every rule's handler now, so active checkers start without
    /// waiting for traffic.
    pub fn warm_up(&self) {
        let rules = self.rules.load_full();
        for rule in rules.rules() {
            self.handler(&rule.id);
        }
    }

    /// Replace the rule set. Pooled clients of origins no longer referenced
    /// are evicted, new origins are pre-warmed, live groups get their
    /// version bumped and the handler cache is cleared.
    pub fn refresh(&self, proxies: &[ReverseProxyConfig]) -> Result<(), GatewayError> {
        validate_proxies(proxies).map_err(|e| GatewayError::Config(e.to_string()))?;

        let old = self.rules.load_full();
        let old_origins: HashSet<String> = old.rules().iter().flat_map(|r| rule_origins(r)).collect();
        let new_origins = origins(proxies);

        let mut removed = 0;
        for origin in old_origins.difference(&new_origins) {
            if self.pool.remove(origin) {
                removed += 1;
            }
        }
        let mut added = 0;
        for origin in new_origins.difference(&old_origins) {
            self.pool.prewarm(origin);
            added += 1;
        }

        self.rules.store(Arc::new(RuleTable::new(proxies)));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        for cached in self.handlers.iter() {
            if let Some(balancer) = cached.handler.balancer() {
                balancer.group().bump_version();
                balancer.shutdown();
            }
        }
        self.handlers.clear();

        info!(
            "proxy: manager: refreshed, rules={}, origins_added={}, origins_removed={}, generation={}",
            proxies.len(),
            added,
            removed,
            generation
        );
        Ok(())
    }

    /// Stop every health checker and background task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.handlers.clear();
        info!("proxy: manager: shut down");
    }

    fn build_handler(&self, rule: Arc<ReverseProxyConfig>, generation: u64) -> CachedHandler {
        let group = Arc::new(UpstreamGroup::from_config(&rule.lb_config, generation));
        let balancer = Balancer::new(
            group,
            self.pool.clone(),
            self.probe.clone(),
            &self.tunables,
            &self.cancel,
        );
        debug!(
            "proxy: manager: handler built, rule={}, strategy={}, generation={}",
            rule.id,
            rule.lb_config.strategy.as_str(),
            generation
        );
        CachedHandler {
            generation,
            handler: Arc::new(ReverseProxyHandler::new(rule, balancer, self.pool.clone())),
        }
    }
}

impl Drop for ReverseProxyManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn rule_origins(rule: &ReverseProxyConfig) -> impl Iterator<Item = String> + '_ {
    rule.lb_config.all_urls().map(origin_of)
}

fn origins(proxies: &[ReverseProxyConfig]) -> HashSet<String> {
    proxies.iter().flat_map(rule_origins).collect()
}
