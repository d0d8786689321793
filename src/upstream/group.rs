use super::instance::{origin_of, StateChange, Upstream};
use crate::config::{HealthCheckMode, LoadBalancerConfig, Strategy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Which list a selection is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamSet {
    Main,
    Canary,
}

/// Runtime form of one `LoadBalancerConfig` generation.
///
/// Everything but `version` is fixed at construction. The `Upstream`s inside
/// live as long as this generation and are mutated in place by health
/// tracking. `version` is a cache-invalidation token bumped by the manager
/// when upstream membership changes; it carries no concurrency control.
#[derive(Debug)]
pub struct UpstreamGroup {
    strategy: Strategy,
    health_check_mode: HealthCheckMode,
    check_interval: Duration,
    health_path: String,
    canary_percent: u8,
    upstreams: Vec<Arc<Upstream>>,
    canary_upstreams: Vec<Arc<Upstream>>,
    version: AtomicU64,
    events: broadcast::Sender<StateChange>,
}

impl UpstreamGroup {
    pub fn from_config(cfg: &LoadBalancerConfig, version: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let build = |list: &[crate::config::UpstreamConfig]| -> Vec<Arc<Upstream>> {
            list.iter()
                .map(|u| Arc::new(Upstream::new(&u.url, u.weight, Some(events.clone()))))
                .collect()
        };
        let upstreams = build(&cfg.upstreams);
        let canary_upstreams = build(&cfg.canary_upstreams);

        Self {
            strategy: cfg.strategy,
            health_check_mode: cfg.health_check_mode,
            check_interval: Duration::from_millis(cfg.check_interval_ms),
            health_path: cfg.health_path.clone(),
            canary_percent: cfg.canary_percent,
            upstreams,
            canary_upstreams,
            version: AtomicU64::new(version),
            events,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn health_check_mode(&self) -> HealthCheckMode {
        self.health_check_mode
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn health_path(&self) -> &str {
        &self.health_path
    }

    pub fn canary_percent(&self) -> u8 {
        self.canary_percent
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn canary_upstreams(&self) -> &[Arc<Upstream>] {
        &self.canary_upstreams
    }

    pub fn set(&self, which: UpstreamSet) -> &[Arc<Upstream>] {
        match which {
            UpstreamSet::Main => &self.upstreams,
            UpstreamSet::Canary => &self.canary_upstreams,
        }
    }

    /// Main list followed by canary list.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.iter().chain(self.canary_upstreams.iter())
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Returns the new version.
    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Health gate for selection. `Disabled` mode ignores the flag.
    #[inline]
    pub fn is_eligible(&self, upstream: &Upstream) -> bool {
        self.health_check_mode == HealthCheckMode::Disabled || upstream.is_healthy()
    }

    pub fn eligible(&self, which: UpstreamSet) -> Vec<Arc<Upstream>> {
        self.set(which)
            .iter()
            .filter(|u| self.is_eligible(u))
            .cloned()
            .collect()
    }

    /// Find the upstream a URL belongs to. Accepts a full target URI: the
    /// match is on `scheme://authority`.
    pub fn find(&self, url: &str) -> Option<&Arc<Upstream>> {
        if let Some(u) = self.all().find(|u| u.url() == url) {
            return Some(u);
        }
        let origin = origin_of(url);
        self.all().find(|u| u.origin() == origin)
    }
}
