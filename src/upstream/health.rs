use crate::config::HealthCheckMode;
use crate::upstream::{Upstream, UpstreamGroup};
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on probes in flight for one group.
const PROBE_CONCURRENCY: usize = 16;

/// Bounded-timeout GET against an upstream's health path. 2xx is healthy;
/// any other status, a connect error or a timeout is unhealthy.
#[derive(Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new(connect_timeout: Duration, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    pub async fn check(&self, upstream: &Upstream, health_path: &str) -> bool {
        let url = probe_url(upstream.url(), health_path);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("health: probe failed, url={}, error={}", url, e);
                false
            }
        }
    }
}

fn probe_url(base: &str, health_path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        health_path.trim_start_matches('/')
    )
}

/// Background poller for one `ActiveCheck` group. Stops on `stop()`, on
/// drop, or when the parent token is cancelled.
pub struct ActiveHealthChecker {
    cancel: CancellationToken,
}

impl ActiveHealthChecker {
    /// Returns `None` unless the group is in active mode and a tokio runtime
    /// is available.
    pub fn start(
        group: Arc<UpstreamGroup>,
        probe: HealthProbe,
        jitter: Duration,
        parent: &CancellationToken,
    ) -> Option<Self> {
        if group.health_check_mode() != HealthCheckMode::ActiveCheck {
            return None;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!("health: active: no runtime, checker not started");
                return None;
            }
        };

        let cancel = parent.child_token();
        let token = cancel.clone();
        handle.spawn(async move {
            let initial_delay = random_jitter(jitter);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }

            let mut ticker = tokio::time::interval(group.check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                "health: active: checker started, upstreams={}, interval_ms={}",
                group.all().count(),
                group.check_interval().as_millis()
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => run_round(&group, &probe).await,
                }
            }
            debug!("health: active: checker stopped");
        });

        Some(Self { cancel })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ActiveHealthChecker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Probe every upstream in the group (main and canary) once.
pub(crate) async fn run_round(group: &UpstreamGroup, probe: &HealthProbe) {
    let upstreams: Vec<Arc<Upstream>> = group.all().cloned().collect();
    let path = group.health_path();

    stream::iter(upstreams)
        .map(|upstream| async move {
            let healthy = probe.check(&upstream, path).await;
            upstream.mark_checked(SystemTime::now());
            if upstream.set_healthy(healthy) {
                if healthy {
                    info!("health: active: upstream recovered, url={}", upstream.url());
                } else {
                    warn!(
                        "health: active: upstream marked unhealthy, url={}",
                        upstream.url()
                    );
                }
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalancerConfig, UpstreamConfig};
    use crate::test_util::{unreachable_addr, MockUpstream};

    fn probe() -> HealthProbe {
        HealthProbe::new(Duration::from_millis(500), Duration::from_millis(500)).unwrap()
    }

    fn active_group(urls: &[String], interval_ms: u64) -> Arc<UpstreamGroup> {
        let cfg = LoadBalancerConfig {
            health_check_mode: HealthCheckMode::ActiveCheck,
            check_interval_ms: interval_ms,
            upstreams: urls
                .iter()
                .map(|u| UpstreamConfig {
                    url: u.clone(),
                    weight: 1.0,
                })
                .collect(),
            ..Default::default()
        };
        Arc::new(UpstreamGroup::from_config(&cfg, 1))
    }

    #[test]
    fn test_probe_url_joins_path() {
        assert_eq!(probe_url("http://h:1", "/health"), "http://h:1/health");
        assert_eq!(probe_url("http://h:1/", "/health"), "http://h:1/health");
        assert_eq!(probe_url("http://h:1", "ready"), "http://h:1/ready");
    }

    #[tokio::test]
    async fn test_probe_status_classes() {
        let mock = MockUpstream::start(200).await;
        let u = Upstream::new(&mock.url(), 1.0, None);
        assert!(probe().check(&u, "/health").await);

        mock.set_status(503);
        assert!(!probe().check(&u, "/health").await);

        mock.set_status(302);
        assert!(!probe().check(&u, "/health").await);
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_unhealthy() {
        let u = Upstream::new(&format!("http://{}", unreachable_addr()), 1.0, None);
        assert!(!probe().check(&u, "/health").await);
    }

    #[tokio::test]
    async fn test_round_sets_health_from_probe() {
        let up = MockUpstream::start(200).await;
        let down = MockUpstream::start(500).await;
        let group = active_group(&[up.url(), down.url()], 1_000);

        run_round(&group, &probe()).await;
        assert!(group.upstreams()[0].is_healthy());
        assert!(!group.upstreams()[1].is_healthy());
        assert!(group.upstreams()[1].last_checked().is_some());

        down.set_status(204);
        run_round(&group, &probe()).await;
        assert!(group.upstreams()[1].is_healthy());
    }

    #[tokio::test]
    async fn test_round_covers_canary_upstreams() {
        let main = MockUpstream::start(200).await;
        let canary = MockUpstream::start(503).await;
        let cfg = LoadBalancerConfig {
            health_check_mode: HealthCheckMode::ActiveCheck,
            upstreams: vec![UpstreamConfig {
                url: main.url(),
                weight: 1.0,
            }],
            canary_upstreams: vec![UpstreamConfig {
                url: canary.url(),
                weight: 1.0,
            }],
            ..Default::default()
        };
        let group = UpstreamGroup::from_config(&cfg, 1);

        run_round(&group, &probe()).await;
        assert!(group.upstreams()[0].is_healthy());
        assert!(!group.canary_upstreams()[0].is_healthy());
        assert!(group.canary_upstreams()[0].last_checked().is_some());
        assert_eq!(canary.hits(), 1);

        canary.set_status(200);
        run_round(&group, &probe()).await;
        assert!(group.canary_upstreams()[0].is_healthy());
    }

    #[tokio::test]
    async fn test_checker_polls_until_stopped() {
        let mock = MockUpstream::start(500).await;
        let group = active_group(&[mock.url()], 50);
        let root = CancellationToken::new();

        let checker =
            ActiveHealthChecker::start(group.clone(), probe(), Duration::ZERO, &root).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!group.upstreams()[0].is_healthy());
        assert!(mock.hits() >= 2);

        checker.stop();
        assert!(checker.is_stopped());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let hits = mock.hits();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mock.hits(), hits);
    }

    #[tokio::test]
    async fn test_checker_only_in_active_mode() {
        let cfg = LoadBalancerConfig {
            health_check_mode: HealthCheckMode::PassiveCheck,
            ..Default::default()
        };
        let group = Arc::new(UpstreamGroup::from_config(&cfg, 1));
        let root = CancellationToken::new();
        assert!(ActiveHealthChecker::start(group, probe(), Duration::ZERO, &root).is_none());
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_checker() {
        let mock = MockUpstream::start(200).await;
        let group = active_group(&[mock.url()], 1_000);
        let root = CancellationToken::new();
        let checker = ActiveHealthChecker::start(group, probe(), Duration::ZERO, &root).unwrap();
        root.cancel();
        assert!(checker.is_stopped());
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }
}
