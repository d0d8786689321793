use crate::config::HealthCheckMode;
use crate::upstream::health::HealthProbe;
use crate::upstream::{Upstream, UpstreamGroup};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Passive health tracking, driven only by failures the proxy reports.
///
/// A report against a healthy upstream wins the `recovering` CAS, marks it
/// unhealthy and starts one recovery chain: wait `interval`, probe once,
/// and either restore the upstream or retry until `threshold` probes have
/// failed. After that the upstream stays unhealthy until the next report
/// arms a fresh chain. At most one chain per upstream runs at a time.
#[derive(Clone)]
pub struct PassiveRecovery {
    interval: Duration,
    threshold: u32,
    probe: HealthProbe,
    cancel: CancellationToken,
}

impl PassiveRecovery {
    pub fn new(
        interval: Duration,
        threshold: u32,
        probe: HealthProbe,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interval,
            threshold,
            probe,
            cancel,
        }
    }

    /// No-op unless the group is in `PassiveCheck` mode. `url` may be the
    /// full target URI the request was sent to.
    pub fn report_failure(&self, group: &UpstreamGroup, url: &str, at: SystemTime) {
        if group.health_check_mode() != HealthCheckMode::PassiveCheck {
            return;
        }
        let upstream = match group.find(url) {
            Some(u) => u.clone(),
            None => {
                debug!("health: passive: failure for unknown upstream, url={}", url);
                return;
            }
        };
        upstream.mark_checked(at);

        if !upstream.try_begin_recovery() {
            debug!(
                "health: passive: recovery already running, url={}",
                upstream.url()
            );
            return;
        }
        upstream.reset_retry_count();
        if upstream.set_healthy(false) {
            warn!(
                "health: passive: upstream marked unhealthy, url={}",
                upstream.url()
            );
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!(
                    "health: passive: no runtime, recovery not scheduled, url={}",
                    upstream.url()
                );
                upstream.finish_recovery();
                return;
            }
        };
        let this = self.clone();
        let health_path = group.health_path().to_string();
        handle.spawn(async move { this.recover(upstream, health_path).await });
    }

    async fn recover(self, upstream: Arc<Upstream>, health_path: String) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    upstream.finish_recovery();
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            let healthy = self.probe.check(&upstream, &health_path).await;
            upstream.mark_checked(SystemTime::now());

            if healthy {
                upstream.set_healthy(true);
                upstream.finish_recovery();
                upstream.reset_retry_count();
                metrics::counter!("gateway_passive_recovery_total", "result" => "recovered")
                    .increment(1);
                info!("health: passive: upstream recovered, url={}", upstream.url());
                return;
            }

            upstream.finish_recovery();
            let retries = upstream.increment_retry_count();
            if retries >= self.threshold {
                metrics::counter!("gateway_passive_recovery_total", "result" => "exhausted")
                    .increment(1);
                warn!(
                    "health: passive: recovery gave up, url={}, retries={}",
                    upstream.url(),
                    retries
                );
                return;
            }

            // Re-enter the failure path. A report that slipped in between
            // owns the upstream now and has started its own chain.
            if !upstream.try_begin_recovery() {
                return;
            }
            upstream.set_healthy(false);
            debug!(
                "health: passive: probe failed, retrying, url={}, retries={}",
                upstream.url(),
                retries
            );
        }
    }
}
