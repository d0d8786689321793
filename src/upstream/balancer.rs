use crate::config::Tunables;
use crate::upstream::health::{ActiveHealthChecker, HealthProbe};
use crate::upstream::loadbalance::{target_set, LoadBalancer, SelectionContext};
use crate::upstream::passive::PassiveRecovery;
use crate::upstream::pool::ConnectionPool;
use crate::upstream::{StateChange, StateChangeKind, Upstream, UpstreamGroup};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Front of one upstream group: canary gating, strategy dispatch and both
/// health-tracking modes.
///
/// Owns the tasks that react to upstream state changes (delayed pool
/// eviction, debounced weighted-random rebuilds) plus the active checker
/// when the group needs one. All of them stop on `shutdown()` or drop.
pub struct Balancer {
    group: Arc<UpstreamGroup>,
    lb: LoadBalancer,
    passive: PassiveRecovery,
    pool: ConnectionPool,
    checker: Option<ActiveHealthChecker>,
    rebuild_debounce: Duration,
    cancel: CancellationToken,
}

impl Balancer {
    pub fn new(
        group: Arc<UpstreamGroup>,
        pool: ConnectionPool,
        probe: HealthProbe,
        tunables: &Tunables,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let cancel = parent.child_token();
        let passive = PassiveRecovery::new(
            tunables.recovery_interval(),
            tunables.failure_threshold,
            probe.clone(),
            cancel.clone(),
        );
        let checker = ActiveHealthChecker::start(
            group.clone(),
            probe,
            Duration::from_millis(tunables.health_check_jitter_ms),
            &cancel,
        );

        let balancer = Arc::new(Self {
            lb: LoadBalancer::new(group.strategy()),
            group,
            passive,
            pool,
            checker,
            rebuild_debounce: tunables.rebuild_debounce(),
            cancel,
        });
        balancer.spawn_state_listener();
        balancer
    }

    pub fn group(&self) -> &Arc<UpstreamGroup> {
        &self.group
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.lb
    }

    /// `None` means the target set (canary or main) has no healthy upstream.
    pub fn choose(&self, ctx: &SelectionContext<'_>) -> Option<Arc<Upstream>> {
        let which = target_set(&self.group, ctx);
        let chosen = self.lb.select(&self.group, which, ctx);
        if chosen.is_none() {
            debug!(
                "lb: no healthy upstream, strategy={}, set={:?}",
                self.lb.strategy().as_str(),
                which
            );
        }
        chosen
    }

    pub fn report_failure(&self, url: &str, at: SystemTime) {
        self.passive.report_failure(&self.group, url, at);
    }

    pub fn has_active_checker(&self) -> bool {
        self.checker.as_ref().is_some_and(|c| !c.is_stopped())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_state_listener(self: &Arc<Self>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => return,
        };
        let mut rx = self.group.subscribe();
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        handle.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = rx.recv() => ev,
                };
                let Some(this) = weak.upgrade() else { break };
                match event {
                    Ok(change) => this.on_state_change(&change),
                    Err(RecvError::Lagged(n)) => {
                        warn!("lb: state events lagged, skipped={}", n);
                        this.schedule_rebuild();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn on_state_change(self: &Arc<Self>, change: &StateChange) {
        if change.kind == StateChangeKind::BecameUnhealthy {
            self.pool.remove_after(&change.origin);
        }
        self.schedule_rebuild();
    }

    /// Coalesce bursts of state changes into one rebuild after the debounce
    /// window. Only weighted random caches derived state.
    fn schedule_rebuild(self: &Arc<Self>) {
        let Some(wr) = self.lb.as_weighted_random() else {
            return;
        };
        if !wr.mark_rebuild_pending() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let delay = self.rebuild_debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(this) = weak.upgrade() {
                if let Some(wr) = this.lb.as_weighted_random() {
                    wr.flush_pending(&this.group);
                }
            }
        });
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
