use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// What changed on an upstream. Published only when the value actually
/// changes; setting a field to its current value is silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeKind {
    BecameHealthy,
    BecameUnhealthy,
    EffectiveWeight,
}

#[derive(Debug, Clone)]
pub struct StateChange {
    pub url: Arc<str>,
    pub origin: Arc<str>,
    pub kind: StateChangeKind,
}

/// `f64` stored as raw bits in an `AtomicU64`.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Release);
    }

    /// Returns the previous value.
    fn swap(&self, v: f64) -> f64 {
        f64::from_bits(self.0.swap(v.to_bits(), Ordering::AcqRel))
    }
}

/// One backend instance. Shared between the request path (readers of
/// `healthy`) and background probes (writers), so every mutable field is
/// atomic.
#[derive(Debug)]
pub struct Upstream {
    url: Arc<str>,
    /// `scheme://authority`, the connection pool key.
    origin: Arc<str>,
    weight: f64,
    healthy: AtomicBool,
    recovering: AtomicBool,
    retry_count: AtomicU32,
    current_weight: AtomicF64,
    effective_weight: AtomicF64,
    /// Unix millis of the last probe or failure report, 0 = never.
    last_checked_ms: AtomicU64,
    events: Option<broadcast::Sender<StateChange>>,
}

impl Upstream {
    pub fn new(url: &str, weight: f64, events: Option<broadcast::Sender<StateChange>>) -> Self {
        let weight = weight.max(1.0);
        Self {
            url: Arc::from(url),
            origin: Arc::from(origin_of(url)),
            weight,
            healthy: AtomicBool::new(true),
            recovering: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            current_weight: AtomicF64::new(0.0),
            effective_weight: AtomicF64::new(weight),
            last_checked_ms: AtomicU64::new(0),
            events,
        }
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[inline]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Returns `true` if the flag actually flipped. An unhealthy → healthy
    /// transition resets `effective_weight` to the static weight.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        // The weight must be restored before readers can see the flag.
        if healthy && !self.is_healthy() {
            self.set_effective_weight(self.weight);
        }
        let previous = self.healthy.swap(healthy, Ordering::AcqRel);
        if previous == healthy {
            return false;
        }
        if healthy {
            self.publish(StateChangeKind::BecameHealthy);
        } else {
            self.publish(StateChangeKind::BecameUnhealthy);
        }
        true
    }

    pub fn effective_weight(&self) -> f64 {
        self.effective_weight.load()
    }

    pub fn set_effective_weight(&self, weight: f64) -> bool {
        let previous = self.effective_weight.swap(weight);
        if previous == weight {
            return false;
        }
        self.publish(StateChangeKind::EffectiveWeight);
        true
    }

    pub fn current_weight(&self) -> f64 {
        self.current_weight.load()
    }

    pub fn set_current_weight(&self, weight: f64) {
        self.current_weight.store(weight);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// CAS `recovering` false → true. Only the winner may start a recovery
    /// chain.
    pub fn try_begin_recovery(&self) -> bool {
        self.recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_recovery(&self) {
        self.recovering.store(false, Ordering::Release);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    /// Returns the new count.
    pub fn increment_retry_count(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_retry_count(&self) {
        self.retry_count.store(0, Ordering::Release);
    }

    pub fn mark_checked(&self, at: SystemTime) {
        let ms = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_checked_ms.store(ms, Ordering::Release);
    }

    pub fn last_checked(&self) -> Option<SystemTime> {
        match self.last_checked_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    fn publish(&self, kind: StateChangeKind) {
        if let Some(ref tx) = self.events {
            // No subscriber is fine: nothing caches derived state yet.
            let _ = tx.send(StateChange {
                url: self.url.clone(),
                origin: self.origin.clone(),
                kind,
            });
        }
    }
}

/// `scheme://authority` of a URL, or the URL without trailing slashes when it
/// does not parse.
pub fn origin_of(url: &str) -> String {
    match url.parse::<http::Uri>() {
        Ok(uri) => match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(authority)) => format!("{}://{}", scheme, authority),
            _ => url.trim_end_matches('/').to_string(),
        },
        Err(_) => url.trim_end_matches('/').to_string(),
    }
}
