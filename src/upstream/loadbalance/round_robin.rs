use crate::upstream::Upstream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The counter restarts from zero past this value.
const COUNTER_RESET_BOUND: usize = 1_000_000;

/// Plain round robin over the currently healthy upstreams.
///
/// The cycle length follows the healthy set, so position is not preserved
/// across membership changes.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn do_select(&self, healthy: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        if healthy.is_empty() {
            return None;
        }
        let count = self.next_count();
        Some(healthy[count % healthy.len()].clone())
    }

    fn next_count(&self) -> usize {
        match self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(if c >= COUNTER_RESET_BOUND { 0 } else { c + 1 })
            }) {
            Ok(c) | Err(c) => c,
        }
    }
}
