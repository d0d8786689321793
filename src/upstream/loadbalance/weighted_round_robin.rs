use crate::upstream::Upstream;
use std::sync::{Arc, Mutex, PoisonError};

/// Smooth weighted round robin.
///
/// Each pick adds every candidate's `effective_weight` to its
/// `current_weight`, takes the maximum, then subtracts the total effective
/// weight from the winner. Over a window of `sum(weights)` picks each upstream
/// is chosen exactly `weight` times, interleaved rather than in bursts.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinBalancer {
    /// One pick at a time; the step reads and writes several upstreams.
    step: Mutex<()>,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn do_select(&self, healthy: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        if healthy.is_empty() {
            return None;
        }
        let _step = self.step.lock().unwrap_or_else(PoisonError::into_inner);

        let mut total = 0.0;
        let mut best: Option<&Arc<Upstream>> = None;
        for u in healthy {
            let effective = u.effective_weight();
            total += effective;
            let current = u.current_weight() + effective;
            u.set_current_weight(current);
            if best.map_or(true, |b| current > b.current_weight()) {
                best = Some(u);
            }
        }

        let best = best?;
        best.set_current_weight(best.current_weight() - total);
        Some(best.clone())
    }
}
