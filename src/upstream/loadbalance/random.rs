use crate::upstream::Upstream;
use rand::Rng;
use std::sync::Arc;

/// Uniform pick among healthy upstreams; weights are ignored.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(&self, healthy: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        if healthy.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..healthy.len());
        Some(healthy[idx].clone())
    }
}
