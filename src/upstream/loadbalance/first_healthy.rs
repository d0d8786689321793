use crate::upstream::Upstream;
use std::sync::Arc;

/// No balancing: the first healthy upstream in list order always wins.
#[derive(Debug, Default)]
pub struct FirstHealthyBalancer;

impl FirstHealthyBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(&self, healthy: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        healthy.first().cloned()
    }
}
