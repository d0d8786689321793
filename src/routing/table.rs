use crate::config::ReverseProxyConfig;
use crate::routing::PathMatcher;
use std::sync::Arc;

/// Proxy rules in match order: longer patterns first, config order among
/// patterns of equal length.
#[derive(Default)]
pub struct RuleTable {
    rules: Vec<Arc<ReverseProxyConfig>>,
}

impl RuleTable {
    pub fn new(rules: &[ReverseProxyConfig]) -> Self {
        let mut rules: Vec<Arc<ReverseProxyConfig>> =
            rules.iter().cloned().map(Arc::new).collect();
        rules.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        tracing::debug!("routing: compiled rule table, count={}", rules.len());
        Self { rules }
    }

    pub fn match_path(&self, path: &str) -> Option<&Arc<ReverseProxyConfig>> {
        self.rules
            .iter()
            .find(|rule| PathMatcher::matches(&rule.path, path))
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ReverseProxyConfig>> {
        self.rules.iter().find(|rule| rule.id == id)
    }

    pub fn rules(&self) -> &[Arc<ReverseProxyConfig>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
