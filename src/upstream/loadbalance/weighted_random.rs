use crate::upstream::{Upstream, UpstreamGroup, UpstreamSet};
use arc_swap::ArcSwap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Weighted random using a cached prefix sum + binary search.
///
/// The table covers the eligible upstreams of both sets, weighted by
/// `effective_weight`, and is stamped with the group version it was built
/// from. A version mismatch rebuilds inline; health or weight changes go
/// through a debounced rebuild scheduled by the owning `Balancer`. Readers
/// always see a complete table because rebuilds swap in a fresh `Arc`.
pub struct WeightedRandomBalancer {
    table: ArcSwap<WeightTable>,
    rebuild_pending: AtomicBool,
}

struct WeightTable {
    /// `None` until the first build.
    version: Option<u64>,
    main: PrefixTable,
    canary: PrefixTable,
}

#[derive(Default)]
struct PrefixTable {
    upstreams: Vec<Arc<Upstream>>,
    prefix_sum: Vec<f64>,
    total_weight: f64,
}

impl PrefixTable {
    fn build(upstreams: Vec<Arc<Upstream>>) -> Self {
        let mut prefix_sum = Vec::with_capacity(upstreams.len());
        let mut sum = 0.0;
        for u in &upstreams {
            sum += u.effective_weight().max(0.0);
            prefix_sum.push(sum);
        }
        Self {
            upstreams,
            prefix_sum,
            total_weight: sum,
        }
    }

    fn pick(&self) -> Option<Arc<Upstream>> {
        if self.upstreams.is_empty() || self.total_weight <= 0.0 {
            return None;
        }
        let target = rand::thread_rng().gen_range(0.0..self.total_weight);
        let idx = self
            .prefix_sum
            .partition_point(|&s| s <= target)
            .min(self.upstreams.len() - 1);
        Some(self.upstreams[idx].clone())
    }
}

impl WeightTable {
    fn set(&self, which: UpstreamSet) -> &PrefixTable {
        match which {
            UpstreamSet::Main => &self.main,
            UpstreamSet::Canary => &self.canary,
        }
    }
}

impl Default for WeightedRandomBalancer {
    fn default() -> Self {
        Self {
            table: ArcSwap::from_pointee(WeightTable {
                version: None,
                main: PrefixTable::default(),
                canary: PrefixTable::default(),
            }),
            rebuild_pending: AtomicBool::new(false),
        }
    }
}

impl WeightedRandomBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&self, group: &UpstreamGroup) {
        let version = group.version();
        let main = PrefixTable::build(group.eligible(UpstreamSet::Main));
        let canary = PrefixTable::build(group.eligible(UpstreamSet::Canary));
        tracing::debug!(
            "lb: weighted_random: table rebuilt, version={}, main={}, canary={}",
            version,
            main.upstreams.len(),
            canary.upstreams.len()
        );
        self.table.store(Arc::new(WeightTable {
            version: Some(version),
            main,
            canary,
        }));
    }

    /// Version the cached table was built from.
    pub fn table_version(&self) -> Option<u64> {
        self.table.load().version
    }

    /// Set the pending flag. Returns `true` for the caller that should
    /// schedule the rebuild; later callers coalesce into it.
    pub fn mark_rebuild_pending(&self) -> bool {
        self.rebuild_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run the debounced rebuild.
    pub fn flush_pending(&self, group: &UpstreamGroup) {
        self.rebuild_pending.store(false, Ordering::Release);
        self.rebuild(group);
    }

    pub fn do_select(&self, group: &UpstreamGroup, which: UpstreamSet) -> Option<Arc<Upstream>> {
        let picked = {
            let table = self.table.load();
            if table.version == Some(group.version()) {
                table.set(which).pick()
            } else {
                None
            }
        };

        if let Some(u) = picked {
            if group.is_eligible(&u) {
                return Some(u);
            }
        }

        // Stale version, or health moved since the last build and the
        // debounced rebuild has not landed yet.
        self.rebuild(group);
        self.pick_fresh(group, which)
    }

    fn pick_fresh(&self, group: &UpstreamGroup, which: UpstreamSet) -> Option<Arc<Upstream>> {
        self.table
            .load()
            .set(which)
            .pick()
            .filter(|u| group.is_eligible(u))
    }
}
