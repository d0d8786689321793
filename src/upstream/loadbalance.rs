pub mod first_healthy;
pub mod ip_hash;
pub mod random;
pub mod round_robin;
pub mod weighted_random;
pub mod weighted_round_robin;

use crate::config::Strategy;
use crate::upstream::{Upstream, UpstreamGroup, UpstreamSet};
use first_healthy::FirstHealthyBalancer;
use ip_hash::IpHashBalancer;
use random::RandomBalancer;
use round_robin::RoundRobinBalancer;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;
use weighted_random::WeightedRandomBalancer;
use weighted_round_robin::WeightedRoundRobinBalancer;

/// Request attributes the strategies and canary gate look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionContext<'a> {
    pub client_ip: Option<IpAddr>,
    pub session_id: Option<&'a str>,
}

pub enum LoadBalancer {
    FirstHealthy(FirstHealthyBalancer),
    RoundRobin(RoundRobinBalancer),
    IpHash(IpHashBalancer),
    Random(RandomBalancer),
    WeightedRandom(WeightedRandomBalancer),
    WeightedRoundRobin(WeightedRoundRobinBalancer),
}

impl LoadBalancer {
    /// Strategy registry. `Strategy` is resolved when the config is parsed,
    /// so every identifier that reaches here has a constructor.
    pub fn new(strategy: Strategy) -> Self {
        match strategy {
            Strategy::None => Self::FirstHealthy(FirstHealthyBalancer::new()),
            Strategy::RoundRobin => Self::RoundRobin(RoundRobinBalancer::new()),
            Strategy::IpHash => Self::IpHash(IpHashBalancer::new()),
            Strategy::Random => Self::Random(RandomBalancer::new()),
            Strategy::WeightedRandom => Self::WeightedRandom(WeightedRandomBalancer::new()),
            Strategy::WeightedRoundRobin => {
                Self::WeightedRoundRobin(WeightedRoundRobinBalancer::new())
            }
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::FirstHealthy(_) => Strategy::None,
            Self::RoundRobin(_) => Strategy::RoundRobin,
            Self::IpHash(_) => Strategy::IpHash,
            Self::Random(_) => Strategy::Random,
            Self::WeightedRandom(_) => Strategy::WeightedRandom,
            Self::WeightedRoundRobin(_) => Strategy::WeightedRoundRobin,
        }
    }

    /// Pick from one set of `group`. Never returns an ineligible upstream;
    /// `None` means the set has no eligible member.
    pub fn select(
        &self,
        group: &UpstreamGroup,
        which: UpstreamSet,
        ctx: &SelectionContext<'_>,
    ) -> Option<Arc<Upstream>> {
        match self {
            Self::IpHash(lb) => {
                lb.do_select(group.set(which), ctx.client_ip, |u| group.is_eligible(u))
            }
            Self::WeightedRandom(lb) => lb.do_select(group, which),
            Self::FirstHealthy(lb) => lb.do_select(&group.eligible(which)),
            Self::RoundRobin(lb) => lb.do_select(&group.eligible(which)),
            Self::Random(lb) => lb.do_select(&group.eligible(which)),
            Self::WeightedRoundRobin(lb) => lb.do_select(&group.eligible(which)),
        }
    }

    pub fn as_weighted_random(&self) -> Option<&WeightedRandomBalancer> {
        match self {
            Self::WeightedRandom(lb) => Some(lb),
            _ => None,
        }
    }
}

/// Canary gate. A request with a session id goes to the canary list when
/// one is configured and the session hashes into the canary percentage.
/// Pure over `(session_id, percent)`, so a session lands in the same bucket
/// on every call.
pub fn target_set(group: &UpstreamGroup, ctx: &SelectionContext<'_>) -> UpstreamSet {
    match ctx.session_id {
        Some(session) if !group.canary_upstreams().is_empty() => {
            if in_canary(session, group.canary_percent()) {
                UpstreamSet::Canary
            } else {
                UpstreamSet::Main
            }
        }
        _ => UpstreamSet::Main,
    }
}

pub fn in_canary(session_id: &str, percent: u8) -> bool {
    stable_hash(session_id) % 100 < u64::from(percent)
}

/// Deterministic across calls and processes (fixed-key SipHash).
pub(crate) fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
