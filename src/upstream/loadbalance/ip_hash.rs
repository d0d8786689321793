use super::stable_hash;
use crate::upstream::Upstream;
use std::net::IpAddr;
use std::sync::Arc;

/// Client-IP affinity. The home index is `hash(ip) % n` over the full list;
/// an ineligible home probes forward (wrapping) to the next eligible one, so
/// the same IP sticks to the same upstream while health and order hold.
#[derive(Debug, Default)]
pub struct IpHashBalancer;

impl IpHashBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select<F>(
        &self,
        upstreams: &[Arc<Upstream>],
        client_ip: Option<IpAddr>,
        is_eligible: F,
    ) -> Option<Arc<Upstream>>
    where
        F: Fn(&Upstream) -> bool,
    {
        let n = upstreams.len();
        if n == 0 {
            return None;
        }
        let home = match client_ip {
            Some(ip) => (stable_hash(&ip) % n as u64) as usize,
            None => 0,
        };
        (0..n)
            .map(|offset| &upstreams[(home + offset) % n])
            .find(|u| is_eligible(u))
            .cloned()
    }
}
