use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tunables: Tunables,

    /// Routing rules, one handler each.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxies: Vec<ReverseProxyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Tokio worker threads. `None` means one per available core.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            worker_threads: None,
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_drain_timeout() -> u64 {
    30
}

/// Operational knobs for health tracking and the client pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Delay before a passive recovery probe.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_ms: u64,

    /// Consecutive failed recovery probes before passive recovery gives up.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Grace period before a pooled client of an unhealthy upstream is evicted.
    #[serde(default = "default_pool_removal_delay")]
    pub pool_removal_delay_ms: u64,

    #[serde(default = "default_rebuild_debounce")]
    pub rebuild_debounce_ms: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Upper bound of the random delay before an active checker's first round.
    #[serde(default)]
    pub health_check_jitter_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            recovery_interval_ms: default_recovery_interval(),
            failure_threshold: default_failure_threshold(),
            connect_timeout_ms: default_connect_timeout(),
            pool_removal_delay_ms: default_pool_removal_delay(),
            rebuild_debounce_ms: default_rebuild_debounce(),
            probe_timeout_ms: default_probe_timeout(),
            health_check_jitter_ms: 0,
        }
    }
}

fn default_recovery_interval() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_pool_removal_delay() -> u64 {
    3_000
}

fn default_rebuild_debounce() -> u64 {
    200
}

fn default_probe_timeout() -> u64 {
    2_000
}

/// One routing rule: which paths it owns and how to forward them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseProxyConfig {
    pub id: String,

    /// Glob pattern over `/`-delimited segments (`*`, `**`).
    pub path: String,

    /// Remove the literal (non-wildcard) prefix of `path` before forwarding.
    #[serde(default, alias = "stripPrefix")]
    pub strip_prefix: bool,

    #[serde(default = "default_proxy_timeout", alias = "timeoutMs")]
    pub timeout_ms: u64,

    /// Extra headers set on every outbound request of this rule.
    #[serde(
        default,
        alias = "addHeaders",
        deserialize_with = "deserialize_null_default"
    )]
    pub add_headers: HashMap<String, String>,

    #[serde(default, alias = "lbConfig")]
    pub lb_config: LoadBalancerConfig,
}

impl Default for ReverseProxyConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            path: "/**".to_string(),
            strip_prefix: false,
            timeout_ms: default_proxy_timeout(),
            add_headers: HashMap::new(),
            lb_config: LoadBalancerConfig::default(),
        }
    }
}

fn default_proxy_timeout() -> u64 {
    30_000
}

/// Balancing strategy identifier. Resolved when the config is parsed, so an
/// unknown name fails the load instead of the first request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[serde(alias = "NONE")]
    None,
    #[default]
    #[serde(alias = "ROUND_ROBIN", alias = "roundrobin")]
    RoundRobin,
    #[serde(alias = "IP_HASH")]
    IpHash,
    #[serde(alias = "RANDOM")]
    Random,
    #[serde(alias = "WEIGHTED_RANDOM")]
    WeightedRandom,
    #[serde(alias = "WEIGHTED_ROUND_ROBIN")]
    WeightedRoundRobin,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::None => "none",
            Strategy::RoundRobin => "round_robin",
            Strategy::IpHash => "ip_hash",
            Strategy::Random => "random",
            Strategy::WeightedRandom => "weighted_random",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMode {
    #[serde(alias = "ACTIVE_CHECK")]
    ActiveCheck,
    #[default]
    #[serde(alias = "PASSIVE_CHECK")]
    PassiveCheck,
    /// Upstreams are always treated as healthy.
    #[serde(alias = "DISABLED")]
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default, alias = "healthCheckMode")]
    pub health_check_mode: HealthCheckMode,

    #[serde(default = "default_check_interval", alias = "checkIntervalMs")]
    pub check_interval_ms: u64,

    #[serde(default = "default_health_path", alias = "healthPath")]
    pub health_path: String,

    /// Share of session-carrying requests routed to `canary_upstreams`.
    #[serde(default = "default_canary_percent", alias = "canaryPercent")]
    pub canary_percent: u8,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(
        default,
        alias = "canaryUpstreams",
        deserialize_with = "deserialize_null_default"
    )]
    pub canary_upstreams: Vec<UpstreamConfig>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            health_check_mode: HealthCheckMode::default(),
            check_interval_ms: default_check_interval(),
            health_path: default_health_path(),
            canary_percent: default_canary_percent(),
            upstreams: Vec::new(),
            canary_upstreams: Vec::new(),
        }
    }
}

fn default_check_interval() -> u64 {
    10_000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_canary_percent() -> u8 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base origin, e.g. `http://10.0.0.5:8080`.
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_full_serde() {
        let json = r#"{
            "id": "users",
            "path": "/api/users/**",
            "strip_prefix": true,
            "timeout_ms": 1500,
            "add_headers": {"X-Env": "prod"},
            "lb_config": {
                "strategy": "weighted_random",
                "health_check_mode": "active_check",
                "check_interval_ms": 5000,
                "health_path": "/ping",
                "canary_percent": 20,
                "upstreams": [
                    {"url": "http://10.0.0.1:8080", "weight": 1},
                    {"url": "http://10.0.0.2:8080", "weight": 3}
                ],
                "canary_upstreams": [
                    {"url": "http://10.0.1.1:8080"}
                ]
            }
        }"#;

        let proxy: ReverseProxyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(proxy.id, "users");
        assert_eq!(proxy.path, "/api/users/**");
        assert!(proxy.strip_prefix);
        assert_eq!(proxy.timeout_ms, 1500);
        assert_eq!(proxy.add_headers.get("X-Env").map(String::as_str), Some("prod"));

        let lb = &proxy.lb_config;
        assert_eq!(lb.strategy, Strategy::WeightedRandom);
        assert_eq!(lb.health_check_mode, HealthCheckMode::ActiveCheck);
        assert_eq!(lb.check_interval_ms, 5000);
        assert_eq!(lb.health_path, "/ping");
        assert_eq!(lb.canary_percent, 20);
        assert_eq!(lb.upstreams.len(), 2);
        assert_eq!(lb.upstreams[1].weight, 3.0);
        assert_eq!(lb.canary_upstreams[0].weight, 1.0);
    }

    #[test]
    fn test_proxy_camel_case_aliases() {
        let json = r#"{
            "id": "r1",
            "path": "/svc/**",
            "stripPrefix": true,
            "timeoutMs": 2000,
            "addHeaders": {"X-A": "1"},
            "lbConfig": {
                "strategy": "IP_HASH",
                "healthCheckMode": "DISABLED",
                "checkIntervalMs": 1000,
                "upstreams": [{"url": "http://127.0.0.1:9000", "weight": 2}],
                "canaryUpstreams": null
            }
        }"#;

        let proxy: ReverseProxyConfig = serde_json::from_str(json).unwrap();
        assert!(proxy.strip_prefix);
        assert_eq!(proxy.timeout_ms, 2000);
        assert_eq!(proxy.lb_config.strategy, Strategy::IpHash);
        assert_eq!(proxy.lb_config.health_check_mode, HealthCheckMode::Disabled);
        assert!(proxy.lb_config.canary_upstreams.is_empty());
    }

    #[test]
    fn test_proxy_defaults() {
        let proxy: ReverseProxyConfig =
            serde_json::from_str(r#"{"id": "r", "path": "/**"}"#).unwrap();
        assert!(!proxy.strip_prefix);
        assert_eq!(proxy.timeout_ms, 30_000);
        assert!(proxy.add_headers.is_empty());
        assert_eq!(proxy.lb_config.strategy, Strategy::RoundRobin);
        assert_eq!(proxy.lb_config.health_check_mode, HealthCheckMode::PassiveCheck);
        assert_eq!(proxy.lb_config.health_path, "/health");
        assert_eq!(proxy.lb_config.canary_percent, 10);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let json = r#"{"id": "r", "path": "/**", "lb_config": {"strategy": "least_conn"}}"#;
        assert!(serde_json::from_str::<ReverseProxyConfig>(json).is_err());
    }

    #[test]
    fn test_tunables_defaults() {
        let t = Tunables::default();
        assert_eq!(t.recovery_interval_ms, 30_000);
        assert_eq!(t.failure_threshold, 3);
        assert_eq!(t.connect_timeout_ms, 5_000);
        assert_eq!(t.pool_removal_delay_ms, 3_000);
        assert_eq!(t.rebuild_debounce_ms, 200);
    }

    #[test]
    fn test_strategy_names() {
        for (strategy, name) in [
            (Strategy::None, "none"),
            (Strategy::RoundRobin, "round_robin"),
            (Strategy::IpHash, "ip_hash"),
            (Strategy::Random, "random"),
            (Strategy::WeightedRandom, "weighted_random"),
            (Strategy::WeightedRoundRobin, "weighted_round_robin"),
        ] {
            assert_eq!(strategy.as_str(), name);
            let parsed: Strategy = serde_json::from_str(&format!("\"{}\"", name)).unwrap();
            assert_eq!(parsed, strategy);
        }
    }
}
