pub mod types;


pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for operational settings. When the file does not
    /// exist, built-in defaults are used.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config: file not found, using defaults, path={}", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            "config: loaded, proxies={}, listen={}",
            config.proxies.len(),
            config.server.listen
        );
        Ok(config)
    }

    /// Environment overrides cover operational integers and the listen
    /// address. Routing rules only come from the config source.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GATEWAY_LISTEN") {
            self.server.listen = v;
        }

        let t = &mut self.tunables;
        override_u64("GATEWAY_RECOVERY_INTERVAL_MS", &mut t.recovery_interval_ms);
        override_u64("GATEWAY_CONNECT_TIMEOUT_MS", &mut t.connect_timeout_ms);
        override_u64("GATEWAY_POOL_REMOVAL_DELAY_MS", &mut t.pool_removal_delay_ms);
        override_u64("GATEWAY_REBUILD_DEBOUNCE_MS", &mut t.rebuild_debounce_ms);
        override_u64("GATEWAY_PROBE_TIMEOUT_MS", &mut t.probe_timeout_ms);
        override_u64("GATEWAY_HEALTH_CHECK_JITTER_MS", &mut t.health_check_jitter_ms);
        if let Ok(v) = std::env::var("GATEWAY_FAILURE_THRESHOLD") {
            if let Ok(n) = v.parse::<u32>() {
                t.failure_threshold = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_proxies(&self.proxies)
    }
}

/// Rule list checks shared by startup and runtime refresh: non-empty unique
/// ids plus per-rule validation.
pub fn validate_proxies(proxies: &[ReverseProxyConfig]) -> Result<()> {
    let mut ids = HashSet::new();
    for proxy in proxies {
        if proxy.id.is_empty() {
            anyhow::bail!("proxy with path '{}' has an empty id", proxy.path);
        }
        if !ids.insert(proxy.id.as_str()) {
            anyhow::bail!("duplicate proxy id '{}'", proxy.id);
        }
        proxy.validate()?;
    }
    Ok(())
}

impl ReverseProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            anyhow::bail!("proxy '{}': path '{}' must start with '/'", self.id, self.path);
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("proxy '{}': timeout_ms must be greater than 0", self.id);
        }
        self.lb_config
            .validate()
            .map_err(|e| anyhow::anyhow!("proxy '{}': {}", self.id, e))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl LoadBalancerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.canary_percent > 100 {
            anyhow::bail!("canary_percent {} exceeds 100", self.canary_percent);
        }
        if self.health_check_mode == HealthCheckMode::ActiveCheck && self.check_interval_ms == 0 {
            anyhow::bail!("check_interval_ms must be greater than 0 for active_check");
        }
        if !self.health_path.starts_with('/') {
            anyhow::bail!("health_path '{}' must start with '/'", self.health_path);
        }
        for upstream in self.upstreams.iter().chain(&self.canary_upstreams) {
            upstream.validate()?;
        }
        Ok(())
    }

    /// Every configured upstream URL, main list first.
    pub fn all_urls(&self) -> impl Iterator<Item = &str> {
        self.upstreams
            .iter()
            .chain(&self.canary_upstreams)
            .map(|u| u.url.as_str())
    }
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.weight.is_nan() || self.weight < 1.0 {
            anyhow::bail!("upstream '{}': weight {} must be >= 1", self.url, self.weight);
        }
        let uri: http::Uri = self
            .url
            .parse()
            .map_err(|e| anyhow::anyhow!("upstream '{}': invalid url: {}", self.url, e))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => anyhow::bail!("upstream '{}': scheme must be http or https", self.url),
        }
        if uri.host().is_none() {
            anyhow::bail!("upstream '{}': missing host", self.url);
        }
        Ok(())
    }
}

impl Tunables {
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pool_removal_delay(&self) -> Duration {
        Duration::from_millis(self.pool_removal_delay_ms)
    }

    pub fn rebuild_debounce(&self) -> Duration {
        Duration::from_millis(self.rebuild_debounce_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn override_u64(key: &str, target: &mut u64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *target = n;
        }
    }
}
