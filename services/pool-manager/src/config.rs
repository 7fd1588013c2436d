//! Configuration for the pool manager.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clusterpool_reconcile::{ControllerConfig, DEFAULT_NAMESPACE};

/// Which allocation policy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Provision a new cluster per request, delete on recycle.
    OnDemand,
    /// Keep warm clusters per fingerprint and reuse them.
    Fixed,
}

impl FromStr for PoolMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on-demand" | "ondemand" => Ok(PoolMode::OnDemand),
            "fixed" => Ok(PoolMode::Fixed),
            other => anyhow::bail!("unknown pool mode {other:?}, expected on-demand or fixed"),
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolMode::OnDemand => "on-demand",
            PoolMode::Fixed => "fixed",
        })
    }
}

/// Pool manager tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub mode: PoolMode,

    /// Warm instances kept per fingerprint.
    pub pool_size: usize,

    /// Age after which a recycled instance is destroyed instead of pooled.
    pub life_span: Duration,

    /// Bound on one provisioning attempt, including readiness polling.
    pub provision_timeout: Duration,

    /// Delay between readiness polls.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::Fixed,
            pool_size: 2,
            life_span: Duration::from_secs(3600),
            provision_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Binary configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace watched for requests and used for instance objects.
    pub namespace: String,

    pub pool: PoolConfig,

    /// Worker loops.
    pub workers: usize,

    /// Requeues before a request is dropped.
    pub max_retries: u32,

    /// Cache resync interval in seconds. 0 disables resync.
    pub resync_secs: u64,

    /// Startup cache sync bound in seconds.
    pub sync_timeout_secs: u64,

    /// Pool maintenance interval in seconds. 0 disables it.
    pub maintain_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any name-to-value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PoolConfig::default();

        let namespace = lookup("CLUSTERPOOL_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let pool = PoolConfig {
            mode: parse_or(&lookup, "CLUSTERPOOL_MODE", defaults.mode)?,
            pool_size: parse_or(&lookup, "CLUSTERPOOL_POOL_SIZE", defaults.pool_size)?,
            life_span: Duration::from_secs(parse_or(
                &lookup,
                "CLUSTERPOOL_LIFESPAN_SECS",
                defaults.life_span.as_secs(),
            )?),
            provision_timeout: Duration::from_secs(parse_or(
                &lookup,
                "CLUSTERPOOL_PROVISION_TIMEOUT_SECS",
                defaults.provision_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "CLUSTERPOOL_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
        };

        let log_level = lookup("CLUSTERPOOL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            namespace,
            pool,
            workers: parse_or(&lookup, "CLUSTERPOOL_WORKERS", 2)?,
            max_retries: parse_or(&lookup, "CLUSTERPOOL_MAX_RETRIES", 5)?,
            resync_secs: parse_or(&lookup, "CLUSTERPOOL_RESYNC_SECS", 60)?,
            sync_timeout_secs: parse_or(&lookup, "CLUSTERPOOL_SYNC_TIMEOUT_SECS", 30)?,
            maintain_secs: parse_or(&lookup, "CLUSTERPOOL_MAINTAIN_SECS", 30)?,
            log_level,
        })
    }

    /// Engine settings derived from this config.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            name: "pool-manager".to_string(),
            workers: self.workers,
            max_retries: self.max_retries,
            resync_period: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            ..Default::default()
        }
    }

    pub fn maintain_interval(&self) -> Option<Duration> {
        (self.maintain_secs > 0).then(|| Duration::from_secs(self.maintain_secs))
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value {raw:?} for {name}")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.pool.mode, PoolMode::Fixed);
        assert_eq!(config.pool.pool_size, 2);
        assert_eq!(config.pool.life_span, Duration::from_secs(3600));
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.maintain_interval(), Some(Duration::from_secs(30)));

        let controller = config.controller_config();
        assert_eq!(controller.resync_period, Some(Duration::from_secs(60)));
        assert_eq!(controller.sync_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CLUSTERPOOL_NAMESPACE", "ci"),
            ("CLUSTERPOOL_MODE", "on-demand"),
            ("CLUSTERPOOL_POOL_SIZE", "5"),
            ("CLUSTERPOOL_RESYNC_SECS", "0"),
            ("CLUSTERPOOL_MAINTAIN_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.namespace, "ci");
        assert_eq!(config.pool.mode, PoolMode::OnDemand);
        assert_eq!(config.pool.pool_size, 5);
        assert_eq!(config.controller_config().resync_period, None);
        assert_eq!(config.maintain_interval(), None);
    }

    #[test]
    fn test_bad_values_are_reported() {
        let err = load(&[("CLUSTERPOOL_POOL_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("CLUSTERPOOL_POOL_SIZE"));

        let err = load(&[("CLUSTERPOOL_MODE", "elastic")]).unwrap_err();
        assert!(format!("{err:#}").contains("unknown pool mode"));
    }
}
