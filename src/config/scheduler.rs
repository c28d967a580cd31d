//! Scheduler configuration structures.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::interval::IntervalConfig;
use crate::core::lease::LeaseConfig;
use crate::core::AppResult;

/// Serial operation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Pool description, also the id interval settings are stored under.
    pub description: String,
    /// Per-iteration timeout in milliseconds.
    pub timeout_ms: u64,
    /// Membership reconciliation cadence in milliseconds.
    pub membership_refresh_ms: u64,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            description: "queue-processor".into(),
            timeout_ms: 30_000,
            membership_refresh_ms: 1_000,
        }
    }
}

impl OperationConfig {
    /// Validate operation settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("description must not be empty".into());
        }
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".into());
        }
        if self.membership_refresh_ms == 0 {
            return Err("membership_refresh_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Iteration timeout.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Membership refresh cadence.
    pub const fn membership_refresh(&self) -> Duration {
        Duration::from_millis(self.membership_refresh_ms)
    }
}

/// Adaptive interval settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalSettings {
    /// Delay while busy, in milliseconds.
    pub start_delay_ms: u64,
    /// Delay ceiling, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter upper bound, in milliseconds.
    pub max_jitter_ms: u64,
    /// Idle samples before the delay doubles.
    pub idle_threshold: u32,
    /// Gauge sampling cadence, in milliseconds.
    pub gauge_interval_ms: u64,
    /// Budget for reading a persisted delay, in milliseconds.
    pub load_timeout_ms: u64,
}

impl Default for IntervalSettings {
    fn default() -> Self {
        let d = IntervalConfig::default();
        Self {
            start_delay_ms: millis(d.start_delay),
            max_delay_ms: millis(d.max_delay),
            max_jitter_ms: millis(d.max_jitter),
            idle_threshold: d.idle_threshold,
            gauge_interval_ms: millis(d.gauge_interval),
            load_timeout_ms: millis(d.load_timeout),
        }
    }
}

impl IntervalSettings {
    /// Validate interval settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.start_delay_ms == 0 {
            return Err("start_delay_ms must be greater than 0".into());
        }
        if self.max_delay_ms < self.start_delay_ms {
            return Err("max_delay_ms must be at least start_delay_ms".into());
        }
        if self.idle_threshold == 0 {
            return Err("idle_threshold must be greater than 0".into());
        }
        if self.gauge_interval_ms == 0 {
            return Err("gauge_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Runtime interval configuration.
    pub const fn to_interval_config(&self) -> IntervalConfig {
        IntervalConfig {
            start_delay: Duration::from_millis(self.start_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
            idle_threshold: self.idle_threshold,
            gauge_interval: Duration::from_millis(self.gauge_interval_ms),
            load_timeout: Duration::from_millis(self.load_timeout_ms),
        }
    }
}

/// Lease settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// Lease lifetime in milliseconds.
    pub ttl_ms: u64,
    /// Renewal cadence in milliseconds.
    pub renew_interval_ms: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        let d = LeaseConfig::default();
        Self {
            ttl_ms: millis(d.ttl),
            renew_interval_ms: millis(d.renew_interval),
        }
    }
}

impl LeaseSettings {
    /// Validate lease settings. Renewal must happen before expiry.
    pub fn validate(&self) -> Result<(), String> {
        if self.ttl_ms == 0 {
            return Err("ttl_ms must be greater than 0".into());
        }
        if self.renew_interval_ms == 0 || self.renew_interval_ms >= self.ttl_ms {
            return Err("renew_interval_ms must be in (0, ttl_ms)".into());
        }
        Ok(())
    }

    /// Runtime lease configuration.
    pub const fn to_lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_millis(self.ttl_ms),
            renew_interval: Duration::from_millis(self.renew_interval_ms),
        }
    }
}

/// Queue listing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum items listed per queue and iteration.
    pub batch_size: usize,
    /// How long a step is remembered as having no rate limit, in milliseconds.
    pub no_rate_limit_cache_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            no_rate_limit_cache_ms: 60_000,
        }
    }
}

impl QueueSettings {
    /// Validate queue settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".into());
        }
        Ok(())
    }

    /// No-rate-limit cache lifetime.
    pub const fn no_rate_limit_ttl(&self) -> Duration {
        Duration::from_millis(self.no_rate_limit_cache_ms)
    }
}

/// Notification listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Subscribe to `queue-check` wake-ups.
    pub enabled: bool,
    /// Storage-level channel all topics share.
    pub channel: String,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "scheduler".into(),
        }
    }
}

impl ListenerSettings {
    /// Validate listener settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.channel.trim().is_empty() {
            return Err("channel must not be empty".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Operation pool.
    pub operation: OperationConfig,
    /// Adaptive interval. Without it tenants only run when triggered.
    pub interval: Option<IntervalSettings>,
    /// Leases.
    pub lease: LeaseSettings,
    /// Queue listing.
    pub queue: QueueSettings,
    /// Notification listener.
    pub listener: ListenerSettings,
}

impl SchedulerConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.operation
            .validate()
            .map_err(|e| format!("operation invalid: {e}"))?;
        if let Some(interval) = &self.interval {
            interval
                .validate()
                .map_err(|e| format!("interval invalid: {e}"))?;
        }
        self.lease.validate().map_err(|e| format!("lease invalid: {e}"))?;
        self.queue.validate().map_err(|e| format!("queue invalid: {e}"))?;
        self.listener
            .validate()
            .map_err(|e| format!("listener invalid: {e}"))?;
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from the process environment after reading `.env` if present.
    pub fn from_env() -> AppResult<Self> {
        // a missing .env file is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults overridden by `SCHEDULER_*` variables returned
    /// by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("SCHEDULER_OPERATION_DESCRIPTION") {
            cfg.operation.description = v;
        }
        set_parsed(&lookup, "SCHEDULER_OPERATION_TIMEOUT_MS", &mut cfg.operation.timeout_ms)?;
        set_parsed(
            &lookup,
            "SCHEDULER_MEMBERSHIP_REFRESH_MS",
            &mut cfg.operation.membership_refresh_ms,
        )?;

        let interval_enabled: Option<bool> = parse(&lookup, "SCHEDULER_INTERVAL_ENABLED")?;
        if interval_enabled == Some(true) || lookup("SCHEDULER_INTERVAL_START_MS").is_some() {
            let mut interval = IntervalSettings::default();
            set_parsed(&lookup, "SCHEDULER_INTERVAL_START_MS", &mut interval.start_delay_ms)?;
            set_parsed(&lookup, "SCHEDULER_INTERVAL_MAX_MS", &mut interval.max_delay_ms)?;
            set_parsed(&lookup, "SCHEDULER_INTERVAL_JITTER_MS", &mut interval.max_jitter_ms)?;
            set_parsed(
                &lookup,
                "SCHEDULER_INTERVAL_IDLE_THRESHOLD",
                &mut interval.idle_threshold,
            )?;
            set_parsed(
                &lookup,
                "SCHEDULER_INTERVAL_GAUGE_MS",
                &mut interval.gauge_interval_ms,
            )?;
            cfg.interval = Some(interval);
        }

        set_parsed(&lookup, "SCHEDULER_LEASE_TTL_MS", &mut cfg.lease.ttl_ms)?;
        set_parsed(&lookup, "SCHEDULER_LEASE_RENEW_MS", &mut cfg.lease.renew_interval_ms)?;
        set_parsed(&lookup, "SCHEDULER_QUEUE_BATCH_SIZE", &mut cfg.queue.batch_size)?;
        set_parsed(
            &lookup,
            "SCHEDULER_QUEUE_NO_RATE_LIMIT_CACHE_MS",
            &mut cfg.queue.no_rate_limit_cache_ms,
        )?;
        set_parsed(&lookup, "SCHEDULER_LISTENER_ENABLED", &mut cfg.listener.enabled)?;
        if let Some(v) = lookup("SCHEDULER_LISTENER_CHANNEL") {
            cfg.listener.channel = v;
        }

        cfg.validate()
            .map_err(anyhow::Error::msg)
            .context("scheduler configuration from environment")?;
        Ok(cfg)
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> AppResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("{key}={raw}")))
        .transpose()
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> AppResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(v) = parse(lookup, key)? {
        *target = v;
    }
    Ok(())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
