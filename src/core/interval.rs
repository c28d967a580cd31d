//! Adaptive wake-up interval with jitter and idle backoff.
//!
//! An [`Interval`] tracks the delay between two runs of a per-resource work
//! loop. Busy resources stay at `start_delay`; resources that report no
//! activity for `idle_threshold` consecutive samples double their delay, up
//! to `max_delay`. The current delay is persisted per
//! `(operation_id, resource_id)` so a restarted scheduler resumes where it
//! left off.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::SchedulerError;

/// Storage for persisted interval delays.
#[async_trait]
pub trait IntervalSettingsRepository: Send + Sync {
    /// Read the persisted delay, if any.
    async fn read_interval(
        &self,
        operation_id: &str,
        resource_id: &str,
    ) -> Result<Option<Duration>, SchedulerError>;

    /// Persist a new delay and return the stored value.
    async fn set_interval(
        &self,
        operation_id: &str,
        resource_id: &str,
        delay: Duration,
    ) -> Result<Duration, SchedulerError>;
}

/// Tuning knobs for an [`Interval`].
#[derive(Debug, Clone)]
pub struct IntervalConfig {
    /// Floor delay used while the resource is busy.
    pub start_delay: Duration,
    /// Ceiling delay reached after repeated idle samples.
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,
    /// Consecutive idle samples required before doubling the delay.
    pub idle_threshold: u32,
    /// Cadence of the gauge sampler.
    pub gauge_interval: Duration,
    /// Budget for reading the persisted delay at construction.
    pub load_timeout: Duration,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            max_jitter: Duration::from_millis(25),
            idle_threshold: 3,
            gauge_interval: Duration::from_secs(1),
            load_timeout: Duration::from_secs(5),
        }
    }
}

impl IntervalConfig {
    /// Clamp a candidate delay into `[start_delay, max_delay]`, returning
    /// `None` when it falls outside.
    fn accept(&self, delay: Duration) -> Option<Duration> {
        (delay >= self.start_delay && delay <= self.max_delay).then_some(delay)
    }
}

#[derive(Debug)]
struct IntervalState {
    current_delay: Duration,
    consecutive_idle: u32,
}

/// Per-resource adaptive interval.
pub struct Interval {
    operation_id: String,
    resource_id: String,
    config: IntervalConfig,
    state: RwLock<IntervalState>,
    settings: Option<Arc<dyn IntervalSettingsRepository>>,
}

impl std::fmt::Debug for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interval")
            .field("operation_id", &self.operation_id)
            .field("resource_id", &self.resource_id)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl Interval {
    /// Create an interval starting at `start_delay` without persistence.
    pub fn new(
        operation_id: impl Into<String>,
        resource_id: impl Into<String>,
        config: IntervalConfig,
    ) -> Self {
        Self::with_delay(operation_id.into(), resource_id.into(), config, None, None)
    }

    /// Create an interval seeded from persisted state.
    ///
    /// Falls back to `start_delay` when the store has nothing, errors, times
    /// out, or holds a value outside `[start_delay, max_delay]`.
    pub async fn load(
        operation_id: impl Into<String>,
        resource_id: impl Into<String>,
        config: IntervalConfig,
        settings: Arc<dyn IntervalSettingsRepository>,
    ) -> Self {
        let operation_id = operation_id.into();
        let resource_id = resource_id.into();

        let read = tokio::time::timeout(
            config.load_timeout,
            settings.read_interval(&operation_id, &resource_id),
        )
        .await;

        let persisted = match read {
            Ok(Ok(Some(delay))) => config.accept(delay),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(%operation_id, %resource_id, error = %e, "failed to read interval, using start delay");
                None
            }
            Err(_) => {
                warn!(%operation_id, %resource_id, "timed out reading interval, using start delay");
                None
            }
        };

        Self::with_delay(operation_id, resource_id, config, persisted, Some(settings))
    }

    fn with_delay(
        operation_id: String,
        resource_id: String,
        config: IntervalConfig,
        delay: Option<Duration>,
        settings: Option<Arc<dyn IntervalSettingsRepository>>,
    ) -> Self {
        let current_delay = delay.unwrap_or(config.start_delay);
        Self {
            operation_id,
            resource_id,
            config,
            state: RwLock::new(IntervalState {
                current_delay,
                consecutive_idle: 0,
            }),
            settings,
        }
    }

    /// Resource this interval paces.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Current delay without jitter.
    pub fn current_delay(&self) -> Duration {
        self.state.read().current_delay
    }

    /// Idle samples seen since the last reset or doubling.
    pub fn consecutive_idle(&self) -> u32 {
        self.state.read().consecutive_idle
    }

    /// Delay until the next wake-up: current delay plus uniform jitter.
    pub fn compute_next_delay(&self) -> Duration {
        let base = self.current_delay();
        let max_jitter_ms = u64::try_from(self.config.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_jitter_ms == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=max_jitter_ms);
        base + Duration::from_millis(jitter)
    }

    /// Feed the number of units the last sampling window processed.
    ///
    /// Returns the new delay when it changed. A change schedules a
    /// best-effort write to the settings store.
    pub fn report_activity(&self, units_processed: usize) -> Option<Duration> {
        let changed = {
            let mut state = self.state.write();
            let before = state.current_delay;

            if units_processed > 0 {
                state.current_delay = self.config.start_delay;
                state.consecutive_idle = 0;
            } else {
                state.consecutive_idle += 1;
                if state.consecutive_idle >= self.config.idle_threshold {
                    state.current_delay = (state.current_delay * 2).min(self.config.max_delay);
                    state.consecutive_idle = 0;
                }
            }

            (state.current_delay != before).then_some(state.current_delay)
        };

        if let Some(delay) = changed {
            debug!(
                operation_id = %self.operation_id,
                resource_id = %self.resource_id,
                ?delay,
                "interval changed"
            );
            self.persist(delay);
        }
        changed
    }

    fn persist(&self, delay: Duration) {
        let Some(settings) = self.settings.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let operation_id = self.operation_id.clone();
        let resource_id = self.resource_id.clone();
        handle.spawn(async move {
            if let Err(e) = settings.set_interval(&operation_id, &resource_id, delay).await {
                warn!(%operation_id, %resource_id, error = %e, "failed to persist interval");
            }
        });
    }

    /// Spawn a loop that sleeps for [`Self::compute_next_delay`] and then
    /// calls `on_tick`, until `token` is cancelled.
    pub fn spawn_ticker<F>(self: &Arc<Self>, token: CancellationToken, on_tick: F) -> JoinHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let interval = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = interval.compute_next_delay();
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(delay) => on_tick(),
                }
            }
        })
    }

    /// Spawn a loop that samples `gauge` every `gauge_interval` and feeds
    /// the result into [`Self::report_activity`], until `token` is cancelled.
    pub fn spawn_gauge_sampler<G>(self: &Arc<Self>, token: CancellationToken, gauge: G) -> JoinHandle<()>
    where
        G: Fn(&str) -> usize + Send + Sync + 'static,
    {
        let interval = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.config.gauge_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let units = gauge(&interval.resource_id);
                        interval.report_activity(units);
                    }
                }
            }
        })
    }
}

/// Counter of units processed since the last sample.
#[derive(Debug, Default)]
pub struct ActivityGauge {
    units: AtomicUsize,
}

impl ActivityGauge {
    /// Create an empty gauge.
    pub const fn new() -> Self {
        Self {
            units: AtomicUsize::new(0),
        }
    }

    /// Add processed units.
    pub fn record(&self, units: usize) {
        self.units.fetch_add(units, Ordering::AcqRel);
    }

    /// Read and reset the counter.
    pub fn take(&self) -> usize {
        self.units.swap(0, Ordering::AcqRel)
    }
}
