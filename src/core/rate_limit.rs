//! Rate-limit resolution for queued step runs.
//!
//! Static limits are declared on a step. Dynamic limits are computed per step
//! run from evaluated KEY / VALUE / WINDOW / UNITS expressions; when several
//! step runs resolve to the same key with different parameters the longer
//! window and the lower limit win.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::events::{DiagnosticEvent, EventReason, EventSeverity, EventSink};
use crate::core::queue::QueueItem;
use crate::core::SchedulerError;
use crate::util::cache::TtlCache;

/// Window applied when a dynamic limit has no WINDOW expression.
pub const DEFAULT_WINDOW: &str = "1m";

/// Map of `step_run_id -> rate-limit key -> units to consume`.
pub type StepRunRateLimits = HashMap<String, HashMap<String, i32>>;

/// How a step declares a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitKind {
    /// Fixed key and units.
    Static,
    /// Key, value, window, and units come from expressions.
    Dynamic,
}

/// Rate limit declared on a step definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRateLimit {
    /// Step the limit belongs to.
    pub step_id: String,
    /// Static: the rate-limit key. Dynamic: the expression group name.
    pub key: String,
    /// Units consumed per step run (static limits only).
    pub units: i32,
    /// Declaration kind.
    pub kind: RateLimitKind,
}

/// Which dynamic rate-limit parameter an expression computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpressionKind {
    /// Resolved rate-limit key (string).
    Key,
    /// Limit value (integer).
    Value,
    /// Window duration (string).
    Window,
    /// Units consumed (integer).
    Units,
}

/// Stored result of evaluating one dynamic rate-limit expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionEval {
    /// Step run the expression was evaluated for.
    pub step_run_id: String,
    /// Expression group, one per dynamic limit on the step.
    pub key: String,
    /// Parameter computed.
    pub kind: ExpressionKind,
    /// String output.
    pub value_str: Option<String>,
    /// Integer output.
    pub value_int: Option<i64>,
}

/// Effective parameters of one rate-limit key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDefinition {
    /// Rate-limit key.
    pub key: String,
    /// Units allowed per window.
    pub limit_value: i64,
    /// Window, as written by the expression.
    pub window: String,
}

/// Persistent state of a rate-limit key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Owning tenant.
    pub tenant_id: String,
    /// Rate-limit key.
    pub key: String,
    /// Units allowed per window.
    pub limit_value: i64,
    /// Window.
    pub window: String,
    /// Units remaining in the current window.
    pub value: i64,
}

/// Storage contract for rate limits.
#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// Rate limits declared on any of `step_ids`.
    async fn list_step_rate_limits(
        &self,
        tenant_id: &str,
        step_ids: &[String],
    ) -> Result<Vec<StepRateLimit>, SchedulerError>;

    /// Evaluated dynamic expressions for `step_run_ids`.
    async fn list_expression_evals(
        &self,
        step_run_ids: &[String],
    ) -> Result<Vec<ExpressionEval>, SchedulerError>;

    /// Create or update the persistent state of each key.
    async fn upsert_rate_limits(
        &self,
        tenant_id: &str,
        limits: &[RateLimitDefinition],
    ) -> Result<(), SchedulerError>;
}

/// Parse a rate-limit window such as `1m`, `30 seconds`, or `HOUR`.
pub fn parse_window(window: &str) -> Result<Duration, SchedulerError> {
    let trimmed = window.trim();
    let invalid = || SchedulerError::Evaluation(format!("invalid rate limit window `{window}`"));

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let count: u64 = if digits.is_empty() {
        1
    } else {
        digits.parse().map_err(|_| invalid())?
    };
    if count == 0 {
        return Err(invalid());
    }

    let seconds_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        "month" | "months" => 2_592_000,
        "y" | "year" | "years" => 31_536_000,
        _ => return Err(invalid()),
    };

    count
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

#[derive(Debug, Default)]
struct PartialLimit {
    key: Option<String>,
    value: Option<i64>,
    window: Option<String>,
    units: Option<i64>,
}

/// Outcome of reconciling dynamic expression evaluations.
#[derive(Debug, Default)]
pub struct ResolvedDynamicLimits {
    /// One definition per resolved key.
    pub definitions: Vec<RateLimitDefinition>,
    /// Units per step run and key.
    pub units: StepRunRateLimits,
    /// Warnings produced while resolving.
    pub events: Vec<DiagnosticEvent>,
}

struct KeyState {
    window: String,
    window_len: Duration,
    limit_value: i64,
}

/// Group evaluations into per-step-run limits and reconcile conflicting
/// parameters across step runs sharing a key.
pub fn reconcile_dynamic_limits(tenant_id: &str, evals: &[ExpressionEval]) -> ResolvedDynamicLimits {
    let mut partials: BTreeMap<(&str, &str), PartialLimit> = BTreeMap::new();
    for eval in evals {
        let partial = partials
            .entry((eval.step_run_id.as_str(), eval.key.as_str()))
            .or_default();
        match eval.kind {
            ExpressionKind::Key => partial.key.clone_from(&eval.value_str),
            ExpressionKind::Value => partial.value = eval.value_int,
            ExpressionKind::Window => partial.window.clone_from(&eval.value_str),
            ExpressionKind::Units => partial.units = eval.value_int,
        }
    }

    let mut out = ResolvedDynamicLimits::default();
    let mut by_key: BTreeMap<String, KeyState> = BTreeMap::new();

    let invalid = |step_run_id: &str, message: String| {
        DiagnosticEvent::new(
            tenant_id,
            step_run_id,
            EventReason::RateLimitInvalid,
            EventSeverity::Warning,
            message,
        )
    };

    for ((step_run_id, group), partial) in partials {
        let (Some(key), Some(limit_value)) = (partial.key, partial.value) else {
            out.events.push(invalid(
                step_run_id,
                format!("dynamic rate limit `{group}` is missing its key or value"),
            ));
            continue;
        };

        let window = partial.window.unwrap_or_else(|| DEFAULT_WINDOW.to_string());
        let window_len = match parse_window(&window) {
            Ok(len) => len,
            Err(e) => {
                out.events.push(invalid(step_run_id, format!("rate limit `{key}`: {e}")));
                continue;
            }
        };

        let Ok(units) = i32::try_from(partial.units.unwrap_or(1)) else {
            out.events.push(invalid(
                step_run_id,
                format!("rate limit `{key}`: units out of range"),
            ));
            continue;
        };

        match by_key.get_mut(&key) {
            None => {
                by_key.insert(
                    key.clone(),
                    KeyState {
                        window,
                        window_len,
                        limit_value,
                    },
                );
            }
            Some(state) => {
                if window_len != state.window_len {
                    if window_len > state.window_len {
                        state.window = window.clone();
                        state.window_len = window_len;
                    }
                    out.events.push(DiagnosticEvent::new(
                        tenant_id,
                        step_run_id,
                        EventReason::RateLimitConflict,
                        EventSeverity::Warning,
                        format!(
                            "rate limit `{key}` computed with window `{window}`, using `{}`",
                            state.window
                        ),
                    ));
                }
                if limit_value != state.limit_value {
                    state.limit_value = state.limit_value.min(limit_value);
                    out.events.push(DiagnosticEvent::new(
                        tenant_id,
                        step_run_id,
                        EventReason::RateLimitConflict,
                        EventSeverity::Warning,
                        format!(
                            "rate limit `{key}` computed with limit {limit_value}, using {}",
                            state.limit_value
                        ),
                    ));
                }
            }
        }

        // units are consumption, not a shared ceiling: no cross-run reconciliation
        out.units
            .entry(step_run_id.to_string())
            .or_default()
            .insert(key, units);
    }

    out.definitions = by_key
        .into_iter()
        .map(|(key, state)| RateLimitDefinition {
            key,
            limit_value: state.limit_value,
            window: state.window,
        })
        .collect();
    out
}

/// Resolves rate limits for batches of queue items of one queue.
pub struct RateLimitResolver {
    tenant_id: String,
    repository: Arc<dyn RateLimitRepository>,
    events: Arc<dyn EventSink>,
    no_limit_steps: TtlCache<String, ()>,
}

impl RateLimitResolver {
    /// Create a resolver. Steps found to have no rate limit are remembered
    /// for `cache_ttl`.
    pub fn new(
        tenant_id: impl Into<String>,
        repository: Arc<dyn RateLimitRepository>,
        events: Arc<dyn EventSink>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            repository,
            events,
            no_limit_steps: TtlCache::new(cache_ttl),
        }
    }

    /// Whether `step_id` is cached as having no rate limit.
    pub fn is_known_unlimited(&self, step_id: &str) -> bool {
        self.no_limit_steps.contains(&step_id.to_string())
    }

    /// Compute `step_run_id -> key -> units` for `items`.
    pub async fn resolve(&self, items: &[QueueItem]) -> Result<StepRunRateLimits, SchedulerError> {
        let mut step_ids: Vec<String> = items
            .iter()
            .map(|i| i.step_id.clone())
            .filter(|id| !self.no_limit_steps.contains(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if step_ids.is_empty() {
            return Ok(StepRunRateLimits::new());
        }
        step_ids.sort();

        let declared = self
            .repository
            .list_step_rate_limits(&self.tenant_id, &step_ids)
            .await?;

        let limited: HashSet<&str> = declared.iter().map(|l| l.step_id.as_str()).collect();
        for step_id in &step_ids {
            if !limited.contains(step_id.as_str()) {
                self.no_limit_steps.insert(step_id.clone(), ());
            }
        }
        if declared.is_empty() {
            return Ok(StepRunRateLimits::new());
        }

        let mut static_limits: HashMap<&str, Vec<&StepRateLimit>> = HashMap::new();
        let mut dynamic_steps: HashSet<&str> = HashSet::new();
        for limit in &declared {
            match limit.kind {
                RateLimitKind::Static => static_limits.entry(limit.step_id.as_str()).or_default().push(limit),
                RateLimitKind::Dynamic => {
                    dynamic_steps.insert(limit.step_id.as_str());
                }
            }
        }

        let mut result = StepRunRateLimits::new();

        let dynamic_runs: Vec<String> = items
            .iter()
            .filter(|i| dynamic_steps.contains(i.step_id.as_str()))
            .map(|i| i.step_run_id.clone())
            .collect();
        if !dynamic_runs.is_empty() {
            let evals = self.repository.list_expression_evals(&dynamic_runs).await?;
            let resolved = reconcile_dynamic_limits(&self.tenant_id, &evals);

            if !resolved.definitions.is_empty() {
                self.repository
                    .upsert_rate_limits(&self.tenant_id, &resolved.definitions)
                    .await?;
            }
            if !resolved.events.is_empty() {
                self.events.emit(resolved.events);
            }
            result = resolved.units;
        }

        for item in items {
            let Some(limits) = static_limits.get(item.step_id.as_str()) else {
                continue;
            };
            let entry = result.entry(item.step_run_id.clone()).or_default();
            for limit in limits {
                entry.insert(limit.key.clone(), limit.units);
            }
        }

        debug!(tenant_id = %self.tenant_id, step_runs = result.len(), "resolved rate limits");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(run: &str, group: &str, kind: ExpressionKind, v: &str) -> ExpressionEval {
        ExpressionEval {
            step_run_id: run.into(),
            key: group.into(),
            kind,
            value_str: Some(v.into()),
            value_int: None,
        }
    }

    fn eval_int(run: &str, group: &str, kind: ExpressionKind, v: i64) -> ExpressionEval {
        ExpressionEval {
            step_run_id: run.into(),
            key: group.into(),
            kind,
            value_str: None,
            value_int: Some(v),
        }
    }

    fn limit(run: &str, key: &str, value: i64, window: &str, units: i64) -> Vec<ExpressionEval> {
        vec![
            eval_str(run, "rl", ExpressionKind::Key, key),
            eval_int(run, "rl", ExpressionKind::Value, value),
            eval_str(run, "rl", ExpressionKind::Window, window),
            eval_int(run, "rl", ExpressionKind::Units, units),
        ]
    }

    #[test]
    fn parses_windows() {
        assert_eq!(parse_window("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_window("1h").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse_window("30 seconds").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_window("MINUTE").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_window("2 days").unwrap(), Duration::from_secs(172_800));
        assert!(parse_window("").is_err());
        assert!(parse_window("0m").is_err());
        assert!(parse_window("5 fortnights").is_err());
    }

    #[test]
    fn longer_window_wins() {
        let mut evals = limit("sr1", "user-1", 10, "1m", 1);
        evals.extend(limit("sr2", "user-1", 10, "1h", 2));

        let resolved = reconcile_dynamic_limits("t1", &evals);
        assert_eq!(resolved.definitions.len(), 1);
        assert_eq!(resolved.definitions[0].window, "1h");
        assert_eq!(resolved.events.len(), 1);
        assert_eq!(resolved.events[0].reason, EventReason::RateLimitConflict);
        assert_eq!(resolved.events[0].severity, EventSeverity::Warning);
    }

    #[test]
    fn lower_limit_wins() {
        let mut evals = limit("sr1", "user-1", 10, "1m", 1);
        evals.extend(limit("sr2", "user-1", 5, "1m", 1));
        evals.extend(limit("sr3", "user-1", 7, "1m", 1));

        let resolved = reconcile_dynamic_limits("t1", &evals);
        assert_eq!(resolved.definitions[0].limit_value, 5);
        assert_eq!(resolved.events.len(), 2);
    }

    #[test]
    fn units_are_kept_per_step_run() {
        let mut evals = limit("sr1", "user-1", 10, "1m", 3);
        evals.extend(limit("sr2", "user-1", 10, "1m", 4));

        let resolved = reconcile_dynamic_limits("t1", &evals);
        assert_eq!(resolved.units["sr1"]["user-1"], 3);
        assert_eq!(resolved.units["sr2"]["user-1"], 4);
        assert!(resolved.events.is_empty());
    }

    #[test]
    fn missing_key_is_reported() {
        let evals = vec![eval_int("sr1", "rl", ExpressionKind::Value, 10)];
        let resolved = reconcile_dynamic_limits("t1", &evals);
        assert!(resolved.definitions.is_empty());
        assert!(resolved.units.is_empty());
        assert_eq!(resolved.events[0].reason, EventReason::RateLimitInvalid);
    }

    #[test]
    fn defaults_window_and_units() {
        let evals = vec![
            eval_str("sr1", "rl", ExpressionKind::Key, "k"),
            eval_int("sr1", "rl", ExpressionKind::Value, 3),
        ];
        let resolved = reconcile_dynamic_limits("t1", &evals);
        assert_eq!(resolved.definitions[0].window, DEFAULT_WINDOW);
        assert_eq!(resolved.units["sr1"]["k"], 1);
    }
}
