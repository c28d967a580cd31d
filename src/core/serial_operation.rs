//! Single-flight execution with trailing-edge coalescing.
//!
//! A [`SerialOperation`] runs one [`OperationMethod`] for one resource id.
//! At most one execution is in flight per resource; triggers that arrive
//! while a run is in progress collapse into a single extra iteration.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::interval::Interval;
use crate::core::SchedulerError;

/// Unit of work executed for one resource.
///
/// Returns `Ok(true)` when more work is known to be pending and the loop
/// should run again immediately.
#[async_trait]
pub trait OperationMethod: Send + Sync + 'static {
    /// Run one iteration for `resource_id`.
    async fn run(&self, resource_id: &str) -> Result<bool, SchedulerError>;

    /// Release state kept for `resource_id` once it left its pool.
    fn forget(&self, _resource_id: &str) {}
}

/// Adapter turning an async closure into an [`OperationMethod`].
#[derive(Clone)]
pub struct FnOperation<F> {
    f: F,
}

impl<F> FnOperation<F> {
    /// Wrap a closure `Fn(String) -> impl Future<Output = Result<bool, _>>`.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> OperationMethod for FnOperation<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, SchedulerError>> + Send + 'static,
{
    async fn run(&self, resource_id: &str) -> Result<bool, SchedulerError> {
        (self.f)(resource_id.to_string()).await
    }
}

#[derive(Debug, Default)]
struct OperationState {
    is_running: bool,
    continue_pending: bool,
    last_run_at: Option<Instant>,
}

/// Serialized operation bound to a single resource id.
pub struct SerialOperation {
    id: String,
    description: String,
    timeout: Duration,
    method: Arc<dyn OperationMethod>,
    state: RwLock<OperationState>,
    runs: AtomicU64,
    token: CancellationToken,
    interval: Option<Arc<Interval>>,
}

impl std::fmt::Debug for SerialOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialOperation")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl SerialOperation {
    /// Create an operation. `token` roots every execution; cancelling it
    /// aborts in-flight work and ignores further triggers.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        timeout: Duration,
        method: Arc<dyn OperationMethod>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            timeout,
            method,
            state: RwLock::new(OperationState::default()),
            runs: AtomicU64::new(0),
            token,
            interval: None,
        }
    }

    /// Attach an interval that self-triggers the operation.
    #[must_use]
    pub fn with_interval(mut self, interval: Arc<Interval>) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Resource id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attached interval, if any.
    pub fn interval(&self) -> Option<&Arc<Interval>> {
        self.interval.as_ref()
    }

    /// Whether an execution loop is active.
    pub fn is_running(&self) -> bool {
        self.state.read().is_running
    }

    /// Start of the most recent iteration.
    pub fn last_run_at(&self) -> Option<Instant> {
        self.state.read().last_run_at
    }

    /// Number of iterations executed so far.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    /// Whether [`Self::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn the interval ticker and gauge sampler, if an interval is attached.
    pub fn start<G>(self: &Arc<Self>, gauge: G)
    where
        G: Fn(&str) -> usize + Send + Sync + 'static,
    {
        let Some(interval) = self.interval.clone() else {
            return;
        };
        let op = Arc::downgrade(self);
        interval.spawn_ticker(self.token.clone(), move || {
            if let Some(op) = op.upgrade() {
                op.trigger_or_continue();
            }
        });
        interval.spawn_gauge_sampler(self.token.clone(), gauge);
    }

    /// Cancel in-flight work and stop self-triggering.
    pub fn stop(&self) {
        debug!(id = %self.id, description = %self.description, "stopping operation");
        self.token.cancel();
    }

    /// Request a run. Starts a loop when idle; otherwise marks a
    /// continuation that the active loop will pick up.
    pub fn trigger_or_continue(self: &Arc<Self>) {
        if self.token.is_cancelled() {
            return;
        }

        {
            let mut state = self.state.write();
            state.continue_pending = true;
            if state.is_running {
                return;
            }
            state.is_running = true;
        }

        let op = Arc::clone(self);
        tokio::spawn(async move { op.run_loop().await });
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            {
                let mut state = self.state.write();
                state.continue_pending = false;
                state.last_run_at = Some(Instant::now());
            }

            let result = self.run_once().await;
            self.runs.fetch_add(1, Ordering::AcqRel);

            let should_continue = match result {
                Ok(more) => more,
                Err(SchedulerError::Cancelled) => {
                    debug!(id = %self.id, description = %self.description, "operation cancelled");
                    self.state.write().is_running = false;
                    return;
                }
                Err(e) => {
                    error!(
                        id = %self.id,
                        description = %self.description,
                        error = %e,
                        "operation failed"
                    );
                    self.state.write().is_running = false;
                    return;
                }
            };

            let finished = {
                let mut state = self.state.write();
                let again = should_continue || state.continue_pending;
                if self.token.is_cancelled() || !again {
                    state.is_running = false;
                    true
                } else {
                    false
                }
            };
            if finished {
                return;
            }
        }
    }

    async fn run_once(&self) -> Result<bool, SchedulerError> {
        let child = self.token.child_token();
        tokio::select! {
            biased;
            () = child.cancelled() => Err(SchedulerError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.method.run(&self.id)) => {
                res.unwrap_or(Err(SchedulerError::Timeout(self.timeout)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn wait_idle(op: &SerialOperation) {
        for _ in 0..200 {
            if !op.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation never went idle");
    }

    #[tokio::test]
    async fn continue_signal_keeps_looping() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let method = FnOperation::new(move |_id| {
            let counter = Arc::clone(&counter);
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) < 2) }
        });
        let op = Arc::new(SerialOperation::new(
            "t1",
            "test",
            Duration::from_secs(1),
            Arc::new(method),
            CancellationToken::new(),
        ));

        op.trigger_or_continue();
        tokio::time::sleep(Duration::from_millis(10)).await;
        wait_idle(&op).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(op.run_count(), 3);
    }

    #[tokio::test]
    async fn timeout_ends_loop() {
        let method = FnOperation::new(|_id| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(true)
        });
        let op = Arc::new(SerialOperation::new(
            "t1",
            "slow",
            Duration::from_millis(20),
            Arc::new(method),
            CancellationToken::new(),
        ));

        op.trigger_or_continue();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(op.is_running());
        wait_idle(&op).await;
        assert_eq!(op.run_count(), 1);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn stop_mid_run_is_not_logged_as_failure() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let method = FnOperation::new(|_id| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(false)
        });
        let op = Arc::new(SerialOperation::new(
            "t1",
            "test",
            Duration::from_secs(30),
            Arc::new(method),
            CancellationToken::new(),
        ));

        op.trigger_or_continue();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(op.is_running());
        op.stop();
        wait_idle(&op).await;

        let text = logs.text();
        assert!(text.contains("operation cancelled"));
        assert!(!text.contains("ERROR"));
        assert!(!text.contains("operation failed"));
    }

    #[tokio::test]
    async fn stopped_operation_ignores_triggers() {
        let method = FnOperation::new(|_id| async { Ok(false) });
        let op = Arc::new(SerialOperation::new(
            "t1",
            "test",
            Duration::from_secs(1),
            Arc::new(method),
            CancellationToken::new(),
        ));
        op.stop();
        op.trigger_or_continue();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(op.run_count(), 0);
        assert!(op.is_stopped());
    }
}
