//! In-process notification channel backed by tokio broadcast channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::core::listener::NotificationChannel;
use crate::core::SchedulerError;

/// Notification channel for tests and single-process deployments.
pub struct InMemoryNotifier {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    sent: AtomicUsize,
}

impl InMemoryNotifier {
    /// Create a notifier whose channels buffer `capacity` payloads.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
            sent: AtomicUsize::new(0),
        }
    }

    /// Payloads sent so far, across channels.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl NotificationChannel for InMemoryNotifier {
    async fn notify(&self, channel: &str, payload: &str) -> Result<(), SchedulerError> {
        self.sent.fetch_add(1, Ordering::AcqRel);
        // no listener yet is not an error
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<broadcast::Receiver<String>, SchedulerError> {
        Ok(self.sender(channel).subscribe())
    }
}
