//! Topic fan-out over a single notification channel.
//!
//! Every message travels on one storage-level channel as
//! `{"topic": ..., "payload": ...}`. [`MultiplexedListener`] opens that
//! channel on the first subscription and delivers each message to every
//! live [`Subscription`] of its topic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::SchedulerError;

/// Wire-level notification channel (e.g. `LISTEN`/`NOTIFY`).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Send `payload` once on `channel`.
    async fn notify(&self, channel: &str, payload: &str) -> Result<(), SchedulerError>;

    /// Open a receiver for every payload sent on `channel` from now on.
    async fn listen(&self, channel: &str) -> Result<broadcast::Receiver<String>, SchedulerError>;
}

/// Message as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    /// Logical topic.
    pub topic: String,
    /// Message body.
    pub payload: serde_json::Value,
}

type Subscriber = (u64, mpsc::UnboundedSender<TopicMessage>);

#[derive(Default)]
struct Registry {
    topic_ids: HashMap<String, u32>,
    subscribers: HashMap<u32, Vec<Subscriber>>,
    next_subscriber_id: u64,
    connected: bool,
}

impl Registry {
    fn topic_id(&mut self, topic: &str) -> u32 {
        if let Some(id) = self.topic_ids.get(topic) {
            return *id;
        }
        let id = u32::try_from(self.topic_ids.len()).unwrap_or(u32::MAX);
        self.topic_ids.insert(topic.to_string(), id);
        id
    }

    fn dispatch(&mut self, message: &TopicMessage) -> usize {
        let Some(topic_id) = self.topic_ids.get(&message.topic).copied() else {
            return 0;
        };
        let Some(subs) = self.subscribers.get_mut(&topic_id) else {
            return 0;
        };
        subs.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        subs.len()
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.subscribers.clear();
    }
}

/// Multiplexes many topics over one notification channel.
pub struct MultiplexedListener {
    channel: String,
    conn: Arc<dyn NotificationChannel>,
    registry: Arc<Mutex<Registry>>,
    connecting: tokio::sync::Mutex<()>,
    token: CancellationToken,
}

impl MultiplexedListener {
    /// Create a listener over `channel`. Nothing is opened until the first
    /// subscription.
    pub fn new(channel: impl Into<String>, conn: Arc<dyn NotificationChannel>) -> Self {
        Self {
            channel: channel.into(),
            conn,
            registry: Arc::new(Mutex::new(Registry::default())),
            connecting: tokio::sync::Mutex::new(()),
            token: CancellationToken::new(),
        }
    }

    /// Root the listener under an existing cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Whether the underlying channel is open.
    pub fn is_connected(&self) -> bool {
        self.registry.lock().connected
    }

    /// Small integer id of `topic`, assigned on first use.
    pub fn topic_id(&self, topic: &str) -> u32 {
        self.registry.lock().topic_id(topic)
    }

    /// Publish `payload` under `topic`.
    pub async fn publish<T: Serialize + Sync>(&self, topic: &str, payload: &T) -> Result<(), SchedulerError> {
        let message = TopicMessage {
            topic: topic.to_string(),
            payload: serde_json::to_value(payload)?,
        };
        let raw = serde_json::to_string(&message)?;
        self.topic_id(topic);
        self.conn.notify(&self.channel, &raw).await
    }

    /// Subscribe to `topic`. The subscription receives every message
    /// published under it until dropped.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, SchedulerError> {
        if self.token.is_cancelled() {
            return Err(SchedulerError::ListenerClosed);
        }
        self.ensure_connected().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock();
        let topic_id = registry.topic_id(topic);
        let id = registry.next_subscriber_id;
        registry.next_subscriber_id += 1;
        registry.subscribers.entry(topic_id).or_default().push((id, tx));
        debug!(channel = %self.channel, %topic, topic_id, subscriber = id, "subscribed");

        Ok(Subscription {
            topic: topic.to_string(),
            topic_id,
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        })
    }

    async fn ensure_connected(&self) -> Result<(), SchedulerError> {
        let _guard = self.connecting.lock().await;
        if self.registry.lock().connected {
            return Ok(());
        }

        let rx = self.conn.listen(&self.channel).await?;
        self.registry.lock().connected = true;
        debug!(channel = %self.channel, "notification channel opened");

        let registry = Arc::clone(&self.registry);
        let token = self.token.clone();
        let channel = self.channel.clone();
        tokio::spawn(dispatch_loop(channel, rx, registry, token));
        Ok(())
    }

    /// Close the channel and end every subscription.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

async fn dispatch_loop(
    channel: String,
    mut rx: broadcast::Receiver<String>,
    registry: Arc<Mutex<Registry>>,
    token: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            () = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Ok(raw) => raw,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%channel, skipped, "listener lagged, notifications dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match serde_json::from_str::<TopicMessage>(&raw) {
            Ok(message) => {
                let delivered = registry.lock().dispatch(&message);
                debug!(%channel, topic = %message.topic, delivered, "dispatched");
            }
            Err(e) => warn!(%channel, error = %e, "dropping malformed notification"),
        }
    }
    registry.lock().disconnect();
    debug!(%channel, "notification channel closed");
}

/// Receiving end of a topic subscription. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    topic_id: u32,
    id: u64,
    rx: mpsc::UnboundedReceiver<TopicMessage>,
    registry: std::sync::Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the listener is closed.
    pub async fn recv(&mut self) -> Option<TopicMessage> {
        self.rx.recv().await
    }

    /// Next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<TopicMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        if let Some(subs) = registry.subscribers.get_mut(&self.topic_id) {
            subs.retain(|(id, _)| *id != self.id);
        }
    }
}
