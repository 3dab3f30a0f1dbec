//! Pub/sub plumbing between producers, the orchestrator and persisters.
//!
//! Messages travel on redis channels named `livetraffic.<topic>.<tenant>`.
//! Publishing goes through a [`PublishQueue`]: callers only enqueue, one
//! [`Publisher`] task owns the connection and does the I/O.

use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::error::Result;

/// Topic raw request digests are published under.
pub const REPORT_TOPIC: &str = "report";

/// Bound of the in-process hand-off between the redis pump and consumers.
const SUBSCRIBER_BUFFER: usize = 4096;

/// One pub/sub message: `topic`, `tenant` and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub tenant: String,
    pub payload: String,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        tenant: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            tenant: tenant.into(),
            payload: payload.into(),
        }
    }

    pub fn channel(&self) -> String {
        crate::key(&[self.topic.as_str(), self.tenant.as_str()])
    }

    /// Splits a channel name back into a message for `topic`.
    ///
    /// Returns `None` when the channel does not belong to `topic`.
    pub fn from_channel(topic: &str, channel: &str, payload: String) -> Option<Self> {
        let prefix = crate::key(&[topic, ""]);
        let tenant = channel.strip_prefix(&prefix)?;
        Some(Self::new(topic, tenant, payload))
    }
}

// ─── Publishing ──────────────────────────────────────────────────

/// Non-blocking handle producers push messages into.
#[derive(Debug, Clone)]
pub struct PublishQueue {
    tx: mpsc::UnboundedSender<Message>,
}

impl PublishQueue {
    /// A queue and the receiving end its single consumer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueues `payload` for `tenant` under `topic`. Never blocks.
    pub fn publish(&self, tenant: &str, payload: String, topic: &str) {
        if self.tx.send(Message::new(topic, tenant, payload)).is_err() {
            debug!("publish queue closed, dropping message for {topic}");
        }
    }
}

/// The single task draining a [`PublishQueue`] into redis.
pub struct Publisher;

impl Publisher {
    /// Spawns the drain task. It ends once every queue handle is dropped.
    pub fn spawn(
        mut conn: ConnectionManager,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let channel = message.channel();
                let sent: redis::RedisResult<i64> = conn.publish(&channel, &message.payload).await;
                if let Err(e) = sent {
                    warn!("publish on {channel} failed: {e}");
                }
            }
            debug!("publisher drained, exiting");
        })
    }
}

// ─── Subscribing ─────────────────────────────────────────────────

/// Blocking source of messages for one topic.
pub struct Subscriber {
    rx: mpsc::Receiver<Message>,
}

impl Subscriber {
    /// An in-process subscriber fed through the returned sender.
    pub fn channel() -> (mpsc::Sender<Message>, Self) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        (tx, Self { rx })
    }

    /// Pattern-subscribes to every tenant of `topic` on redis.
    pub async fn redis(client: &redis::Client, topic: &str) -> Result<Self> {
        let mut pubsub = client.get_async_pubsub().await?;
        let pattern = crate::key(&[topic, "*"]);
        pubsub.psubscribe(&pattern).await?;
        info!("subscribed to {pattern}");

        let (tx, subscriber) = Self::channel();
        let topic = topic.to_owned();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("undecodable payload on {}: {e}", msg.get_channel_name());
                        continue;
                    }
                };
                let channel = msg.get_channel_name();
                let Some(message) = Message::from_channel(&topic, channel, payload) else {
                    continue;
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!("subscription to {topic} ended");
        });
        Ok(subscriber)
    }

    /// Next message, or `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}
