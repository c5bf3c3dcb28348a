//! Thin edge over the publish/subscribe substrate: the versioned dispatch
//! envelope, (de)serialization, attribute propagation, and delayed
//! republish. Nothing in here knows about the store or the providers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::config::BusConfig;
use crate::error::{AppError, AppResult};

pub const DISPATCH_SCHEMA: &str = "notify/dispatch/v1";
pub const ATTR_TRACE_ID: &str = "trace_id";
pub const ATTR_IDEMPOTENCY_KEY: &str = "idempotency_key";

/// Wire payload naming a notification to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub schema: String,
    pub id: i64,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchEnvelope {
    pub fn new(id: i64, attempt: u32) -> Self {
        Self {
            schema: DISPATCH_SCHEMA.to_string(),
            id,
            attempt,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

/// What a handler tells the edge to do with the consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ack,
    Nack,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: BusMessage) -> AppResult<()>;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Next message on the subscription, or `None` once it is closed.
    async fn pull(&self) -> Option<BusMessage>;
}

/// Single-topic in-process bus backed by an unbounded channel. Stands in
/// for the external substrate in local runs and tests; production deploys
/// plug their own `Publisher`/`Subscriber` pair into [`EventBus::new`].
pub struct InProcessBus {
    topic: String,
    tx: mpsc::UnboundedSender<BusMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<BusMessage>>,
}

impl InProcessBus {
    pub fn new(topic: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            topic: topic.to_string(),
            tx,
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Publisher for InProcessBus {
    async fn publish(&self, topic: &str, message: BusMessage) -> AppResult<()> {
        if topic != self.topic {
            return Err(AppError::BusUnavailable(format!("Unknown topic: {}", topic)));
        }
        self.tx
            .send(message)
            .map_err(|_| AppError::BusUnavailable("Subscription closed".to_string()))
    }
}

#[async_trait]
impl Subscriber for InProcessBus {
    async fn pull(&self) -> Option<BusMessage> {
        self.rx.lock().await.recv().await
    }
}

/// Dispatch-event edge used by ingress, dispatcher and sweeper.
pub struct EventBus {
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
    topic: String,
}

impl EventBus {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
        topic: String,
    ) -> Self {
        Self {
            publisher,
            subscriber,
            topic,
        }
    }

    pub fn in_process(config: &BusConfig) -> Self {
        let bus = Arc::new(InProcessBus::new(&config.topic));
        Self::new(bus.clone(), bus, config.topic.clone())
    }

    pub async fn publish_dispatch(
        &self,
        id: i64,
        attempt: u32,
        attributes: HashMap<String, String>,
    ) -> AppResult<()> {
        let envelope = DispatchEnvelope::new(id, attempt);
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| AppError::BusUnavailable(format!("Failed to encode envelope: {}", e)))?;
        self.publisher
            .publish(&self.topic, BusMessage { payload, attributes })
            .await
    }

    /// Schedule a republish after `delay`. The delay lives in this process;
    /// if it is lost to a crash the sweeper re-enqueues the orphaned row.
    pub fn publish_dispatch_delayed(
        self: &Arc<Self>,
        id: i64,
        attempt: u32,
        delay: Duration,
        attributes: HashMap<String, String>,
    ) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = bus.publish_dispatch(id, attempt, attributes).await {
                tracing::warn!(
                    "Delayed republish for notification {} failed (sweeper will recover): {}",
                    id,
                    e
                );
            }
        });
    }

    /// Pull the next decodable dispatch event. Messages with an unknown
    /// schema are acked away with a warning.
    pub async fn next_dispatch(
        &self,
    ) -> Option<(DispatchEnvelope, HashMap<String, String>, BusMessage)> {
        loop {
            let message = self.subscriber.pull().await?;
            match serde_json::from_slice::<DispatchEnvelope>(&message.payload) {
                Ok(envelope) if envelope.schema == DISPATCH_SCHEMA => {
                    let attributes = message.attributes.clone();
                    return Some((envelope, attributes, message));
                }
                Ok(envelope) => {
                    tracing::warn!("Dropping dispatch event with unknown schema {}", envelope.schema);
                }
                Err(e) => {
                    tracing::warn!("Dropping undecodable dispatch event: {}", e);
                }
            }
        }
    }

    /// Nack path: hand the original message back to the topic for another
    /// delivery attempt.
    pub async fn redeliver(&self, message: BusMessage) -> AppResult<()> {
        self.publisher.publish(&self.topic, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::in_process(&Config::default().bus))
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = DispatchEnvelope::new(42, 3);
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: DispatchEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.schema, DISPATCH_SCHEMA);
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.attempt, 3);
    }

    #[tokio::test]
    async fn publish_then_pull() {
        let bus = bus();
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_TRACE_ID.to_string(), "t-1".to_string());
        bus.publish_dispatch(7, 0, attributes).await.unwrap();

        let (envelope, attrs, _) = bus.next_dispatch().await.unwrap();
        assert_eq!(envelope.id, 7);
        assert_eq!(envelope.attempt, 0);
        assert_eq!(attrs.get(ATTR_TRACE_ID).map(String::as_str), Some("t-1"));
    }

    #[tokio::test]
    async fn unknown_schema_is_skipped() {
        let bus = bus();
        let raw = BusMessage {
            payload: serde_json::to_vec(&serde_json::json!({
                "schema": "notify/dispatch/v9", "id": 1, "attempt": 0,
                "enqueued_at": Utc::now(),
            }))
            .unwrap(),
            attributes: HashMap::new(),
        };
        bus.redeliver(raw).await.unwrap();
        bus.publish_dispatch(2, 0, HashMap::new()).await.unwrap();

        let (envelope, _, _) = bus.next_dispatch().await.unwrap();
        assert_eq!(envelope.id, 2);
    }

    #[tokio::test]
    async fn delayed_publish_arrives() {
        let bus = bus();
        bus.publish_dispatch_delayed(9, 1, Duration::from_millis(10), HashMap::new());

        let (envelope, _, _) = bus.next_dispatch().await.unwrap();
        assert_eq!(envelope.id, 9);
        assert_eq!(envelope.attempt, 1);
    }
}
