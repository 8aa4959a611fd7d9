//! Message bus collaborators
//!
//! Outbound: a `Publisher` receives every transformed `ProtocolResult` and
//! every write-result notification. Inbound: a `SubscriptionRegistry` maps
//! topics to handlers and is fed by `RedisSubscriber` (or directly by tests).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use edgelink_model::{WriteKind, WriteTask};
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CollectError, Result};

// ============================================================================
// Payload and topics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Text(serde_json::to_string(value)?))
    }
}

/// Topic names used on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTopics {
    /// Prefix for data topics; the protocol id is appended
    pub data: String,
    pub write_command: String,
    pub write_result: String,
    pub config_changed: String,
    /// Runtime log filter, e.g. `debug` or `info,collectsrv=trace`
    pub log_level: String,
}

impl Default for BusTopics {
    fn default() -> Self {
        Self {
            data: "edgelink:data".to_string(),
            write_command: "edgelink:write".to_string(),
            write_result: "edgelink:write:result".to_string(),
            config_changed: "edgelink:config:changed".to_string(),
            log_level: "edgelink:log:level".to_string(),
        }
    }
}

impl BusTopics {
    pub fn data_topic(&self, protocol_id: &str) -> String {
        format!("{}:{}", self.data, protocol_id)
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Outbound sink. Implementations serialize concurrent calls themselves and
/// retry internally; `false` means the payload was dropped.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Payload, cancel: &CancellationToken) -> bool;
}

/// Publishes into the log; the default when no bus is configured
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, payload: Payload, _cancel: &CancellationToken) -> bool {
        match &payload {
            Payload::Text(text) => info!("[{}] {}", topic, text),
            Payload::Bytes(bytes) => info!("[{}] {} bytes", topic, bytes.len()),
        }
        true
    }
}

/// Redis PUBLISH over a lazily established multiplexed connection
pub struct RedisPublisher {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisPublisher")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RedisPublisher {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: tokio::sync::Mutex::new(None),
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    async fn try_publish(
        &self,
        slot: &mut Option<MultiplexedConnection>,
        topic: &str,
        payload: &Payload,
    ) -> Result<()> {
        if slot.is_none() {
            *slot = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(CollectError::bus("Redis connection unavailable"));
        };
        let _receivers: i64 = conn.publish(topic, payload.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, topic: &str, payload: Payload, cancel: &CancellationToken) -> bool {
        // One publish at a time; the lock also guards connection setup
        let mut slot = self.conn.lock().await;
        for attempt in 1..=self.max_attempts {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return false,
                r = self.try_publish(&mut slot, topic, &payload) => r,
            };
            match outcome {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Publish to {} failed (attempt {}/{}): {}", topic, attempt, self.max_attempts, e);
                    *slot = None;
                    if attempt < self.max_attempts {
                        tokio::select! {
                            _ = cancel.cancelled() => return false,
                            _ = tokio::time::sleep(self.retry_delay) => {},
                        }
                    }
                },
            }
        }
        error!("Dropped message for {}", topic);
        false
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

pub type Handler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Topic → handler table; one handler per topic
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: DashMap<String, Handler>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the topic
    pub fn register(&self, topic: impl Into<String>, handler: Handler) {
        let topic = topic.into();
        debug!("Handler registered for {}", topic);
        self.handlers.insert(topic, handler);
    }

    pub fn unregister(&self, topic: &str) -> bool {
        self.handlers.remove(topic).is_some()
    }

    /// Deliver a payload; `false` when nobody listens on the topic
    pub fn dispatch(&self, topic: &str, payload: Payload) -> bool {
        // Clone out so the handler never runs under the map shard lock
        let handler = self.handlers.get(topic).map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => {
                handler(payload);
                true
            },
            None => {
                debug!("No handler for {}", topic);
                false
            },
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }
}

/// Feeds a `SubscriptionRegistry` from Redis pub/sub
pub struct RedisSubscriber {
    client: redis::Client,
    registry: Arc<SubscriptionRegistry>,
}

impl RedisSubscriber {
    pub fn new(url: &str, registry: Arc<SubscriptionRegistry>) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            registry,
        })
    }

    /// Subscribe to every registered topic and dispatch until cancelled.
    /// Reconnects after a lost connection.
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            if let Err(e) = self.listen(&cancel).await {
                warn!("Subscriber connection lost: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {},
            }
        }
        debug!("Subscriber stopped");
    }

    async fn listen(&self, cancel: &CancellationToken) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for topic in self.registry.topics() {
            pubsub.subscribe(&topic).await?;
        }
        info!("Subscribed to {:?}", self.registry.topics());

        let mut messages = std::pin::pin!(pubsub.on_message());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = messages.next() => match msg {
                    Some(msg) => {
                        let topic = msg.get_channel_name().to_string();
                        let payload = match std::str::from_utf8(msg.get_payload_bytes()) {
                            Ok(text) => Payload::Text(text.to_string()),
                            Err(_) => Payload::Bytes(msg.get_payload_bytes().to_vec()),
                        };
                        self.registry.dispatch(&topic, payload);
                    },
                    None => return Err(CollectError::bus("Pub/sub stream ended")),
                },
            }
        }
    }
}

// ============================================================================
// Inbound write commands
// ============================================================================

#[derive(Debug, Deserialize)]
struct WriteCommand {
    #[serde(default)]
    id: Option<String>,
    protocol_id: String,
    equipment_id: String,
    label: String,
    value: serde_json::Value,
    #[serde(default)]
    kind: WriteKind,
}

/// Parse an inbound write command; numbers and bools are accepted as values
pub fn parse_write_command(payload: &Payload) -> Result<WriteTask> {
    let command: WriteCommand = serde_json::from_slice(payload.as_bytes())?;
    let value = match command.value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Bool(b) => (if b { "1" } else { "0" }).to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(CollectError::validation(format!(
                "Unsupported write value {}",
                other
            )))
        },
    };
    let mut task = WriteTask::new(
        command.protocol_id,
        command.equipment_id,
        command.label,
        value,
    )
    .with_kind(command.kind);
    if let Some(id) = command.id.filter(|id| !id.is_empty()) {
        task.id = id;
    }
    Ok(task)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_write_command() {
        let payload = Payload::Text(
            r#"{"id":"w-1","protocol_id":"p1","equipment_id":"e1","label":"sp","value":12.5,"kind":"Start"}"#
                .to_string(),
        );
        let task = parse_write_command(&payload).unwrap();
        assert_eq!(task.id, "w-1");
        assert_eq!(task.value, "12.5");
        assert_eq!(task.kind, WriteKind::Start);

        let payload = Payload::Text(
            r#"{"protocol_id":"p1","equipment_id":"e1","label":"run","value":true}"#.to_string(),
        );
        let task = parse_write_command(&payload).unwrap();
        assert_eq!(task.value, "1");
        assert_eq!(task.kind, WriteKind::Other);
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_parse_write_command_rejects_garbage() {
        assert!(parse_write_command(&Payload::Text("not json".into())).is_err());
        let nested = Payload::Text(
            r#"{"protocol_id":"p1","equipment_id":"e1","label":"x","value":[1]}"#.to_string(),
        );
        assert!(matches!(
            parse_write_command(&nested).unwrap_err(),
            CollectError::Validation(_)
        ));
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry.register(
            "t1",
            Arc::new(move |_: Payload| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(registry.dispatch("t1", Payload::Text("a".into())));
        assert!(!registry.dispatch("t2", Payload::Text("b".into())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.unregister("t1"));
        assert!(!registry.dispatch("t1", Payload::Text("c".into())));
        assert_eq!(registry.topics(), Vec::<String>::new());
    }

    #[test]
    fn test_data_topic() {
        assert_eq!(BusTopics::default().data_topic("p1"), "edgelink:data:p1");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_publisher() {
        let publisher = LogPublisher;
        let cancel = CancellationToken::new();
        assert!(publisher.publish("t", Payload::Bytes(vec![1, 2]), &cancel).await);
        assert!(publisher.publish("t", Payload::Text("{\"v\":1}".into()), &cancel).await);
        assert!(logs_contain("[t] 2 bytes"));
        assert!(logs_contain("[t] {\"v\":1}"));
    }

    #[tokio::test]
    async fn test_redis_publisher_gives_up() {
        // Nothing listens on port 1
        let publisher = RedisPublisher::new("redis://127.0.0.1:1/")
            .unwrap()
            .with_retry(2, Duration::from_millis(10));
        assert!(
            !publisher
                .publish("t", Payload::Text("x".into()), &CancellationToken::new())
                .await
        );
    }
}
