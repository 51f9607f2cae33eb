//! EventBus — fire-and-forget progress publishing per conversation.
//!
//! Each conversation gets its own broadcast channel, namespaced
//! `sse:<namespace>:<conversation_id>`. Publishing never blocks on delivery
//! and never fails the pipeline: no subscribers is not an error, and durable
//! history writes happen on a separate task. Ordering is guaranteed only
//! between envelopes emitted by the same publisher on the same channel.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::EventsConfig;

use super::envelope::{EventEnvelope, EventType};
use super::history::{EventHistory, HistoryWriter};

pub struct EventBus {
    namespace: String,
    channel_capacity: usize,
    channels: DashMap<String, broadcast::Sender<EventEnvelope>>,
    history_tx: Option<mpsc::UnboundedSender<EventEnvelope>>,
}

impl EventBus {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            channel_capacity: config.channel_capacity,
            channels: DashMap::new(),
            history_tx: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&EventsConfig::default())
    }

    /// Attach a durable history store; writes are drained by a background
    /// task so the publishing path stays non-blocking.
    pub fn with_history(mut self, history: Arc<dyn EventHistory>) -> (Self, HistoryWriter) {
        let (tx, writer) = HistoryWriter::spawn(history);
        self.history_tx = Some(tx);
        (self, writer)
    }

    /// Channel name for a conversation, e.g. `sse:axon:conv-42`.
    pub fn channel_key(&self, conversation_id: &str) -> String {
        format!("sse:{}:{}", self.namespace, conversation_id)
    }

    /// Publish an event, stamping the current time.
    ///
    /// Known types are checked for their required payload fields (a gap is
    /// logged, never rejected); unknown types pass through untouched so newer
    /// producers keep working against older consumers.
    pub fn publish(
        &self,
        conversation_id: &str,
        event_type: EventType,
        payload: Map<String, Value>,
    ) -> EventEnvelope {
        self.emit(EventEnvelope::now(conversation_id, event_type, payload))
    }

    /// Publish with a caller-supplied timestamp.
    pub fn publish_at(
        &self,
        conversation_id: &str,
        event_type: EventType,
        timestamp: f64,
        payload: Map<String, Value>,
    ) -> EventEnvelope {
        self.emit(EventEnvelope::at(
            conversation_id,
            event_type,
            timestamp,
            payload,
        ))
    }

    fn emit(&self, envelope: EventEnvelope) -> EventEnvelope {
        if envelope.event_type.is_known() {
            let missing = envelope.missing_fields();
            if !missing.is_empty() {
                warn!(
                    conversation = %envelope.conversation_id,
                    event_type = %envelope.event_type,
                    ?missing,
                    "event published with missing required fields"
                );
            }
        } else {
            debug!(
                conversation = %envelope.conversation_id,
                event_type = %envelope.event_type,
                "publishing unknown event type as-is"
            );
        }

        let key = self.channel_key(&envelope.conversation_id);
        let sender = self
            .channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone();

        // Fire-and-forget: a send error only means nobody is listening live.
        let _ = sender.send(envelope.clone());

        if let Some(history_tx) = &self.history_tx {
            if history_tx.send(envelope.clone()).is_err() {
                warn!("history writer is gone, event not persisted");
            }
        }

        envelope
    }

    /// Subscribe to a conversation's live channel.
    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<EventEnvelope> {
        let key = self.channel_key(conversation_id);
        self.channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }

    /// Number of live subscribers on a conversation's channel.
    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        let key = self.channel_key(conversation_id);
        self.channels
            .get(&key)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::history::MemoryEventHistory;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_in_order() {
        let bus = EventBus::with_defaults();
        let mut rx = bus.subscribe("conv-1");

        bus.publish(
            "conv-1",
            EventType::Content,
            payload(&[("text", json!("a"))]),
        );
        bus.publish(
            "conv-1",
            EventType::Content,
            payload(&[("text", json!("b"))]),
        );

        assert_eq!(rx.recv().await.unwrap().payload["text"], "a");
        assert_eq!(rx.recv().await.unwrap().payload["text"], "b");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::with_defaults();
        let env = bus.publish("conv-lonely", EventType::Done, Map::new());
        assert_eq!(env.conversation_id, "conv-lonely");
    }

    #[tokio::test]
    async fn test_timestamp_injected_at_publish() {
        let bus = EventBus::with_defaults();
        let before = crate::events::envelope::unix_now();
        let env = bus.publish("conv-1", EventType::Done, Map::new());
        let after = crate::events::envelope::unix_now();

        assert!(env.timestamp >= before && env.timestamp <= after);
    }

    #[tokio::test]
    async fn test_channels_are_isolated_per_conversation() {
        let bus = EventBus::with_defaults();
        let mut rx_a = bus.subscribe("conv-a");
        let _rx_b = bus.subscribe("conv-b");

        bus.publish("conv-b", EventType::Done, Map::new());
        bus.publish(
            "conv-a",
            EventType::Content,
            payload(&[("text", json!("only a"))]),
        );

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.conversation_id, "conv-a");
    }

    #[tokio::test]
    async fn test_history_receives_published_events() {
        let history = Arc::new(MemoryEventHistory::new());
        let (bus, writer) = EventBus::with_defaults().with_history(history.clone());

        bus.publish(
            "conv-1",
            EventType::Cost,
            payload(&[("credits", json!(3))]),
        );
        drop(bus);
        writer.join().await;

        assert_eq!(history.count("conv-1").await.unwrap(), 1);
    }

    #[test]
    fn test_channel_key_namespacing() {
        let bus = EventBus::with_defaults();
        assert_eq!(bus.channel_key("c-1"), "sse:axon:c-1");
    }
}
