use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    Map(HashMap<String, serde_json::Value>),
}

/// Scrape lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpyEvent {
    /// Event key (e.g., "image.created", "tag.latest_promoted")
    pub key: EventKey,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SpyEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    /// Create an event from key/value pairs
    pub fn with_fields<I, K>(key: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let map = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self::new(key, EventPayload::Map(map))
    }

    /// Look up a field of a map payload
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        match &self.payload {
            EventPayload::Map(map) => map.get(name),
            _ => None,
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<SpyEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SpyEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SpyEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events accepted by `filter`
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&SpyEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            filter: Arc::new(filter),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiver that yields only the events its filter accepts.
///
/// Lagged receivers skip the overwritten events and keep going.
pub struct EventStream {
    receiver: broadcast::Receiver<SpyEvent>,
    filter: Arc<dyn Fn(&SpyEvent) -> bool + Send + Sync>,
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<SpyEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain every matching event that is already buffered.
    pub fn drain(&mut self) -> Vec<SpyEvent> {
        let mut drained = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if (self.filter)(&event) => drained.push(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return drained,
            }
        }
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Image events
    pub const IMAGE_CREATED: &str = "image.created";

    // Tag events
    pub const TAG_CREATED: &str = "tag.created";
    pub const TAG_LATEST_PROMOTED: &str = "tag.latest_promoted";
    pub const TAG_LATEST_CLEARED: &str = "tag.latest_cleared";
    pub const TAG_UNTAGGED: &str = "tag.untagged";

    // Layer events
    pub const LAYER_SOURCES_UPDATED: &str = "layer.sources_updated";

    // Updater events
    pub const UPDATER_RUN_COMPLETED: &str = "updater.run_completed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let emitter = EventEmitter::new(4);
        emitter.emit(SpyEvent::empty(events::IMAGE_CREATED));
    }

    #[tokio::test]
    async fn test_subscribe_receives_event() {
        let emitter = EventEmitter::new(4);
        let mut rx = emitter.subscribe();
        emitter.emit(SpyEvent::with_fields(
            events::TAG_CREATED,
            [("tag", serde_json::json!("1.2.3"))],
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, events::TAG_CREATED);
        assert_eq!(event.field("tag"), Some(&serde_json::json!("1.2.3")));
    }

    #[tokio::test]
    async fn test_filtered_stream_skips_other_keys() {
        let emitter = EventEmitter::new(8);
        let mut stream = emitter.subscribe_filtered(|e| e.key == events::TAG_LATEST_PROMOTED);

        emitter.emit(SpyEvent::empty(events::IMAGE_CREATED));
        emitter.emit(SpyEvent::with_fields(
            events::TAG_LATEST_PROMOTED,
            [("tag", serde_json::json!("2"))],
        ));

        let event = stream.recv().await.unwrap();
        assert_eq!(event.key, events::TAG_LATEST_PROMOTED);
        assert_eq!(event.field("tag"), Some(&serde_json::json!("2")));
    }

    #[test]
    fn test_drain_returns_buffered_matches() {
        let emitter = EventEmitter::new(8);
        let mut stream = emitter.subscribe_filtered(|e| e.key.starts_with("tag."));
        assert!(stream.drain().is_empty());

        emitter.emit(SpyEvent::empty(events::TAG_UNTAGGED));
        emitter.emit(SpyEvent::empty(events::IMAGE_CREATED));
        emitter.emit(SpyEvent::empty(events::TAG_CREATED));

        let keys: Vec<_> = stream.drain().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![events::TAG_UNTAGGED, events::TAG_CREATED]);
    }

    #[test]
    fn test_field_on_empty_payload() {
        let event = SpyEvent::empty(events::TAG_UNTAGGED);
        assert!(event.field("tag").is_none());
    }
}
