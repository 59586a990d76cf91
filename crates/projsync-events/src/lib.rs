use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub mod feed;

pub use feed::{
    publish_change, BusFeed, ChangeFeed, EntityPayload, EventStream, FeedError, FeedItem,
};

/// Minimal event envelope (RFC3339 time), optionally scoped to a parent id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub payload: Value,
}

/// A simple broadcast bus for JSON-serializable events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        self.send(kind, None, payload);
    }

    pub fn publish_scoped<T: Serialize>(&self, kind: &str, parent_id: &str, payload: &T) {
        self.send(kind, Some(parent_id.to_string()), payload);
    }

    fn send<T: Serialize>(&self, kind: &str, parent_id: Option<String>, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let _ = self.tx.send(Envelope {
            time: now,
            kind: kind.to_string(),
            parent_id,
            payload: val,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scoped_publish_carries_parent_id() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish_scoped("comments.added", "p1", &json!({"entity": {"id": "c1"}}));
        bus.publish("sync.notice", &json!({"code": "x"}));

        let first = rx.recv().await.expect("first envelope");
        assert_eq!(first.kind, "comments.added");
        assert_eq!(first.parent_id.as_deref(), Some("p1"));
        assert_eq!(first.payload["entity"]["id"], "c1");

        let second = rx.recv().await.expect("second envelope");
        assert_eq!(second.parent_id, None);
    }

    #[test]
    fn publish_without_receivers_is_silent() {
        let bus = Bus::new(0);
        assert_eq!(bus.receiver_count(), 0);
        bus.publish("sync.notice", &json!({"ok": true}));
    }
}
