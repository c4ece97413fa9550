use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Self {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        Self {
            time: now,
            kind: kind.to_string(),
            payload: val,
        }
    }
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

    /// Publish and return the envelope that was sent, so callers can journal it.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) -> Envelope {
        let env = Envelope::new(kind, payload);
        if self.tx.send(env.clone()).is_err() {
            tracing::trace!(kind, "no bus subscribers");
        }
        env
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribers_receive_published_envelopes() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        let sent = bus.publish("tasks.claimed", &json!({"task_id": "t-1"}));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("bus timeout")
            .expect("bus closed");
        assert_eq!(got.kind, "tasks.claimed");
        assert_eq!(got.payload["task_id"], "t-1");
        assert_eq!(got.time, sent.time);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = Bus::new(4);
        let env = bus.publish("service.start", &json!({}));
        assert_eq!(env.kind, "service.start");
        assert_eq!(bus.receiver_count(), 0);
    }
}
