use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::KafkaConfig;

/// Envelope published to the `offline-events` topic for a recipient with no
/// live connection (spec §4.12). Keyed by recipient user id so a downstream
/// push-notification consumer can fan out per user.
#[derive(Serialize)]
struct OfflineEnvelope {
    event_id: Uuid,
    user_id: Uuid,
    #[serde(rename = "type")]
    event_type: String,
    payload: Value,
    priority: Option<u8>,
    ttl: Option<u64>,
}

/// Best-effort publisher to the offline-events bus. A publish failure is
/// logged, never propagated — it must not fail the enclosing ingest call
/// (spec §4.12).
pub struct OfflineDispatcher {
    producer: FutureProducer,
    topic: String,
}

impl OfflineDispatcher {
    pub fn new(config: &KafkaConfig) -> Result<Self, rdkafka::error::KafkaError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self {
            producer,
            topic: config.offline_topic.clone(),
        })
    }

    pub async fn dispatch(&self, event_id: Uuid, user_id: Uuid, event_type: &str, payload: Value, priority: Option<u8>, ttl: Option<u64>) {
        let envelope = OfflineEnvelope {
            event_id,
            user_id,
            event_type: event_type.to_string(),
            payload,
            priority,
            ttl,
        };
        let Ok(body) = serde_json::to_string(&envelope) else {
            tracing::error!(%event_id, %user_id, "failed to serialize offline-events envelope");
            return;
        };
        let key = user_id.to_string();
        let record = FutureRecord::to(&self.topic).key(&key).payload(&body);

        if let Err((err, _)) = self.producer.send(record, std::time::Duration::from_secs(0)).await {
            tracing::warn!(%event_id, %user_id, error = %err, "offline-events publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_type_field() {
        let envelope = OfflineEnvelope {
            event_id: Uuid::nil(),
            user_id: Uuid::nil(),
            event_type: "notification.new".to_string(),
            payload: serde_json::json!({"a": 1}),
            priority: Some(1),
            ttl: Some(60),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"notification.new\""));
    }
}
