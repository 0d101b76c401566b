use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::category::EventCategory;

/// Delivery priority hint (spec §3: "optional priority 0|1|2").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// A typed event flowing from an external service through the Broadcaster
/// to recipient connections (spec §3, §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub category: EventCategory,
    pub timestamp: DateTime<Utc>,
    pub recipients: Vec<Uuid>,
    pub sender: Option<Uuid>,
    pub payload: Value,
    pub priority: Option<Priority>,
    pub ttl_secs: Option<u64>,
}

impl RealtimeEvent {
    /// Serialize once so the same frame can be enqueued to every recipient
    /// connection without re-encoding per device.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::category::category_for;

    #[test]
    fn to_frame_produces_stable_json_with_type_field() {
        let event = RealtimeEvent {
            id: Uuid::nil(),
            event_type: "message.new".to_string(),
            category: category_for("message.new").unwrap(),
            timestamp: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            recipients: vec![Uuid::nil()],
            sender: None,
            payload: serde_json::json!({"text": "hi"}),
            priority: None,
            ttl_secs: None,
        };

        let frame = event.to_frame();
        assert!(frame.contains("\"type\":\"message.new\""));
        assert!(frame.contains("\"payload\""));
    }
}
