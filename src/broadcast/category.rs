use serde::{Deserialize, Serialize};

/// Coarse grouping derived from an event type's dotted prefix (spec §3,
/// glossary: "Event category"). Pure function of the type string — ingestion
/// rejects any type whose prefix isn't one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventCategory {
    Presence,
    Messaging,
    Typing,
    Call,
    Notification,
    User,
    System,
}

/// Maps an event type like `message.new` to its category via the prefix
/// before the first dot. Returns `None` for unrecognized prefixes, which
/// the ingestion endpoint treats as a validation failure.
pub fn category_for(event_type: &str) -> Option<EventCategory> {
    let prefix = event_type.split('.').next().unwrap_or(event_type);
    match prefix {
        "presence" => Some(EventCategory::Presence),
        "message" => Some(EventCategory::Messaging),
        "typing" => Some(EventCategory::Typing),
        "call" => Some(EventCategory::Call),
        "notification" => Some(EventCategory::Notification),
        "user" => Some(EventCategory::User),
        "system" => Some(EventCategory::System),
        _ => None,
    }
}
