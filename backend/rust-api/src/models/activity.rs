use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Client-reported activity (focus changes, navigation, heartbeat...).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ActivityEvent {
    #[validate(length(min = 1, max = 64))]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Stored form of an activity event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: String,
    pub attempt_id: String,
    pub actor_id: Option<String>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub occurred_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn from_event(attempt_id: &str, actor_id: Option<&str>, event: ActivityEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            actor_id: actor_id.map(str::to_string),
            kind: event.kind,
            payload: event.payload,
            occurred_at: event.occurred_at,
            recorded_at: Utc::now(),
        }
    }
}
