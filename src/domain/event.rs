//! Ledger events and related types
//!
//! An `Event` is the immutable record of one user action. Clients submit a
//! `NewEvent`; the ledger fills in the identity fields and assigns the
//! sequence position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    validate_text, EventType, ProjectKey, UserId, ValidationError, MAX_IDEMPOTENCY_KEY_LEN,
};

/// Event properties (free-form JSON object)
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// An event as submitted, before the ledger has accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    /// Caller-chosen id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    pub project_key: ProjectKey,

    pub user_id: UserId,

    pub event_type: EventType,

    #[serde(default)]
    pub properties: Properties,

    /// Client-side timestamp (metadata only; never used for ordering)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ts: Option<DateTime<Utc>>,

    /// Client retry key, unique per project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    pub fn new(
        project_key: impl Into<ProjectKey>,
        user_id: impl Into<UserId>,
        event_type: impl Into<EventType>,
    ) -> Self {
        Self {
            id: None,
            project_key: project_key.into(),
            user_id: user_id.into(),
            event_type: event_type.into(),
            properties: Properties::new(),
            client_ts: None,
            idempotency_key: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_client_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.client_ts = Some(ts);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Validate required fields and their length limits.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.project_key.validate()?;
        self.user_id.validate()?;
        self.event_type.validate()?;
        if let Some(key) = &self.idempotency_key {
            validate_text("idempotencyKey", key, MAX_IDEMPOTENCY_KEY_LEN)?;
        }
        Ok(())
    }

    /// Validate and stamp the event with its id and receive time.
    ///
    /// The returned event has `sequence == 0`; the ledger sets the real
    /// position when it persists the row.
    pub fn into_event(self, received_at: DateTime<Utc>) -> Result<Event, ValidationError> {
        self.validate()?;
        Ok(Event {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            sequence: 0,
            project_key: self.project_key,
            user_id: self.user_id,
            event_type: self.event_type,
            properties: self.properties,
            received_at,
            client_ts: self.client_ts,
            idempotency_key: self.idempotency_key,
        })
    }
}

/// An event stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique id; also the idempotency key for reward application
    pub id: Uuid,

    /// Ledger position, strictly increasing within a project in commit order
    pub sequence: u64,

    pub project_key: ProjectKey,

    pub user_id: UserId,

    pub event_type: EventType,

    pub properties: Properties,

    /// Time the ledger accepted the event
    pub received_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ts: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Event {
    /// Read a property as a whole number.
    ///
    /// Accepts JSON integers and integral floats (`10.0`); anything else,
    /// including a missing property, is `None`.
    pub fn integer_property(&self, name: &str) -> Option<i64> {
        let value = self.properties.get(name)?;
        if let Some(n) = value.as_i64() {
            return Some(n);
        }
        let f = value.as_f64()?;
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            Some(f as i64)
        } else {
            None
        }
    }
}

/// Result of appending an event.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendReceipt {
    /// The stored event (the earlier copy when `duplicate` is set)
    pub event: Event,

    /// True when the id or idempotency key was already in the ledger
    pub duplicate: bool,
}

/// One page of a ledger scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<Event>,

    /// Pass back as the cursor to continue; `None` when the scan is done
    pub next_cursor: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_event_assigns_id() {
        let now = Utc::now();
        let event = NewEvent::new("p1", "u1", "purchase")
            .with_property("amount", json!(10))
            .into_event(now)
            .unwrap();

        assert_eq!(event.received_at, now);
        assert_eq!(event.sequence, 0);
        assert_eq!(event.integer_property("amount"), Some(10));
    }

    #[test]
    fn test_into_event_keeps_caller_id() {
        let id = Uuid::new_v4();
        let event = NewEvent::new("p1", "u1", "purchase")
            .with_id(id)
            .into_event(Utc::now())
            .unwrap();
        assert_eq!(event.id, id);
    }

    #[test]
    fn test_empty_fields_rejected() {
        let err = NewEvent::new("", "u1", "purchase").validate().unwrap_err();
        assert_eq!(err.field, "projectKey");

        let err = NewEvent::new("p1", "", "purchase").validate().unwrap_err();
        assert_eq!(err.field, "userId");

        let err = NewEvent::new("p1", "u1", " ").validate().unwrap_err();
        assert_eq!(err.field, "eventType");
    }

    #[test]
    fn test_idempotency_key_limit() {
        let err = NewEvent::new("p1", "u1", "purchase")
            .with_idempotency_key("k".repeat(129))
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "idempotencyKey");
    }

    #[test]
    fn test_integer_property() {
        let event = NewEvent::new("p1", "u1", "purchase")
            .with_property("a", json!(5))
            .with_property("b", json!(5.0))
            .with_property("c", json!(5.5))
            .with_property("d", json!("5"))
            .into_event(Utc::now())
            .unwrap();

        assert_eq!(event.integer_property("a"), Some(5));
        assert_eq!(event.integer_property("b"), Some(5));
        assert_eq!(event.integer_property("c"), None);
        assert_eq!(event.integer_property("d"), None);
        assert_eq!(event.integer_property("missing"), None);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = NewEvent::new("p1", "u1", "daily_login")
            .into_event(Utc::now())
            .unwrap();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["projectKey"], "p1");
        assert_eq!(value["eventType"], "daily_login");
        assert!(value.get("clientTs").is_none());
    }
}
