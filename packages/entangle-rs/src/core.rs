//! Core value types shared by the bus and the machine registry.
//!
//! # Overview
//!
//! - [`Event`] = a fact that was emitted on the bus (immutable once built)
//! - [`Payload`] = the open key/value mapping carried by events and
//!   transitions
//! - [`EventId`] / [`SubscriptionId`] = generated identities
//!
//! Event types are plain strings. The [`topics`] module lists the vocabulary
//! collaborators conventionally use, but any string is a legal event type.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Open key/value mapping carried by events and transition payloads.
pub type Payload = Map<String, Value>;

/// Recommended event vocabulary.
///
/// This is a convention between collaborators, not something the bus
/// validates.
pub mod topics {
    pub const AUTH_LOGIN: &str = "auth:login";
    pub const AUTH_LOGOUT: &str = "auth:logout";
    pub const WALLET_CREATED: &str = "wallet:created";
    pub const WALLET_TRANSACTION: &str = "wallet:transaction";
    pub const TOKEN_GENERATED: &str = "token:generated";
    pub const TOKEN_REVOKED: &str = "token:revoked";
    /// Emitted by [`Hub::drive`](crate::Hub::drive) after a successful transition.
    pub const MACHINE_TRANSITION: &str = "machine:transition";
}

/// Identity of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a subscription, returned by [`EventBus::subscribe`](crate::EventBus::subscribe).
///
/// Uniqueness comes from generation (UUID v4); the bus never reuses an ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fact that was emitted on the bus.
///
/// Events are immutable once constructed. The bus shares a single
/// `Arc<Event>` between the history ring and every handler of the emission,
/// so no handler can change what a later sibling observes.
///
/// # Example
///
/// ```ignore
/// let event = Event::new("auth:login", payload! { "user" => "ada" });
/// assert_eq!(event.event_type, "auth:login");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Generated identity.
    pub id: EventId,
    /// Event type name (e.g. `auth:login`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Collaborator-defined data.
    pub data: Payload,
    /// When the event was built.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build a new event, assigning a fresh ID and the current timestamp.
    pub fn new(event_type: impl Into<String>, data: Payload) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Look up a single data field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Build a [`Payload`] from `key => value` pairs.
///
/// Values go through `serde_json::json!`, so anything serializable works.
///
/// ```ignore
/// let data = payload! { "user" => "ada", "amount" => 42 };
/// ```
#[macro_export]
macro_rules! payload {
    () => {
        $crate::Payload::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Payload::new();
        $(
            map.insert(::std::string::String::from($key), $crate::__serde_json::json!($value));
        )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_new_assigns_identity() {
        let a = Event::new("auth:login", Payload::new());
        let b = Event::new("auth:login", Payload::new());

        assert_ne!(a.id, b.id);
        assert_eq!(a.event_type, "auth:login");
        assert!(a.timestamp <= b.timestamp);
    }

    #[test]
    fn test_payload_macro_needs_no_serde_json_in_scope() {
        mod downstream {
            pub fn build() -> crate::Payload {
                crate::payload! { "user" => "ada", "tags" => ["new", "vip"] }
            }
        }

        let data = downstream::build();
        assert_eq!(data.get("tags"), Some(&json!(["new", "vip"])));
    }

    #[test]
    fn test_payload_macro() {
        let data = payload! { "user" => "ada", "amount" => 42 };
        assert_eq!(data.get("user"), Some(&json!("ada")));
        assert_eq!(data.get("amount"), Some(&json!(42)));

        let empty = payload! {};
        assert!(empty.is_empty());
    }

    #[test]
    fn test_event_serializes_with_type_field() {
        let event = Event::new("wallet:created", payload! { "wallet" => "w-1" });
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], json!("wallet:created"));
        assert_eq!(value["data"]["wallet"], json!("w-1"));
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_event_get() {
        let event = Event::new("token:generated", payload! { "token" => "abc" });
        assert_eq!(event.get("token"), Some(&json!("abc")));
        assert_eq!(event.get("missing"), None);
    }

    #[test]
    fn test_subscription_id_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        let id = SubscriptionId::from(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(id.as_uuid(), &uuid);
    }
}
