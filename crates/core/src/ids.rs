//! Identifier newtypes for the room directory.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque remote identifier of a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Create a room id from its wire form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The wire form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id from its wire form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The wire form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Human-readable room alias, e.g. `#welcome:example.org`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomAlias(String);

impl RoomAlias {
    /// Create an alias from its wire form.
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    /// Build a `#localpart:server` alias.
    pub fn from_parts(localpart: &str, server: &str) -> Self {
        Self(format!("#{localpart}:{server}"))
    }

    /// The wire form of this alias.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part between `#` and `:`, if this alias is well-formed.
    pub fn localpart(&self) -> Option<&str> {
        self.0.strip_prefix('#')?.split(':').next()
    }
}

impl fmt::Display for RoomAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Addresses one piece of room state: an event type plus its state key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateRef {
    /// Event type, e.g. `m.room.topic`.
    pub event_type: String,
    /// State key; the empty string for singleton state.
    pub state_key: String,
}

impl StateRef {
    /// State addressed by type alone (empty state key).
    pub fn of(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: String::new(),
        }
    }

    /// State addressed by type and key.
    pub fn keyed(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_localpart() {
        let alias = RoomAlias::from_parts("welcome", "example.org");
        assert_eq!(alias.as_str(), "#welcome:example.org");
        assert_eq!(alias.localpart(), Some("welcome"));
    }

    #[test]
    fn malformed_alias_has_no_localpart() {
        assert_eq!(RoomAlias::new("welcome").localpart(), None);
    }

    #[test]
    fn state_ref_of_uses_empty_key() {
        let state = StateRef::of("m.room.topic");
        assert_eq!(state.state_key, "");
    }
}
