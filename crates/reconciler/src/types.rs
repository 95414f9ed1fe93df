//! Runtime types derived during a reconciliation pass.
//!
//! Everything here is recomputed each pass and discarded at its end;
//! nothing is persisted or mutated concurrently.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use concierge_core::RoomId;
use concierge_plan::SessionGroup;
use serde_json::Value;

/// A plan room resolved against the remote system for the current pass.
#[derive(Debug, Clone)]
pub struct Room {
    /// Remote identifier.
    pub id: RoomId,
    /// Local name under which the plan declares it.
    pub local_name: String,
    /// Sibling sort key, padded for lexical ordering.
    pub sort_key: String,
}

/// Sort key for the nth sibling under a parent. Sparse so manual
/// interleaving stays possible; six digits keep the keys lexically
/// ordered up to 99 999 siblings.
pub fn sort_key(position: usize) -> String {
    format!("{:06}", (position + 1) * 10)
}

/// Recorded membership of one child in a space.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChildRecord {
    /// Sort key within the space.
    pub order: Option<String>,
    /// Promoted visibility in the space.
    pub suggested: bool,
}

impl ChildRecord {
    /// Parse from `m.space.child` event content. `None` when the content is
    /// empty, which is how child links are removed.
    pub fn from_content(content: &Value) -> Option<Self> {
        let object = content.as_object()?;
        if object.is_empty() {
            return None;
        }
        Some(Self {
            order: object
                .get("order")
                .and_then(Value::as_str)
                .map(str::to_string),
            suggested: object
                .get("suggested")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Render as `m.space.child` event content.
    pub fn render(&self, server_name: &str) -> Value {
        let mut content = serde_json::Map::new();
        content.insert("via".into(), serde_json::json!([server_name]));
        if let Some(order) = &self.order {
            content.insert("order".into(), Value::String(order.clone()));
        }
        if self.suggested {
            content.insert("suggested".into(), Value::Bool(true));
        }
        Value::Object(content)
    }
}

/// A space paired with its child-membership snapshot, fetched once per pass
/// and mutated in place as children are reconciled.
#[derive(Debug)]
pub struct ListedSpace {
    /// The space room.
    pub room: Room,
    /// Invite-only space; its children stay out of the public-parent index.
    pub private: bool,
    /// Current child memberships by child room id.
    pub children: HashMap<RoomId, ChildRecord>,
}

/// A scheduled talk, fully recomputed from the external feed every pass.
#[derive(Debug, Clone)]
pub struct Session {
    /// Stable talk id from the feed.
    pub id: String,
    /// Talk title.
    pub title: String,
    /// Talk detail URL.
    pub url: String,
    /// Physical or virtual venue name, if any.
    pub venue: Option<String>,
    /// Scheduled start.
    pub begin: DateTime<Utc>,
    /// Scheduled end.
    pub end: DateTime<Utc>,
    /// `begin` minus the configured lead time.
    pub open: DateTime<Utc>,
    /// Zero-based conference day, from the earliest session's date.
    pub day: i64,
}

impl Session {
    /// Which group the session belongs to at `now`. The three groups are
    /// mutually exclusive and collectively exhaustive.
    pub fn group_at(&self, now: DateTime<Utc>) -> SessionGroup {
        let opened = now >= self.open;
        let ended = now >= self.end;
        if ended {
            SessionGroup::Past
        } else if opened {
            SessionGroup::Current
        } else {
            SessionGroup::Future
        }
    }

    /// The instant at which the session next changes group, if any.
    pub fn next_transition(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.group_at(now) {
            SessionGroup::Future => Some(self.open),
            SessionGroup::Current => Some(self.end),
            SessionGroup::Past => None,
        }
    }
}
