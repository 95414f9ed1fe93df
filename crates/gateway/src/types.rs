//! Wire types and event-type constants for the room directory protocol.

use std::collections::HashMap;

use concierge_core::{RoomId, UserId};
use serde::Deserialize;
use serde_json::Value;

/// Singleton room state event types.
pub mod event_type {
    pub const NAME: &str = "m.room.name";
    pub const TOPIC: &str = "m.room.topic";
    pub const AVATAR: &str = "m.room.avatar";
    pub const POWER_LEVELS: &str = "m.room.power_levels";
    pub const JOIN_RULES: &str = "m.room.join_rules";
    pub const CANONICAL_ALIAS: &str = "m.room.canonical_alias";
    pub const HISTORY_VISIBILITY: &str = "m.room.history_visibility";
    pub const GUEST_ACCESS: &str = "m.room.guest_access";
    pub const PINNED_EVENTS: &str = "m.room.pinned_events";

    /// Keyed by the member's user id.
    pub const MEMBER: &str = "m.room.member";
    /// Keyed by the child room's id.
    pub const SPACE_CHILD: &str = "m.space.child";
    /// Keyed by the widget's name.
    pub const WIDGETS: &str = "im.vector.modular.widgets";
    /// Stable identity of a managed room, independent of its alias.
    pub const ROOM_TAG: &str = "org.concierge.room_tag";

    pub const MESSAGE: &str = "m.room.message";
}

/// Membership values carried by `m.room.member` events.
pub mod membership {
    pub const JOIN: &str = "join";
    pub const INVITE: &str = "invite";
    pub const LEAVE: &str = "leave";
    pub const BAN: &str = "ban";
}

/// Response to an alias resolution.
#[derive(Debug, Deserialize)]
pub struct ResolvedAlias {
    pub room_id: RoomId,
}

/// Response to a room creation.
#[derive(Debug, Deserialize)]
pub struct CreatedRoom {
    pub room_id: RoomId,
}

/// Response to a state send or message send.
#[derive(Debug, Deserialize)]
pub struct SentEvent {
    pub event_id: String,
}

/// One event as returned by history pagination or sync timelines.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: UserId,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub origin_server_ts: u64,
}

/// One page of room message history.
#[derive(Debug, Deserialize)]
pub struct MessagesPage {
    #[serde(default)]
    pub chunk: Vec<RoomEvent>,
    /// Continuation cursor. Absent when the history is exhausted.
    #[serde(default)]
    pub end: Option<String>,
}

/// Own-profile content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub displayname: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// The incremental diff returned by the long-poll sync call.
#[derive(Debug, Default, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<RoomId, JoinedRoomSync>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinedRoomSync {
    #[serde(default)]
    pub state: EventContainer,
    #[serde(default)]
    pub timeline: EventContainer,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventContainer {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}
