//! Local room-state cache.
//!
//! Populated only from confirmed writes and from server-pushed sync data,
//! never speculatively. Reads of current room state are served from here
//! instead of a network round trip.

use std::collections::HashMap;
use std::sync::RwLock;

use concierge_core::{RoomId, StateRef};
use serde_json::Value;

/// room -> (event type, state key) -> latest content.
#[derive(Debug, Default)]
pub struct StateCache {
    rooms: RwLock<HashMap<RoomId, HashMap<StateRef, Value>>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached content for one piece of state, if known.
    pub fn get(&self, room: &RoomId, state: &StateRef) -> Option<Value> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room)?.get(state).cloned()
    }

    /// Record a confirmed write or a sync-observed state event.
    pub fn record(&self, room: &RoomId, state: StateRef, content: Value) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.entry(room.clone()).or_default().insert(state, content);
    }

    /// All cached state of one event type in a room, keyed by state key.
    pub fn of_type(&self, room: &RoomId, event_type: &str) -> HashMap<String, Value> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room)
            .map(|states| {
                states
                    .iter()
                    .filter(|(state, _)| state.event_type == event_type)
                    .map(|(state, content)| (state.state_key.clone(), content.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any state at all is cached for the room.
    pub fn knows_room(&self, room: &RoomId) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.contains_key(room)
    }

    /// Drop everything cached for a room, e.g. after leaving it.
    pub fn forget_room(&self, room: &RoomId) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.remove(room);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn records_and_reads_back() {
        let cache = StateCache::new();
        let room = RoomId::from("!a:x");
        let topic = StateRef::of("m.room.topic");

        assert_eq!(cache.get(&room, &topic), None);
        cache.record(&room, topic.clone(), json!({"topic": "Hi"}));
        assert_eq!(cache.get(&room, &topic), Some(json!({"topic": "Hi"})));
    }

    #[test]
    fn later_record_overwrites() {
        let cache = StateCache::new();
        let room = RoomId::from("!a:x");
        let name = StateRef::of("m.room.name");

        cache.record(&room, name.clone(), json!({"name": "old"}));
        cache.record(&room, name.clone(), json!({"name": "new"}));
        assert_eq!(cache.get(&room, &name), Some(json!({"name": "new"})));
    }

    #[test]
    fn of_type_groups_by_state_key() {
        let cache = StateCache::new();
        let room = RoomId::from("!space:x");

        cache.record(
            &room,
            StateRef::keyed("m.space.child", "!c1:x"),
            json!({"via": ["x"]}),
        );
        cache.record(
            &room,
            StateRef::keyed("m.space.child", "!c2:x"),
            json!({"via": ["x"], "suggested": true}),
        );
        cache.record(&room, StateRef::of("m.room.name"), json!({"name": "Space"}));

        let children = cache.of_type(&room, "m.space.child");
        assert_eq!(children.len(), 2);
        assert_eq!(children["!c2:x"]["suggested"], json!(true));
    }

    #[test]
    fn forget_room_clears_all_state() {
        let cache = StateCache::new();
        let room = RoomId::from("!a:x");
        cache.record(&room, StateRef::of("m.room.topic"), json!({"topic": "t"}));

        cache.forget_room(&room);
        assert!(!cache.knows_room(&room));
        assert_eq!(cache.get(&room, &StateRef::of("m.room.topic")), None);
    }
}
