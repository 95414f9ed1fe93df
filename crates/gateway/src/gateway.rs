//! The gateway facade.
//!
//! Composes the transport with rate limiting, retry, and the local state
//! cache. Every remote call the rest of the system makes funnels through
//! here; nothing else is permitted to touch the network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use concierge_core::{optional, Error, Result, RoomAlias, RoomId, StateRef, UserId};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cache::StateCache;
use crate::limiter::{Lane, RateLimiter};
use crate::pager::{Direction, MessagePager};
use crate::retry::RetryPolicy;
use crate::transport::{Request, Transport};
use crate::types::{
    event_type, CreatedRoom, MessagesPage, Profile, ResolvedAlias, RoomEvent, SentEvent,
    SyncResponse,
};

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

/// Resilient remote-call gateway.
pub struct Gateway {
    transport: Arc<dyn Transport>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    cache: StateCache,
    txn_counter: AtomicU64,
}

impl Gateway {
    /// Create a gateway over the given transport.
    ///
    /// `min_spacing` paces the default lane; `creation_cooldown` is the
    /// fixed wait before every room-creation call.
    pub fn new(
        transport: Arc<dyn Transport>,
        min_spacing: Duration,
        creation_cooldown: Duration,
    ) -> Self {
        Self {
            transport,
            limiter: RateLimiter::new(min_spacing, creation_cooldown),
            retry: RetryPolicy::default(),
            cache: StateCache::new(),
            txn_counter: AtomicU64::new(0),
        }
    }

    /// Replace the retry policy. Tests use this to avoid real backoff delays.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Issue one call through the lane discipline and retry policy.
    ///
    /// The lane permit is held for the duration of the call so the default
    /// lane stays concurrency-1; retry backoff happens outside the permit so
    /// a backing-off call does not starve the lane.
    async fn call(&self, lane: Lane, request: Request) -> Result<Value> {
        self.retry
            .run(|| async {
                let _permit = self.limiter.admit(lane).await;
                self.transport.call(request.clone()).await
            })
            .await
    }

    fn next_txn_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("concierge.{millis}.{seq}")
    }

    // ---- directory ----

    /// Resolve an alias to a room id, or `None` if it does not exist.
    pub async fn resolve_alias(&self, alias: &RoomAlias) -> Result<Option<RoomId>> {
        let request = Request::get(format!("directory/room/{}", encode(alias.as_str())));
        let body = optional(self.call(Lane::Default, request).await)?;
        body.map(|body| {
            let resolved: ResolvedAlias = serde_json::from_value(body)?;
            Ok(resolved.room_id)
        })
        .transpose()
    }

    /// Point an alias at a room.
    pub async fn create_alias(&self, alias: &RoomAlias, room: &RoomId) -> Result<()> {
        let request = Request::put(
            format!("directory/room/{}", encode(alias.as_str())),
            json!({ "room_id": room }),
        );
        self.call(Lane::Default, request).await?;
        Ok(())
    }

    /// Delete an alias. Absence is not an error.
    pub async fn delete_alias(&self, alias: &RoomAlias) -> Result<()> {
        let request = Request::delete(format!("directory/room/{}", encode(alias.as_str())));
        optional(self.call(Lane::Default, request).await)?;
        Ok(())
    }

    // ---- rooms ----

    /// Create a room. Goes through the creation lane, which waits a fixed
    /// cooldown first; the server needs a moment after each creation before
    /// the new room's state is consistent.
    ///
    /// Everything declared in the creation body's `initial_state` and power
    /// level override is recorded in the cache as confirmed state.
    pub async fn create_room(&self, creation: Value) -> Result<RoomId> {
        let request = Request::post("createRoom", creation.clone());
        let body = self.call(Lane::Creation, request).await?;
        let created: CreatedRoom = serde_json::from_value(body)?;
        info!(room = %created.room_id, "created room");

        if let Some(initial) = creation.get("initial_state").and_then(Value::as_array) {
            for event in initial {
                let Some(etype) = event.get("type").and_then(Value::as_str) else {
                    continue;
                };
                let key = event
                    .get("state_key")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let content = event.get("content").cloned().unwrap_or(Value::Null);
                self.cache
                    .record(&created.room_id, StateRef::keyed(etype, key), content);
            }
        }
        if let Some(levels) = creation.get("power_level_content_override") {
            self.cache.record(
                &created.room_id,
                StateRef::of(event_type::POWER_LEVELS),
                levels.clone(),
            );
        }
        Ok(created.room_id)
    }

    /// All rooms the authenticated account has joined.
    pub async fn joined_rooms(&self) -> Result<Vec<RoomId>> {
        let body = self.call(Lane::Default, Request::get("joined_rooms")).await?;
        let rooms = body
            .get("joined_rooms")
            .cloned()
            .ok_or_else(|| Error::assertion("joined_rooms response missing room list"))?;
        Ok(serde_json::from_value(rooms)?)
    }

    /// Joined members of a room.
    pub async fn joined_members(&self, room: &RoomId) -> Result<Vec<UserId>> {
        let request = Request::get(format!("rooms/{}/joined_members", encode(room.as_str())));
        let body = self.call(Lane::Default, request).await?;
        let joined = body
            .get("joined")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::assertion("joined_members response missing member map"))?;
        Ok(joined.keys().map(|id| UserId::new(id.clone())).collect())
    }

    /// Membership events of a room, keyed by member user id. Always read
    /// fresh: memberships change without our involvement, so the cache of
    /// confirmed writes cannot speak for them.
    pub async fn members(
        &self,
        room: &RoomId,
    ) -> Result<std::collections::HashMap<String, Value>> {
        let request = Request::get(format!("rooms/{}/members", encode(room.as_str())));
        let body = self.call(Lane::Default, request).await?;
        let chunk = body
            .get("chunk")
            .cloned()
            .ok_or_else(|| Error::assertion("members response missing event chunk"))?;
        let events: Vec<RoomEvent> = serde_json::from_value(chunk)?;
        Ok(events
            .into_iter()
            .filter_map(|e| e.state_key.map(|key| (key, e.content)))
            .collect())
    }

    /// Invite a user into a room.
    pub async fn invite(&self, room: &RoomId, user: &UserId) -> Result<()> {
        let request = Request::post(
            format!("rooms/{}/invite", encode(room.as_str())),
            json!({ "user_id": user }),
        );
        self.call(Lane::Default, request).await?;
        Ok(())
    }

    /// Kick a user from a room.
    pub async fn kick(&self, room: &RoomId, user: &UserId, reason: &str) -> Result<()> {
        let request = Request::post(
            format!("rooms/{}/kick", encode(room.as_str())),
            json!({ "user_id": user, "reason": reason }),
        );
        self.call(Lane::Default, request).await?;
        Ok(())
    }

    /// Leave a room and drop its cached state.
    pub async fn leave(&self, room: &RoomId) -> Result<()> {
        let request = Request::post(format!("rooms/{}/leave", encode(room.as_str())), json!({}));
        self.call(Lane::Default, request).await?;
        self.cache.forget_room(room);
        Ok(())
    }

    /// Forget a left room.
    pub async fn forget(&self, room: &RoomId) -> Result<()> {
        let request = Request::post(format!("rooms/{}/forget", encode(room.as_str())), json!({}));
        self.call(Lane::Default, request).await?;
        Ok(())
    }

    // ---- room state ----

    /// Current content of one piece of room state, read through the cache.
    ///
    /// The first read of an uncached room loads the room's full state in one
    /// call; subsequent reads are local.
    pub async fn room_state(&self, room: &RoomId, state: &StateRef) -> Result<Option<Value>> {
        if !self.cache.knows_room(room) {
            self.load_room_state(room).await?;
        }
        Ok(self.cache.get(room, state))
    }

    /// All cached state of one event type in a room, keyed by state key.
    /// Loads the room's full state first if it is not cached yet.
    pub async fn room_state_of_type(
        &self,
        room: &RoomId,
        etype: &str,
    ) -> Result<std::collections::HashMap<String, Value>> {
        if !self.cache.knows_room(room) {
            self.load_room_state(room).await?;
        }
        Ok(self.cache.of_type(room, etype))
    }

    /// Fetch a room's full state and record it all in the cache.
    pub async fn load_room_state(&self, room: &RoomId) -> Result<()> {
        let request = Request::get(format!("rooms/{}/state", encode(room.as_str())));
        let body = self.call(Lane::Default, request).await?;
        let events: Vec<RoomEvent> = serde_json::from_value(body)?;
        debug!(room = %room, events = events.len(), "loaded room state");
        for event in events {
            let key = event.state_key.unwrap_or_default();
            self.cache
                .record(room, StateRef::keyed(event.event_type, key), event.content);
        }
        Ok(())
    }

    /// Send a state event and record the accepted content in the cache.
    pub async fn send_state(&self, room: &RoomId, state: &StateRef, content: Value) -> Result<()> {
        let request = Request::put(
            format!(
                "rooms/{}/state/{}/{}",
                encode(room.as_str()),
                encode(&state.event_type),
                encode(&state.state_key)
            ),
            content.clone(),
        );
        self.call(Lane::Default, request).await?;
        self.cache.record(room, state.clone(), content);
        Ok(())
    }

    /// Send a state event only if the desired content differs from the
    /// cached current content, by deep structural equality. Returns whether
    /// a write was issued. This is what makes repeated reconciliation passes
    /// with an unchanged plan issue zero mutating calls.
    pub async fn send_state_if_different(
        &self,
        room: &RoomId,
        state: &StateRef,
        content: Value,
    ) -> Result<bool> {
        let current = self.room_state(room, state).await?;
        if current.as_ref() == Some(&content) {
            return Ok(false);
        }
        debug!(room = %room, event_type = %state.event_type, state_key = %state.state_key,
            "state differs, writing");
        self.send_state(room, state, content).await?;
        Ok(true)
    }

    // ---- profile ----

    /// Fetch a user's profile. Missing profiles read as empty.
    pub async fn profile(&self, user: &UserId) -> Result<Profile> {
        let request = Request::get(format!("profile/{}", encode(user.as_str())));
        let body = optional(self.call(Lane::Default, request).await)?;
        body.map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
            .map(Option::unwrap_or_default)
    }

    /// Set the authenticated account's display name.
    pub async fn set_display_name(&self, user: &UserId, name: &str) -> Result<()> {
        let request = Request::put(
            format!("profile/{}/displayname", encode(user.as_str())),
            json!({ "displayname": name }),
        );
        self.call(Lane::Default, request).await?;
        Ok(())
    }

    /// Set the authenticated account's avatar.
    pub async fn set_avatar_url(&self, user: &UserId, url: &str) -> Result<()> {
        let request = Request::put(
            format!("profile/{}/avatar_url", encode(user.as_str())),
            json!({ "avatar_url": url }),
        );
        self.call(Lane::Default, request).await?;
        Ok(())
    }

    // ---- messages ----

    /// Send a message event, returning its event id.
    pub async fn send_message(&self, room: &RoomId, content: Value) -> Result<String> {
        let request = Request::put(
            format!(
                "rooms/{}/send/{}/{}",
                encode(room.as_str()),
                event_type::MESSAGE,
                self.next_txn_id()
            ),
            content,
        );
        let body = self.call(Lane::Default, request).await?;
        let sent: SentEvent = serde_json::from_value(body)?;
        Ok(sent.event_id)
    }

    /// Redact an event.
    pub async fn redact(&self, room: &RoomId, event_id: &str, reason: &str) -> Result<()> {
        let request = Request::put(
            format!(
                "rooms/{}/redact/{}/{}",
                encode(room.as_str()),
                encode(event_id),
                self.next_txn_id()
            ),
            json!({ "reason": reason }),
        );
        self.call(Lane::Default, request).await?;
        Ok(())
    }

    /// Begin paginating a room's message history.
    pub fn messages(
        &self,
        room: RoomId,
        direction: Direction,
        filter: Option<Value>,
    ) -> MessagePager<'_> {
        MessagePager::new(self, room, direction, filter)
    }

    pub(crate) async fn fetch_messages(
        &self,
        room: &RoomId,
        direction: &str,
        from: Option<&str>,
        filter: Option<&Value>,
    ) -> Result<MessagesPage> {
        let mut request = Request::get(format!("rooms/{}/messages", encode(room.as_str())))
            .with_query("dir", direction)
            .with_query("limit", "100");
        if let Some(from) = from {
            request = request.with_query("from", from);
        }
        if let Some(filter) = filter {
            request = request.with_query("filter", filter.to_string());
        }
        let body = self.call(Lane::Default, request).await?;
        Ok(serde_json::from_value(body)?)
    }

    // ---- sync ----

    /// One long-poll sync round. Runs on the unlimited lane; the server may
    /// hold the request open for the full timeout. Every state event in the
    /// response is recorded in the cache before the response is returned.
    pub async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncResponse> {
        let mut request =
            Request::get("sync").with_query("timeout", timeout.as_millis().to_string());
        if let Some(since) = since {
            request = request.with_query("since", since);
        }
        let body = self.call(Lane::Unlimited, request).await?;
        let response: SyncResponse = serde_json::from_value(body)?;

        for (room, joined) in &response.rooms.join {
            let state_events = joined
                .state
                .events
                .iter()
                .chain(joined.timeline.events.iter());
            for event in state_events {
                if let Some(key) = &event.state_key {
                    self.cache.record(
                        room,
                        StateRef::keyed(event.event_type.clone(), key.clone()),
                        event.content.clone(),
                    );
                }
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use wiremock::matchers::{body_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::transport::HttpTransport;

    use super::*;

    fn gateway(server: &MockServer) -> Gateway {
        let transport = HttpTransport::new(server.uri().parse().unwrap(), "token").unwrap();
        Gateway::new(Arc::new(transport), Duration::ZERO, Duration::ZERO)
            .with_retry_policy(RetryPolicy::immediate())
    }

    #[tokio::test]
    async fn resolve_alias_absence_reads_as_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "errcode": "M_NOT_FOUND"
            })))
            .mount(&server)
            .await;

        let found = gateway(&server)
            .resolve_alias(&RoomAlias::new("#nope:x"))
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn create_room_records_initial_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_matrix/client/v3/createRoom"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"room_id": "!new:x"})),
            )
            .mount(&server)
            .await;

        let gw = gateway(&server);
        let room = gw
            .create_room(json!({
                "name": "welcome",
                "initial_state": [
                    {"type": "m.room.topic", "state_key": "", "content": {"topic": "Hi"}}
                ],
                "power_level_content_override": {"users_default": 0}
            }))
            .await
            .unwrap();
        assert_eq!(room, RoomId::from("!new:x"));

        // Reads are served from the cache; no state GET is mounted.
        let topic = gw
            .room_state(&room, &StateRef::of(event_type::TOPIC))
            .await
            .unwrap();
        assert_eq!(topic, Some(json!({"topic": "Hi"})));
        let levels = gw
            .room_state(&room, &StateRef::of(event_type::POWER_LEVELS))
            .await
            .unwrap();
        assert_eq!(levels, Some(json!({"users_default": 0})));
    }

    #[tokio::test]
    async fn send_state_if_different_skips_matching_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/_matrix/client/v3/rooms/.*/state$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"event_id": "$1", "type": "m.room.topic", "sender": "@c:x",
                 "state_key": "", "content": {"topic": "Hi"}}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/_matrix/client/v3/rooms/.*/state/.*"))
            .and(body_json(json!({"topic": "Changed"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"event_id": "$2"})))
            .expect(1)
            .mount(&server)
            .await;

        let gw = gateway(&server);
        let room = RoomId::from("!r:x");
        let topic = StateRef::of(event_type::TOPIC);

        let wrote = gw
            .send_state_if_different(&room, &topic, json!({"topic": "Hi"}))
            .await
            .unwrap();
        assert!(!wrote);

        let wrote = gw
            .send_state_if_different(&room, &topic, json!({"topic": "Changed"}))
            .await
            .unwrap();
        assert!(wrote);

        // The accepted write is now the cached truth.
        let wrote = gw
            .send_state_if_different(&room, &topic, json!({"topic": "Changed"}))
            .await
            .unwrap();
        assert!(!wrote);
    }

    #[tokio::test]
    async fn sync_populates_the_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next_batch": "s1",
                "rooms": {"join": {"!r:x": {
                    "state": {"events": [
                        {"event_id": "$1", "type": "m.room.name", "sender": "@c:x",
                         "state_key": "", "content": {"name": "Lobby"}}
                    ]},
                    "timeline": {"events": [
                        {"event_id": "$2", "type": "m.room.member", "sender": "@u:x",
                         "state_key": "@u:x", "content": {"membership": "join"}},
                        {"event_id": "$3", "type": "m.room.message", "sender": "@u:x",
                         "content": {"body": "hello"}}
                    ]}
                }}}
            })))
            .mount(&server)
            .await;

        let gw = gateway(&server);
        let response = gw.sync(None, Duration::from_secs(30)).await.unwrap();
        assert_eq!(response.next_batch, "s1");

        let room = RoomId::from("!r:x");
        let name = gw
            .room_state(&room, &StateRef::of(event_type::NAME))
            .await
            .unwrap();
        assert_eq!(name, Some(json!({"name": "Lobby"})));
        let member = gw
            .room_state(&room, &StateRef::keyed(event_type::MEMBER, "@u:x"))
            .await
            .unwrap();
        assert_eq!(member, Some(json!({"membership": "join"})));
    }

    #[tokio::test]
    async fn pager_follows_cursors_until_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/_matrix/client/v3/rooms/.*/messages$"))
            .respond_with(move |req: &wiremock::Request| {
                let from = req
                    .url
                    .query_pairs()
                    .find(|(k, _)| k == "from")
                    .map(|(_, v)| v.to_string());
                let body = match from.as_deref() {
                    None => json!({"chunk": [
                        {"event_id": "$1", "type": "m.room.message", "sender": "@c:x",
                         "content": {"body": "one"}}
                    ], "end": "cursor1"}),
                    Some("cursor1") => json!({"chunk": [
                        {"event_id": "$2", "type": "m.room.message", "sender": "@c:x",
                         "content": {"body": "two"}}
                    ]}),
                    Some(other) => json!({"error": format!("unexpected cursor {other}")}),
                };
                ResponseTemplate::new(200).set_body_json(body)
            })
            .mount(&server)
            .await;

        let gw = gateway(&server);
        let mut pager = gw.messages(RoomId::from("!r:x"), Direction::Backward, None);

        let first = pager.next_page().await.unwrap().unwrap();
        assert_eq!(first[0].event_id, "$1");
        let second = pager.next_page().await.unwrap().unwrap();
        assert_eq!(second[0].event_id, "$2");
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leave_forgets_cached_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/_matrix/client/v3/rooms/.*/leave$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/_matrix/client/v3/rooms/.*/state$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let gw = gateway(&server);
        let room = RoomId::from("!r:x");
        gw.cache
            .record(&room, StateRef::of(event_type::TOPIC), json!({"topic": "t"}));

        gw.leave(&room).await.unwrap();
        // State reads now go back to the server, which has nothing.
        let topic = gw
            .room_state(&room, &StateRef::of(event_type::TOPIC))
            .await
            .unwrap();
        assert_eq!(topic, None);
    }
}
