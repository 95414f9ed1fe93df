//! Per-room reconciliation.
//!
//! The room tree is walked depth-first in plan declaration order: parents
//! are created and classified before their children, since children need
//! the parent's privacy and space identity.

use concierge_core::{Error, Result, RoomAlias, RoomId, StateRef, UserId};
use concierge_gateway::types::event_type;
use concierge_plan::{Children, RoomSpec, SessionGroup};
use concierge_scheduler::TaskKey;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::diff::diff;
use crate::invites::reconcile_invitations;
use crate::notices::{upsert_notice, NoticeKind};
use crate::power_levels::{desired_levels, moderators_of};
use crate::reconciler::{PassCtx, Reconciler};
use crate::spaces::{load_space, reconcile_space_children, ExpectedChild};
use crate::types::{sort_key, Room};

/// State key the managed widget lives under.
const WIDGET_STATE_KEY: &str = "concierge";

impl Reconciler {
    /// Reconcile a sibling set in declaration order, returning the children
    /// the parent space should list. A failed room is logged and skipped
    /// unless the failure is a remote-state assertion, which aborts the
    /// pass.
    pub(crate) fn reconcile_rooms<'a>(
        &'a self,
        ctx: &'a PassCtx,
        rooms: &'a IndexMap<String, RoomSpec>,
        parent_private: bool,
    ) -> BoxFuture<'a, Result<Vec<ExpectedChild>>> {
        async move {
            let mut expected = Vec::new();
            for (position, (local_name, spec)) in rooms.iter().enumerate() {
                let sort = sort_key(position);
                match self
                    .reconcile_room(ctx, local_name, spec, sort, parent_private)
                    .await
                {
                    Ok(Some(room)) => expected.push(ExpectedChild {
                        room,
                        suggested: false,
                    }),
                    Ok(None) => {}
                    Err(e) if matches!(e, Error::Assertion { .. }) => return Err(e),
                    Err(e) => {
                        warn!(room = %local_name, error = %e, "room reconciliation failed");
                    }
                }
            }
            Ok(expected)
        }
        .boxed()
    }

    /// Reconcile one room spec. Returns the resolved room, or `None` when
    /// the spec destroys it.
    async fn reconcile_room(
        &self,
        ctx: &PassCtx,
        local_name: &str,
        spec: &RoomSpec,
        sort: String,
        parent_private: bool,
    ) -> Result<Option<Room>> {
        let private = spec.private || parent_private;
        let alias = self.alias_for(local_name);
        let (existing, alias_resolves) = self.resolve_room(spec, &alias).await?;

        if spec.destroy {
            if let Some(id) = existing {
                self.destroy_room(&id, &alias).await?;
            }
            return Ok(None);
        }

        let (id, fresh) = match existing {
            Some(id) => (id, false),
            None => (self.create_room(local_name, spec, &alias, ctx, private).await?, true),
        };
        let room = Room {
            id: id.clone(),
            local_name: local_name.to_string(),
            sort_key: sort,
        };

        if !fresh {
            self.converge_room(ctx, &room, spec, &alias, alias_resolves, private)
                .await?;
        }
        self.converge_derived_facets(&room, spec).await?;
        self.track_room(&room, spec);

        match &spec.children {
            // An empty nested map marks a space whose children are managed
            // elsewhere (venue overviews); diffing would strip them.
            Some(Children::Nested(children)) if !children.is_empty() => {
                let mut space = load_space(self.gateway(), room.clone(), private).await?;
                let expected = self.reconcile_rooms(ctx, children, private).await?;
                // The registry lock must not be held across awaits; the
                // pass lane already serializes access.
                let mut public_parents = std::mem::take(&mut self.registries().public_parents);
                let result = reconcile_space_children(
                    self.gateway(),
                    &mut space,
                    &expected,
                    &self.plan().server_name,
                    &mut public_parents,
                )
                .await;
                self.registries().public_parents = public_parents;
                result?;
            }
            Some(Children::SessionGroup(group)) => {
                self.register_session_slot(*group, room.clone(), private);
            }
            Some(Children::Nested(_)) | None => {}
        }

        if private {
            let levels = desired_levels(&self.plan().power_levels, &ctx.inherited, spec);
            let mut eligible = moderators_of(&levels);
            eligible.extend(spec.invite.iter().cloned());
            let invited =
                reconcile_invitations(self.gateway(), &self.plan().steward.id, &room.id, &eligible)
                    .await?;
            self.schedule_invite_nudges(&room, &eligible, &invited, ctx.now);
        }
        Ok(Some(room))
    }

    /// Arm a nudge timer per freshly invited user: after the configured
    /// delay the room's invitations are re-checked, reissuing anything the
    /// server dropped. Keyed per (space, user) so repeat passes replace
    /// rather than stack.
    fn schedule_invite_nudges(
        &self,
        room: &Room,
        eligible: &[UserId],
        invited: &[UserId],
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let Ok(delay) = chrono::Duration::from_std(self.tunables().nudge_delay) else {
            return;
        };
        for user in invited {
            let this = self.clone();
            let room_id = room.id.clone();
            let eligible = eligible.to_vec();
            let nudged = user.clone();
            let armed = self.scheduler().schedule_at(
                TaskKey::nudge(&room.id, user),
                now + delay,
                move || async move {
                    let result = reconcile_invitations(
                        this.gateway(),
                        &this.plan().steward.id,
                        &room_id,
                        &eligible,
                    )
                    .await;
                    if let Err(e) = result {
                        warn!(room = %room_id, user = %nudged, error = %e, "invite nudge failed");
                    }
                },
            );
            if let Err(e) = armed {
                warn!(room = %room.id, user = %user, error = %e, "could not arm nudge timer");
            }
        }
    }

    /// The published alias for a local name, honoring the alias proxy.
    pub(crate) fn alias_for(&self, local_name: &str) -> RoomAlias {
        let server = match &self.plan().alias_proxy {
            Some(proxy) if proxy.applies_to(local_name) => proxy.server.as_str(),
            _ => self.plan().server_name.as_str(),
        };
        RoomAlias::from_parts(local_name, server)
    }

    /// Resolve a spec to an existing room: stable tag first, then alias.
    /// When both resolve differently the alias is the newer truth and the
    /// tag mapping is stale. The second return is whether the alias
    /// currently resolves to the returned room.
    async fn resolve_room(
        &self,
        spec: &RoomSpec,
        alias: &RoomAlias,
    ) -> Result<(Option<RoomId>, bool)> {
        let tagged = spec
            .tag
            .as_ref()
            .and_then(|tag| self.registries().tags.get(tag).cloned());
        let aliased = self.gateway().resolve_alias(alias).await?;

        match (tagged, aliased) {
            (Some(tagged), Some(aliased)) if tagged != aliased => {
                warn!(tag_room = %tagged, alias_room = %aliased,
                    "tag mapping is stale, trusting the alias");
                if let Some(tag) = &spec.tag {
                    self.registries().tags.insert(tag.clone(), aliased.clone());
                }
                Ok((Some(aliased), true))
            }
            (_, Some(aliased)) => Ok((Some(aliased), true)),
            (Some(tagged), None) => Ok((Some(tagged), false)),
            (None, None) => Ok((None, false)),
        }
    }

    /// Decommission a room: strip its alias, kick everyone but the steward,
    /// then leave and forget it.
    async fn destroy_room(&self, id: &RoomId, alias: &RoomAlias) -> Result<()> {
        info!(room = %id, "destroying room");
        self.gateway().delete_alias(alias).await?;
        for member in self.gateway().joined_members(id).await? {
            if member == self.plan().steward.id {
                continue;
            }
            if let Err(e) = self
                .gateway()
                .kick(id, &member, "this room has been decommissioned")
                .await
            {
                warn!(room = %id, user = %member, error = %e, "kick failed");
            }
        }
        self.gateway().leave(id).await?;
        self.gateway().forget(id).await?;
        self.registries().tags.retain(|_, tagged| tagged != id);
        Ok(())
    }

    /// Create a room with its full initial state in one call.
    async fn create_room(
        &self,
        local_name: &str,
        spec: &RoomSpec,
        alias: &RoomAlias,
        ctx: &PassCtx,
        private: bool,
    ) -> Result<RoomId> {
        info!(room = %local_name, private, "creating room");
        let mut initial_state = vec![
            json!({
                "type": event_type::JOIN_RULES,
                "state_key": "",
                "content": {"join_rule": if private { "invite" } else { "public" }},
            }),
            json!({
                "type": event_type::HISTORY_VISIBILITY,
                "state_key": "",
                "content": {
                    "history_visibility": if private { "invited" } else { "world_readable" }
                },
            }),
        ];
        if let Some(url) = self.avatar_url(spec.avatar.as_deref())? {
            initial_state.push(json!({
                "type": event_type::AVATAR,
                "state_key": "",
                "content": {"url": url},
            }));
        }
        if let Some(tag) = &spec.tag {
            initial_state.push(json!({
                "type": event_type::ROOM_TAG,
                "state_key": "",
                "content": {"tag": tag},
            }));
        }
        // Name and topic go through initial_state so the cache records them
        // as confirmed writes; the next pass then sees them as current.
        if !spec.name.is_empty() {
            initial_state.push(json!({
                "type": event_type::NAME,
                "state_key": "",
                "content": {"name": spec.name},
            }));
        }
        if let Some(topic) = &spec.topic {
            initial_state.push(json!({
                "type": event_type::TOPIC,
                "state_key": "",
                "content": {"topic": topic},
            }));
        }

        let mut creation = json!({
            "visibility": if private { "private" } else { "public" },
            "preset": if private { "private_chat" } else { "public_chat" },
            "initial_state": initial_state,
            "power_level_content_override":
                desired_levels(&self.plan().power_levels, &ctx.inherited, spec).render(),
        });
        if spec.is_space() {
            creation["creation_content"] = json!({"type": "m.space"});
        }

        let id = self.gateway().create_room(creation).await?;
        self.gateway().create_alias(alias, &id).await?;
        self.gateway()
            .send_state(
                &id,
                &StateRef::of(event_type::CANONICAL_ALIAS),
                json!({"alias": alias}),
            )
            .await?;
        if let Some(tag) = &spec.tag {
            self.registries().tags.insert(tag.clone(), id.clone());
        }
        Ok(id)
    }

    /// Converge the mutable facets of an existing room.
    async fn converge_room(
        &self,
        ctx: &PassCtx,
        room: &Room,
        spec: &RoomSpec,
        alias: &RoomAlias,
        alias_resolves: bool,
        private: bool,
    ) -> Result<()> {
        if let Some(tag) = &spec.tag {
            self.gateway()
                .send_state_if_different(
                    &room.id,
                    &StateRef::of(event_type::ROOM_TAG),
                    json!({"tag": tag}),
                )
                .await?;
            self.registries().tags.insert(tag.clone(), room.id.clone());
        }

        if !alias_resolves {
            info!(room = %room.id, alias = %alias, "re-pointing alias");
            self.gateway().create_alias(alias, &room.id).await?;
        }
        self.gateway()
            .send_state_if_different(
                &room.id,
                &StateRef::of(event_type::CANONICAL_ALIAS),
                json!({"alias": alias}),
            )
            .await?;

        // A room known to exist must carry a power-levels event; its
        // absence means the remote state is corrupted.
        let current_levels = self
            .gateway()
            .room_state(&room.id, &StateRef::of(event_type::POWER_LEVELS))
            .await?
            .ok_or_else(|| {
                Error::assertion(format!("room {} has no power-levels event", room.id))
            })?;
        let desired = desired_levels(&self.plan().power_levels, &ctx.inherited, spec).render();
        let changes = diff(&current_levels, &desired);
        if !changes.is_empty() {
            debug!(room = %room.id, changes = changes.len(), "power levels drifted");
            self.gateway()
                .send_state(&room.id, &StateRef::of(event_type::POWER_LEVELS), desired)
                .await?;
        }

        self.gateway()
            .send_state_if_different(
                &room.id,
                &StateRef::of(event_type::JOIN_RULES),
                json!({"join_rule": if private { "invite" } else { "public" }}),
            )
            .await?;
        if let Some(url) = self.avatar_url(spec.avatar.as_deref())? {
            self.gateway()
                .send_state_if_different(
                    &room.id,
                    &StateRef::of(event_type::AVATAR),
                    json!({"url": url}),
                )
                .await?;
        }
        if !spec.name.is_empty() {
            self.gateway()
                .send_state_if_different(
                    &room.id,
                    &StateRef::of(event_type::NAME),
                    json!({"name": spec.name}),
                )
                .await?;
        }
        if let Some(topic) = &spec.topic {
            self.gateway()
                .send_state_if_different(
                    &room.id,
                    &StateRef::of(event_type::TOPIC),
                    json!({"topic": topic}),
                )
                .await?;
        }
        Ok(())
    }

    /// Converge the facets that apply to fresh and existing rooms alike:
    /// the widget, the pinned intro notice, and the redirect notice.
    async fn converge_derived_facets(&self, room: &Room, spec: &RoomSpec) -> Result<()> {
        let widget_state = StateRef::keyed(event_type::WIDGETS, WIDGET_STATE_KEY);
        match &spec.widget {
            Some(widget) => {
                self.gateway()
                    .send_state_if_different(
                        &room.id,
                        &widget_state,
                        json!({
                            "type": "customwidget",
                            "name": widget.name,
                            "url": widget.url,
                        }),
                    )
                    .await?;
            }
            None => {
                let current = self.gateway().room_state(&room.id, &widget_state).await?;
                if current.is_some_and(|v| v.as_object().is_some_and(|o| !o.is_empty())) {
                    debug!(room = %room.id, "removing widget");
                    self.gateway()
                        .send_state(&room.id, &widget_state, json!({}))
                        .await?;
                }
            }
        }

        if let Some(intro) = &spec.intro {
            let root = upsert_notice(
                self.gateway(),
                &self.plan().steward.id,
                &room.id,
                NoticeKind::Intro,
                intro,
            )
            .await?;
            self.gateway()
                .send_state_if_different(
                    &room.id,
                    &StateRef::of(event_type::PINNED_EVENTS),
                    json!({"pinned": [root]}),
                )
                .await?;
        }

        if let Some(target) = &spec.redirect {
            let target_alias = self.alias_for(target);
            let body = format!("This room has moved to {target_alias}");
            upsert_notice(
                self.gateway(),
                &self.plan().steward.id,
                &room.id,
                NoticeKind::Redirect,
                &body,
            )
            .await?;
        }
        Ok(())
    }

    /// Resolve a symbolic avatar name to its media URL.
    pub(crate) fn avatar_url(&self, name: Option<&str>) -> Result<Option<String>> {
        let Some(name) = name else { return Ok(None) };
        self.plan()
            .resolve_avatar(name)
            .map_err(|e| Error::config(e.to_string()))
            .map(|url| url.map(str::to_string))
    }

    /// Maintain the control-room and attendant-room registries from the
    /// spec's flags.
    fn track_room(&self, room: &Room, spec: &RoomSpec) {
        let mut registries = self.registries();
        if spec.control {
            registries.control_rooms.insert(room.id.clone());
        } else {
            registries.control_rooms.remove(&room.id);
        }
        if spec.invite_attendants {
            registries.attendant_rooms.push(room.clone());
        }
    }

    fn register_session_slot(&self, group: SessionGroup, room: Room, private: bool) {
        debug!(group = group.name(), room = %room.id, "registered session-group slot");
        self.registries().session_slots.insert(group, (room, private));
    }

    /// Resolve a source room for inherited power levels by its local name.
    pub(crate) async fn resolve_by_local_name(&self, local_name: &str) -> Result<Option<RoomId>> {
        self.gateway().resolve_alias(&self.alias_for(local_name)).await
    }
}
