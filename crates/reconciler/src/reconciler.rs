//! The reconciliation control loop.
//!
//! `reconcile` converges the remote room graph onto the plan: it re-arms
//! its own periodic timer before doing any work, converges the steward's
//! profile, computes inherited power levels, walks the room tree, and
//! derives session rooms from the external schedule feed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use concierge_core::{Error, Result, RoomId, StateRef, Tunables, UserId};
use concierge_gateway::types::event_type;
use concierge_gateway::Gateway;
use concierge_plan::{Plan, RoomSpec, SessionGroup, SessionsSpec, WidgetSpec};
use concierge_scheduler::{Scheduler, TaskKey};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::power_levels::inherited_from_room;
use crate::sessions::{
    derive_sessions, session_room_name, session_tag, ScheduleFeed,
};
use crate::spaces::{load_space, reconcile_space_children, ExpectedChild};
use crate::types::{sort_key, ChildRecord, Room, Session};

/// Read-only context shared by everything in one pass.
pub(crate) struct PassCtx {
    /// The instant the pass observes as "now".
    pub now: DateTime<Utc>,
    /// Inherited user levels, merged into every room's desired levels.
    pub inherited: HashMap<UserId, i64>,
}

/// Mutable indexes owned by the reconciler. Populated during passes, read
/// by co-resident modules through accessors.
#[derive(Default)]
pub(crate) struct Registries {
    /// Stable tag -> room id.
    pub tags: HashMap<String, RoomId>,
    pub tags_scanned: bool,
    /// Publicly listed child -> its parent space.
    pub public_parents: HashMap<RoomId, RoomId>,
    /// Rooms flagged as operator control rooms.
    pub control_rooms: HashSet<RoomId>,
    /// Rooms shared with attendants, in plan order. Reset each pass.
    pub attendant_rooms: Vec<Room>,
    /// Session-group slot spaces: group -> (space, private).
    pub session_slots: HashMap<SessionGroup, (Room, bool)>,
}

struct Inner {
    plan: Plan,
    gateway: Arc<Gateway>,
    scheduler: Arc<Scheduler>,
    feed: Option<Arc<dyn ScheduleFeed>>,
    tunables: Tunables,
    /// Serializes whole passes; never held across pass boundaries.
    pass_lane: tokio::sync::Mutex<()>,
    registries: Mutex<Registries>,
}

/// Reconciliation controller. Cloning is cheap and shares all state, so
/// timer callbacks can capture a handle.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    /// Create a reconciler over a loaded plan.
    pub fn new(
        plan: Plan,
        gateway: Arc<Gateway>,
        scheduler: Arc<Scheduler>,
        tunables: Tunables,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                plan,
                gateway,
                scheduler,
                feed: None,
                tunables,
                pass_lane: tokio::sync::Mutex::new(()),
                registries: Mutex::new(Registries::default()),
            }),
        }
    }

    /// Attach an external schedule feed for session derivation. Must be
    /// called before the reconciler is cloned or scheduled.
    #[must_use]
    pub fn with_schedule_feed(self, feed: Arc<dyn ScheduleFeed>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.feed = Some(feed);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("schedule feed attached after the reconciler was shared; ignoring");
                Self { inner }
            }
        }
    }

    pub(crate) fn plan(&self) -> &Plan {
        &self.inner.plan
    }

    pub(crate) fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub(crate) fn tunables(&self) -> &Tunables {
        &self.inner.tunables
    }

    pub(crate) fn registries(&self) -> MutexGuard<'_, Registries> {
        self.inner
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The parent space a room is publicly listed under, if any.
    pub fn public_parent_of(&self, room: &RoomId) -> Option<RoomId> {
        self.registries().public_parents.get(room).cloned()
    }

    /// Whether a room is flagged as an operator control room.
    pub fn is_control_room(&self, room: &RoomId) -> bool {
        self.registries().control_rooms.contains(room)
    }

    /// Run one full reconciliation pass.
    ///
    /// Passes never overlap: the pass lane serializes them even when
    /// triggered rapidly. The periodic timer for the next pass is re-armed
    /// before any work happens, so a slow or failing pass still schedules
    /// its successor.
    pub async fn reconcile(&self) -> Result<()> {
        let _pass = self.inner.pass_lane.lock().await;
        let now = self.inner.scheduler.clock().now();
        self.arm_periodic(now)?;

        self.scan_tags_once().await?;
        self.reconcile_profile().await?;
        let ctx = PassCtx {
            now,
            inherited: self.compute_inherited().await?,
        };
        self.registries().attendant_rooms.clear();

        self.reconcile_rooms(&ctx, &self.inner.plan.rooms, false)
            .await?;
        self.reconcile_sessions(&ctx).await?;
        info!("reconciliation pass complete");
        Ok(())
    }

    fn arm_periodic(&self, now: DateTime<Utc>) -> Result<()> {
        let period = chrono::Duration::from_std(self.inner.tunables.reconcile_period)
            .map_err(|e| Error::config(format!("reconcile period out of range: {e}")))?;
        let this = self.clone();
        self.inner
            .scheduler
            .schedule_at(TaskKey::reconcile(), now + period, move || async move {
                if let Err(e) = this.reconcile().await {
                    error!(error = %e, "periodic reconciliation failed");
                }
            })
            .map_err(|e| Error::config(e.to_string()))
    }

    /// Populate the tag registry from joined rooms' tag state. Runs once
    /// per process.
    async fn scan_tags_once(&self) -> Result<()> {
        if self.registries().tags_scanned {
            return Ok(());
        }
        let joined = self.gateway().joined_rooms().await?;
        for room in joined {
            let tag_state = self
                .gateway()
                .room_state(&room, &StateRef::of(event_type::ROOM_TAG))
                .await?;
            if let Some(tag) = tag_state
                .as_ref()
                .and_then(|c| c.get("tag"))
                .and_then(Value::as_str)
            {
                self.registries().tags.insert(tag.to_string(), room.clone());
            }
        }
        let mut registries = self.registries();
        debug!(tags = registries.tags.len(), "tag registry populated");
        registries.tags_scanned = true;
        Ok(())
    }

    /// Converge the steward's own profile onto the plan.
    async fn reconcile_profile(&self) -> Result<()> {
        let steward = &self.inner.plan.steward;
        let profile = self.gateway().profile(&steward.id).await?;

        if profile.displayname.as_deref() != Some(steward.name.as_str()) {
            info!(name = %steward.name, "updating steward display name");
            self.gateway()
                .set_display_name(&steward.id, &steward.name)
                .await?;
        }
        if let Some(url) = self.avatar_url(steward.avatar.as_deref())? {
            if profile.avatar_url.as_deref() != Some(url.as_str()) {
                info!("updating steward avatar");
                self.gateway().set_avatar_url(&steward.id, &url).await?;
            }
        }
        Ok(())
    }

    /// Compute inherited user levels from the configured source rooms.
    async fn compute_inherited(&self) -> Result<HashMap<UserId, i64>> {
        let mut inherited = HashMap::new();
        let Some(rules) = &self.inner.plan.inherit_user_power_levels else {
            return Ok(inherited);
        };
        for (local_name, rule) in rules {
            let Some(source) = self.resolve_by_local_name(local_name).await? else {
                warn!(room = %local_name, "inherit source room does not exist yet");
                continue;
            };
            let members = self.gateway().joined_members(&source).await?;
            let levels = self
                .gateway()
                .room_state(&source, &StateRef::of(event_type::POWER_LEVELS))
                .await?
                .ok_or_else(|| {
                    Error::assertion(format!("room {source} has no power-levels event"))
                })?;
            let users: HashMap<UserId, i64> = levels
                .get("users")
                .map(|u| serde_json::from_value(u.clone()))
                .transpose()?
                .unwrap_or_default();
            inherited_from_room(rule, &members, &users, &mut inherited);
        }
        Ok(inherited)
    }

    // ---- sessions ----

    /// Derive and reconcile the session room set from the schedule feed.
    async fn reconcile_sessions(&self, ctx: &PassCtx) -> Result<()> {
        let (Some(spec), Some(feed)) = (&self.inner.plan.sessions, &self.inner.feed) else {
            return Ok(());
        };
        let talks = feed.talks(&spec.conference).await?;
        let sessions = derive_sessions(spec, talks, ctx.now);

        let mut by_group: HashMap<SessionGroup, Vec<ExpectedChild>> = HashMap::new();
        let mut by_venue: HashMap<String, Vec<Room>> = HashMap::new();

        for (position, session) in sessions.iter().enumerate() {
            let local_name = session_room_name(spec, session);
            let room_spec = self.session_room_spec(spec, session);
            let room = match self
                .reconcile_session_room(ctx, &local_name, &room_spec, position)
                .await
            {
                Ok(room) => room,
                Err(e) if matches!(e, Error::Assertion { .. }) => return Err(e),
                Err(e) => {
                    warn!(session = %session.id, error = %e, "session reconciliation failed");
                    continue;
                }
            };

            let group = session.group_at(ctx.now);
            by_group.entry(group).or_default().push(ExpectedChild {
                room: room.clone(),
                suggested: group == SessionGroup::Current,
            });
            if let Some(venue) = &session.venue {
                by_venue.entry(venue.clone()).or_default().push(room.clone());
            }
            self.schedule_regroup(&room, session, ctx.now)?;
        }

        self.place_groups(by_group).await?;
        self.reconcile_venue_overviews(ctx, spec, by_venue).await?;
        Ok(())
    }

    /// The synthetic spec a session's room is reconciled under.
    fn session_room_spec(&self, spec: &SessionsSpec, session: &Session) -> RoomSpec {
        let talk_override = spec.overrides.get(&session.id);
        let no_widget = talk_override.is_some_and(|o| o.no_widget);
        RoomSpec {
            name: session.title.clone(),
            topic: Some(session.url.clone()),
            widget: (spec.widgets && !no_widget).then(|| WidgetSpec {
                name: session.title.clone(),
                url: session.url.clone(),
            }),
            redirect: talk_override.and_then(|o| o.redirect.clone()),
            tag: Some(session_tag(session)),
            ..RoomSpec::default()
        }
    }

    async fn reconcile_session_room(
        &self,
        ctx: &PassCtx,
        local_name: &str,
        room_spec: &RoomSpec,
        position: usize,
    ) -> Result<Room> {
        let mut single = indexmap::IndexMap::new();
        single.insert(local_name.to_string(), room_spec.clone());
        let mut reconciled = self.reconcile_rooms(ctx, &single, false).await?;
        let mut child = reconciled
            .pop()
            .ok_or_else(|| Error::transient(format!("session room {local_name} not reconciled")))?;
        child.room.sort_key = sort_key(position);
        Ok(child.room)
    }

    /// Converge every registered session-group slot onto its member set.
    async fn place_groups(
        &self,
        mut by_group: HashMap<SessionGroup, Vec<ExpectedChild>>,
    ) -> Result<()> {
        let slots: Vec<(SessionGroup, Room, bool)> = self
            .registries()
            .session_slots
            .iter()
            .map(|(group, (room, private))| (*group, room.clone(), *private))
            .collect();

        for (group, slot_room, private) in slots {
            let mut space = load_space(self.gateway(), slot_room, private).await?;
            let expected = by_group.remove(&group).unwrap_or_default();
            let mut public_parents = std::mem::take(&mut self.registries().public_parents);
            let result = reconcile_space_children(
                self.gateway(),
                &mut space,
                &expected,
                &self.inner.plan.server_name,
                &mut public_parents,
            )
            .await;
            self.registries().public_parents = public_parents;
            result?;
        }
        Ok(())
    }

    /// Maintain one overview space per venue, listing that venue's sessions
    /// plus every room shared with attendants.
    async fn reconcile_venue_overviews(
        &self,
        ctx: &PassCtx,
        spec: &SessionsSpec,
        by_venue: HashMap<String, Vec<Room>>,
    ) -> Result<()> {
        for (venue, session_rooms) in by_venue {
            let local_name = format!("{}-venue-{}", spec.prefix, slug(&venue));
            let venue_spec = RoomSpec {
                name: venue.clone(),
                children: Some(concierge_plan::Children::Nested(indexmap::IndexMap::new())),
                tag: Some(format!("venue/{}", slug(&venue))),
                ..RoomSpec::default()
            };

            let mut single = indexmap::IndexMap::new();
            single.insert(local_name, venue_spec);
            let Some(child) = self.reconcile_rooms(ctx, &single, false).await?.pop() else {
                continue;
            };

            let mut expected: Vec<ExpectedChild> = Vec::new();
            let attendant_rooms = self.registries().attendant_rooms.clone();
            for (position, room) in session_rooms
                .into_iter()
                .chain(attendant_rooms)
                .enumerate()
            {
                let mut room = room;
                room.sort_key = sort_key(position);
                expected.push(ExpectedChild {
                    room,
                    suggested: false,
                });
            }

            let mut space = load_space(self.gateway(), child.room, false).await?;
            let mut public_parents = std::mem::take(&mut self.registries().public_parents);
            let result = reconcile_space_children(
                self.gateway(),
                &mut space,
                &expected,
                &self.inner.plan.server_name,
                &mut public_parents,
            )
            .await;
            self.registries().public_parents = public_parents;
            result?;
        }
        Ok(())
    }

    /// Arm the regroup timer for a session's next group transition.
    ///
    /// Regroups are keyed per room, so a re-triggered reconciliation
    /// replaces rather than duplicates the timer. A regroup only makes
    /// sense strictly before the next full pass, which would subsume it;
    /// scheduling one without a periodic timer armed is a bug.
    pub(crate) fn schedule_regroup(
        &self,
        room: &Room,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(when) = session.next_transition(now) else {
            return Ok(());
        };
        let next_pass = self
            .inner
            .scheduler
            .next_fire_time(&TaskKey::reconcile())
            .ok_or_else(|| Error::assertion("no periodic reconcile timer is armed"))?;
        if when >= next_pass {
            debug!(session = %session.id, "next pass subsumes the regroup, skipping timer");
            return Ok(());
        }

        let this = self.clone();
        let timer_room = room.clone();
        let timer_session = session.clone();
        self.inner
            .scheduler
            .schedule_at(TaskKey::regroup(&room.id), when, move || async move {
                if let Err(e) = this.regroup_session(&timer_room, &timer_session).await {
                    error!(session = %timer_session.id, error = %e, "regroup failed");
                }
            })
            .map_err(|e| Error::config(e.to_string()))
    }

    /// Re-run only the group-membership step for one session. Fired by
    /// regroup timers between full passes.
    async fn regroup_session(&self, room: &Room, session: &Session) -> Result<()> {
        let _pass = self.inner.pass_lane.lock().await;
        let now = self.inner.scheduler.clock().now();
        let group = session.group_at(now);
        debug!(session = %session.id, group = group.name(), "regrouping session");

        let slots: Vec<(SessionGroup, Room, bool)> = self
            .registries()
            .session_slots
            .iter()
            .map(|(g, (r, p))| (*g, r.clone(), *p))
            .collect();

        for (slot_group, slot_room, private) in slots {
            let member = slot_group == group;
            let state = StateRef::keyed(event_type::SPACE_CHILD, room.id.as_str());
            if member {
                let record = ChildRecord {
                    order: Some(room.sort_key.clone()),
                    suggested: group == SessionGroup::Current,
                };
                self.gateway()
                    .send_state_if_different(
                        &slot_room.id,
                        &state,
                        record.render(&self.inner.plan.server_name),
                    )
                    .await?;
                let mut registries = self.registries();
                if private {
                    registries.public_parents.remove(&room.id);
                } else {
                    registries
                        .public_parents
                        .insert(room.id.clone(), slot_room.id.clone());
                }
            } else {
                let current = self.gateway().room_state(&slot_room.id, &state).await?;
                let linked = current
                    .is_some_and(|v| v.as_object().is_some_and(|o| !o.is_empty()));
                if linked {
                    self.gateway()
                        .send_state(&slot_room.id, &state, serde_json::json!({}))
                        .await?;
                    let mut registries = self.registries();
                    if registries.public_parents.get(&room.id) == Some(&slot_room.id) {
                        registries.public_parents.remove(&room.id);
                    }
                }
            }
        }

        self.schedule_regroup(room, session, now)?;
        Ok(())
    }
}

fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_lowercase_and_safe() {
        assert_eq!(slug("Main Stage"), "main-stage");
        assert_eq!(slug("Saal 1"), "saal-1");
    }
}
