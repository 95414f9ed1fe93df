//! Plan document types.
//!
//! The plan is parsed once at startup and never mutated afterwards. Room
//! mappings are order-preserving: sibling sort keys are assigned from
//! declaration order.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use concierge_core::UserId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Identity the controller maintains as its own chat profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StewardSpec {
    /// The steward's own user id.
    pub id: UserId,
    /// Display name to converge the profile to.
    pub name: String,
    /// Symbolic avatar name, resolved through the `avatars` map.
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Time-derived classification of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionGroup {
    /// Not yet opened.
    Future,
    /// Opened and not yet ended.
    Current,
    /// Ended.
    Past,
}

impl SessionGroup {
    /// All groups, in display order.
    pub const ALL: [Self; 3] = [Self::Current, Self::Future, Self::Past];

    /// The symbolic name used in plan documents.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Future => "future",
            Self::Current => "current",
            Self::Past => "past",
        }
    }
}

/// Children of a room spec: either nested specs (making the room a space)
/// or the symbolic name of a session-group slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Children {
    /// A session-group slot: this space holds the sessions currently in
    /// that group.
    SessionGroup(SessionGroup),
    /// Nested room specs in declaration order.
    Nested(IndexMap<String, RoomSpec>),
}

/// Widget descriptor rendered into a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSpec {
    /// Widget title.
    pub name: String,
    /// Widget content URL.
    pub url: String,
}

/// Declarative description of one room.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSpec {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Topic, if any.
    #[serde(default)]
    pub topic: Option<String>,
    /// Symbolic avatar name, resolved through the `avatars` map.
    #[serde(default)]
    pub avatar: Option<String>,
    /// Widget to maintain in the room, or absent to remove any.
    #[serde(default)]
    pub widget: Option<WidgetSpec>,
    /// Invite-only room; also governs child visibility in the
    /// public-parent index.
    #[serde(default)]
    pub private: bool,
    /// Only the steward may post.
    #[serde(default)]
    pub read_only: bool,
    /// Only moderators may post.
    #[serde(default)]
    pub moderators_only: bool,
    /// Children, making this room a space.
    #[serde(default)]
    pub children: Option<Children>,
    /// Tombstone: decommission this room if it exists.
    #[serde(default)]
    pub destroy: bool,
    /// Stable identity independent of the alias.
    #[serde(default)]
    pub tag: Option<String>,
    /// Local name of another room; rendered as a redirect notice.
    #[serde(default)]
    pub redirect: Option<String>,
    /// Pinned intro notice text.
    #[serde(default)]
    pub intro: Option<String>,
    /// Marks the operator control room.
    #[serde(default)]
    pub control: bool,
    /// Share this room with attendants (feeds venue overview composition).
    #[serde(default)]
    pub invite_attendants: bool,
    /// Extra users who must hold an invitation when the room is private.
    #[serde(default)]
    pub invite: Vec<UserId>,
}

impl RoomSpec {
    /// Whether this spec declares children (is a space).
    pub const fn is_space(&self) -> bool {
        self.children.is_some()
    }
}

/// Per-talk override for session room derivation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkOverride {
    /// Local-name suffix replacing the synthetic default.
    #[serde(default)]
    pub suffix: Option<String>,
    /// Redirect the derived room instead of hosting content directly.
    #[serde(default)]
    pub redirect: Option<String>,
    /// Suppress the video-conference widget for this talk.
    #[serde(default)]
    pub no_widget: bool,
}

/// Config for deriving rooms from an external talk schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsSpec {
    /// Conference identifier passed to the schedule feed.
    pub conference: String,
    /// Local-name prefix for derived rooms.
    pub prefix: String,
    /// Minutes before `begin` at which a session opens.
    #[serde(default = "default_open_early")]
    pub open_early_minutes: i64,
    /// Shift all sessions so this date lines up with today. Rehearsal use.
    #[serde(default)]
    pub demo_date: Option<NaiveDate>,
    /// Talk ids excluded from derivation.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Per-talk overrides keyed by talk id.
    #[serde(default)]
    pub overrides: IndexMap<String, TalkOverride>,
    /// Attach a video-conference widget to derived rooms.
    #[serde(default = "default_true")]
    pub widgets: bool,
}

const fn default_open_early() -> i64 {
    10
}

const fn default_true() -> bool {
    true
}

/// Baseline permission template merged into every room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerLevels {
    /// Explicit per-user levels.
    #[serde(default)]
    pub users: BTreeMap<UserId, i64>,
    /// Default level for users not listed.
    #[serde(default)]
    pub users_default: i64,
    /// Default level required to send message events.
    #[serde(default)]
    pub events_default: i64,
    /// Default level required to send state events.
    #[serde(default = "default_state")]
    pub state_default: i64,
    /// Per-event-type level requirements.
    #[serde(default)]
    pub events: BTreeMap<String, i64>,
    /// Level required to ban.
    #[serde(default = "default_moderator")]
    pub ban: i64,
    /// Level required to kick.
    #[serde(default = "default_moderator")]
    pub kick: i64,
    /// Level required to redact.
    #[serde(default = "default_moderator")]
    pub redact: i64,
    /// Level required to invite.
    #[serde(default)]
    pub invite: i64,
}

const fn default_state() -> i64 {
    50
}

const fn default_moderator() -> i64 {
    50
}

/// Level every moderator holds.
pub const MODERATOR_LEVEL: i64 = 50;

/// Level reserved for the steward. Inherited levels never reach it.
pub const STEWARD_LEVEL: i64 = 100;

/// Cap applied to every inherited user level.
pub const INHERIT_CAP: i64 = 99;

impl PowerLevels {
    /// The level a user resolves to under this template.
    pub fn level_of(&self, user: &UserId) -> i64 {
        self.users.get(user).copied().unwrap_or(self.users_default)
    }

    /// Render as wire content for the power-levels state event.
    pub fn render(&self) -> serde_json::Value {
        serde_json::json!({
            "users": self.users,
            "users_default": self.users_default,
            "events_default": self.events_default,
            "state_default": self.state_default,
            "events": self.events,
            "ban": self.ban,
            "kick": self.kick,
            "redact": self.redact,
            "invite": self.invite,
        })
    }
}

/// Rule computing additional user permissions from another room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritRule {
    /// Floor applied to every member of the source room.
    pub raise_to: i64,
}

/// Rewrite rule publishing certain local names under a different naming
/// authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasProxy {
    /// Local names the rule applies to.
    pub names: Vec<String>,
    /// The alternate server name aliases are published under.
    pub server: String,
}

impl AliasProxy {
    /// Whether the rule rewrites this local name.
    pub fn applies_to(&self, local_name: &str) -> bool {
        self.names.iter().any(|n| n == local_name)
    }
}

/// The declarative target-state document. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// The controller's own identity.
    pub steward: StewardSpec,
    /// Default server name for published aliases.
    pub server_name: String,
    /// Top-level rooms in declaration order.
    #[serde(default)]
    pub rooms: IndexMap<String, RoomSpec>,
    /// Session derivation config, if any.
    #[serde(default)]
    pub sessions: Option<SessionsSpec>,
    /// Baseline permission template.
    #[serde(default)]
    pub power_levels: PowerLevels,
    /// Symbolic avatar names. A value may alias another name.
    #[serde(default)]
    pub avatars: IndexMap<String, String>,
    /// Rules deriving extra user levels from other rooms' membership,
    /// keyed by source room local name.
    #[serde(default)]
    pub inherit_user_power_levels: Option<IndexMap<String, InheritRule>>,
    /// Alias rewrite rule, if any.
    #[serde(default)]
    pub alias_proxy: Option<AliasProxy>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn children_parses_session_group_from_string() {
        let children: Children = serde_yaml::from_str("current").unwrap();
        assert!(matches!(
            children,
            Children::SessionGroup(SessionGroup::Current)
        ));
    }

    #[test]
    fn children_parses_nested_map() {
        let children: Children = serde_yaml::from_str("lobby:\n  name: Lobby\n").unwrap();
        match children {
            Children::Nested(map) => {
                assert_eq!(map.get("lobby").map(|r| r.name.as_str()), Some("Lobby"));
            }
            Children::SessionGroup(_) => panic!("expected nested children"),
        }
    }

    #[test]
    fn power_levels_default_resolution() {
        let mut levels = PowerLevels::default();
        levels.users.insert(UserId::from("@mod:x"), 50);
        assert_eq!(levels.level_of(&UserId::from("@mod:x")), 50);
        assert_eq!(levels.level_of(&UserId::from("@guest:x")), 0);
    }
}
