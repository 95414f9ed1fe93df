//! Power-level resolution.
//!
//! Every room's desired power levels are the plan baseline, raised by
//! inherited user levels and adjusted by the room's posting flags.

use std::collections::HashMap;

use concierge_core::UserId;
use concierge_plan::{
    InheritRule, PowerLevels, RoomSpec, INHERIT_CAP, MODERATOR_LEVEL, STEWARD_LEVEL,
};

/// Compute the inherited levels contributed by one source room.
///
/// Every joined member gets at least the rule's floor; members with a higher
/// explicit level in the source room keep it. Everything is capped below the
/// steward level.
pub fn inherited_from_room(
    rule: &InheritRule,
    members: &[UserId],
    source_users: &HashMap<UserId, i64>,
    into: &mut HashMap<UserId, i64>,
) {
    for member in members {
        let explicit = source_users.get(member).copied().unwrap_or(0);
        let level = explicit.max(rule.raise_to).min(INHERIT_CAP);
        let entry = into.entry(member.clone()).or_insert(level);
        *entry = (*entry).max(level);
    }
}

/// The desired power levels for one room: baseline merged with inherited
/// levels and the room's posting flags.
pub fn desired_levels(
    baseline: &PowerLevels,
    inherited: &HashMap<UserId, i64>,
    spec: &RoomSpec,
) -> PowerLevels {
    let mut levels = baseline.clone();

    for (user, inherited_level) in inherited {
        let capped = (*inherited_level).min(INHERIT_CAP);
        let current = levels.level_of(user);
        // The steward's 100 and any explicit baseline grant above the
        // inherited value win.
        if capped > current && current < STEWARD_LEVEL {
            levels.users.insert(user.clone(), capped);
        }
    }

    if spec.read_only {
        levels.events_default = STEWARD_LEVEL;
    } else if spec.moderators_only {
        levels.events_default = MODERATOR_LEVEL;
    }
    if spec.private {
        levels.invite = MODERATOR_LEVEL;
    }
    levels
}

/// Users holding at least moderator level under the given levels.
pub fn moderators_of(levels: &PowerLevels) -> Vec<UserId> {
    levels
        .users
        .iter()
        .filter(|(_, level)| **level >= MODERATOR_LEVEL && **level < STEWARD_LEVEL)
        .map(|(user, _)| user.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn baseline() -> PowerLevels {
        let mut levels = PowerLevels::default();
        levels.users.insert(UserId::from("@steward:x"), 100);
        levels
    }

    #[test]
    fn inherited_takes_max_of_explicit_and_floor() {
        let rule = InheritRule { raise_to: 50 };
        let members = vec![UserId::from("@u:x"), UserId::from("@plain:x")];
        let mut source_users = HashMap::new();
        source_users.insert(UserId::from("@u:x"), 60);

        let mut inherited = HashMap::new();
        inherited_from_room(&rule, &members, &source_users, &mut inherited);

        assert_eq!(inherited[&UserId::from("@u:x")], 60);
        assert_eq!(inherited[&UserId::from("@plain:x")], 50);
    }

    #[test]
    fn inherited_levels_never_reach_the_steward_level() {
        let rule = InheritRule { raise_to: 50 };
        let members = vec![UserId::from("@admin:x")];
        let mut source_users = HashMap::new();
        source_users.insert(UserId::from("@admin:x"), 100);

        let mut inherited = HashMap::new();
        inherited_from_room(&rule, &members, &source_users, &mut inherited);
        assert_eq!(inherited[&UserId::from("@admin:x")], INHERIT_CAP);

        let levels = desired_levels(&baseline(), &inherited, &RoomSpec::default());
        assert_eq!(levels.level_of(&UserId::from("@admin:x")), INHERIT_CAP);
    }

    #[test]
    fn explicit_baseline_grant_above_inherited_wins() {
        let mut base = baseline();
        base.users.insert(UserId::from("@mod:x"), 75);
        let mut inherited = HashMap::new();
        inherited.insert(UserId::from("@mod:x"), 50);

        let levels = desired_levels(&base, &inherited, &RoomSpec::default());
        assert_eq!(levels.level_of(&UserId::from("@mod:x")), 75);
    }

    #[test]
    fn steward_is_never_lowered() {
        let mut inherited = HashMap::new();
        inherited.insert(UserId::from("@steward:x"), 50);
        let levels = desired_levels(&baseline(), &inherited, &RoomSpec::default());
        assert_eq!(levels.level_of(&UserId::from("@steward:x")), 100);
    }

    #[test]
    fn posting_flags_adjust_events_default() {
        let read_only = RoomSpec {
            read_only: true,
            ..RoomSpec::default()
        };
        let levels = desired_levels(&baseline(), &HashMap::new(), &read_only);
        assert_eq!(levels.events_default, STEWARD_LEVEL);

        let mods_only = RoomSpec {
            moderators_only: true,
            ..RoomSpec::default()
        };
        let levels = desired_levels(&baseline(), &HashMap::new(), &mods_only);
        assert_eq!(levels.events_default, MODERATOR_LEVEL);
    }

    #[test]
    fn moderators_excludes_the_steward() {
        let mut levels = baseline();
        levels.users.insert(UserId::from("@mod:x"), 50);
        levels.users.insert(UserId::from("@guest:x"), 0);
        assert_eq!(moderators_of(&levels), vec![UserId::from("@mod:x")]);
    }
}
