//! Plan loading and load-time validation.
//!
//! Schema violations and invariant breaches are fatal here, before any
//! reconciliation runs against the remote system.

use std::path::Path;

use concierge_core::UserId;

use crate::error::{Error, Result};
use crate::types::{Children, Plan, RoomSpec, STEWARD_LEVEL};

/// Bound on avatar alias chains. The map is small; anything deeper is a cycle.
const MAX_AVATAR_HOPS: usize = 16;

impl Plan {
    /// Parse and validate a plan document.
    pub fn from_yaml(document: &str) -> Result<Self> {
        let plan: Self = serde_yaml::from_str(document)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Read, parse, and validate a plan document from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        Self::from_yaml(&document)
    }

    /// Resolve a symbolic avatar name to its media reference, following
    /// name-to-name aliases. `None` if the name is unknown.
    pub fn resolve_avatar(&self, name: &str) -> Result<Option<&str>> {
        let mut current = name;
        for _ in 0..MAX_AVATAR_HOPS {
            match self.avatars.get(current) {
                Some(value) if self.avatars.contains_key(value.as_str()) => {
                    current = value;
                }
                Some(value) => return Ok(Some(value)),
                None if current == name => return Ok(None),
                None => {
                    return Err(Error::validation(format!(
                        "avatar '{name}' aliases unknown name '{current}'"
                    )))
                }
            }
        }
        Err(Error::validation(format!(
            "avatar '{name}' alias chain exceeds {MAX_AVATAR_HOPS} hops (cycle?)"
        )))
    }

    fn validate(&self) -> Result<()> {
        self.validate_steward_level()?;
        if let Some(avatar) = &self.steward.avatar {
            if self.resolve_avatar(avatar)?.is_none() {
                return Err(Error::validation(format!(
                    "steward references unknown avatar '{avatar}'"
                )));
            }
        }
        for (local_name, spec) in &self.rooms {
            self.validate_room(local_name, spec)?;
        }
        if let Some(rules) = &self.inherit_user_power_levels {
            for rule in rules.values() {
                if rule.raise_to >= STEWARD_LEVEL {
                    return Err(Error::validation(format!(
                        "inherited power level floor {} would reach the steward level",
                        rule.raise_to
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_steward_level(&self) -> Result<()> {
        let steward: &UserId = &self.steward.id;
        if self.power_levels.level_of(steward) != STEWARD_LEVEL {
            return Err(Error::validation(format!(
                "steward {steward} must resolve to power level {STEWARD_LEVEL} in the baseline"
            )));
        }
        Ok(())
    }

    fn validate_room(&self, local_name: &str, spec: &RoomSpec) -> Result<()> {
        if let Some(avatar) = &spec.avatar {
            if self.resolve_avatar(avatar)?.is_none() {
                return Err(Error::validation(format!(
                    "room '{local_name}' references unknown avatar '{avatar}'"
                )));
            }
        }
        if spec.destroy && spec.children.is_some() {
            return Err(Error::validation(format!(
                "room '{local_name}' cannot both destroy and declare children"
            )));
        }
        if let Some(Children::Nested(children)) = &spec.children {
            for (child_name, child) in children {
                self.validate_room(child_name, child)?;
            }
        }
        Ok(())
    }
}
