//! The plan: an immutable, validated desired-state document for rooms,
//! spaces, sessions, and power levels, loaded once at startup.

pub mod error;
pub mod loader;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    AliasProxy, Children, InheritRule, Plan, PowerLevels, RoomSpec, SessionGroup, SessionsSpec,
    StewardSpec, TalkOverride, WidgetSpec, INHERIT_CAP, MODERATOR_LEVEL, STEWARD_LEVEL,
};
