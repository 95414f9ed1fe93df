//! Shared foundation for the concierge workspace: identifier newtypes, the
//! remote error taxonomy, and environment-driven tunables.

pub mod config;
pub mod error;
pub mod ids;

pub use config::Tunables;
pub use error::{optional, Error, ErrorClass, Result};
pub use ids::{RoomAlias, RoomId, StateRef, UserId};
