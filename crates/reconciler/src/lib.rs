//! Reconciliation control loop.
//!
//! Converges the remote room graph onto a declarative plan: rooms and
//! spaces are created, converged, or decommissioned; session rooms are
//! derived from an external schedule; and per-room timers handle session
//! group transitions between full passes.

pub mod diff;
pub mod invites;
pub mod notices;
pub mod power_levels;
pub mod reconciler;
pub mod rooms;
pub mod sessions;
pub mod spaces;
pub mod types;

pub use diff::{diff, Change};
pub use reconciler::Reconciler;
pub use sessions::{ScheduleFeed, Talk};
pub use types::{ChildRecord, ListedSpace, Room, Session};
