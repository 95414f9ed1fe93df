//! Generic delayed-task scheduling: run a task at time T, cancelable and
//! reschedulable, keyed so re-arming replaces instead of stacking.

pub mod clock;
pub mod error;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use scheduler::{Scheduler, TaskKey, TaskKind, MAX_TIMER_DELAY};
