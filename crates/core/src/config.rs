//! Environment-driven tunables.
//!
//! Every variable is required: a deployment that forgets one fails at
//! startup instead of silently running with a default that may not suit it.

use std::time::Duration;

use crate::error::{Error, Result};

/// Externally configured operating parameters.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Remote call budget for the default lane, in calls per second.
    pub calls_per_second: f64,
    /// Fixed cooldown observed before every room-creation call.
    pub room_creation_cooldown: Duration,
    /// Interval between periodic reconciliation passes.
    pub reconcile_period: Duration,
    /// Delay before a space-invite nudge re-check.
    pub nudge_delay: Duration,
}

impl Tunables {
    /// Build tunables directly. Rejects a non-positive call budget.
    pub fn new(
        calls_per_second: f64,
        room_creation_cooldown: Duration,
        reconcile_period: Duration,
        nudge_delay: Duration,
    ) -> Result<Self> {
        if calls_per_second <= 0.0 {
            return Err(Error::config("calls_per_second must be positive"));
        }
        Ok(Self {
            calls_per_second,
            room_creation_cooldown,
            reconcile_period,
            nudge_delay,
        })
    }

    /// Load all tunables from the environment. Missing or malformed
    /// variables are fatal.
    pub fn from_env() -> Result<Self> {
        Self::new(
            required_f64("CONCIERGE_CALLS_PER_SECOND")?,
            Duration::from_millis(required_u64("CONCIERGE_ROOM_CREATION_COOLDOWN_MS")?),
            Duration::from_secs(required_u64("CONCIERGE_RECONCILE_PERIOD_SECS")?),
            Duration::from_secs(required_u64("CONCIERGE_NUDGE_DELAY_SECS")?),
        )
    }

    /// Minimum spacing between calls on the default lane.
    pub fn min_call_spacing(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.calls_per_second)
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::config(format!("missing environment variable {name}")))
}

fn required_u64(name: &str) -> Result<u64> {
    required(name)?
        .parse()
        .map_err(|e| Error::config(format!("invalid {name}: {e}")))
}

fn required_f64(name: &str) -> Result<f64> {
    required(name)?
        .parse()
        .map_err(|e| Error::config(format!("invalid {name}: {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn spacing_derives_from_budget() {
        let t = Tunables::new(
            4.0,
            Duration::from_millis(500),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(t.min_call_spacing(), Duration::from_millis(250));
    }

    #[test]
    fn zero_budget_is_rejected() {
        let t = Tunables::new(
            0.0,
            Duration::ZERO,
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        assert!(t.is_err());
    }

    #[test]
    fn missing_variable_is_fatal() {
        std::env::remove_var("CONCIERGE_CALLS_PER_SECOND");
        assert!(Tunables::from_env().is_err());
    }
}
