//! Call admission lanes.
//!
//! The default lane admits one in-flight call at a time with a minimum
//! spacing between call starts. The creation lane is also serial but waits
//! a fixed cooldown before every call, working around a server race where a
//! just-created room's state is not immediately consistent. The unlimited
//! lane exists for the long-poll sync call, which blocks server-side for
//! tens of seconds and must not starve the others.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// Which admission discipline a call goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Serial, paced by the configured calls-per-second budget.
    Default,
    /// No pacing. Long-poll sync only.
    Unlimited,
    /// Serial, fixed cooldown before each call. Room creation only.
    Creation,
}

/// Holds a lane for the duration of one call.
pub struct LanePermit<'a> {
    _guard: Option<MutexGuard<'a, Pacing>>,
}

#[derive(Debug)]
struct Pacing {
    last_admitted: Option<Instant>,
}

/// Lane-per-discipline rate limiter.
pub struct RateLimiter {
    default_lane: Mutex<Pacing>,
    min_spacing: Duration,
    creation_lane: Mutex<Pacing>,
    creation_cooldown: Duration,
}

impl RateLimiter {
    /// Create a limiter with the given default-lane spacing and
    /// creation-lane cooldown.
    pub fn new(min_spacing: Duration, creation_cooldown: Duration) -> Self {
        Self {
            default_lane: Mutex::new(Pacing {
                last_admitted: None,
            }),
            min_spacing,
            creation_lane: Mutex::new(Pacing {
                last_admitted: None,
            }),
            creation_cooldown,
        }
    }

    /// Wait until the lane admits a call. The returned permit must be held
    /// for the duration of the call so the lane stays concurrency-1.
    pub async fn admit(&self, lane: Lane) -> LanePermit<'_> {
        match lane {
            Lane::Unlimited => LanePermit { _guard: None },
            Lane::Default => {
                let mut pacing = self.default_lane.lock().await;
                if let Some(last) = pacing.last_admitted {
                    let elapsed = last.elapsed();
                    if elapsed < self.min_spacing {
                        tokio::time::sleep(self.min_spacing - elapsed).await;
                    }
                }
                pacing.last_admitted = Some(Instant::now());
                LanePermit {
                    _guard: Some(pacing),
                }
            }
            Lane::Creation => {
                let mut pacing = self.creation_lane.lock().await;
                tokio::time::sleep(self.creation_cooldown).await;
                pacing.last_admitted = Some(Instant::now());
                LanePermit {
                    _guard: Some(pacing),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use super::*;

    #[tokio::test]
    async fn default_lane_spaces_calls() {
        let limiter = RateLimiter::new(Duration::from_millis(50), Duration::ZERO);

        let start = StdInstant::now();
        for _ in 0..3 {
            let permit = limiter.admit(Lane::Default).await;
            drop(permit);
        }
        // First call is immediate; the next two each wait the spacing.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn unlimited_lane_does_not_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(10));

        let start = StdInstant::now();
        let permit = limiter.admit(Lane::Unlimited).await;
        drop(permit);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn creation_lane_waits_cooldown_every_time() {
        let limiter = RateLimiter::new(Duration::ZERO, Duration::from_millis(40));

        let start = StdInstant::now();
        drop(limiter.admit(Lane::Creation).await);
        drop(limiter.admit(Lane::Creation).await);
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn lane_is_concurrency_one() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(10), Duration::ZERO));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let permit = limiter.admit(Lane::Default).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.ok();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
