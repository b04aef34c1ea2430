//! Injected time source.
//!
//! Every timestamp the repositories write and every staleness comparison they
//! make goes through [`Clock`]. Production code installs [`SystemClock`];
//! tests install a [`ManualClock`] and advance it explicitly, which makes the
//! claim-for-check window deterministic.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Trait for clock implementations.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock that reads the real wall clock.
///
/// This is the default clock for production use and the only place in the
/// crate that touches a wall-clock API.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mutable clock for tests.
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// a repository and keep another to advance time:
///
/// ```rust
/// use chrono::{Duration, Utc};
/// use slipway_core::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(Utc::now());
/// let observer = clock.clone();
/// clock.advance(Duration::hours(1));
/// assert_eq!(observer.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    instant: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given instant.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            instant: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock to the given instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self
            .instant
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = instant;
    }

    /// Advances the clock by the given delta.
    pub fn advance(&self, delta: Duration) {
        let mut guard = self
            .instant
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .instant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(30));
        assert_eq!(clock.now(), start + Duration::minutes(30));
    }

    #[test]
    fn test_manual_clock_clones_share_the_instant() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let observer = clock.clone();

        clock.set(start + Duration::hours(2));
        assert_eq!(observer.now(), start + Duration::hours(2));
    }
}
