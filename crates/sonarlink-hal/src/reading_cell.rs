//! [`ReadingCell`] – per-sensor cache written by the bridge, read by the poll
//! loop.
//!
//! There is exactly one writer (the bridge delivery path) and one reader (the
//! poll cycle).  The record is two independent atomics rather than a locked
//! struct so neither side can ever block the other:
//!
//! * the writer stores the timestamp first, then publishes the distance with
//!   `Release`;
//! * the reader loads the distance with `Acquire`, then the timestamp.
//!
//! A load racing a store may pair the newest distance with a timestamp that
//! is newer still (the next store's).  The distance itself is never torn.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::DateTime;
use sonarlink_types::{Reading, SENTINEL_DISTANCE_CM, SonarPayload};

const NEVER_OBSERVED: i64 = i64::MIN;

#[derive(Debug)]
pub struct ReadingCell {
    distance_cm: AtomicU32,
    observed_at_ms: AtomicI64,
}

impl Default for ReadingCell {
    fn default() -> Self {
        Self {
            distance_cm: AtomicU32::new(SENTINEL_DISTANCE_CM),
            observed_at_ms: AtomicI64::new(NEVER_OBSERVED),
        }
    }
}

impl ReadingCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached reading with `payload`.  No range validation.
    pub fn store(&self, payload: &SonarPayload) {
        self.observed_at_ms
            .store(payload.timestamp.timestamp_millis(), Ordering::Relaxed);
        self.distance_cm.store(payload.distance_cm, Ordering::Release);
    }

    /// Cached distance; the sentinel until the first store.
    pub fn distance_cm(&self) -> u32 {
        self.distance_cm.load(Ordering::Acquire)
    }

    /// Full cached record.
    pub fn load(&self) -> Reading {
        let distance_cm = self.distance_cm.load(Ordering::Acquire);
        let observed_at = match self.observed_at_ms.load(Ordering::Relaxed) {
            NEVER_OBSERVED => None,
            ms => DateTime::from_timestamp_millis(ms),
        };
        Reading {
            distance_cm,
            observed_at,
        }
    }
}
