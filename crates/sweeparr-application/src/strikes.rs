// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::Mutex;
use std::time::Duration;

use moka::sync::Cache;
use sweeparr_domain::StrikeType;
use tracing::{debug, info};

/// Strikes for a download that stops being observed are forgotten after this long.
const STRIKE_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

type StrikeKey = (String, StrikeType);

/// Per-download, per-type strike counters.
///
/// Hashes are compared case-insensitively because clients disagree on casing.
pub struct StrikeTracker {
    counters: Cache<StrikeKey, u16>,
    // Serialises read-modify-write on counters.
    guard: Mutex<()>,
}

impl StrikeTracker {
    pub fn new() -> Self {
        Self {
            counters: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(STRIKE_IDLE_TTL)
                .build(),
            guard: Mutex::new(()),
        }
    }

    /// Record one strike. Returns true once `max_strikes` is reached, clearing the counter.
    ///
    /// A `max_strikes` of zero disables the strike type and never counts.
    pub fn strike(&self, hash: &str, name: &str, strike_type: StrikeType, max_strikes: u16) -> bool {
        if max_strikes == 0 {
            return false;
        }

        let key = key(hash, strike_type);
        let _lock = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let count = self.counters.get(&key).unwrap_or(0).saturating_add(1);
        if count >= max_strikes {
            self.counters.invalidate(&key);
            info!(
                target: "strikes",
                hash,
                name,
                strike_type = %strike_type,
                count,
                max_strikes,
                "strike limit reached"
            );
            return true;
        }

        self.counters.insert(key, count);
        debug!(
            target: "strikes",
            hash,
            name,
            strike_type = %strike_type,
            count,
            max_strikes,
            "strike recorded"
        );
        false
    }

    pub fn reset(&self, hash: &str, strike_type: StrikeType) {
        self.counters.invalidate(&key(hash, strike_type));
    }

    pub fn count(&self, hash: &str, strike_type: StrikeType) -> u16 {
        self.counters.get(&key(hash, strike_type)).unwrap_or(0)
    }
}

impl Default for StrikeTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn key(hash: &str, strike_type: StrikeType) -> StrikeKey {
    (hash.to_lowercase(), strike_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaching_threshold_reports_and_clears() {
        let tracker = StrikeTracker::new();

        assert!(!tracker.strike("ABC", "n", StrikeType::Stalled, 3));
        assert!(!tracker.strike("abc", "n", StrikeType::Stalled, 3));
        assert_eq!(tracker.count("aBc", StrikeType::Stalled), 2);

        assert!(tracker.strike("abc", "n", StrikeType::Stalled, 3));
        assert_eq!(tracker.count("abc", StrikeType::Stalled), 0);
    }

    #[test]
    fn zero_max_never_counts() {
        let tracker = StrikeTracker::new();
        for _ in 0..5 {
            assert!(!tracker.strike("abc", "n", StrikeType::SlowSpeed, 0));
        }
        assert_eq!(tracker.count("abc", StrikeType::SlowSpeed), 0);
    }

    #[test]
    fn types_are_counted_separately() {
        let tracker = StrikeTracker::new();
        tracker.strike("abc", "n", StrikeType::Stalled, 5);
        tracker.strike("abc", "n", StrikeType::SlowSpeed, 5);
        tracker.strike("abc", "n", StrikeType::SlowSpeed, 5);

        assert_eq!(tracker.count("abc", StrikeType::Stalled), 1);
        assert_eq!(tracker.count("abc", StrikeType::SlowSpeed), 2);

        tracker.reset("ABC", StrikeType::SlowSpeed);
        assert_eq!(tracker.count("abc", StrikeType::SlowSpeed), 0);
        assert_eq!(tracker.count("abc", StrikeType::Stalled), 1);
    }

    #[test]
    fn single_strike_limit_fires_immediately() {
        let tracker = StrikeTracker::new();
        assert!(tracker.strike("abc", "n", StrikeType::FailedImport, 1));
    }
}
