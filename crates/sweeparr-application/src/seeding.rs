// SPDX-License-Identifier: GPL-3.0-or-later
use sweeparr_config::SeedingRule;
use sweeparr_domain::CleanReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanDecision {
    BelowMinSeedTime,
    WithinLimits,
    Clean(CleanReason),
}

/// Decide whether a seeding download has met its category's limits.
///
/// Seed times in `rule` are minutes; negative maxima never trigger.
pub fn evaluate_seeding_rule(
    rule: &SeedingRule,
    ratio: f64,
    seeding_time_seconds: i64,
) -> CleanDecision {
    let seeded_minutes = seeding_time_seconds.max(0) as f64 / 60.0;

    if rule.min_seed_time > 0.0 && seeded_minutes < rule.min_seed_time {
        return CleanDecision::BelowMinSeedTime;
    }

    if rule.max_ratio >= 0.0 && ratio >= rule.max_ratio {
        return CleanDecision::Clean(CleanReason::MaxRatioReached);
    }

    if rule.max_seed_time >= 0.0 && seeded_minutes >= rule.max_seed_time {
        return CleanDecision::Clean(CleanReason::MaxSeedTimeReached);
    }

    CleanDecision::WithinLimits
}
