// SPDX-License-Identifier: GPL-3.0-or-later
//! Stall and slow-speed rule evaluation.

use std::sync::Arc;

use moka::sync::Cache;
use sweeparr_config::{SlowRule, StallRule, TorrentPrivacy};
use sweeparr_domain::{DeleteReason, StrikeType};
use tracing::debug;

use crate::download_clients::TorrentItem;
use crate::strikes::StrikeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleOutcome {
    pub matched: bool,
    pub reason: DeleteReason,
    pub delete_from_client: bool,
}

impl RuleOutcome {
    pub fn matched(reason: DeleteReason, delete_from_client: bool) -> Self {
        Self {
            matched: true,
            reason,
            delete_from_client,
        }
    }

    pub fn not_matched() -> Self {
        Self::default()
    }
}

pub trait RuleEvaluator: Send + Sync {
    fn evaluate_slow_rules(&self, item: &dyn TorrentItem) -> RuleOutcome;
    fn evaluate_stall_rules(&self, item: &dyn TorrentItem) -> RuleOutcome;
}

/// Applies the first enabled rule whose privacy and completion window fit the item.
pub struct RuleEngine {
    stall_rules: Vec<StallRule>,
    slow_rules: Vec<SlowRule>,
    strikes: Arc<StrikeTracker>,
    // Downloaded bytes at the previous stall observation, by lower-cased hash.
    last_downloaded: Cache<String, u64>,
}

impl RuleEngine {
    pub fn new(
        stall_rules: Vec<StallRule>,
        slow_rules: Vec<SlowRule>,
        strikes: Arc<StrikeTracker>,
    ) -> Self {
        Self {
            stall_rules,
            slow_rules,
            strikes,
            last_downloaded: Cache::new(100_000),
        }
    }

    fn made_progress(&self, item: &dyn TorrentItem) -> bool {
        let key = item.hash().to_lowercase();
        let current = item.downloaded_bytes();
        let previous = self.last_downloaded.get(&key);
        self.last_downloaded.insert(key, current);
        previous.is_some_and(|previous| current > previous)
    }
}

fn applies(
    enabled: bool,
    privacy: TorrentPrivacy,
    min_completion: f64,
    max_completion: f64,
    item: &dyn TorrentItem,
) -> bool {
    let completion = item.completion_percentage();
    enabled
        && privacy.matches(item.is_private())
        && completion >= min_completion
        && completion <= max_completion
}

fn delete_from_client(item: &dyn TorrentItem, delete_private: bool) -> bool {
    !item.is_private() || delete_private
}

impl RuleEvaluator for RuleEngine {
    fn evaluate_slow_rules(&self, item: &dyn TorrentItem) -> RuleOutcome {
        let Some(rule) = self.slow_rules.iter().find(|rule| {
            applies(
                rule.enabled,
                rule.privacy,
                rule.min_completion_percentage,
                rule.max_completion_percentage,
                item,
            )
        }) else {
            return RuleOutcome::not_matched();
        };

        if rule.max_strikes == 0 {
            return RuleOutcome::not_matched();
        }

        if rule
            .ignore_above_size_bytes
            .is_some_and(|limit| item.size() > limit)
        {
            debug!(target: "rules", hash = item.hash(), rule = %rule.name, "download above size limit");
            return RuleOutcome::not_matched();
        }

        let too_slow = rule.min_speed_bytes > 0 && item.download_speed() < rule.min_speed_bytes;
        let too_long = rule.max_time_hours > 0.0
            && item.eta() > 0
            && item.eta() as f64 > rule.max_time_hours * 3600.0;

        if !too_slow && !too_long {
            return RuleOutcome::not_matched();
        }

        if self
            .strikes
            .strike(item.hash(), item.name(), StrikeType::SlowSpeed, rule.max_strikes)
        {
            return RuleOutcome::matched(
                DeleteReason::SlowSpeed,
                delete_from_client(item, rule.delete_private_torrents_from_client),
            );
        }

        RuleOutcome::not_matched()
    }

    fn evaluate_stall_rules(&self, item: &dyn TorrentItem) -> RuleOutcome {
        let Some(rule) = self.stall_rules.iter().find(|rule| {
            applies(
                rule.enabled,
                rule.privacy,
                rule.min_completion_percentage,
                rule.max_completion_percentage,
                item,
            )
        }) else {
            return RuleOutcome::not_matched();
        };

        if rule.max_strikes == 0 {
            return RuleOutcome::not_matched();
        }

        if rule.reset_strikes_on_progress && self.made_progress(item) {
            debug!(target: "rules", hash = item.hash(), rule = %rule.name, "progress made, clearing stall strikes");
            self.strikes.reset(item.hash(), StrikeType::Stalled);
            return RuleOutcome::not_matched();
        }

        if self
            .strikes
            .strike(item.hash(), item.name(), StrikeType::Stalled, rule.max_strikes)
        {
            return RuleOutcome::matched(
                DeleteReason::Stalled,
                delete_from_client(item, rule.delete_private_torrents_from_client),
            );
        }

        RuleOutcome::not_matched()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download_clients::testing::FakeItem;

    fn engine(stall: Vec<StallRule>, slow: Vec<SlowRule>) -> (RuleEngine, Arc<StrikeTracker>) {
        let strikes = Arc::new(StrikeTracker::new());
        (RuleEngine::new(stall, slow, strikes.clone()), strikes)
    }

    fn stalled(hash: &str, downloaded: u64) -> FakeItem {
        FakeItem {
            size: 1000,
            downloaded,
            downloading: true,
            stalled: true,
            ..FakeItem::new(hash, "tv")
        }
    }

    #[test]
    fn stall_rule_fires_after_max_strikes() {
        let (engine, _) = engine(
            vec![StallRule {
                max_strikes: 2,
                reset_strikes_on_progress: false,
                ..StallRule::default()
            }],
            vec![],
        );
        let item = stalled("abc", 100);

        assert!(!engine.evaluate_stall_rules(&item).matched);
        let outcome = engine.evaluate_stall_rules(&item);
        assert!(outcome.matched);
        assert_eq!(outcome.reason, DeleteReason::Stalled);
        assert!(outcome.delete_from_client);
    }

    #[test]
    fn progress_resets_stall_strikes() {
        let (engine, strikes) = engine(
            vec![StallRule {
                max_strikes: 3,
                ..StallRule::default()
            }],
            vec![],
        );

        engine.evaluate_stall_rules(&stalled("abc", 100));
        engine.evaluate_stall_rules(&stalled("abc", 100));
        assert_eq!(strikes.count("abc", StrikeType::Stalled), 2);

        assert!(!engine.evaluate_stall_rules(&stalled("abc", 150)).matched);
        assert_eq!(strikes.count("abc", StrikeType::Stalled), 0);
    }

    #[test]
    fn first_matching_rule_wins_by_privacy_and_completion() {
        let (engine, _) = engine(
            vec![
                StallRule {
                    name: "private only".into(),
                    privacy: TorrentPrivacy::Private,
                    max_strikes: 1,
                    ..StallRule::default()
                },
                StallRule {
                    name: "late public".into(),
                    privacy: TorrentPrivacy::Public,
                    min_completion_percentage: 50.0,
                    max_strikes: 1,
                    ..StallRule::default()
                },
            ],
            vec![],
        );

        // 10% complete public item matches neither rule.
        assert!(!engine.evaluate_stall_rules(&stalled("early", 100)).matched);
        assert!(engine.evaluate_stall_rules(&stalled("late", 600)).matched);
    }

    #[test]
    fn private_items_stay_in_client_unless_allowed() {
        let (engine, _) = engine(
            vec![StallRule {
                max_strikes: 1,
                ..StallRule::default()
            }],
            vec![],
        );
        let item = FakeItem {
            private: true,
            ..stalled("priv", 10)
        };

        let outcome = engine.evaluate_stall_rules(&item);
        assert!(outcome.matched);
        assert!(!outcome.delete_from_client);
    }

    #[test]
    fn zero_strike_rule_never_matches() {
        let (engine, strikes) = engine(
            vec![StallRule {
                max_strikes: 0,
                ..StallRule::default()
            }],
            vec![],
        );
        assert!(!engine.evaluate_stall_rules(&stalled("abc", 1)).matched);
        assert_eq!(strikes.count("abc", StrikeType::Stalled), 0);
    }

    #[test]
    fn slow_rule_checks_speed_and_size_limit() {
        let (engine, strikes) = engine(
            vec![],
            vec![SlowRule {
                max_strikes: 1,
                min_speed_bytes: 1024,
                ignore_above_size_bytes: Some(10_000),
                ..SlowRule::default()
            }],
        );

        let slow = FakeItem {
            size: 5_000,
            speed: 10,
            downloading: true,
            ..FakeItem::new("slow", "tv")
        };
        let outcome = engine.evaluate_slow_rules(&slow);
        assert!(outcome.matched);
        assert_eq!(outcome.reason, DeleteReason::SlowSpeed);

        let huge = FakeItem {
            size: 50_000,
            ..slow.clone()
        };
        assert!(!engine.evaluate_slow_rules(&huge).matched);

        let fast = FakeItem {
            hash: "fast".into(),
            speed: 4096,
            ..slow
        };
        assert!(!engine.evaluate_slow_rules(&fast).matched);
        assert_eq!(strikes.count("fast", StrikeType::SlowSpeed), 0);
    }

    #[test]
    fn slow_rule_checks_eta() {
        let (engine, _) = engine(
            vec![],
            vec![SlowRule {
                max_strikes: 1,
                max_time_hours: 1.0,
                ..SlowRule::default()
            }],
        );
        let item = FakeItem {
            size: 100,
            speed: 1,
            eta: 7200,
            downloading: true,
            ..FakeItem::new("eta", "tv")
        };
        assert!(engine.evaluate_slow_rules(&item).matched);
    }
}
