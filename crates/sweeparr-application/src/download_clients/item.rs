// SPDX-License-Identifier: GPL-3.0-or-later
use std::fmt;

use url::Url;

/// Client-independent view over one torrent.
///
/// Every adapter wraps its native response type and implements this trait.
/// Wrappers are built per API response and never persisted. String getters
/// return `""` when the client omitted the value.
pub trait TorrentItem: Send + Sync + fmt::Debug {
    fn hash(&self) -> &str;
    fn name(&self) -> &str;
    fn category(&self) -> &str;
    /// Writes the category back into the wrapped native value.
    fn set_category(&mut self, category: &str);
    fn save_path(&self) -> &str;
    fn trackers(&self) -> &[String];
    fn is_private(&self) -> bool;
    fn size(&self) -> u64;
    fn downloaded_bytes(&self) -> u64;
    fn download_speed(&self) -> u64;
    fn eta(&self) -> i64;
    fn ratio(&self) -> f64;
    fn seeding_time_seconds(&self) -> i64;

    fn is_downloading(&self) -> bool;
    fn is_stalled(&self) -> bool;
    fn is_seeding(&self) -> bool;
    fn is_metadata_downloading(&self) -> bool;

    fn clone_box(&self) -> Box<dyn TorrentItem>;

    fn tags(&self) -> &[String] {
        &[]
    }

    /// Records a tag applied on the client. Clients without tags ignore it.
    fn add_tag(&mut self, _tag: &str) {}

    fn completion_percentage(&self) -> f64 {
        completion_percentage(self.downloaded_bytes(), self.size())
    }

    /// True when the hash, category or a tag equals, or a tracker host contains,
    /// one of `patterns`. Comparison ignores case.
    fn is_ignored(&self, patterns: &[String]) -> bool {
        patterns.iter().any(|pattern| {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                return false;
            }

            self.hash().eq_ignore_ascii_case(pattern)
                || self.category().eq_ignore_ascii_case(pattern)
                || self.tags().iter().any(|tag| tag.eq_ignore_ascii_case(pattern))
                || self
                    .trackers()
                    .iter()
                    .any(|tracker| tracker_host(tracker).contains(&pattern.to_lowercase()))
        })
    }
}

impl Clone for Box<dyn TorrentItem> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

pub fn completion_percentage(downloaded: u64, size: u64) -> f64 {
    if size == 0 {
        return 0.0;
    }
    downloaded as f64 / size as f64 * 100.0
}

/// Lower-cased host of a tracker announce URL, or the raw value when it does not parse.
pub fn tracker_host(tracker: &str) -> String {
    Url::parse(tracker)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| tracker.to_string())
        .to_lowercase()
}
