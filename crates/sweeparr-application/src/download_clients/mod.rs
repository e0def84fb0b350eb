// SPDX-License-Identifier: GPL-3.0-or-later
//! Torrent client adapters and the cleanup contract they share.
//!
//! Each protocol module implements the plumbing methods of [`DownloadService`]
//! (fetching items and files, deleting, categorising). The decision logic
//! lives in the trait's provided methods so every client is judged the same way.

pub mod deluge;
pub mod error;
pub mod factory;
pub mod item;
pub mod qbittorrent;
pub mod rtorrent;
pub mod transmission;
pub mod utorrent;
pub mod xmlrpc;

use std::sync::Arc;

use async_trait::async_trait;
use sweeparr_config::{DownloadCleanerConfig, QueueCleanerConfig, SeedingRule};
use sweeparr_domain::{
    CleanupEventPayload, DeleteReason, DomainEvent, DownloadCheckResult, StrikeType,
};
use tracing::{debug, info, warn};

use crate::events::EventPublisher;
use crate::hardlinks::{check_hard_links, HardLinkFileService, LinkCheck};
use crate::rules::RuleEvaluator;
use crate::seeding::{evaluate_seeding_rule, CleanDecision};
use crate::strikes::StrikeTracker;

pub use error::DownloadClientError;
pub use factory::{DownloadClientKind, DownloadServiceFactory, FactoryError};
pub use item::TorrentItem;

/// A file inside a torrent. `path` is relative to the item's save path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: String,
    pub size: u64,
    pub selection: FileSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSelection {
    Wanted,
    /// Deselected by the user.
    Unwanted,
    /// Skipped by the client on its own (qBittorrent excluded-file rules).
    SkippedByClient,
}

/// Collaborators and configuration shared by every adapter instance.
pub struct ServiceContext {
    pub queue_cleaner: QueueCleanerConfig,
    pub download_cleaner: DownloadCleanerConfig,
    pub strikes: Arc<StrikeTracker>,
    pub rules: Arc<dyn RuleEvaluator>,
    pub hard_links: Arc<dyn HardLinkFileService>,
    pub events: Arc<dyn EventPublisher>,
}

#[async_trait]
pub trait DownloadService: Send + Sync {
    /// Configured name of the client instance, used in logs and events.
    fn name(&self) -> &str;

    fn context(&self) -> &ServiceContext;

    fn supports_tags(&self) -> bool {
        false
    }

    async fn get_item(
        &self,
        hash: &str,
    ) -> Result<Option<Box<dyn TorrentItem>>, DownloadClientError>;

    /// Items in a seeding or completed state, exactly as the client reports them.
    async fn list_seeding(&self) -> Result<Vec<Box<dyn TorrentItem>>, DownloadClientError>;

    async fn get_files(
        &self,
        item: &dyn TorrentItem,
    ) -> Result<Vec<TorrentFile>, DownloadClientError>;

    /// Removing a hash the client does not know is not an error.
    async fn delete_download(
        &self,
        hash: &str,
        delete_source_files: bool,
    ) -> Result<(), DownloadClientError>;

    async fn create_category(&self, name: &str) -> Result<(), DownloadClientError>;

    /// Moves `item` to `category` (or tags it) on the client and mirrors the change locally.
    async fn apply_unlinked_category(
        &self,
        item: &mut dyn TorrentItem,
        category: &str,
    ) -> Result<(), DownloadClientError>;

    async fn get_seeding_downloads(
        &self,
    ) -> Result<Vec<Box<dyn TorrentItem>>, DownloadClientError> {
        let items = self.list_seeding().await?;
        Ok(items
            .into_iter()
            .filter(|item| !item.hash().is_empty())
            .collect())
    }

    fn filter_downloads_to_be_cleaned(
        &self,
        items: &[Box<dyn TorrentItem>],
        rules: &[SeedingRule],
    ) -> Vec<Box<dyn TorrentItem>> {
        filter_by_category(items, rules.iter().map(|rule| rule.name.as_str()))
    }

    fn filter_downloads_to_change_category(
        &self,
        items: &[Box<dyn TorrentItem>],
        categories: &[String],
    ) -> Vec<Box<dyn TorrentItem>> {
        let unlinked = &self.context().download_cleaner.unlinked;
        let tag_mode = unlinked.use_tag && self.supports_tags();

        filter_by_category(items, categories.iter().map(String::as_str))
            .into_iter()
            .filter(|item| {
                !tag_mode
                    || !item
                        .tags()
                        .iter()
                        .any(|tag| tag.eq_ignore_ascii_case(&unlinked.target_category))
            })
            .collect()
    }

    async fn should_remove_from_arr_queue(
        &self,
        hash: &str,
        ignored_patterns: &[String],
    ) -> Result<DownloadCheckResult, DownloadClientError> {
        let Some(item) = self.get_item(hash).await? else {
            debug!(target: "download_client", client = self.name(), hash, "download not found");
            return Ok(DownloadCheckResult::not_found());
        };

        if item.is_ignored(ignored_patterns) {
            info!(target: "download_client", client = self.name(), hash, name = item.name(), "download is ignored");
            return Ok(DownloadCheckResult::keep(item.is_private()));
        }

        let files = match self.get_files(item.as_ref()).await {
            Ok(files) => files,
            Err(err) => {
                warn!(
                    target: "download_client",
                    client = self.name(),
                    hash,
                    error = %err,
                    "failed to list files, keeping download"
                );
                return Ok(DownloadCheckResult::keep(item.is_private()));
            }
        };

        Ok(evaluate_queue_item(
            self.name(),
            self.context(),
            item.as_ref(),
            &files,
        ))
    }

    /// Deletes items past their seeding limits and returns the hashes that were removed.
    async fn clean_downloads(
        &self,
        items: Vec<Box<dyn TorrentItem>>,
        rules: &[SeedingRule],
    ) -> Result<Vec<String>, DownloadClientError> {
        let cleaner = &self.context().download_cleaner;
        let mut cleaned = Vec::new();

        for item in items {
            if item.is_ignored(&cleaner.ignored_downloads) {
                debug!(target: "download_cleaner", client = self.name(), hash = item.hash(), "download is ignored");
                continue;
            }

            let Some(rule) = rules
                .iter()
                .find(|rule| rule.name.eq_ignore_ascii_case(item.category()))
            else {
                continue;
            };

            if item.is_private() && !cleaner.delete_private {
                debug!(target: "download_cleaner", client = self.name(), hash = item.hash(), "skipping private download");
                continue;
            }

            let reason = match evaluate_seeding_rule(rule, item.ratio(), item.seeding_time_seconds()) {
                CleanDecision::Clean(reason) => reason,
                decision => {
                    debug!(target: "download_cleaner", client = self.name(), hash = item.hash(), ?decision, "download kept");
                    continue;
                }
            };

            if let Err(err) = self
                .delete_download(item.hash(), rule.delete_source_files)
                .await
            {
                warn!(
                    target: "download_cleaner",
                    client = self.name(),
                    hash = item.hash(),
                    error = %err,
                    "failed to clean download"
                );
                continue;
            }

            info!(
                target: "download_cleaner",
                client = self.name(),
                hash = item.hash(),
                name = item.name(),
                %reason,
                "download cleaned"
            );

            self.context().events.publish(&DomainEvent::new(
                "download.cleaned",
                CleanupEventPayload::DownloadCleaned {
                    client: self.name().to_string(),
                    hash: item.hash().to_string(),
                    name: item.name().to_string(),
                    category: item.category().to_string(),
                    reason,
                    delete_source_files: rule.delete_source_files,
                },
            ));
            cleaned.push(item.hash().to_string());
        }

        Ok(cleaned)
    }

    /// Recategorise items whose files are no longer hardlinked anywhere else.
    ///
    /// Counts for ignored root directories must already be populated.
    async fn change_category_for_no_hard_links(
        &self,
        items: Vec<Box<dyn TorrentItem>>,
    ) -> Result<(), DownloadClientError> {
        let context = self.context();
        let unlinked = &context.download_cleaner.unlinked;
        let ignore_root_dirs = !unlinked.ignored_root_dirs.is_empty();
        let is_tag = unlinked.use_tag && self.supports_tags();

        for mut item in items {
            if item.hash().is_empty() || item.name().is_empty() || item.category().is_empty() {
                continue;
            }

            if item.is_ignored(&context.download_cleaner.ignored_downloads) {
                debug!(target: "download_cleaner", client = self.name(), hash = item.hash(), "download is ignored");
                continue;
            }

            let files = match self.get_files(item.as_ref()).await {
                Ok(files) => files,
                Err(err) => {
                    warn!(
                        target: "download_cleaner",
                        client = self.name(),
                        hash = item.hash(),
                        error = %err,
                        "failed to list files, skipping hardlink check"
                    );
                    continue;
                }
            };

            match check_hard_links(
                context.hard_links.as_ref(),
                item.save_path(),
                &files,
                ignore_root_dirs,
            ) {
                LinkCheck::Orphaned => {}
                LinkCheck::Linked { path } => {
                    debug!(target: "download_cleaner", client = self.name(), hash = item.hash(), path = %path.display(), "download still hardlinked");
                    continue;
                }
                LinkCheck::Missing { path } => {
                    info!(target: "download_cleaner", client = self.name(), hash = item.hash(), path = %path.display(), "file not found, skipping download");
                    continue;
                }
                LinkCheck::NoFiles => {
                    debug!(target: "download_cleaner", client = self.name(), hash = item.hash(), "no wanted files to check");
                    continue;
                }
            }

            let old_category = item.category().to_string();
            if let Err(err) = self
                .apply_unlinked_category(item.as_mut(), &unlinked.target_category)
                .await
            {
                warn!(
                    target: "download_cleaner",
                    client = self.name(),
                    hash = item.hash(),
                    error = %err,
                    "failed to change category"
                );
                continue;
            }

            info!(
                target: "download_cleaner",
                client = self.name(),
                hash = item.hash(),
                name = item.name(),
                from = %old_category,
                to = %unlinked.target_category,
                is_tag,
                "category changed for unlinked download"
            );

            context.events.publish(&DomainEvent::new(
                "download.category_changed",
                CleanupEventPayload::CategoryChanged {
                    client: self.name().to_string(),
                    hash: item.hash().to_string(),
                    name: item.name().to_string(),
                    old_category,
                    new_category: unlinked.target_category.clone(),
                    is_tag,
                },
            ));
        }

        Ok(())
    }
}

/// Items with a non-empty hash whose category matches one of `names`, ignoring case.
pub fn filter_by_category<'a>(
    items: &[Box<dyn TorrentItem>],
    names: impl Iterator<Item = &'a str>,
) -> Vec<Box<dyn TorrentItem>> {
    let names: Vec<&str> = names.collect();
    items
        .iter()
        .filter(|item| !item.hash().is_empty())
        .filter(|item| {
            names
                .iter()
                .any(|name| name.eq_ignore_ascii_case(item.category()))
        })
        .cloned()
        .collect()
}

/// Steps of the queue check that follow a successful item and file lookup.
pub fn evaluate_queue_item(
    client: &str,
    context: &ServiceContext,
    item: &dyn TorrentItem,
    files: &[TorrentFile],
) -> DownloadCheckResult {
    let is_private = item.is_private();

    if !files.is_empty() {
        if files
            .iter()
            .all(|file| file.selection == FileSelection::SkippedByClient)
        {
            info!(target: "download_client", client, hash = item.hash(), "all files skipped by client");
            return DownloadCheckResult::remove(DeleteReason::AllFilesSkippedByClient, true, is_private);
        }

        if files
            .iter()
            .all(|file| file.selection != FileSelection::Wanted)
        {
            info!(target: "download_client", client, hash = item.hash(), "all files unwanted");
            return DownloadCheckResult::remove(DeleteReason::AllFilesSkipped, true, is_private);
        }
    }

    if item.is_metadata_downloading() {
        let max_strikes = context.queue_cleaner.downloading_metadata_max_strikes;
        if max_strikes > 0
            && context.strikes.strike(
                item.hash(),
                item.name(),
                StrikeType::DownloadingMetadata,
                max_strikes,
            )
        {
            return DownloadCheckResult::remove(DeleteReason::DownloadingMetadata, true, is_private);
        }
        return DownloadCheckResult::keep(is_private);
    }

    if item.is_downloading() && item.download_speed() > 0 {
        if context.queue_cleaner.has_active_slow_rules() {
            let outcome = context.rules.evaluate_slow_rules(item);
            if outcome.matched {
                return DownloadCheckResult::remove(outcome.reason, outcome.delete_from_client, is_private);
            }
        }
        return DownloadCheckResult::keep(is_private);
    }

    if item.is_stalled() && context.queue_cleaner.has_active_stall_rules() {
        let outcome = context.rules.evaluate_stall_rules(item);
        if outcome.matched {
            return DownloadCheckResult::remove(outcome.reason, outcome.delete_from_client, is_private);
        }
    }

    DownloadCheckResult::keep(is_private)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes shared by adapter and job tests.

    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use sweeparr_config::{DownloadCleanerConfig, QueueCleanerConfig};

    use super::{item::TorrentItem, ServiceContext};
    use crate::events::InMemoryEventBus;
    use crate::hardlinks::HardLinkFileService;
    use crate::rules::{RuleEvaluator, RuleOutcome};
    use crate::strikes::StrikeTracker;

    #[derive(Debug, Clone, Default)]
    pub struct FakeItem {
        pub hash: String,
        pub name: String,
        pub category: String,
        pub save_path: String,
        pub trackers: Vec<String>,
        pub tags: Vec<String>,
        pub private: bool,
        pub size: u64,
        pub downloaded: u64,
        pub speed: u64,
        pub eta: i64,
        pub ratio: f64,
        pub seeding_time: i64,
        pub downloading: bool,
        pub stalled: bool,
        pub seeding: bool,
        pub metadata: bool,
    }

    impl FakeItem {
        pub fn new(hash: &str, category: &str) -> Self {
            Self {
                hash: hash.to_string(),
                name: format!("{hash} name"),
                category: category.to_string(),
                save_path: "/downloads".to_string(),
                ..Self::default()
            }
        }

        pub fn boxed(self) -> Box<dyn TorrentItem> {
            Box::new(self)
        }
    }

    impl TorrentItem for FakeItem {
        fn hash(&self) -> &str {
            &self.hash
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn category(&self) -> &str {
            &self.category
        }
        fn set_category(&mut self, category: &str) {
            self.category = category.to_string();
        }
        fn save_path(&self) -> &str {
            &self.save_path
        }
        fn trackers(&self) -> &[String] {
            &self.trackers
        }
        fn tags(&self) -> &[String] {
            &self.tags
        }
        fn is_private(&self) -> bool {
            self.private
        }
        fn size(&self) -> u64 {
            self.size
        }
        fn downloaded_bytes(&self) -> u64 {
            self.downloaded
        }
        fn download_speed(&self) -> u64 {
            self.speed
        }
        fn eta(&self) -> i64 {
            self.eta
        }
        fn ratio(&self) -> f64 {
            self.ratio
        }
        fn seeding_time_seconds(&self) -> i64 {
            self.seeding_time
        }
        fn is_downloading(&self) -> bool {
            self.downloading
        }
        fn is_stalled(&self) -> bool {
            self.stalled
        }
        fn is_seeding(&self) -> bool {
            self.seeding
        }
        fn is_metadata_downloading(&self) -> bool {
            self.metadata
        }
        fn clone_box(&self) -> Box<dyn TorrentItem> {
            Box::new(self.clone())
        }
    }

    /// Rule evaluator returning a fixed outcome and counting calls.
    #[derive(Default)]
    pub struct CountingEvaluator {
        pub slow_calls: AtomicUsize,
        pub stall_calls: AtomicUsize,
        pub outcome: RuleOutcome,
    }

    impl RuleEvaluator for CountingEvaluator {
        fn evaluate_slow_rules(&self, _item: &dyn TorrentItem) -> RuleOutcome {
            self.slow_calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }

        fn evaluate_stall_rules(&self, _item: &dyn TorrentItem) -> RuleOutcome {
            self.stall_calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    /// Hardlink counts looked up by file name; unknown files report one link.
    #[derive(Default)]
    pub struct FakeHardLinks {
        pub counts: Mutex<Vec<(String, i64)>>,
        pub populate_calls: AtomicUsize,
    }

    impl FakeHardLinks {
        pub fn with_counts(counts: &[(&str, i64)]) -> Self {
            Self {
                counts: Mutex::new(
                    counts
                        .iter()
                        .map(|(name, count)| (name.to_string(), *count))
                        .collect(),
                ),
                populate_calls: AtomicUsize::new(0),
            }
        }
    }

    impl HardLinkFileService for FakeHardLinks {
        fn get_hard_link_count(&self, path: &Path, _ignore_root_dirs: bool) -> i64 {
            let counts = self.counts.lock().expect("counts lock");
            counts
                .iter()
                .find(|(name, _)| path.ends_with(name))
                .map(|(_, count)| *count)
                .unwrap_or(1)
        }

        fn populate_file_counts(&self, _dirs: &[std::path::PathBuf]) {
            self.populate_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub struct ContextParts {
        pub queue_cleaner: QueueCleanerConfig,
        pub download_cleaner: DownloadCleanerConfig,
        pub rules: Arc<dyn RuleEvaluator>,
        pub hard_links: Arc<dyn HardLinkFileService>,
        pub events: InMemoryEventBus,
    }

    impl Default for ContextParts {
        fn default() -> Self {
            Self {
                queue_cleaner: QueueCleanerConfig::default(),
                download_cleaner: DownloadCleanerConfig::default(),
                rules: Arc::new(CountingEvaluator::default()),
                hard_links: Arc::new(FakeHardLinks::default()),
                events: InMemoryEventBus::new(),
            }
        }
    }

    impl ContextParts {
        pub fn build(self) -> Arc<ServiceContext> {
            Arc::new(ServiceContext {
                queue_cleaner: self.queue_cleaner,
                download_cleaner: self.download_cleaner,
                strikes: Arc::new(StrikeTracker::new()),
                rules: self.rules,
                hard_links: self.hard_links,
                events: Arc::new(self.events),
            })
        }
    }
}
