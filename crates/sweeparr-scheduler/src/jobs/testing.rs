// SPDX-License-Identifier: GPL-3.0-or-later
//! Fakes for the cleaner job tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sweeparr_application::{
    ArrClient, ArrError, ArrQueueSource, DownloadClientError, DownloadService, FileSelection,
    HardLinkFileService, LoggingEventPublisher, RemovalError, RemovalSink, RuleEngine,
    ServiceContext, StrikeTracker, TorrentFile, TorrentItem,
};
use sweeparr_config::{ArrInstanceConfig, DownloadCleanerConfig, QueueCleanerConfig};
use sweeparr_domain::{
    DownloadCheckResult, InstanceType, QueuePage, QueueRecord, RemovalRequest, SearchItem,
};

pub fn service_context() -> Arc<ServiceContext> {
    cleaner_context(DownloadCleanerConfig::default())
}

/// Context whose download cleaner settings drive the shared cleanup methods.
pub fn cleaner_context(download_cleaner: DownloadCleanerConfig) -> Arc<ServiceContext> {
    let strikes = Arc::new(StrikeTracker::new());
    Arc::new(ServiceContext {
        queue_cleaner: QueueCleanerConfig::default(),
        download_cleaner,
        strikes: strikes.clone(),
        rules: Arc::new(RuleEngine::new(Vec::new(), Vec::new(), strikes)),
        hard_links: Arc::new(FakeHardLinks::default()),
        events: Arc::new(LoggingEventPublisher),
    })
}

#[derive(Debug, Clone, Default)]
pub struct FakeItem {
    hash: String,
    name: String,
    category: String,
}

impl FakeItem {
    pub fn new(hash: &str, category: &str) -> Self {
        Self {
            hash: hash.to_string(),
            name: hash.to_uppercase(),
            category: category.to_string(),
        }
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
        "/downloads"
    }
    fn trackers(&self) -> &[String] {
        &[]
    }
    fn is_private(&self) -> bool {
        false
    }
    fn size(&self) -> u64 {
        1024
    }
    fn downloaded_bytes(&self) -> u64 {
        1024
    }
    fn download_speed(&self) -> u64 {
        0
    }
    fn eta(&self) -> i64 {
        0
    }
    fn ratio(&self) -> f64 {
        2.0
    }
    fn seeding_time_seconds(&self) -> i64 {
        3600
    }
    fn is_downloading(&self) -> bool {
        false
    }
    fn is_stalled(&self) -> bool {
        false
    }
    fn is_seeding(&self) -> bool {
        true
    }
    fn is_metadata_downloading(&self) -> bool {
        false
    }
    fn clone_box(&self) -> Box<dyn TorrentItem> {
        Box::new(self.clone())
    }
}

#[derive(Default)]
pub struct FakeHardLinks {
    populate_calls: AtomicUsize,
}

impl FakeHardLinks {
    pub fn populate_calls(&self) -> usize {
        self.populate_calls.load(Ordering::SeqCst)
    }
}

impl HardLinkFileService for FakeHardLinks {
    fn get_hard_link_count(&self, _path: &Path, _ignore_root_dirs: bool) -> i64 {
        1
    }

    fn populate_file_counts(&self, _dirs: &[PathBuf]) {
        self.populate_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Download client whose answers are scripted and whose deletes and category changes are recorded.
///
/// Only the queue check is scripted. Seeding cleanup and recategorising run through the
/// trait's own methods.
pub struct FakeService {
    name: String,
    context: Arc<ServiceContext>,
    checks: HashMap<String, DownloadCheckResult>,
    seeding: Vec<FakeItem>,
    fail_checks: bool,
    fail_listing: bool,
    fail_category_creation: bool,
    check_calls: AtomicUsize,
    listing_calls: AtomicUsize,
    cleaned: Mutex<Vec<String>>,
    recategorised: Mutex<Vec<String>>,
    created_categories: Mutex<Vec<String>>,
}

impl FakeService {
    pub fn new(name: &str, context: Arc<ServiceContext>) -> Self {
        Self {
            name: name.to_string(),
            context,
            checks: HashMap::new(),
            seeding: Vec::new(),
            fail_checks: false,
            fail_listing: false,
            fail_category_creation: false,
            check_calls: AtomicUsize::new(0),
            listing_calls: AtomicUsize::new(0),
            cleaned: Mutex::new(Vec::new()),
            recategorised: Mutex::new(Vec::new()),
            created_categories: Mutex::new(Vec::new()),
        }
    }

    pub fn with_check(mut self, hash: &str, result: DownloadCheckResult) -> Self {
        self.checks.insert(hash.to_lowercase(), result);
        self
    }

    pub fn with_seeding(mut self, items: Vec<FakeItem>) -> Self {
        self.seeding = items;
        self
    }

    pub fn failing_checks(mut self) -> Self {
        self.fail_checks = true;
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    pub fn failing_category_creation(mut self) -> Self {
        self.fail_category_creation = true;
        self
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().expect("lock").clone()
    }

    pub fn recategorised(&self) -> Vec<String> {
        self.recategorised.lock().expect("lock").clone()
    }

    pub fn created_categories(&self) -> Vec<String> {
        self.created_categories.lock().expect("lock").clone()
    }

    fn unavailable() -> DownloadClientError {
        DownloadClientError::Request("connection refused".to_string())
    }
}

#[async_trait]
impl DownloadService for FakeService {
    fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> &ServiceContext {
        &self.context
    }

    async fn get_item(
        &self,
        _hash: &str,
    ) -> Result<Option<Box<dyn TorrentItem>>, DownloadClientError> {
        Ok(None)
    }

    async fn list_seeding(&self) -> Result<Vec<Box<dyn TorrentItem>>, DownloadClientError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing {
            return Err(Self::unavailable());
        }
        Ok(self
            .seeding
            .iter()
            .map(|item| Box::new(item.clone()) as Box<dyn TorrentItem>)
            .collect())
    }

    async fn get_files(
        &self,
        item: &dyn TorrentItem,
    ) -> Result<Vec<TorrentFile>, DownloadClientError> {
        Ok(vec![TorrentFile {
            path: format!("{}.mkv", item.name()),
            size: 1024,
            selection: FileSelection::Wanted,
        }])
    }

    async fn delete_download(
        &self,
        hash: &str,
        _delete_source_files: bool,
    ) -> Result<(), DownloadClientError> {
        self.cleaned.lock().expect("lock").push(hash.to_string());
        Ok(())
    }

    async fn create_category(&self, name: &str) -> Result<(), DownloadClientError> {
        if self.fail_category_creation {
            return Err(Self::unavailable());
        }
        self.created_categories
            .lock()
            .expect("lock")
            .push(name.to_string());
        Ok(())
    }

    async fn apply_unlinked_category(
        &self,
        item: &mut dyn TorrentItem,
        category: &str,
    ) -> Result<(), DownloadClientError> {
        self.recategorised
            .lock()
            .expect("lock")
            .push(item.hash().to_string());
        item.set_category(category);
        Ok(())
    }

    async fn should_remove_from_arr_queue(
        &self,
        hash: &str,
        _ignored_patterns: &[String],
    ) -> Result<DownloadCheckResult, DownloadClientError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_checks {
            return Err(Self::unavailable());
        }
        Ok(self
            .checks
            .get(&hash.to_lowercase())
            .copied()
            .unwrap_or_else(DownloadCheckResult::not_found))
    }
}

/// Arr instance serving a queue that can shrink between page requests.
#[derive(Default)]
pub struct FakeArr {
    records: Mutex<Vec<QueueRecord>>,
    page_size: Option<u32>,
    fail: bool,
    failing_imports: bool,
    pages_fetched: AtomicUsize,
    failed_import_calls: AtomicUsize,
}

impl FakeArr {
    pub fn with_records(records: Vec<QueueRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Overrides the page size the instance asks for.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Every record checked for failed imports is reported as failed.
    pub fn failing_imports(mut self) -> Self {
        self.failing_imports = true;
        self
    }

    /// Takes a download out of the queue, as the arr does once it is deleted.
    pub fn dequeue(&self, download_id: &str) {
        self.records
            .lock()
            .expect("lock")
            .retain(|record| !record.download_id.eq_ignore_ascii_case(download_id));
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched.load(Ordering::SeqCst)
    }

    pub fn failed_import_calls(&self) -> usize {
        self.failed_import_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArrQueueSource for FakeArr {
    async fn fetch_page(
        &self,
        _instance: &ArrInstanceConfig,
        page: u32,
        page_size: u32,
    ) -> Result<QueuePage, ArrError> {
        if self.fail {
            return Err(ArrError::Request("connection refused".to_string()));
        }
        self.pages_fetched.fetch_add(1, Ordering::SeqCst);

        let page_size = self.page_size.unwrap_or(page_size).max(1);
        let queue = self.records.lock().expect("lock");
        let records = queue
            .iter()
            .skip(page.saturating_sub(1) as usize * page_size as usize)
            .take(page_size as usize)
            .cloned()
            .collect();
        Ok(QueuePage {
            page,
            page_size,
            total_records: queue.len() as u32,
            records,
        })
    }
}

#[async_trait]
impl ArrClient for FakeArr {
    async fn should_remove_from_queue(
        &self,
        _instance_type: InstanceType,
        _record: &QueueRecord,
        _is_private: bool,
        max_strikes: u16,
    ) -> Result<bool, ArrError> {
        self.failed_import_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.failing_imports && max_strikes > 0)
    }

    async fn delete_queue_item(
        &self,
        _instance: &ArrInstanceConfig,
        _record: &QueueRecord,
        _remove_from_client: bool,
    ) -> Result<(), ArrError> {
        Ok(())
    }

    async fn search(
        &self,
        _instance: &ArrInstanceConfig,
        _item: &SearchItem,
    ) -> Result<(), ArrError> {
        Ok(())
    }
}

/// Removal sink that dequeues each delivered download from a [`FakeArr`].
pub struct DequeueingSink {
    arr: Arc<FakeArr>,
    delivered: Mutex<Vec<String>>,
}

impl DequeueingSink {
    pub fn new(arr: Arc<FakeArr>) -> Self {
        Self {
            arr,
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().expect("lock").clone()
    }
}

#[async_trait]
impl RemovalSink for DequeueingSink {
    async fn remove(&self, request: &RemovalRequest) -> Result<(), RemovalError> {
        self.arr.dequeue(&request.record.download_id);
        self.delivered
            .lock()
            .expect("lock")
            .push(request.record.download_id.clone());
        Ok(())
    }
}
