// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sweeparr_config::DownloadClientConfig;
use tracing::{debug, info};

use super::{
    DownloadClientError, DownloadService, FileSelection, ServiceContext, TorrentFile, TorrentItem,
};

/// Deluge answers with this error code when the web session is not logged in.
const NOT_AUTHENTICATED: i64 = 1;

const STATUS_FIELDS: &[&str] = &[
    "hash",
    "name",
    "label",
    "download_location",
    "total_size",
    "total_done",
    "download_payload_rate",
    "eta",
    "ratio",
    "seeding_time",
    "state",
    "private",
    "trackers",
    "is_finished",
];

pub struct DelugeService {
    name: String,
    client: Client,
    base_url: String,
    password: String,
    request_id: AtomicU64,
    connected: AtomicBool,
    context: Arc<ServiceContext>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

impl DelugeService {
    pub fn new(
        config: &DownloadClientConfig,
        context: Arc<ServiceContext>,
    ) -> Result<Self, DownloadClientError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            client,
            base_url: config.base_url(),
            password: config.password.clone().unwrap_or_default(),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            context,
        })
    }

    fn endpoint(&self) -> Result<Url, DownloadClientError> {
        Url::parse(&format!("{}/json", self.base_url))
            .map_err(|err| DownloadClientError::InvalidBaseUrl(err.to_string()))
    }

    async fn raw_call(&self, method: &str, params: &Value) -> Result<RpcResponse, DownloadClientError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(self.endpoint()?)
            .json(&json!({ "method": method, "params": params, "id": id }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DownloadClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| DownloadClientError::Deserialization(e.to_string()))
    }

    fn into_result(method: &str, response: RpcResponse) -> Result<Value, DownloadClientError> {
        match response.error {
            Some(error) => Err(DownloadClientError::Rpc {
                method: method.to_string(),
                message: error.message,
            }),
            None => Ok(response.result),
        }
    }

    /// Logs in and attaches the web UI to a daemon if it is not already.
    async fn connect(&self, force: bool) -> Result<(), DownloadClientError> {
        if !force && self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let login = self
            .raw_call("auth.login", &json!([self.password]))
            .await?;
        if Self::into_result("auth.login", login)?.as_bool() != Some(true) {
            return Err(DownloadClientError::Authentication);
        }

        let connected = self.raw_call("web.connected", &json!([])).await?;
        if Self::into_result("web.connected", connected)?.as_bool() != Some(true) {
            let hosts = self.raw_call("web.get_hosts", &json!([])).await?;
            let hosts = Self::into_result("web.get_hosts", hosts)?;
            let host_id = hosts
                .as_array()
                .and_then(|hosts| hosts.first())
                .and_then(|host| host.get(0))
                .and_then(Value::as_str)
                .ok_or_else(|| DownloadClientError::Rpc {
                    method: "web.get_hosts".to_string(),
                    message: "no daemon configured in the web ui".to_string(),
                })?
                .to_string();

            let connect = self.raw_call("web.connect", &json!([host_id])).await?;
            Self::into_result("web.connect", connect)?;
            debug!(target: "deluge", client = %self.name, host_id = %host_id, "connected web ui to daemon");
        }

        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, DownloadClientError> {
        self.connect(false).await?;

        let mut response = self.raw_call(method, &params).await?;
        if response
            .error
            .as_ref()
            .is_some_and(|error| error.code == NOT_AUTHENTICATED)
        {
            debug!(target: "deluge", client = %self.name, method, "session expired, logging in again");
            self.connect(true).await?;
            response = self.raw_call(method, &params).await?;
        }

        let result = Self::into_result(method, response)?;
        serde_json::from_value(result).map_err(|e| DownloadClientError::Deserialization(e.to_string()))
    }

    async fn torrent_status(&self, hash: &str) -> Result<Option<DelugeTorrent>, DownloadClientError> {
        let status: Option<DelugeTorrent> = self
            .call("core.get_torrent_status", json!([hash, STATUS_FIELDS]))
            .await?;
        Ok(status.filter(|torrent| !torrent.hash.is_empty()))
    }
}

#[async_trait]
impl DownloadService for DelugeService {
    fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> &ServiceContext {
        &self.context
    }

    async fn get_item(
        &self,
        hash: &str,
    ) -> Result<Option<Box<dyn TorrentItem>>, DownloadClientError> {
        let hash = hash.to_lowercase();
        Ok(self
            .torrent_status(&hash)
            .await?
            .map(|torrent| Box::new(DelugeItem::from(torrent)) as Box<dyn TorrentItem>))
    }

    async fn list_seeding(&self) -> Result<Vec<Box<dyn TorrentItem>>, DownloadClientError> {
        let torrents: Option<HashMap<String, DelugeTorrent>> = self
            .call("core.get_torrents_status", json!([{}, STATUS_FIELDS]))
            .await?;

        Ok(torrents
            .unwrap_or_default()
            .into_iter()
            .map(|(hash, mut torrent)| {
                if torrent.hash.is_empty() {
                    torrent.hash = hash;
                }
                torrent
            })
            .filter(|torrent| torrent.is_finished || torrent.state == "Seeding")
            .map(|torrent| Box::new(DelugeItem::from(torrent)) as Box<dyn TorrentItem>)
            .collect())
    }

    async fn get_files(
        &self,
        item: &dyn TorrentItem,
    ) -> Result<Vec<TorrentFile>, DownloadClientError> {
        let status: DelugeFiles = self
            .call(
                "core.get_torrent_status",
                json!([item.hash(), ["files", "file_priorities"]]),
            )
            .await?;

        Ok(status
            .files
            .into_iter()
            .map(|file| {
                let priority = status
                    .file_priorities
                    .get(file.index)
                    .copied()
                    .unwrap_or(1);
                TorrentFile {
                    path: file.path,
                    size: file.size,
                    selection: if priority == 0 {
                        FileSelection::Unwanted
                    } else {
                        FileSelection::Wanted
                    },
                }
            })
            .collect())
    }

    async fn delete_download(
        &self,
        hash: &str,
        delete_source_files: bool,
    ) -> Result<(), DownloadClientError> {
        let hash = hash.to_lowercase();
        if self.torrent_status(&hash).await?.is_none() {
            debug!(target: "deluge", client = %self.name, hash = %hash, "torrent already gone");
            return Ok(());
        }

        let _: Value = self
            .call("core.remove_torrent", json!([hash, delete_source_files]))
            .await?;
        Ok(())
    }

    async fn create_category(&self, name: &str) -> Result<(), DownloadClientError> {
        let labels: Option<Vec<String>> = self.call("label.get_labels", json!([])).await?;
        if labels.unwrap_or_default().iter().any(|label| label.eq_ignore_ascii_case(name)) {
            return Ok(());
        }

        info!(target: "deluge", client = %self.name, label = name, "creating label");
        let _: Value = self.call("label.add", json!([name])).await?;
        Ok(())
    }

    async fn apply_unlinked_category(
        &self,
        item: &mut dyn TorrentItem,
        category: &str,
    ) -> Result<(), DownloadClientError> {
        let _: Value = self
            .call("label.set_torrent", json!([item.hash(), category]))
            .await?;
        item.set_category(category);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DelugeTorrent {
    hash: String,
    name: String,
    label: String,
    download_location: String,
    total_size: i64,
    total_done: i64,
    download_payload_rate: i64,
    eta: i64,
    ratio: f64,
    seeding_time: i64,
    state: String,
    private: bool,
    trackers: Vec<DelugeTracker>,
    is_finished: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DelugeTracker {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DelugeFiles {
    files: Vec<DelugeFile>,
    file_priorities: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DelugeFile {
    index: usize,
    path: String,
    size: u64,
}

#[derive(Debug, Clone)]
pub struct DelugeItem {
    torrent: DelugeTorrent,
    trackers: Vec<String>,
}

impl From<DelugeTorrent> for DelugeItem {
    fn from(mut torrent: DelugeTorrent) -> Self {
        let trackers = std::mem::take(&mut torrent.trackers)
            .into_iter()
            .map(|tracker| tracker.url)
            .collect();
        Self { torrent, trackers }
    }
}

impl TorrentItem for DelugeItem {
    fn hash(&self) -> &str {
        &self.torrent.hash
    }

    fn name(&self) -> &str {
        &self.torrent.name
    }

    fn category(&self) -> &str {
        &self.torrent.label
    }

    fn set_category(&mut self, category: &str) {
        self.torrent.label = category.to_string();
    }

    fn save_path(&self) -> &str {
        &self.torrent.download_location
    }

    fn trackers(&self) -> &[String] {
        &self.trackers
    }

    fn is_private(&self) -> bool {
        self.torrent.private
    }

    fn size(&self) -> u64 {
        self.torrent.total_size.max(0) as u64
    }

    fn downloaded_bytes(&self) -> u64 {
        self.torrent.total_done.max(0) as u64
    }

    fn download_speed(&self) -> u64 {
        self.torrent.download_payload_rate.max(0) as u64
    }

    fn eta(&self) -> i64 {
        self.torrent.eta
    }

    fn ratio(&self) -> f64 {
        self.torrent.ratio
    }

    fn seeding_time_seconds(&self) -> i64 {
        self.torrent.seeding_time
    }

    fn is_downloading(&self) -> bool {
        self.torrent.state == "Downloading"
    }

    fn is_stalled(&self) -> bool {
        self.is_downloading() && self.torrent.download_payload_rate <= 0 && self.torrent.eta <= 0
    }

    fn is_seeding(&self) -> bool {
        self.torrent.state == "Seeding"
    }

    /// Deluge has no metadata state; a downloading torrent without a size has no metadata yet.
    fn is_metadata_downloading(&self) -> bool {
        self.is_downloading() && self.torrent.total_size <= 0
    }

    fn clone_box(&self) -> Box<dyn TorrentItem> {
        Box::new(self.clone())
    }
}
