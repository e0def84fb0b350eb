// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use sweeparr_config::DownloadClientConfig;
use tracing::debug;

use super::{
    DownloadClientError, DownloadService, FileSelection, ServiceContext, TorrentFile, TorrentItem,
};

const SESSION_HEADER: &str = "X-Transmission-Session-Id";

const STATUS_DOWNLOADING: i64 = 4;
const STATUS_SEED_WAIT: i64 = 5;
const STATUS_SEEDING: i64 = 6;

const TORRENT_FIELDS: &[&str] = &[
    "hashString",
    "name",
    "downloadDir",
    "totalSize",
    "downloadedEver",
    "rateDownload",
    "eta",
    "uploadRatio",
    "secondsSeeding",
    "status",
    "isPrivate",
    "trackers",
    "metadataPercentComplete",
    "percentDone",
];

pub struct TransmissionService {
    name: String,
    client: Client,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
    session_id: Mutex<Option<String>>,
    context: Arc<ServiceContext>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: String,
    #[serde(default)]
    arguments: Value,
}

impl TransmissionService {
    pub fn new(
        config: &DownloadClientConfig,
        context: Arc<ServiceContext>,
    ) -> Result<Self, DownloadClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let base = match config.url_base.as_deref().map(str::trim) {
            Some(base) if !base.trim_matches('/').is_empty() => config.base_url(),
            _ => format!("{}/transmission", config.host.trim_end_matches('/')),
        };

        Ok(Self {
            name: config.name.clone(),
            client,
            endpoint: format!("{base}/rpc"),
            username: config.username.clone(),
            password: config.password.clone(),
            session_id: Mutex::new(None),
            context,
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store_session_id(&self, id: String) {
        *self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id);
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, DownloadClientError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|err| DownloadClientError::InvalidBaseUrl(err.to_string()))?;
        let mut request = self.client.post(url).json(body);
        if let Some(username) = self.username.as_deref() {
            request = request.basic_auth(username, self.password.as_deref());
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }
        Ok(request.send().await?)
    }

    /// Performs an RPC call, repeating it once when the server hands out a new session id.
    async fn call(&self, method: &str, arguments: Value) -> Result<Value, DownloadClientError> {
        let body = json!({ "method": method, "arguments": arguments });

        let mut response = self.post(&body).await?;
        if response.status() == StatusCode::CONFLICT {
            let session_id = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|value| value.to_str().ok())
                .ok_or(DownloadClientError::Authentication)?
                .to_string();
            debug!(target: "transmission", client = %self.name, "refreshing session id");
            self.store_session_id(session_id);
            response = self.post(&body).await?;
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(DownloadClientError::Authentication);
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(DownloadClientError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        let response: RpcResponse = serde_json::from_str(&text)
            .map_err(|e| DownloadClientError::Deserialization(e.to_string()))?;
        if response.result != "success" {
            return Err(DownloadClientError::Rpc {
                method: method.to_string(),
                message: response.result,
            });
        }
        Ok(response.arguments)
    }

    async fn torrents(&self, arguments: Value) -> Result<Vec<TransmissionTorrent>, DownloadClientError> {
        let arguments = self.call("torrent-get", arguments).await?;
        let torrents = arguments.get("torrents").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(torrents).map_err(|e| DownloadClientError::Deserialization(e.to_string()))
    }
}

#[async_trait]
impl DownloadService for TransmissionService {
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
        let torrent = self
            .torrents(json!({ "ids": [hash], "fields": TORRENT_FIELDS }))
            .await?
            .into_iter()
            .next();
        Ok(torrent.map(|torrent| Box::new(TransmissionItem::from(torrent)) as Box<dyn TorrentItem>))
    }

    async fn list_seeding(&self) -> Result<Vec<Box<dyn TorrentItem>>, DownloadClientError> {
        Ok(self
            .torrents(json!({ "fields": TORRENT_FIELDS }))
            .await?
            .into_iter()
            .filter(|torrent| torrent.percent_done >= 1.0)
            .map(|torrent| Box::new(TransmissionItem::from(torrent)) as Box<dyn TorrentItem>)
            .collect())
    }

    async fn get_files(
        &self,
        item: &dyn TorrentItem,
    ) -> Result<Vec<TorrentFile>, DownloadClientError> {
        let torrent = self
            .torrents(json!({ "ids": [item.hash()], "fields": ["files", "fileStats"] }))
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        Ok(torrent
            .files
            .into_iter()
            .enumerate()
            .map(|(index, file)| {
                let wanted = torrent
                    .file_stats
                    .get(index)
                    .map(|stats| stats.wanted)
                    .unwrap_or(true);
                TorrentFile {
                    path: file.name,
                    size: file.length,
                    selection: if wanted {
                        FileSelection::Wanted
                    } else {
                        FileSelection::Unwanted
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
        self.call(
            "torrent-remove",
            json!({ "ids": [hash.to_lowercase()], "delete-local-data": delete_source_files }),
        )
        .await
        .map(|_| ())
    }

    /// Categories are directories here, created on move.
    async fn create_category(&self, _name: &str) -> Result<(), DownloadClientError> {
        Ok(())
    }

    async fn apply_unlinked_category(
        &self,
        item: &mut dyn TorrentItem,
        category: &str,
    ) -> Result<(), DownloadClientError> {
        let location = category_location(item.save_path(), category);
        self.call(
            "torrent-set-location",
            json!({ "ids": [item.hash()], "location": location, "move": true }),
        )
        .await?;
        item.set_category(category);
        Ok(())
    }
}

/// Sibling directory of `download_dir` named after `category`.
fn category_location(download_dir: &str, category: &str) -> String {
    let parent = Path::new(download_dir.trim_end_matches('/'))
        .parent()
        .unwrap_or_else(|| Path::new("/"));
    parent.join(category).to_string_lossy().into_owned()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TransmissionTorrent {
    hash_string: String,
    name: String,
    download_dir: String,
    total_size: i64,
    downloaded_ever: i64,
    rate_download: i64,
    eta: i64,
    upload_ratio: f64,
    seconds_seeding: i64,
    status: i64,
    is_private: bool,
    trackers: Vec<TransmissionTracker>,
    metadata_percent_complete: f64,
    percent_done: f64,
    files: Vec<TransmissionFile>,
    file_stats: Vec<TransmissionFileStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TransmissionTracker {
    announce: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TransmissionFile {
    name: String,
    length: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct TransmissionFileStats {
    #[serde(default = "wanted_default")]
    wanted: bool,
}

fn wanted_default() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct TransmissionItem {
    torrent: TransmissionTorrent,
    category: String,
    trackers: Vec<String>,
}

impl From<TransmissionTorrent> for TransmissionItem {
    fn from(mut torrent: TransmissionTorrent) -> Self {
        let category = Path::new(torrent.download_dir.trim_end_matches('/'))
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let trackers = std::mem::take(&mut torrent.trackers)
            .into_iter()
            .map(|tracker| tracker.announce)
            .collect();
        Self {
            torrent,
            category,
            trackers,
        }
    }
}

impl TorrentItem for TransmissionItem {
    fn hash(&self) -> &str {
        &self.torrent.hash_string
    }

    fn name(&self) -> &str {
        &self.torrent.name
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn set_category(&mut self, category: &str) {
        self.torrent.download_dir = category_location(&self.torrent.download_dir, category);
        self.category = category.to_string();
    }

    fn save_path(&self) -> &str {
        &self.torrent.download_dir
    }

    fn trackers(&self) -> &[String] {
        &self.trackers
    }

    fn is_private(&self) -> bool {
        self.torrent.is_private
    }

    fn size(&self) -> u64 {
        self.torrent.total_size.max(0) as u64
    }

    fn downloaded_bytes(&self) -> u64 {
        self.torrent.downloaded_ever.max(0) as u64
    }

    fn download_speed(&self) -> u64 {
        self.torrent.rate_download.max(0) as u64
    }

    fn eta(&self) -> i64 {
        self.torrent.eta
    }

    fn ratio(&self) -> f64 {
        self.torrent.upload_ratio
    }

    fn seeding_time_seconds(&self) -> i64 {
        self.torrent.seconds_seeding
    }

    fn is_downloading(&self) -> bool {
        self.torrent.status == STATUS_DOWNLOADING
    }

    fn is_stalled(&self) -> bool {
        self.is_downloading() && self.torrent.rate_download <= 0 && self.torrent.eta <= 0
    }

    fn is_seeding(&self) -> bool {
        matches!(self.torrent.status, STATUS_SEED_WAIT | STATUS_SEEDING)
    }

    fn is_metadata_downloading(&self) -> bool {
        self.is_downloading() && self.torrent.metadata_percent_complete < 1.0
    }

    fn clone_box(&self) -> Box<dyn TorrentItem> {
        Box::new(self.clone())
    }
}
