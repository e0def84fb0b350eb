// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sweeparr_config::DownloadClientConfig;
use tracing::{debug, warn};

use super::{
    DownloadClientError, DownloadService, FileSelection, ServiceContext, TorrentFile, TorrentItem,
};

const STATUS_STARTED: i64 = 1;
const STATUS_PAUSED: i64 = 32;
const PROGRESS_COMPLETE: i64 = 1000;

pub struct UTorrentService {
    name: String,
    client: Client,
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
    token_pattern: Regex,
    context: Arc<ServiceContext>,
}

impl UTorrentService {
    pub fn new(
        config: &DownloadClientConfig,
        context: Arc<ServiceContext>,
    ) -> Result<Self, DownloadClientError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let token_pattern = Regex::new(r#"<div[^>]*id=['"]token['"][^>]*>([^<]+)</div>"#)
            .map_err(|err| DownloadClientError::Request(err.to_string()))?;

        let base = match config.url_base.as_deref().map(str::trim) {
            Some(base) if !base.trim_matches('/').is_empty() => config.base_url(),
            _ => format!("{}/gui", config.host.trim_end_matches('/')),
        };

        Ok(Self {
            name: config.name.clone(),
            client,
            base_url: base,
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
            token: Mutex::new(None),
            token_pattern,
            context,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DownloadClientError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|err| DownloadClientError::InvalidBaseUrl(err.to_string()))
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Fetches a fresh CSRF token; the GUID cookie set alongside it lands in the cookie store.
    async fn refresh_token(&self) -> Result<String, DownloadClientError> {
        let response = self
            .client
            .get(self.endpoint("/token.html")?)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(DownloadClientError::Authentication);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DownloadClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let token = self
            .token_pattern
            .captures(&body)
            .and_then(|captures| captures.get(1))
            .map(|token| token.as_str().trim().to_string())
            .ok_or(DownloadClientError::Authentication)?;

        debug!(target: "utorrent", client = %self.name, "token refreshed");
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.clone());
        Ok(token)
    }

    async fn send(&self, token: &str, params: &[(&str, &str)]) -> Result<reqwest::Response, DownloadClientError> {
        Ok(self
            .client
            .get(self.endpoint("/")?)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("token", token)])
            .query(params)
            .send()
            .await?)
    }

    async fn request<T: DeserializeOwned>(&self, params: &[(&str, &str)]) -> Result<T, DownloadClientError> {
        let token = match self.cached_token() {
            Some(token) => token,
            None => self.refresh_token().await?,
        };

        let mut response = self.send(&token, params).await?;
        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED
        ) {
            let token = self.refresh_token().await?;
            response = self.send(&token, params).await?;
        }

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

    async fn list(&self) -> Result<Vec<UTorrentTorrent>, DownloadClientError> {
        let list: Option<UTorrentList> = self.request(&[("list", "1")]).await?;
        Ok(list
            .unwrap_or_default()
            .torrents
            .iter()
            .map(|row| UTorrentTorrent::from_row(row))
            .collect())
    }

    async fn trackers(&self, hash: &str) -> Result<Vec<String>, DownloadClientError> {
        let props: UTorrentProps = self
            .request(&[("action", "getprops"), ("hash", hash)])
            .await?;
        Ok(props
            .props
            .first()
            .map(|props| {
                props
                    .trackers
                    .split(['\r', '\n'])
                    .map(str::trim)
                    .filter(|tracker| !tracker.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn with_trackers(&self, torrent: UTorrentTorrent) -> Result<UTorrentItem, DownloadClientError> {
        let trackers = self.trackers(&torrent.hash).await?;
        Ok(UTorrentItem { torrent, trackers })
    }
}

#[async_trait]
impl DownloadService for UTorrentService {
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
        let Some(torrent) = self
            .list()
            .await?
            .into_iter()
            .find(|torrent| torrent.hash.eq_ignore_ascii_case(hash))
        else {
            return Ok(None);
        };
        Ok(Some(Box::new(self.with_trackers(torrent).await?)))
    }

    async fn list_seeding(&self) -> Result<Vec<Box<dyn TorrentItem>>, DownloadClientError> {
        let mut items: Vec<Box<dyn TorrentItem>> = Vec::new();
        for torrent in self.list().await? {
            if torrent.progress < PROGRESS_COMPLETE || torrent.hash.is_empty() {
                continue;
            }
            let hash = torrent.hash.clone();
            match self.with_trackers(torrent).await {
                Ok(item) => items.push(Box::new(item)),
                Err(err) => {
                    warn!(target: "utorrent", client = %self.name, hash = %hash, error = %err, "skipping download without trackers");
                }
            }
        }
        Ok(items)
    }

    async fn get_files(
        &self,
        item: &dyn TorrentItem,
    ) -> Result<Vec<TorrentFile>, DownloadClientError> {
        let response: UTorrentFiles = self
            .request(&[("action", "getfiles"), ("hash", item.hash())])
            .await?;

        // The payload is ["HASH", [[name, size, downloaded, priority, ...], ...]].
        let rows = response
            .files
            .get(1)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(rows
            .iter()
            .filter_map(Value::as_array)
            .map(|row| TorrentFile {
                path: string_at(row, 0),
                size: int_at(row, 1).max(0) as u64,
                selection: if int_at(row, 3) == 0 {
                    FileSelection::Unwanted
                } else {
                    FileSelection::Wanted
                },
            })
            .collect())
    }

    async fn delete_download(
        &self,
        hash: &str,
        delete_source_files: bool,
    ) -> Result<(), DownloadClientError> {
        let hash = hash.to_uppercase();
        let action = if delete_source_files { "removedata" } else { "remove" };
        let _: Value = self.request(&[("action", action), ("hash", hash.as_str())]).await?;
        Ok(())
    }

    /// Labels are created implicitly when first assigned.
    async fn create_category(&self, _name: &str) -> Result<(), DownloadClientError> {
        Ok(())
    }

    async fn apply_unlinked_category(
        &self,
        item: &mut dyn TorrentItem,
        category: &str,
    ) -> Result<(), DownloadClientError> {
        let hash = item.hash().to_string();
        let _: Value = self
            .request(&[
                ("action", "setprops"),
                ("hash", hash.as_str()),
                ("s", "label"),
                ("v", category),
            ])
            .await?;
        item.set_category(category);
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UTorrentList {
    torrents: Vec<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UTorrentProps {
    props: Vec<UTorrentProp>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UTorrentProp {
    trackers: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UTorrentFiles {
    files: Vec<Value>,
}

fn string_at(row: &[Value], index: usize) -> String {
    row.get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn int_at(row: &[Value], index: usize) -> i64 {
    row.get(index).and_then(Value::as_i64).unwrap_or_default()
}

/// One row of `list=1`, decoded from its positional columns.
#[derive(Debug, Clone, Default)]
struct UTorrentTorrent {
    hash: String,
    status: i64,
    name: String,
    size: i64,
    progress: i64,
    downloaded: i64,
    ratio: i64,
    download_speed: i64,
    eta: i64,
    label: String,
    completed_on: i64,
    save_path: String,
}

impl UTorrentTorrent {
    fn from_row(row: &[Value]) -> Self {
        Self {
            hash: string_at(row, 0),
            status: int_at(row, 1),
            name: string_at(row, 2),
            size: int_at(row, 3),
            progress: int_at(row, 4),
            downloaded: int_at(row, 5),
            ratio: int_at(row, 7),
            download_speed: int_at(row, 9),
            eta: int_at(row, 10),
            label: string_at(row, 11),
            completed_on: int_at(row, 24),
            save_path: string_at(row, 26),
        }
    }

    fn is_started(&self) -> bool {
        self.status & STATUS_STARTED != 0 && self.status & STATUS_PAUSED == 0
    }
}

#[derive(Debug, Clone)]
pub struct UTorrentItem {
    torrent: UTorrentTorrent,
    trackers: Vec<String>,
}

impl TorrentItem for UTorrentItem {
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
        &self.torrent.save_path
    }

    fn trackers(&self) -> &[String] {
        &self.trackers
    }

    /// The web API does not expose the private flag.
    fn is_private(&self) -> bool {
        false
    }

    fn size(&self) -> u64 {
        self.torrent.size.max(0) as u64
    }

    fn downloaded_bytes(&self) -> u64 {
        self.torrent.downloaded.max(0) as u64
    }

    fn download_speed(&self) -> u64 {
        self.torrent.download_speed.max(0) as u64
    }

    fn eta(&self) -> i64 {
        self.torrent.eta
    }

    fn ratio(&self) -> f64 {
        self.torrent.ratio as f64 / 1000.0
    }

    fn seeding_time_seconds(&self) -> i64 {
        if self.torrent.completed_on <= 0 {
            return 0;
        }
        (Utc::now().timestamp() - self.torrent.completed_on).max(0)
    }

    fn is_downloading(&self) -> bool {
        self.torrent.is_started() && self.torrent.progress < PROGRESS_COMPLETE
    }

    fn is_stalled(&self) -> bool {
        self.is_downloading() && self.torrent.download_speed <= 0 && self.torrent.eta <= 0
    }

    fn is_seeding(&self) -> bool {
        self.torrent.is_started() && self.torrent.progress >= PROGRESS_COMPLETE
    }

    fn is_metadata_downloading(&self) -> bool {
        self.is_downloading() && self.torrent.size <= 0
    }

    fn clone_box(&self) -> Box<dyn TorrentItem> {
        Box::new(self.clone())
    }
}
