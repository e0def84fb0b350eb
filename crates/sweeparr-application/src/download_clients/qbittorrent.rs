// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sweeparr_config::DownloadClientConfig;
use tracing::{debug, warn};

use super::{
    DownloadClientError, DownloadService, FileSelection, ServiceContext, TorrentFile, TorrentItem,
};

/// qBittorrent reports this ETA for torrents it cannot estimate.
const QBIT_INFINITE_ETA: i64 = 8_640_000;

pub struct QBittorrentService {
    name: String,
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    authenticated: AtomicBool,
    context: Arc<ServiceContext>,
}

impl QBittorrentService {
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
            username: config.username.clone(),
            password: config.password.clone(),
            authenticated: AtomicBool::new(false),
            context,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DownloadClientError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|err| DownloadClientError::InvalidBaseUrl(err.to_string()))
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.username.as_deref()?, self.password.as_deref()?))
    }

    async fn authenticate_if_configured(&self, force: bool) -> Result<(), DownloadClientError> {
        let Some((username, password)) = self.credentials() else {
            return Ok(());
        };
        if !force && self.authenticated.load(Ordering::Acquire) {
            return Ok(());
        }

        let url = self.endpoint("/api/v2/auth/login")?;
        let response = self
            .client
            .post(url)
            .form(&[("username", username), ("password", password)])
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

        if body.trim() != "Ok." {
            return Err(DownloadClientError::Authentication);
        }

        debug!(target: "qbittorrent", client = %self.name, "authenticated");
        self.authenticated.store(true, Ordering::Release);
        Ok(())
    }

    /// Sends a request, logging in again once if the session expired.
    async fn send(
        &self,
        path: &str,
        build: impl Fn(&Client, Url) -> RequestBuilder,
    ) -> Result<String, DownloadClientError> {
        self.authenticate_if_configured(false).await?;

        let mut response = build(&self.client, self.endpoint(path)?).send().await?;
        if response.status() == StatusCode::FORBIDDEN && self.credentials().is_some() {
            self.authenticate_if_configured(true).await?;
            response = build(&self.client, self.endpoint(path)?).send().await?;
        }

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(DownloadClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DownloadClientError> {
        let body = self
            .send(path, |client, url| client.get(url).query(query))
            .await?;
        serde_json::from_str(&body).map_err(|e| DownloadClientError::Deserialization(e.to_string()))
    }

    /// Like `get_json`, but a blank or `null` body yields the default value.
    async fn get_json_or_default<T: DeserializeOwned + Default>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DownloadClientError> {
        let body = self
            .send(path, |client, url| client.get(url).query(query))
            .await?;
        if body.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str::<Option<T>>(&body)
            .map(Option::unwrap_or_default)
            .map_err(|e| DownloadClientError::Deserialization(e.to_string()))
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<(), DownloadClientError> {
        self.send(path, |client, url| client.post(url).form(form))
            .await
            .map(|_| ())
    }

    async fn list_torrents(
        &self,
        query: &[(&str, &str)],
    ) -> Result<Vec<QBittorrentTorrent>, DownloadClientError> {
        self.get_json_or_default("/api/v2/torrents/info", query).await
    }

    /// Adds the per-torrent details that `torrents/info` does not carry.
    async fn hydrate(&self, torrent: QBittorrentTorrent) -> Result<QBittorrentItem, DownloadClientError> {
        let hash = torrent.hash.clone();
        let properties: QBittorrentProperties = self
            .get_json("/api/v2/torrents/properties", &[("hash", hash.as_str())])
            .await?;
        let trackers: Vec<QBittorrentTracker> = self
            .get_json_or_default("/api/v2/torrents/trackers", &[("hash", hash.as_str())])
            .await?;

        Ok(QBittorrentItem::new(
            torrent,
            properties.is_private,
            trackers
                .into_iter()
                .map(|tracker| tracker.url)
                .filter(|url| !url.starts_with("**"))
                .collect(),
        ))
    }

    fn tag_mode(&self) -> bool {
        self.context.download_cleaner.unlinked.use_tag
    }
}

#[async_trait]
impl DownloadService for QBittorrentService {
    fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> &ServiceContext {
        &self.context
    }

    fn supports_tags(&self) -> bool {
        true
    }

    async fn get_item(
        &self,
        hash: &str,
    ) -> Result<Option<Box<dyn TorrentItem>>, DownloadClientError> {
        let hash = hash.to_lowercase();
        let Some(torrent) = self
            .list_torrents(&[("hashes", hash.as_str())])
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        Ok(Some(Box::new(self.hydrate(torrent).await?)))
    }

    async fn list_seeding(&self) -> Result<Vec<Box<dyn TorrentItem>>, DownloadClientError> {
        let torrents = self.list_torrents(&[("filter", "completed")]).await?;

        let mut items: Vec<Box<dyn TorrentItem>> = Vec::with_capacity(torrents.len());
        for torrent in torrents {
            if torrent.hash.is_empty() {
                continue;
            }
            let hash = torrent.hash.clone();
            match self.hydrate(torrent).await {
                Ok(item) => items.push(Box::new(item)),
                Err(err) => {
                    warn!(target: "qbittorrent", client = %self.name, hash = %hash, error = %err, "skipping download without details");
                }
            }
        }
        Ok(items)
    }

    async fn get_files(
        &self,
        item: &dyn TorrentItem,
    ) -> Result<Vec<TorrentFile>, DownloadClientError> {
        let files: Vec<QBittorrentFile> = self
            .get_json_or_default("/api/v2/torrents/files", &[("hash", item.hash())])
            .await?;

        Ok(files
            .into_iter()
            .map(|file| TorrentFile {
                path: file.name,
                size: file.size.max(0) as u64,
                selection: if file.priority == 0 {
                    FileSelection::SkippedByClient
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
        let hash = hash.to_lowercase();
        let delete_files = if delete_source_files { "true" } else { "false" };
        self.post_form(
            "/api/v2/torrents/delete",
            &[("hashes", hash.as_str()), ("deleteFiles", delete_files)],
        )
        .await
    }

    async fn create_category(&self, name: &str) -> Result<(), DownloadClientError> {
        if self.tag_mode() {
            return self
                .post_form("/api/v2/torrents/createTags", &[("tags", name)])
                .await;
        }

        let existing: HashMap<String, serde_json::Value> =
            self.get_json_or_default("/api/v2/torrents/categories", &[]).await?;
        if existing.keys().any(|category| category.eq_ignore_ascii_case(name)) {
            return Ok(());
        }

        debug!(target: "qbittorrent", client = %self.name, category = name, "creating category");
        self.post_form(
            "/api/v2/torrents/createCategory",
            &[("category", name), ("savePath", "")],
        )
        .await
    }

    async fn apply_unlinked_category(
        &self,
        item: &mut dyn TorrentItem,
        category: &str,
    ) -> Result<(), DownloadClientError> {
        let hash = item.hash().to_string();
        if self.tag_mode() {
            self.post_form("/api/v2/torrents/addTags", &[("hashes", hash.as_str()), ("tags", category)])
                .await?;
            item.add_tag(category);
            return Ok(());
        }

        self.post_form(
            "/api/v2/torrents/setCategory",
            &[("hashes", hash.as_str()), ("category", category)],
        )
        .await?;
        item.set_category(category);
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct QBittorrentTorrent {
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    save_path: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    downloaded: i64,
    #[serde(default)]
    dlspeed: i64,
    #[serde(default)]
    eta: i64,
    #[serde(default)]
    ratio: f64,
    #[serde(default)]
    seeding_time: i64,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Default, Deserialize)]
struct QBittorrentProperties {
    #[serde(default)]
    is_private: bool,
}

#[derive(Debug, Deserialize)]
struct QBittorrentTracker {
    url: String,
}

#[derive(Debug, Deserialize)]
struct QBittorrentFile {
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    priority: i64,
}

#[derive(Debug, Clone)]
pub struct QBittorrentItem {
    torrent: QBittorrentTorrent,
    tags: Vec<String>,
    trackers: Vec<String>,
    is_private: bool,
}

impl QBittorrentItem {
    fn new(torrent: QBittorrentTorrent, is_private: bool, trackers: Vec<String>) -> Self {
        let tags = torrent
            .tags
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            torrent,
            tags,
            trackers,
            is_private,
        }
    }
}

impl TorrentItem for QBittorrentItem {
    fn hash(&self) -> &str {
        &self.torrent.hash
    }

    fn name(&self) -> &str {
        &self.torrent.name
    }

    fn category(&self) -> &str {
        &self.torrent.category
    }

    fn set_category(&mut self, category: &str) {
        self.torrent.category = category.to_string();
    }

    fn add_tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|existing| existing == tag) {
            self.tags.push(tag.to_string());
        }
    }

    fn save_path(&self) -> &str {
        &self.torrent.save_path
    }

    fn trackers(&self) -> &[String] {
        &self.trackers
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn is_private(&self) -> bool {
        self.is_private
    }

    fn size(&self) -> u64 {
        self.torrent.size.max(0) as u64
    }

    fn downloaded_bytes(&self) -> u64 {
        self.torrent.downloaded.max(0) as u64
    }

    fn download_speed(&self) -> u64 {
        self.torrent.dlspeed.max(0) as u64
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
        matches!(
            self.torrent.state.as_str(),
            "downloading" | "forcedDL" | "stalledDL" | "metaDL" | "forcedMetaDL"
        )
    }

    fn is_stalled(&self) -> bool {
        match self.torrent.state.as_str() {
            "stalledDL" => true,
            "downloading" | "forcedDL" => {
                self.torrent.dlspeed <= 0
                    && (self.torrent.eta == 0 || self.torrent.eta == QBIT_INFINITE_ETA)
            }
            _ => false,
        }
    }

    fn is_seeding(&self) -> bool {
        matches!(
            self.torrent.state.as_str(),
            "uploading" | "stalledUP" | "forcedUP" | "queuedUP" | "pausedUP" | "stoppedUP"
        )
    }

    fn is_metadata_downloading(&self) -> bool {
        matches!(self.torrent.state.as_str(), "metaDL" | "forcedMetaDL")
    }

    fn clone_box(&self) -> Box<dyn TorrentItem> {
        Box::new(self.clone())
    }
}
