// SPDX-License-Identifier: GPL-3.0-or-later
//! Access to the queue of Sonarr, Radarr, Lidarr, Readarr and Whisparr instances.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use sweeparr_config::{ArrInstanceConfig, FailedImportConfig};
use sweeparr_domain::{InstanceType, QueuePage, QueueRecord, SearchItem, StrikeType};
use thiserror::Error;
use tracing::{debug, info};

use crate::strikes::StrikeTracker;

const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Error)]
pub enum ArrError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid instance url: {0}")]
    InvalidUrl(String),
    #[error("arr instance responded with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("deserialization failed: {0}")]
    Deserialization(String),
    #[error("unknown arr instance '{0}'")]
    UnknownInstance(String),
}

impl From<reqwest::Error> for ArrError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

#[async_trait]
pub trait ArrQueueSource: Send + Sync {
    async fn fetch_page(
        &self,
        instance: &ArrInstanceConfig,
        page: u32,
        page_size: u32,
    ) -> Result<QueuePage, ArrError>;
}

#[async_trait]
pub trait ArrClient: ArrQueueSource {
    /// Whether the record carries what is needed to act on it for this application.
    fn is_record_valid(&self, instance_type: InstanceType, record: &QueueRecord) -> bool {
        has_search_identity(instance_type, record)
    }

    /// Failed-import check, striking the record when the application reports an import problem.
    async fn should_remove_from_queue(
        &self,
        instance_type: InstanceType,
        record: &QueueRecord,
        is_private: bool,
        max_strikes: u16,
    ) -> Result<bool, ArrError>;

    async fn delete_queue_item(
        &self,
        instance: &ArrInstanceConfig,
        record: &QueueRecord,
        remove_from_client: bool,
    ) -> Result<(), ArrError>;

    async fn search(&self, instance: &ArrInstanceConfig, item: &SearchItem) -> Result<(), ArrError>;
}

fn has_search_identity(instance_type: InstanceType, record: &QueueRecord) -> bool {
    if record.id <= 0 || record.download_id.trim().is_empty() {
        return false;
    }

    match instance_type {
        InstanceType::Sonarr => record.series_id.is_some() && record.episode_id.is_some(),
        InstanceType::Radarr => record.movie_id.is_some(),
        InstanceType::Lidarr => record.album_id.is_some(),
        InstanceType::Readarr => record.book_id.is_some(),
        InstanceType::Whisparr => {
            record.movie_id.is_some() || (record.series_id.is_some() && record.episode_id.is_some())
        }
    }
}

/// True when the record is stuck importing and none of its messages are ignored.
pub fn is_failed_import(config: &FailedImportConfig, record: &QueueRecord) -> bool {
    if !record.tracked_download_status.eq_ignore_ascii_case("warning") {
        return false;
    }

    let state = record.tracked_download_state.to_lowercase();
    if !matches!(
        state.as_str(),
        "importpending" | "importblocked" | "importfailed"
    ) {
        return false;
    }

    let ignored: Vec<String> = config
        .ignored_patterns
        .iter()
        .map(|pattern| pattern.trim().to_lowercase())
        .filter(|pattern| !pattern.is_empty())
        .collect();

    let has_ignored_message = record.status_messages.iter().any(|status| {
        std::iter::once(&status.title)
            .chain(status.messages.iter())
            .any(|message| {
                let message = message.to_lowercase();
                ignored.iter().any(|pattern| message.contains(pattern))
            })
    });

    !has_ignored_message
}

pub struct HttpArrClient {
    client: Client,
    failed_import: FailedImportConfig,
    strikes: Arc<StrikeTracker>,
}

impl HttpArrClient {
    pub fn new(
        failed_import: FailedImportConfig,
        strikes: Arc<StrikeTracker>,
        timeout: Duration,
    ) -> Result<Self, ArrError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            failed_import,
            strikes,
        })
    }

    fn endpoint(&self, instance: &ArrInstanceConfig, path: &str) -> Result<Url, ArrError> {
        Url::parse(&format!(
            "{}/api/{}/{}",
            instance.url.trim_end_matches('/'),
            instance.instance_type.api_version(),
            path
        ))
        .map_err(|err| ArrError::InvalidUrl(err.to_string()))
    }

    async fn read_body(response: reqwest::Response) -> Result<String, ArrError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ArrError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

fn search_command(item: &SearchItem) -> Value {
    match item {
        SearchItem::Episode { episode_id, .. } => {
            json!({ "name": "EpisodeSearch", "episodeIds": [episode_id] })
        }
        SearchItem::Season {
            series_id,
            season_number,
        } => json!({ "name": "SeasonSearch", "seriesId": series_id, "seasonNumber": season_number }),
        SearchItem::Movie { movie_id } => json!({ "name": "MoviesSearch", "movieIds": [movie_id] }),
        SearchItem::Album { album_id, .. } => json!({ "name": "AlbumSearch", "albumIds": [album_id] }),
        SearchItem::Book { book_id, .. } => json!({ "name": "BookSearch", "bookIds": [book_id] }),
    }
}

#[async_trait]
impl ArrQueueSource for HttpArrClient {
    async fn fetch_page(
        &self,
        instance: &ArrInstanceConfig,
        page: u32,
        page_size: u32,
    ) -> Result<QueuePage, ArrError> {
        let url = self.endpoint(instance, "queue")?;
        debug!(target: "arr", instance = %instance.name, page, page_size, "fetching queue page");

        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &instance.api_key)
            .query(&[("page", page), ("pageSize", page_size)])
            .send()
            .await?;
        let body = Self::read_body(response).await?;

        serde_json::from_str(&body).map_err(|e| ArrError::Deserialization(e.to_string()))
    }
}

#[async_trait]
impl ArrClient for HttpArrClient {
    async fn should_remove_from_queue(
        &self,
        instance_type: InstanceType,
        record: &QueueRecord,
        is_private: bool,
        max_strikes: u16,
    ) -> Result<bool, ArrError> {
        if max_strikes == 0 {
            return Ok(false);
        }
        if is_private && self.failed_import.ignore_private {
            debug!(target: "arr", %instance_type, download_id = %record.download_id, "private download skipped for failed import check");
            return Ok(false);
        }
        if !is_failed_import(&self.failed_import, record) {
            return Ok(false);
        }

        Ok(self.strikes.strike(
            &record.download_id,
            &record.title,
            StrikeType::FailedImport,
            max_strikes,
        ))
    }

    async fn delete_queue_item(
        &self,
        instance: &ArrInstanceConfig,
        record: &QueueRecord,
        remove_from_client: bool,
    ) -> Result<(), ArrError> {
        let url = self.endpoint(instance, &format!("queue/{}", record.id))?;
        let response = self
            .client
            .delete(url)
            .header(API_KEY_HEADER, &instance.api_key)
            .query(&[
                ("removeFromClient", remove_from_client.to_string()),
                ("blocklist", "true".to_string()),
            ])
            .send()
            .await?;
        Self::read_body(response).await?;

        info!(
            target: "arr",
            instance = %instance.name,
            queue_id = record.id,
            title = %record.title,
            remove_from_client,
            "queue item removed"
        );
        Ok(())
    }

    async fn search(&self, instance: &ArrInstanceConfig, item: &SearchItem) -> Result<(), ArrError> {
        let url = self.endpoint(instance, "command")?;
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &instance.api_key)
            .json(&search_command(item))
            .send()
            .await?;
        Self::read_body(response).await?;

        info!(target: "arr", instance = %instance.name, ?item, "search triggered");
        Ok(())
    }
}
