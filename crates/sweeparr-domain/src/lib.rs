// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Sonarr,
    Radarr,
    Lidarr,
    Readarr,
    Whisparr,
}

impl InstanceType {
    /// REST API version segment used by this application family.
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Lidarr | Self::Readarr => "v1",
            Self::Sonarr | Self::Radarr | Self::Whisparr => "v3",
        }
    }
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sonarr => write!(f, "sonarr"),
            Self::Radarr => write!(f, "radarr"),
            Self::Lidarr => write!(f, "lidarr"),
            Self::Readarr => write!(f, "readarr"),
            Self::Whisparr => write!(f, "whisparr"),
        }
    }
}

/// Why a queue item is being removed. Exactly one accompanies every removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    #[default]
    None,
    Stalled,
    SlowSpeed,
    AllFilesSkipped,
    AllFilesSkippedByClient,
    DownloadingMetadata,
    FailedImport,
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Stalled => write!(f, "stalled"),
            Self::SlowSpeed => write!(f, "slow_speed"),
            Self::AllFilesSkipped => write!(f, "all_files_skipped"),
            Self::AllFilesSkippedByClient => write!(f, "all_files_skipped_by_client"),
            Self::DownloadingMetadata => write!(f, "downloading_metadata"),
            Self::FailedImport => write!(f, "failed_import"),
        }
    }
}

/// Why a seeding download was removed by the download cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanReason {
    MaxRatioReached,
    MaxSeedTimeReached,
}

impl std::fmt::Display for CleanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxRatioReached => write!(f, "max_ratio_reached"),
            Self::MaxSeedTimeReached => write!(f, "max_seed_time_reached"),
        }
    }
}

/// Strike counters are kept separately per type so that rules never share a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrikeType {
    Stalled,
    SlowSpeed,
    DownloadingMetadata,
    FailedImport,
}

impl std::fmt::Display for StrikeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stalled => write!(f, "stalled"),
            Self::SlowSpeed => write!(f, "slow_speed"),
            Self::DownloadingMetadata => write!(f, "downloading_metadata"),
            Self::FailedImport => write!(f, "failed_import"),
        }
    }
}

// ============================================================================
// Download checks
// ============================================================================

/// Outcome of asking a download client whether a queue item should go.
///
/// When `found` is false the item no longer exists in the client and the
/// remaining fields carry no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadCheckResult {
    pub found: bool,
    pub should_remove: bool,
    pub is_private: bool,
    pub delete_from_client: bool,
    pub delete_reason: DeleteReason,
}

impl DownloadCheckResult {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn keep(is_private: bool) -> Self {
        Self {
            found: true,
            is_private,
            ..Self::default()
        }
    }

    pub fn remove(reason: DeleteReason, delete_from_client: bool, is_private: bool) -> Self {
        Self {
            found: true,
            should_remove: true,
            is_private,
            delete_from_client,
            delete_reason: reason,
        }
    }
}

// ============================================================================
// Arr queue
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueRecord {
    pub id: i64,
    pub download_id: String,
    pub title: String,
    pub protocol: String,
    pub status: String,
    pub tracked_download_status: String,
    pub tracked_download_state: String,
    pub status_messages: Vec<StatusMessage>,
    pub series_id: Option<i64>,
    pub episode_id: Option<i64>,
    pub season_number: Option<i64>,
    pub movie_id: Option<i64>,
    pub artist_id: Option<i64>,
    pub album_id: Option<i64>,
    pub author_id: Option<i64>,
    pub book_id: Option<i64>,
}

impl QueueRecord {
    pub fn is_torrent(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("torrent")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueuePage {
    pub page: u32,
    pub page_size: u32,
    pub total_records: u32,
    pub records: Vec<QueueRecord>,
}

impl QueuePage {
    pub fn has_more(&self) -> bool {
        !self.records.is_empty()
            && u64::from(self.page) * u64::from(self.page_size) < u64::from(self.total_records)
    }
}

/// The unit an arr application re-searches after a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchItem {
    Episode { series_id: i64, episode_id: i64 },
    Season { series_id: i64, season_number: i64 },
    Movie { movie_id: i64 },
    Album { artist_id: i64, album_id: i64 },
    Book { author_id: i64, book_id: i64 },
}

impl SearchItem {
    /// Pick the search identity for all queue records that share one download id.
    ///
    /// More than one record means the download is a pack, and episode-based
    /// applications then search the whole season.
    pub fn for_records(
        instance_type: InstanceType,
        whisparr_version: Option<u8>,
        records: &[QueueRecord],
    ) -> Option<Self> {
        let record = records.first()?;
        let is_pack = records.len() > 1;

        let episodic = match instance_type {
            InstanceType::Sonarr => true,
            InstanceType::Whisparr => whisparr_version != Some(3),
            _ => false,
        };

        if episodic {
            let series_id = record.series_id?;
            return if is_pack {
                Some(Self::Season {
                    series_id,
                    season_number: record.season_number?,
                })
            } else {
                Some(Self::Episode {
                    series_id,
                    episode_id: record.episode_id?,
                })
            };
        }

        match instance_type {
            InstanceType::Radarr | InstanceType::Whisparr => Some(Self::Movie {
                movie_id: record.movie_id?,
            }),
            InstanceType::Lidarr => Some(Self::Album {
                artist_id: record.artist_id.unwrap_or_default(),
                album_id: record.album_id?,
            }),
            InstanceType::Readarr => Some(Self::Book {
                author_id: record.author_id.unwrap_or_default(),
                book_id: record.book_id?,
            }),
            InstanceType::Sonarr => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalRequest {
    pub id: Uuid,
    pub instance_type: InstanceType,
    pub instance_name: String,
    pub instance_url: String,
    pub record: QueueRecord,
    pub search_item: SearchItem,
    pub is_pack: bool,
    pub remove_from_client: bool,
    pub delete_reason: DeleteReason,
}

// ============================================================================
// Domain Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<TPayload> {
    pub name: &'static str,
    pub occurred_at: DateTime<Utc>,
    pub payload: TPayload,
}

impl<TPayload> DomainEvent<TPayload> {
    pub fn new(name: &'static str, payload: TPayload) -> Self {
        Self {
            name,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleanupEventPayload {
    CategoryChanged {
        client: String,
        hash: String,
        name: String,
        old_category: String,
        new_category: String,
        is_tag: bool,
    },
    DownloadCleaned {
        client: String,
        hash: String,
        name: String,
        category: String,
        reason: CleanReason,
        delete_source_files: bool,
    },
}

pub type CleanupEvent = DomainEvent<CleanupEventPayload>;
