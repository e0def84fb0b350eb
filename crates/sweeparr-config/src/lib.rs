// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sweeparr_domain::InstanceType;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub queue_cleaner_interval_secs: u64,
    pub download_cleaner_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            queue_cleaner_interval_secs: 5 * 60,
            download_cleaner_interval_secs: 60 * 60,
        }
    }
}

/// One configured torrent client. `kind` is resolved by the download service factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadClientConfig {
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    /// Base URL of the client web API. For rTorrent this is the full XML-RPC endpoint.
    pub host: String,
    pub url_base: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DownloadClientConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            enabled: true,
            host: String::new(),
            url_base: None,
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

impl DownloadClientConfig {
    /// Host joined with the optional url base, without a trailing slash.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        match self.url_base.as_deref().map(|b| b.trim_matches('/')) {
            Some(base) if !base.is_empty() => format!("{host}/{base}"),
            _ => host.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrInstanceConfig {
    pub name: String,
    pub instance_type: InstanceType,
    pub enabled: bool,
    pub url: String,
    pub api_key: String,
    /// Only meaningful for Whisparr: 2 behaves like Sonarr, 3 like Radarr.
    pub version: Option<u8>,
    pub page_size: u32,
}

impl Default for ArrInstanceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            instance_type: InstanceType::Sonarr,
            enabled: true,
            url: String::new(),
            api_key: String::new(),
            version: None,
            page_size: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentPrivacy {
    Public,
    Private,
    #[default]
    Both,
}

impl TorrentPrivacy {
    pub fn matches(&self, is_private: bool) -> bool {
        match self {
            Self::Public => !is_private,
            Self::Private => is_private,
            Self::Both => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StallRule {
    pub name: String,
    pub enabled: bool,
    pub max_strikes: u16,
    pub privacy: TorrentPrivacy,
    pub min_completion_percentage: f64,
    pub max_completion_percentage: f64,
    pub reset_strikes_on_progress: bool,
    pub delete_private_torrents_from_client: bool,
}

impl Default for StallRule {
    fn default() -> Self {
        Self {
            name: "stalled".to_string(),
            enabled: true,
            max_strikes: 3,
            privacy: TorrentPrivacy::Both,
            min_completion_percentage: 0.0,
            max_completion_percentage: 100.0,
            reset_strikes_on_progress: true,
            delete_private_torrents_from_client: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowRule {
    pub name: String,
    pub enabled: bool,
    pub max_strikes: u16,
    pub privacy: TorrentPrivacy,
    pub min_completion_percentage: f64,
    pub max_completion_percentage: f64,
    /// Speed in bytes per second below which an observation counts. 0 disables the speed check.
    pub min_speed_bytes: u64,
    /// ETA in hours above which an observation counts. 0 disables the time check.
    pub max_time_hours: f64,
    pub ignore_above_size_bytes: Option<u64>,
    pub delete_private_torrents_from_client: bool,
}

impl Default for SlowRule {
    fn default() -> Self {
        Self {
            name: "slow".to_string(),
            enabled: true,
            max_strikes: 3,
            privacy: TorrentPrivacy::Both,
            min_completion_percentage: 0.0,
            max_completion_percentage: 100.0,
            min_speed_bytes: 0,
            max_time_hours: 0.0,
            ignore_above_size_bytes: None,
            delete_private_torrents_from_client: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FailedImportConfig {
    pub max_strikes: u16,
    pub ignore_private: bool,
    pub delete_private: bool,
    /// Status messages containing any of these are never struck.
    pub ignored_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueueCleanerConfig {
    pub enabled: bool,
    pub ignored_downloads: Vec<String>,
    pub downloading_metadata_max_strikes: u16,
    pub failed_import: FailedImportConfig,
    pub stall_rules: Vec<StallRule>,
    pub slow_rules: Vec<SlowRule>,
}

impl QueueCleanerConfig {
    pub fn has_active_stall_rules(&self) -> bool {
        self.stall_rules
            .iter()
            .any(|rule| rule.enabled && rule.max_strikes > 0)
    }

    pub fn has_active_slow_rules(&self) -> bool {
        self.slow_rules
            .iter()
            .any(|rule| rule.enabled && rule.max_strikes > 0)
    }
}

/// Seeding policy for one category. Times are minutes, `-1` means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedingRule {
    pub name: String,
    pub max_ratio: f64,
    pub min_seed_time: f64,
    pub max_seed_time: f64,
    pub delete_source_files: bool,
}

impl Default for SeedingRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_ratio: -1.0,
            min_seed_time: 0.0,
            max_seed_time: -1.0,
            delete_source_files: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UnlinkedConfig {
    pub enabled: bool,
    pub target_category: String,
    /// Tag items instead of moving them to another category (qBittorrent only).
    pub use_tag: bool,
    pub ignored_root_dirs: Vec<PathBuf>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DownloadCleanerConfig {
    pub enabled: bool,
    pub ignored_downloads: Vec<String>,
    pub delete_private: bool,
    pub categories: Vec<SeedingRule>,
    pub unlinked: UnlinkedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub telemetry: TelemetryConfig,
    pub scheduler: SchedulerConfig,
    pub download_clients: Vec<DownloadClientConfig>,
    pub arr_instances: Vec<ArrInstanceConfig>,
    pub queue_cleaner: QueueCleanerConfig,
    pub download_cleaner: DownloadCleanerConfig,
}

impl AppConfig {
    /// Reject combinations the cleaners cannot act on.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.scheduler.queue_cleaner_interval_secs == 0
            || self.scheduler.download_cleaner_interval_secs == 0
        {
            problems.push("scheduler intervals must be greater than zero".to_string());
        }

        for client in &self.download_clients {
            if client.name.trim().is_empty() {
                problems.push("download client without a name".to_string());
            }
            if client.enabled && client.host.trim().is_empty() {
                problems.push(format!("download client '{}' has no host", client.name));
            }
        }

        for instance in &self.arr_instances {
            if instance.enabled && instance.url.trim().is_empty() {
                problems.push(format!("arr instance '{}' has no url", instance.name));
            }
            if instance.instance_type == InstanceType::Whisparr
                && !matches!(instance.version, Some(2) | Some(3))
            {
                problems.push(format!(
                    "whisparr instance '{}' needs version 2 or 3",
                    instance.name
                ));
            }
        }

        let unlinked = &self.download_cleaner.unlinked;
        if unlinked.enabled {
            if unlinked.target_category.trim().is_empty() {
                problems.push("unlinked handling enabled without a target category".to_string());
            }
            if unlinked.categories.is_empty() {
                problems.push("unlinked handling enabled without categories".to_string());
            }
        }

        for rule in &self.download_cleaner.categories {
            if rule.max_ratio < 0.0 && rule.max_seed_time < 0.0 {
                problems.push(format!(
                    "seeding rule '{}' has neither max ratio nor max seed time",
                    rule.name
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            bail!("invalid configuration: {}", problems.join("; "))
        }
    }
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: SWEEPARR_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("SWEEPARR_").split("__"));

    let config: AppConfig = figment.extract()?;
    info!(
        target: "config",
        download_clients = config.download_clients.len(),
        arr_instances = config.arr_instances.len(),
        "configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn defaults_load_without_file() {
        let config = load(None).expect("defaults should load");
        assert_eq!(config.scheduler.queue_cleaner_interval_secs, 300);
        assert!(config.download_clients.is_empty());
        assert!(!config.queue_cleaner.enabled);
    }

    #[test]
    fn toml_file_populates_nested_sections() {
        let file = write_config(
            r#"
            [queue_cleaner]
            enabled = true
            downloading_metadata_max_strikes = 2

            [[queue_cleaner.stall_rules]]
            name = "public stalls"
            max_strikes = 5
            privacy = "public"

            [[download_clients]]
            name = "qbit"
            kind = "qbittorrent"
            host = "http://localhost:8080/"
            url_base = "/qbt/"

            [[arr_instances]]
            name = "sonarr"
            instance_type = "sonarr"
            url = "http://localhost:8989"
            api_key = "secret"

            [[download_cleaner.categories]]
            name = "tv-sonarr"
            max_ratio = 2.0
            "#,
        );

        let config = load(Some(file.path())).expect("config should load");

        assert!(config.queue_cleaner.enabled);
        assert_eq!(config.queue_cleaner.downloading_metadata_max_strikes, 2);
        let rule = &config.queue_cleaner.stall_rules[0];
        assert_eq!(rule.max_strikes, 5);
        assert_eq!(rule.privacy, TorrentPrivacy::Public);
        assert!(rule.enabled);
        assert_eq!(rule.max_completion_percentage, 100.0);

        assert_eq!(config.download_clients[0].base_url(), "http://localhost:8080/qbt");
        assert_eq!(config.download_clients[0].timeout_secs, 30);
        assert_eq!(config.arr_instances[0].page_size, 200);

        let seeding = &config.download_cleaner.categories[0];
        assert_eq!(seeding.max_ratio, 2.0);
        assert_eq!(seeding.max_seed_time, -1.0);
    }

    #[test]
    fn active_rules_require_strikes() {
        let mut config = QueueCleanerConfig::default();
        assert!(!config.has_active_stall_rules());

        config.stall_rules.push(StallRule {
            max_strikes: 0,
            ..StallRule::default()
        });
        assert!(!config.has_active_stall_rules());

        config.slow_rules.push(SlowRule {
            enabled: false,
            ..SlowRule::default()
        });
        assert!(!config.has_active_slow_rules());

        config.slow_rules.push(SlowRule::default());
        assert!(config.has_active_slow_rules());
    }

    #[test]
    fn validate_rejects_unlinked_without_target() {
        let mut config = AppConfig::default();
        config.download_cleaner.unlinked.enabled = true;
        config.download_cleaner.unlinked.categories = vec!["movies".to_string()];

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("target category"));
    }

    #[test]
    fn validate_requires_whisparr_version() {
        let mut config = AppConfig::default();
        config.arr_instances.push(ArrInstanceConfig {
            name: "whisparr".to_string(),
            instance_type: InstanceType::Whisparr,
            url: "http://localhost:6969".to_string(),
            ..ArrInstanceConfig::default()
        });
        assert!(config.validate().is_err());

        config.arr_instances[0].version = Some(3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn privacy_filter_matches() {
        assert!(TorrentPrivacy::Both.matches(true));
        assert!(TorrentPrivacy::Public.matches(false));
        assert!(!TorrentPrivacy::Public.matches(true));
        assert!(TorrentPrivacy::Private.matches(true));
    }
}
