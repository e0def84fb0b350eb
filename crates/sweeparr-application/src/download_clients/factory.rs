// SPDX-License-Identifier: GPL-3.0-or-later
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sweeparr_config::DownloadClientConfig;
use thiserror::Error;
use tracing::info;

use super::deluge::DelugeService;
use super::qbittorrent::QBittorrentService;
use super::rtorrent::RTorrentService;
use super::transmission::TransmissionService;
use super::utorrent::UTorrentService;
use super::{DownloadClientError, DownloadService, ServiceContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadClientKind {
    QBittorrent,
    Deluge,
    Transmission,
    UTorrent,
    RTorrent,
}

impl FromStr for DownloadClientKind {
    type Err = FactoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "qbittorrent" | "qbit" => Ok(Self::QBittorrent),
            "deluge" => Ok(Self::Deluge),
            "transmission" => Ok(Self::Transmission),
            "utorrent" | "µtorrent" => Ok(Self::UTorrent),
            "rtorrent" => Ok(Self::RTorrent),
            _ => Err(FactoryError::UnknownKind(value.to_string())),
        }
    }
}

impl fmt::Display for DownloadClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QBittorrent => write!(f, "qbittorrent"),
            Self::Deluge => write!(f, "deluge"),
            Self::Transmission => write!(f, "transmission"),
            Self::UTorrent => write!(f, "utorrent"),
            Self::RTorrent => write!(f, "rtorrent"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("unknown download client kind '{0}'")]
    UnknownKind(String),
    #[error("failed to build download client '{name}': {source}")]
    Build {
        name: String,
        #[source]
        source: DownloadClientError,
    },
}

/// Builds the adapter for a configured client.
pub struct DownloadServiceFactory;

impl DownloadServiceFactory {
    pub fn create(
        config: &DownloadClientConfig,
        context: Arc<ServiceContext>,
    ) -> Result<Arc<dyn DownloadService>, FactoryError> {
        let kind: DownloadClientKind = config.kind.parse()?;
        let build_error = |source: DownloadClientError| FactoryError::Build {
            name: config.name.clone(),
            source,
        };

        let service: Arc<dyn DownloadService> = match kind {
            DownloadClientKind::QBittorrent => {
                Arc::new(QBittorrentService::new(config, context).map_err(build_error)?)
            }
            DownloadClientKind::Deluge => {
                Arc::new(DelugeService::new(config, context).map_err(build_error)?)
            }
            DownloadClientKind::Transmission => {
                Arc::new(TransmissionService::new(config, context).map_err(build_error)?)
            }
            DownloadClientKind::UTorrent => {
                Arc::new(UTorrentService::new(config, context).map_err(build_error)?)
            }
            DownloadClientKind::RTorrent => {
                Arc::new(RTorrentService::new(config, context).map_err(build_error)?)
            }
        };

        info!(target: "download_client", client = %config.name, %kind, "download client configured");
        Ok(service)
    }

    /// Adapters for every enabled client. A bad entry fails the whole set.
    pub fn create_all(
        configs: &[DownloadClientConfig],
        context: Arc<ServiceContext>,
    ) -> Result<Vec<Arc<dyn DownloadService>>, FactoryError> {
        configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| Self::create(config, context.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download_clients::testing::ContextParts;

    fn config(kind: &str) -> DownloadClientConfig {
        DownloadClientConfig {
            name: format!("{kind}-1"),
            kind: kind.to_string(),
            host: "http://localhost:8080".to_string(),
            ..DownloadClientConfig::default()
        }
    }

    #[test]
    fn parses_kinds_case_insensitively() {
        assert_eq!("qBittorrent".parse::<DownloadClientKind>().ok(), Some(DownloadClientKind::QBittorrent));
        assert_eq!(" RTorrent ".parse::<DownloadClientKind>().ok(), Some(DownloadClientKind::RTorrent));
        assert!("sabnzbd".parse::<DownloadClientKind>().is_err());
    }

    #[test]
    fn creates_each_adapter() {
        let context = ContextParts::default().build();
        for kind in ["qbittorrent", "deluge", "transmission", "utorrent", "rtorrent"] {
            let service = DownloadServiceFactory::create(&config(kind), context.clone())
                .expect("adapter builds");
            assert_eq!(service.name(), format!("{kind}-1"));
        }
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let err = DownloadServiceFactory::create(&config("nzbget"), ContextParts::default().build())
            .err()
            .expect("unknown kind fails");
        assert!(matches!(err, FactoryError::UnknownKind(kind) if kind == "nzbget"));
    }

    #[test]
    fn disabled_clients_are_skipped() {
        let mut disabled = config("deluge");
        disabled.enabled = false;
        let services = DownloadServiceFactory::create_all(
            &[config("qbittorrent"), disabled],
            ContextParts::default().build(),
        )
        .expect("builds");
        assert_eq!(services.len(), 1);
    }
}
