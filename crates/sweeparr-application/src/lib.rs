// SPDX-License-Identifier: GPL-3.0-or-later
pub mod arr;
pub mod download_clients;
pub mod events;
pub mod hardlinks;
pub mod removal;
pub mod rules;
pub mod seeding;
pub mod strikes;

pub use arr::{is_failed_import, ArrClient, ArrError, ArrQueueSource, HttpArrClient};
pub use download_clients::{
    DownloadClientError, DownloadService, DownloadServiceFactory, FileSelection, ServiceContext,
    TorrentFile, TorrentItem,
};
pub use events::{EventPublisher, InMemoryEventBus, LoggingEventPublisher};
pub use hardlinks::{check_hard_links, FsHardLinkFileService, HardLinkFileService, LinkCheck};
pub use removal::{
    ArrRemovalSink, InMemoryRemovalSink, PublishOutcome, RemovalError, RemovalPublisher,
    RemovalSink,
};
pub use rules::{RuleEngine, RuleEvaluator, RuleOutcome};
pub use seeding::{evaluate_seeding_rule, CleanDecision};
pub use strikes::StrikeTracker;
