// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use sweeparr_application::{
    ArrClient, ArrRemovalSink, DownloadServiceFactory, FsHardLinkFileService,
    HardLinkFileService, HttpArrClient, LoggingEventPublisher, RemovalPublisher, RuleEngine,
    ServiceContext, StrikeTracker,
};
use sweeparr_config::{load as load_config, AppConfig, TelemetryConfig};
use sweeparr_scheduler::jobs::{DownloadCleanerJob, QueueCleanerJob};
use sweeparr_scheduler::registry::JobRegistry;
use sweeparr_scheduler::Scheduler;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ARR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "sweeparr", about = "Cleans stuck downloads out of arr queues and torrent clients")]
struct Cli {
    /// TOML configuration file, layered over defaults and under SWEEPARR_ variables.
    #[arg(short, long, env = "SWEEPARR_CONFIG")]
    config: Option<PathBuf>,

    /// Run both cleaners once and exit instead of scheduling them.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.telemetry);
    config.validate()?;

    info!(
        target: "cli",
        arr_instances = config.arr_instances.len(),
        download_clients = config.download_clients.len(),
        "configuration loaded"
    );

    let (queue_cleaner, download_cleaner) = build_jobs(&config)?;

    if cli.once {
        JobRegistry::execute_job("queue-cleaner", &queue_cleaner).await;
        JobRegistry::execute_job("download-cleaner", &download_cleaner).await;
        return Ok(());
    }

    let scheduler = Scheduler::new(config.scheduler.clone());
    scheduler.register_jobs(queue_cleaner, download_cleaner).await?;
    let _scheduler_handle = scheduler.start();

    shutdown_signal().await;
    Ok(())
}

fn init_tracing(telemetry: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    if telemetry.json {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_level(true),
            )
            .init();
    }
}

/// Wire adapters, rule engine and arr client into the two cleaner jobs.
///
/// Unknown client kinds and malformed client urls fail here, before anything is scheduled.
fn build_jobs(config: &AppConfig) -> Result<(QueueCleanerJob, DownloadCleanerJob)> {
    let strikes = Arc::new(StrikeTracker::new());
    let hard_links: Arc<dyn HardLinkFileService> = Arc::new(FsHardLinkFileService::new());
    let rules = Arc::new(RuleEngine::new(
        config.queue_cleaner.stall_rules.clone(),
        config.queue_cleaner.slow_rules.clone(),
        strikes.clone(),
    ));

    let context = Arc::new(ServiceContext {
        queue_cleaner: config.queue_cleaner.clone(),
        download_cleaner: config.download_cleaner.clone(),
        strikes: strikes.clone(),
        rules,
        hard_links: hard_links.clone(),
        events: Arc::new(LoggingEventPublisher),
    });

    let clients = DownloadServiceFactory::create_all(&config.download_clients, context)?;
    info!(target: "cli", clients = clients.len(), "download clients ready");

    let arr: Arc<dyn ArrClient> = Arc::new(HttpArrClient::new(
        config.queue_cleaner.failed_import.clone(),
        strikes,
        ARR_TIMEOUT,
    )?);
    let removals = Arc::new(RemovalPublisher::new(Arc::new(ArrRemovalSink::new(
        arr.clone(),
        &config.arr_instances,
    ))));

    let queue_cleaner = QueueCleanerJob::new(
        config.queue_cleaner.clone(),
        config.arr_instances.clone(),
        arr,
        clients.clone(),
        removals,
    );
    let download_cleaner =
        DownloadCleanerJob::new(config.download_cleaner.clone(), clients, hard_links);

    Ok((queue_cleaner, download_cleaner))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("install SIGINT handler");

    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");

    #[cfg(not(unix))]
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    tokio::select! {
        _ = interrupt.recv() => {},
        _ = terminate.recv() => {},
    }

    #[cfg(not(unix))]
    {
        interrupt.await.expect("ctrl_c handler");
    }

    info!(target: "cli", "shutdown signal received");
}
