mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dl_common::AppConfig;
use dl_common::config::AdblockSource;
use dl_filter::QueryClassifier;
use dl_store::{LogStore, QueryLogger};
use dl_sync::{DomainView, SyncCoordinator, ViewDelegate, run_retention};
use supervisor::{TaskPriority, spawn_supervised};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Logs what the top-level view would redraw.
struct LoggingDelegate;

impl ViewDelegate for LoggingDelegate {
    fn reset(&self) {
        debug!("view: reset");
    }
    fn delete(&self, positions: Vec<usize>) {
        debug!("view: delete {:?}", positions);
    }
    fn insert(&self, position: usize) {
        debug!("view: insert at {}", position);
    }
    fn update(&self, position: usize) {
        debug!("view: update at {}", position);
    }
    fn moved(&self, from: usize, to: usize) {
        debug!("view: move {} -> {}", from, to);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dnslens=debug".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("dnslens starting...");

    let config = AppConfig::load(None)?;
    info!(
        "Config loaded: db {}, sync every {}s, retention {} days, adblock {}",
        config.db_path,
        config.sync_interval_secs,
        config.retention_days,
        if config.adblock.enabled { "enabled" } else { "disabled" },
    );

    // ── Store, logger, classifier ──────────────────────────────────────

    let store = Arc::new(
        LogStore::open(&config.db_path).context("Query log store is unusable, giving up")?,
    );
    let (logger, _capture) =
        QueryLogger::spawn(store.clone(), Duration::from_millis(config.buffer_flush_ms));
    let classifier = Arc::new(QueryClassifier::new(store.clone(), Some(logger.clone()))?);

    if config.adblock.enabled && !config.adblock.sources.is_empty() {
        if let Err(e) = update_blocklists(&classifier, &config.adblock.sources).await {
            warn!("Initial blocklist import failed: {:#}", e);
        }
    }

    // ── Sync and the top-level view ────────────────────────────────────

    let earliest = config.initial_earliest(dl_common::now_ts());
    let coordinator = SyncCoordinator::new(store.clone(), earliest, None);
    let ticker = coordinator
        .start(Duration::from_secs(config.sync_interval_secs.max(1)))
        .await;
    let view = DomainView::attach(&coordinator, None, Arc::new(LoggingDelegate)).await;

    // ── Background tasks ───────────────────────────────────────────────

    {
        let coordinator = coordinator.clone();
        let days = config.retention_days;
        let every = Duration::from_secs(config.retention_check_hours.max(1) * 3600);
        spawn_supervised("retention", TaskPriority::Essential, move || {
            let coordinator = coordinator.clone();
            async move {
                run_retention(coordinator, days, every).await;
                Ok::<(), anyhow::Error>(())
            }
        });
    }

    if config.adblock.enabled && config.adblock.auto_update_hours > 0 {
        let classifier = classifier.clone();
        let sources = config.adblock.sources.clone();
        let every = Duration::from_secs(config.adblock.auto_update_hours * 3600);
        spawn_supervised("blocklist-refresh", TaskPriority::Background, move || {
            refresh_blocklists(classifier.clone(), sources.clone(), every)
        });
    }

    info!("dnslens ready, reading domains from stdin");

    // ── Query feed ─────────────────────────────────────────────────────

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let domain = line.trim();
        if domain.is_empty() || domain.starts_with('#') {
            continue;
        }
        let blocked = classifier.process_query(domain);
        println!("{} {}", if blocked { "blocked" } else { "allowed" }, domain);
    }

    // ── Final sync and report ──────────────────────────────────────────

    logger.flush().await;
    // the first call may join a pass that persisted before the flush
    coordinator.sync().await;
    coordinator.sync().await;
    view.idle().await;

    println!("{:>8} {:>8}  domain", "total", "blocked");
    for record in view.records() {
        println!("{:>8} {:>8}  {}", record.total, record.blocked, record.domain);
    }

    ticker.abort();
    info!("dnslens stopped");
    Ok(())
}

async fn refresh_blocklists(
    classifier: Arc<QueryClassifier>,
    sources: Vec<AdblockSource>,
    every: Duration,
) -> anyhow::Result<()> {
    loop {
        tokio::time::sleep(every).await;
        info!("Running scheduled blocklist update...");
        update_blocklists(&classifier, &sources).await?;
    }
}

/// Download every source and mark the union blocked.
async fn update_blocklists(
    classifier: &Arc<QueryClassifier>,
    sources: &[AdblockSource],
) -> anyhow::Result<()> {
    let (domains, results) = dl_filter::sources::fetch_all(sources).await;
    let failed = results.iter().filter(|r| r.error.is_some()).count();

    let classifier = classifier.clone();
    let imported = tokio::task::spawn_blocking(move || {
        classifier.block_all(domains.iter().map(String::as_str))
    })
    .await??;

    info!(
        "Blocklist update complete: {} domains from {} source(s), {} failed",
        imported,
        results.len(),
        failed
    );
    Ok(())
}
