use fluxflow::classifier::{AddressBook, AddressClassifier};
use fluxflow::config::Config;
use fluxflow::db::FlowStore;
use fluxflow::enhancement::{EnhancementCache, EnhancementEngine};
use fluxflow::indexer::{IndexerApi, IndexerClient};
use fluxflow::pipeline::SyncEngine;
use fluxflow::scheduler::{run_enhancement_scheduler, run_sync_scheduler};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = Config::from_env()?;
    log::info!("🚀 Starting fluxflow...");
    log::info!("📊 Configuration:");
    log::info!("   Database: {}", config.db_path);
    log::info!(
        "   Active source: {} ({})",
        config.active_source.as_str(),
        config.source_settings(config.active_source).base_url
    );
    log::info!(
        "   Retention window: {} blocks ({}s block time)",
        config.retention_window_blocks,
        config.block_time_seconds
    );
    log::info!("   Periods: {:?}", config.periods);
    log::info!(
        "   Enhancement: max_hops={} min_confidence={} historical={} parallel={}",
        config.enhancement.max_hops,
        config.enhancement.min_confidence,
        config.enhancement.historical_detection_enabled,
        config.enhancement.parallel_enabled
    );

    let store = Arc::new(FlowStore::open(&config.db_path)?);

    let book = AddressBook::load(&config.address_book_path)?;
    log::info!(
        "   Address book: {} exchanges, {} foundation addresses",
        book.exchanges.len(),
        book.foundation.len()
    );
    let classifier = Arc::new(AddressClassifier::new(
        book,
        config.node_registry_url.clone(),
    )?);
    // Initial registry load; a failure here keeps an empty snapshot and the
    // enhancement scheduler retries on its staleness check.
    classifier.refresh_node_operators().await;

    let indexer = Arc::new(IndexerClient::from_config(&config)?);
    let cache = Arc::new(EnhancementCache::new());

    let sync_engine = Arc::new(SyncEngine::new(
        store.clone(),
        classifier.clone(),
        indexer.clone(),
        config.retention_window_blocks,
    ));
    let graph_api: Arc<dyn IndexerApi> = indexer.clone();
    let enhancement_engine = Arc::new(EnhancementEngine::new(
        store.clone(),
        classifier.clone(),
        graph_api,
        cache,
        config.enhancement.clone(),
        config.block_time_seconds,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_task = tokio::spawn(run_sync_scheduler(
        sync_engine.clone(),
        config.sync_interval_seconds,
        shutdown_rx.clone(),
    ));
    let enhancement_task = tokio::spawn(run_enhancement_scheduler(
        enhancement_engine.clone(),
        store.clone(),
        classifier.clone(),
        config.enhancement.clone(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    log::info!("🛑 Shutdown signal received, letting in-flight ticks finish");
    let _ = shutdown_tx.send(true);
    let _ = sync_task.await;
    let _ = enhancement_task.await;

    let stats = store.get_stats()?;
    let counters = enhancement_engine.counters();
    log::info!(
        "👋 fluxflow stopped: {} blocks, {} transactions, {} flow events ({} enhanced over {} runs)",
        stats.block_count,
        stats.tx_count,
        stats.flow_event_count,
        counters.events_enhanced,
        counters.runs
    );
    Ok(())
}
