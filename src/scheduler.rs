//! Periodic schedulers
//!
//! Two independent timers: the ingestion tick and the enhancement tick.
//! Overlap guards live in the engines themselves (a tick that finds the
//! previous one still running logs and returns), so a missed tick costs
//! nothing: the next one re-derives all work from the store. On shutdown
//! both loops stop arming new ticks; an in-flight tick always completes
//! because the select arm runs to the end before the signal is checked
//! again.

use crate::classifier::AddressClassifier;
use crate::config::EnhancementConfig;
use crate::db::FlowStore;
use crate::enhancement::EnhancementEngine;
use crate::pipeline::SyncEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

/// Maximum age of the node-operator snapshot before the enhancement tick
/// refreshes it.
const CLASSIFIER_STALE_SECS: i64 = 600;

/// Periodic ingestion task. The first tick fires immediately.
pub async fn run_sync_scheduler(
    engine: Arc<SyncEngine>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("⏰ Sync scheduler started (every {}s)", interval_secs);
    let mut timer = interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = engine.tick().await {
                    log::error!("❌ Sync tick failed: {}", e);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("Sync scheduler stopping");
                    break;
                }
            }
        }
    }
}

/// Periodic enhancement task. Skips a run while the unknown backlog is
/// below the configured threshold, and keeps the classifier's operator
/// snapshot fresh.
pub async fn run_enhancement_scheduler(
    engine: Arc<EnhancementEngine>,
    store: Arc<FlowStore>,
    classifier: Arc<AddressClassifier>,
    config: EnhancementConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.job_enabled {
        log::info!("Enhancement job disabled by configuration");
        return;
    }
    log::info!(
        "⏰ Enhancement scheduler started (every {}min, threshold {})",
        config.job_interval_minutes,
        config.min_unknowns_threshold
    );

    let retry_secs = (config.failed_retry_hours * 3600) as i64;
    let mut timer = interval(Duration::from_secs(config.job_interval_minutes.max(1) * 60));
    if !config.run_on_start {
        // Consume the immediate first tick so the first run waits a full
        // interval.
        timer.tick().await;
    }

    loop {
        tokio::select! {
            _ = timer.tick() => {
                classifier.refresh_if_stale(CLASSIFIER_STALE_SECS).await;

                match store.count_unknown_wallets(retry_secs) {
                    Ok(count) if (count as usize) < config.min_unknowns_threshold => {
                        log::debug!(
                            "enhancement: {} unknowns below threshold {}, skipping run",
                            count,
                            config.min_unknowns_threshold
                        );
                    }
                    Ok(_) => {
                        if let Err(e) = engine.clone().enhance_unknowns().await {
                            log::error!("❌ Enhancement run failed: {}", e);
                        }
                    }
                    Err(e) => log::error!("❌ Unknown-wallet count failed: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("Enhancement scheduler stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::AddressBook;
    use crate::config::{SourceKind, SourceSettings};
    use crate::enhancement::EnhancementCache;
    use crate::indexer::{
        AddressTx, IndexerApi, IndexerClient, NormalizedBlock, NormalizedTx,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::NamedTempFile;
    use tokio::time::timeout;

    struct EmptyChain {
        tip: u64,
    }

    #[async_trait]
    impl IndexerApi for EmptyChain {
        async fn chain_height(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.tip)
        }
        async fn get_block(
            &self,
            height: u64,
        ) -> Result<NormalizedBlock, Box<dyn std::error::Error + Send + Sync>> {
            Ok(NormalizedBlock {
                height,
                hash: format!("hash{}", height),
                time: height as i64 * 30,
                tx_count: 0,
                size: 100,
                txs: Vec::new(),
            })
        }
        async fn get_transaction(
            &self,
            txid: &str,
        ) -> Result<NormalizedTx, Box<dyn std::error::Error + Send + Sync>> {
            Err(format!("unknown txid {}", txid).into())
        }
        async fn get_address_transactions(
            &self,
            _address: &str,
        ) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Vec::new())
        }
    }

    fn quick_settings() -> SourceSettings {
        SourceSettings {
            base_url: "http://localhost".to_string(),
            batch_size: 5,
            max_concurrent: 2,
            min_request_delay_ms: 0,
            batch_delay_ms: 0,
            rate_limited: false,
            tx_fetch_limit: 10,
            request_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_sync_scheduler_runs_and_stops() {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(crate::db::FlowStore::open(temp.path().to_str().unwrap()).unwrap());
        let classifier = Arc::new(
            AddressClassifier::new(
                AddressBook::from_value(&json!({"exchanges": {}, "foundation": {}})).unwrap(),
                "http://localhost/registry".to_string(),
            )
            .unwrap(),
        );
        let indexer = Arc::new(IndexerClient::with_sources(
            Box::new(EmptyChain { tip: 100 }),
            Box::new(EmptyChain { tip: 100 }),
            quick_settings(),
            quick_settings(),
            SourceKind::Primary,
        ));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            classifier,
            indexer,
            1000,
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sync_scheduler(engine, 3600, rx));

        // Give the immediate first tick a moment to land, then stop.
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        // The immediate tick synced the tip.
        assert_eq!(
            store.get_sync_value("latest_synced").unwrap().as_deref(),
            Some("100")
        );
    }

    #[tokio::test]
    async fn test_enhancement_scheduler_disabled_returns() {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(crate::db::FlowStore::open(temp.path().to_str().unwrap()).unwrap());
        let classifier = Arc::new(
            AddressClassifier::new(
                AddressBook::from_value(&json!({"exchanges": {}, "foundation": {}})).unwrap(),
                "http://localhost/registry".to_string(),
            )
            .unwrap(),
        );
        let cache = Arc::new(EnhancementCache::new());
        let config = EnhancementConfig {
            max_hops: 3,
            time_window_blocks: 86_400,
            min_confidence: 0.8,
            failed_retry_hours: 24,
            job_enabled: false,
            job_interval_minutes: 10,
            run_on_start: false,
            min_unknowns_threshold: 5,
            multi_hop_default_depth: 2,
            multi_hop_max_depth: 5,
            multi_hop_time_window_blocks: 20_160,
            max_branches_per_wallet: 3,
            historical_detection_enabled: true,
            historical_time_window_blocks: 1_051_200,
            historical_connections_enabled: true,
            parallel_enabled: false,
            parallel_batch_size: 4,
            parallel_max_concurrent: 4,
        };

        let chain: Arc<dyn IndexerApi> = Arc::new(EmptyChain { tip: 0 });
        let engine = Arc::new(EnhancementEngine::new(
            store.clone(),
            classifier.clone(),
            chain,
            cache,
            config.clone(),
            30,
        ));

        let (_tx, rx) = watch::channel(false);
        // Returns immediately instead of arming a timer.
        timeout(
            Duration::from_secs(2),
            run_enhancement_scheduler(engine, store, classifier, config, rx),
        )
        .await
        .expect("disabled scheduler should return at once");
    }
}
