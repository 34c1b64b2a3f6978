//! Sync engine: drives one ingestion tick
//!
//! A tick re-reads the chain tip, fetches forward toward it (or backward
//! until the retention window is covered), filters out transactions that
//! touch no classified address, turns the rest into flow events and commits
//! everything in batched writes. Overlapping ticks are rejected with an
//! early return; the next tick re-derives all work from the store.

use crate::classifier::AddressClassifier;
use crate::config::SourceSettings;
use crate::db::FlowStore;
use crate::indexer::{IndexerApi, IndexerClient, NormalizedBlock, NormalizedTx};
use crate::model::{
    flow_type_for, AddressDetails, AddressType, BlockRow, DataOrigin, FlowEvent, TxRow,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

const LATEST_SYNCED_KEY: &str = "latest_synced";

/// Where a tick currently is. Stored in the stats snapshot for the status
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Processing,
    Committing,
}

/// Result of one tick attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tick ran (possibly finding nothing to do).
    Completed,
    /// A previous tick was still running.
    Skipped,
}

/// Performance counters for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub phase: SyncPhase,
    pub blocks_per_minute: f64,
    pub last_batch_size: usize,
    pub last_batch_duration_ms: u64,
    pub consecutive_errors: u32,
    pub last_sync_time: Option<i64>,
    pub total_blocks_processed: u64,
    pub total_flow_events: u64,
}

impl Default for SyncStats {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            blocks_per_minute: 0.0,
            last_batch_size: 0,
            last_batch_duration_ms: 0,
            consecutive_errors: 0,
            last_sync_time: None,
            total_blocks_processed: 0,
            total_flow_events: 0,
        }
    }
}

pub struct SyncEngine {
    store: Arc<FlowStore>,
    classifier: Arc<AddressClassifier>,
    indexer: Arc<IndexerClient>,
    retention_window_blocks: u64,
    running: AtomicBool,
    stats: Mutex<SyncStats>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<FlowStore>,
        classifier: Arc<AddressClassifier>,
        indexer: Arc<IndexerClient>,
        retention_window_blocks: u64,
    ) -> Self {
        Self {
            store,
            classifier,
            indexer,
            retention_window_blocks,
            running: AtomicBool::new(false),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.consecutive_errors = self.indexer.consecutive_errors();
        stats
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.stats.lock().unwrap().phase = phase;
    }

    /// Run one ingestion tick. Rejects overlap: if the previous tick has not
    /// reached idle yet, logs and returns without doing anything.
    pub async fn tick(&self) -> Result<TickOutcome, Box<dyn std::error::Error + Send + Sync>> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::info!("⏭️  Sync tick still running, skipping this one");
            return Ok(TickOutcome::Skipped);
        }
        let result = self.run_tick().await;
        self.set_phase(SyncPhase::Idle);
        self.running.store(false, Ordering::SeqCst);
        result.map(|_| TickOutcome::Completed)
    }

    async fn run_tick(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let started = Instant::now();
        let settings = self.indexer.active_settings();

        let tip = self.indexer.chain_height().await?;
        let latest_synced = self.latest_synced()?.unwrap_or(tip.saturating_sub(1));
        let heights = self.plan_heights(tip, latest_synced, &settings)?;
        if heights.is_empty() {
            log::debug!("sync tick: nothing to fetch at tip {}", tip);
            return Ok(());
        }
        let forward = heights[0] > latest_synced;

        self.set_phase(SyncPhase::Fetching);
        let blocks = self.fetch_blocks(&heights, &settings).await;

        self.set_phase(SyncPhase::Processing);
        let mut block_rows = Vec::new();
        let mut tx_rows = Vec::new();
        let mut events = Vec::new();
        for block in &blocks {
            block_rows.push(block_row(block));
            let (txs, block_events) = build_flow_events(block, &self.classifier);
            tx_rows.extend(txs);
            events.extend(block_events);
        }

        self.set_phase(SyncPhase::Committing);
        self.store.save_blocks_batch(&block_rows)?;
        self.store.save_txs_batch(&tx_rows)?;
        let written = self.store.save_flow_events_batch(&events)?;

        if forward {
            if let Some(advanced) =
                contiguous_advance(latest_synced, &heights, &blocks)
            {
                self.store
                    .set_sync_value(LATEST_SYNCED_KEY, &advanced.to_string())?;
            }
        }

        let duration = started.elapsed();
        {
            let mut stats = self.stats.lock().unwrap();
            stats.last_batch_size = blocks.len();
            stats.last_batch_duration_ms = duration.as_millis() as u64;
            stats.blocks_per_minute = if duration.as_secs_f64() > 0.0 {
                blocks.len() as f64 / duration.as_secs_f64() * 60.0
            } else {
                0.0
            };
            stats.last_sync_time = Some(chrono::Utc::now().timestamp());
            stats.total_blocks_processed += blocks.len() as u64;
            stats.total_flow_events += written as u64;
        }
        log::info!(
            "📦 Synced {} blocks ({} flow events) in {:?} [{}]",
            blocks.len(),
            written,
            duration,
            if forward { "forward" } else { "backfill" }
        );

        self.maybe_cleanup(tip)?;
        Ok(())
    }

    fn latest_synced(&self) -> Result<Option<u64>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self
            .store
            .get_sync_value(LATEST_SYNCED_KEY)?
            .and_then(|v| v.parse().ok()))
    }

    /// Forward batch toward the tip, or a backward batch while the stored
    /// span has not covered the retention window yet.
    fn plan_heights(
        &self,
        tip: u64,
        latest_synced: u64,
        settings: &SourceSettings,
    ) -> Result<Vec<u64>, Box<dyn std::error::Error + Send + Sync>> {
        if latest_synced < tip {
            let end = (latest_synced + settings.batch_size).min(tip);
            return Ok((latest_synced + 1..=end).collect());
        }

        let retention_target = tip.saturating_sub(self.retention_window_blocks);
        if let Some((oldest, newest)) = self.store.height_range()? {
            let stored = newest - oldest + 1;
            if stored < self.retention_window_blocks && oldest > retention_target {
                let start = oldest
                    .saturating_sub(settings.batch_size)
                    .max(retention_target);
                return Ok((start..oldest).collect());
            }
        }
        Ok(Vec::new())
    }

    /// Chunks of `max_concurrent` fetched concurrently; chunks run serially
    /// with the inter-batch delay between them. A failed height is skipped,
    /// the rest of the batch still lands.
    async fn fetch_blocks(
        &self,
        heights: &[u64],
        settings: &SourceSettings,
    ) -> Vec<NormalizedBlock> {
        let mut blocks = Vec::new();
        let chunk_size = settings.max_concurrent.max(1);
        let chunks: Vec<&[u64]> = heights.chunks(chunk_size).collect();

        for (index, chunk) in chunks.iter().enumerate() {
            let mut set: JoinSet<(u64, Result<NormalizedBlock, Box<dyn std::error::Error + Send + Sync>>)> =
                JoinSet::new();
            for &height in chunk.iter() {
                let indexer = self.indexer.clone();
                set.spawn(async move { (height, indexer.get_block(height).await) });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(block))) => blocks.push(block),
                    Ok((height, Err(e))) => {
                        log::warn!("⚠️  Block {} skipped after retries: {}", height, e);
                    }
                    Err(e) => log::warn!("⚠️  Block fetch task failed: {}", e),
                }
            }
            if index + 1 < chunks.len() && settings.batch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(settings.batch_delay_ms)).await;
            }
        }

        blocks.sort_by_key(|b| b.height);
        blocks
    }

    /// Run the retention sweep when the stored span exceeds the window by
    /// more than 10%. Runs after the commit, never during one.
    fn maybe_cleanup(&self, tip: u64) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some((oldest, newest)) = self.store.height_range()? else {
            return Ok(());
        };
        let span = newest - oldest + 1;
        if span * 10 > self.retention_window_blocks * 11 {
            let summary = self
                .store
                .cleanup_old_data(tip.max(newest), self.retention_window_blocks)?;
            log::info!(
                "🧹 Retention sweep: removed {} flow events, {} transactions, {} blocks",
                summary.flow_events,
                summary.transactions,
                summary.blocks
            );
        }
        Ok(())
    }
}

/// Highest height the sync checkpoint can advance to: the longest prefix of
/// the planned heights that actually arrived. A gap is retried next tick
/// instead of being skipped forever.
fn contiguous_advance(
    latest_synced: u64,
    planned: &[u64],
    fetched: &[NormalizedBlock],
) -> Option<u64> {
    let mut advanced = None;
    let mut expected = latest_synced + 1;
    for &height in planned {
        if height != expected {
            break;
        }
        if fetched.iter().any(|b| b.height == height) {
            advanced = Some(height);
            expected += 1;
        } else {
            break;
        }
    }
    advanced
}

fn block_row(block: &NormalizedBlock) -> BlockRow {
    BlockRow {
        height: block.height,
        hash: block.hash.clone(),
        time: block.time,
        tx_count: block.tx_count,
        size: block.size,
    }
}

/// A transfer is anything the source did not flag otherwise, minus coinbase.
fn is_transfer(tx: &NormalizedTx) -> bool {
    tx.kind.as_deref().map_or(true, |k| k == "transfer") && !tx.is_coinbase()
}

/// Relevance filter: at least one input or output address classifies as
/// something other than unknown.
fn is_relevant(tx: &NormalizedTx, classifier: &AddressClassifier) -> bool {
    tx.input_addresses()
        .iter()
        .any(|a| classifier.classify(a).address_type != AddressType::Unknown)
        || tx.vout.iter().any(|out| {
            out.addresses
                .iter()
                .any(|a| classifier.classify(a).address_type != AddressType::Unknown)
        })
}

fn type_priority(t: AddressType) -> u8 {
    match t {
        AddressType::Exchange => 0,
        AddressType::NodeOperator => 1,
        AddressType::Foundation => 2,
        AddressType::Unknown => 3,
    }
}

/// Pick the source-side identity: the input address whose classification
/// ranks highest (exchange > node_operator > foundation > unknown).
fn primary_input(
    tx: &NormalizedTx,
    classifier: &AddressClassifier,
) -> (Option<String>, AddressType, Option<AddressDetails>) {
    let mut best: Option<(String, AddressType, Option<AddressDetails>)> = None;
    for address in tx.input_addresses() {
        let classification = classifier.classify(address);
        let better = match &best {
            Some((_, current, _)) => {
                type_priority(classification.address_type) < type_priority(*current)
            }
            None => true,
        };
        if better {
            best = Some((
                address.to_string(),
                classification.address_type,
                classification.details,
            ));
        }
    }
    match best {
        Some((address, address_type, details)) => (Some(address), address_type, details),
        None => (None, AddressType::Unknown, None),
    }
}

/// Turn one block into transaction rows and flow events. Only relevant
/// transfer transactions survive; each of their outputs becomes one event
/// carrying the primary-input identity on the source side.
pub fn build_flow_events(
    block: &NormalizedBlock,
    classifier: &AddressClassifier,
) -> (Vec<TxRow>, Vec<FlowEvent>) {
    let mut tx_rows = Vec::new();
    let mut events = Vec::new();

    for tx in &block.txs {
        if !is_transfer(tx) || !is_relevant(tx, classifier) {
            continue;
        }

        let (from_address, from_type, from_details) = primary_input(tx, classifier);
        tx_rows.push(TxRow {
            txid: tx.txid.clone(),
            block_height: block.height,
            input_count: tx.vin.len() as u32,
            output_count: tx.vout.len() as u32,
            total_input: tx.total_input_sat() as f64 / 1e8,
            total_output: tx.total_output_sat() as f64 / 1e8,
        });

        for output in &tx.vout {
            let to_address = output.first_address().map(|a| a.to_string());
            let to = match to_address.as_deref() {
                Some(address) => classifier.classify(address),
                None => crate::classifier::Classification {
                    address_type: AddressType::Unknown,
                    details: None,
                },
            };
            events.push(FlowEvent {
                id: None,
                txid: tx.txid.clone(),
                vout: output.n,
                block_height: block.height,
                block_time: block.time,
                from_address: from_address.clone(),
                from_type,
                from_details: from_details.clone(),
                to_address,
                to_type: to.address_type,
                to_details: to.details,
                flow_type: flow_type_for(from_type, to.address_type),
                amount: output.value_sat as f64 / 1e8,
                classification_level: 0,
                intermediary_wallet: None,
                hop_chain: None,
                analysis_timestamp: None,
                data_source: DataOrigin::Sync,
            });
        }
    }

    (tx_rows, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{AddressBook, NodeOperatorInfo};
    use crate::indexer::{TxInput, TxOutput};
    use crate::model::{FlowType, TierCounts};
    use serde_json::json;
    use std::collections::HashMap;

    fn test_classifier() -> AddressClassifier {
        let book = AddressBook::from_value(&json!({
            "exchanges": {"t1Exchange": {"name": "Binance", "logo": "binance.png"}},
            "foundation": {"t1Foundation": "Flux Foundation"}
        }))
        .unwrap();
        let classifier =
            AddressClassifier::new(book, "http://localhost/registry".to_string()).unwrap();
        let mut operators = HashMap::new();
        operators.insert(
            "t1Node".to_string(),
            NodeOperatorInfo {
                node_count: 3,
                tiers: TierCounts {
                    cumulus: 3,
                    nimbus: 0,
                    stratus: 0,
                },
            },
        );
        classifier.set_node_operators(operators);
        classifier
    }

    fn input(address: &str, sat: i64) -> TxInput {
        TxInput {
            address: Some(address.to_string()),
            value_sat: sat,
            is_coinbase: false,
        }
    }

    fn output(n: u32, address: &str, sat: i64) -> TxOutput {
        TxOutput {
            n,
            addresses: vec![address.to_string()],
            value_sat: sat,
        }
    }

    fn transfer(txid: &str, vin: Vec<TxInput>, vout: Vec<TxOutput>) -> NormalizedTx {
        NormalizedTx {
            txid: txid.to_string(),
            kind: Some("transfer".to_string()),
            vin,
            vout,
        }
    }

    fn block(height: u64, txs: Vec<NormalizedTx>) -> NormalizedBlock {
        NormalizedBlock {
            height,
            hash: format!("hash{}", height),
            time: 1_700_000_000 + height as i64 * 30,
            tx_count: txs.len() as u32,
            size: 1000,
            txs,
        }
    }

    #[test]
    fn test_direct_buy_with_change_output() {
        let classifier = test_classifier();
        // Exchange input pays a node operator 10 FLUX with 0.5 FLUX change.
        let tx = transfer(
            "buy1",
            vec![input("t1Exchange", 1_060_000_000)],
            vec![
                output(0, "t1Node", 1_000_000_000),
                output(1, "t1Exchange", 50_000_000),
            ],
        );
        let (tx_rows, events) = build_flow_events(&block(1000, vec![tx]), &classifier);

        assert_eq!(tx_rows.len(), 1);
        assert_eq!(tx_rows[0].input_count, 1);
        assert_eq!(tx_rows[0].total_output, 10.5);

        assert_eq!(events.len(), 2);
        let buy = &events[0];
        assert_eq!(buy.flow_type, FlowType::Buying);
        assert_eq!(buy.from_type, AddressType::Exchange);
        assert_eq!(buy.to_type, AddressType::NodeOperator);
        assert_eq!(buy.amount, 10.0);
        assert_eq!(buy.classification_level, 0);
        assert_eq!(buy.data_source, DataOrigin::Sync);
        match &buy.from_details {
            Some(AddressDetails::Exchange { name, .. }) => assert_eq!(name, "Binance"),
            other => panic!("expected exchange details, got {:?}", other),
        }

        let change = &events[1];
        assert_eq!(change.flow_type, FlowType::P2p);
        assert_eq!(change.from_type, AddressType::Exchange);
        assert_eq!(change.to_type, AddressType::Exchange);
        assert_eq!(change.amount, 0.5);
    }

    #[test]
    fn test_direct_sell_to_exchange() {
        let classifier = test_classifier();
        let tx = transfer(
            "sell1",
            vec![input("t1Node", 10_000_000_000)],
            vec![output(0, "t1Exchange", 10_000_000_000)],
        );
        let (_, events) = build_flow_events(&block(2000, vec![tx]), &classifier);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flow_type, FlowType::Selling);
        assert_eq!(events[0].from_type, AddressType::NodeOperator);
        assert_eq!(events[0].to_type, AddressType::Exchange);
        assert_eq!(events[0].amount, 100.0);
        assert_eq!(events[0].classification_level, 0);
    }

    #[test]
    fn test_relevance_filter_drops_unclassified() {
        let classifier = test_classifier();
        let irrelevant = transfer(
            "noise",
            vec![input("t1Random1", 100)],
            vec![output(0, "t1Random2", 90)],
        );
        let relevant = transfer(
            "signal",
            vec![input("t1Random1", 100)],
            vec![output(0, "t1Exchange", 90)],
        );
        let (tx_rows, events) =
            build_flow_events(&block(3000, vec![irrelevant, relevant]), &classifier);

        assert_eq!(tx_rows.len(), 1);
        assert_eq!(tx_rows[0].txid, "signal");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flow_type, FlowType::Selling);
        assert_eq!(events[0].from_type, AddressType::Unknown);
    }

    #[test]
    fn test_primary_input_priority() {
        let classifier = test_classifier();
        // Exchange outranks node_operator outranks foundation.
        let tx = transfer(
            "multi",
            vec![
                input("t1Foundation", 100),
                input("t1Node", 100),
                input("t1Exchange", 100),
            ],
            vec![output(0, "t1Somebody", 250)],
        );
        let (_, events) = build_flow_events(&block(4000, vec![tx]), &classifier);
        assert_eq!(events[0].from_type, AddressType::Exchange);
        assert_eq!(events[0].from_address.as_deref(), Some("t1Exchange"));

        let tx = transfer(
            "multi2",
            vec![input("t1Foundation", 100), input("t1Node", 100)],
            vec![output(0, "t1Somebody", 150)],
        );
        let (_, events) = build_flow_events(&block(4001, vec![tx]), &classifier);
        assert_eq!(events[0].from_type, AddressType::NodeOperator);
    }

    #[test]
    fn test_coinbase_and_non_transfer_skipped() {
        let classifier = test_classifier();
        let mut coinbase = transfer(
            "cb",
            vec![TxInput {
                address: None,
                value_sat: 0,
                is_coinbase: true,
            }],
            vec![output(0, "t1Node", 7_500_000_000)],
        );
        coinbase.kind = None;
        let mut confirm = transfer(
            "confirm",
            vec![input("t1Node", 0)],
            vec![output(0, "t1Node", 0)],
        );
        confirm.kind = Some("fluxnode_confirm".to_string());

        let (tx_rows, events) =
            build_flow_events(&block(5000, vec![coinbase, confirm]), &classifier);
        assert!(tx_rows.is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn test_contiguous_advance_stops_at_gap() {
        let planned = vec![101, 102, 103, 104];
        let fetched: Vec<NormalizedBlock> =
            [101, 102, 104].iter().map(|&h| block(h, vec![])).collect();
        assert_eq!(contiguous_advance(100, &planned, &fetched), Some(102));

        let none: Vec<NormalizedBlock> = vec![block(104, vec![])];
        assert_eq!(contiguous_advance(100, &planned, &none), None);

        let all: Vec<NormalizedBlock> =
            planned.iter().map(|&h| block(h, vec![])).collect();
        assert_eq!(contiguous_advance(100, &planned, &all), Some(104));
    }
}
