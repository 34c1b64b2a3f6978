//! Enhancement engine
//!
//! For flow events whose counterparty is still `unknown`, decide whether
//! that wallet is really a node operator. Two lanes per event, in order:
//!
//! 1. Direct historical checks on the wallet itself (coinbase receipts in
//!    the window, then recent connections to known operators).
//! 2. A bounded BFS over the transaction graph, following money forward for
//!    buys and backward for sells, up to `max_hops` intermediaries.
//!
//! A hit rewrites the event row in one store call; a miss stamps
//! `analysis_timestamp` so the event sits out the retry cooldown.

use crate::classifier::{AddressClassifier, NodeOperatorInfo};
use crate::config::EnhancementConfig;
use crate::db::FlowStore;
use crate::enhancement::cache::EnhancementCache;
use crate::enhancement::{CoinbaseEvidence, ConnectionEvidence};
use crate::indexer::{AddressTx, IndexerApi, NormalizedTx, TxDirection};
use crate::model::{AddressDetails, AddressType, ClassificationPatch, DataOrigin, FlowEvent};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinSet;

/// Most recent wallet transactions inspected by the historical-connection
/// check.
const MAX_CONNECTION_LOOKBACK: usize = 20;

const METHOD_CURRENT_API: &str = "current_api";
const METHOD_HISTORICAL_COINBASE: &str = "historical_coinbase";

const STATUS_ACTIVE: &str = "active";
const STATUS_HISTORICAL: &str = "historical";

/// Which side of the event is unknown, and therefore which way the graph
/// walk goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnalysisDirection {
    /// Unknown buyer: follow the wallet's outgoing transactions forward.
    Outbound,
    /// Unknown seller: follow the wallet's incoming transactions backward.
    Inbound,
}

impl AnalysisDirection {
    fn hop_direction(&self) -> TxDirection {
        match self {
            AnalysisDirection::Outbound => TxDirection::Sent,
            AnalysisDirection::Inbound => TxDirection::Received,
        }
    }
}

/// Result of one run attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(EnhancementSummary),
    /// A previous run was still in flight.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnhancementSummary {
    pub processed: usize,
    pub enhanced: usize,
    pub missed: usize,
    pub duration_ms: u64,
}

/// Lifetime counters across runs.
#[derive(Debug, Clone, Default)]
pub struct EnhancementCounters {
    pub runs: u64,
    pub events_enhanced: u64,
    pub events_missed: u64,
    pub circular_detections: u64,
    pub last_run_time: Option<i64>,
}

/// A successful detection, ready to be written back.
#[derive(Debug, Clone)]
struct DetectionHit {
    level: u32,
    /// `None` for level 0; for the BFS, the wallets traversed from the
    /// observed one, excluding the final node wallet.
    hop_chain: Option<Vec<String>>,
    details: AddressDetails,
}

struct BfsEntry {
    wallet: String,
    depth: u32,
    chain: Vec<String>,
    txids: Vec<String>,
}

pub struct EnhancementEngine {
    store: Arc<FlowStore>,
    classifier: Arc<AddressClassifier>,
    indexer: Arc<dyn IndexerApi>,
    cache: Arc<EnhancementCache>,
    config: EnhancementConfig,
    block_time_seconds: u64,
    running: AtomicBool,
    circulars: AtomicU64,
    counters: Mutex<EnhancementCounters>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl EnhancementEngine {
    pub fn new(
        store: Arc<FlowStore>,
        classifier: Arc<AddressClassifier>,
        indexer: Arc<dyn IndexerApi>,
        cache: Arc<EnhancementCache>,
        config: EnhancementConfig,
        block_time_seconds: u64,
    ) -> Self {
        Self::with_timestamp_fn(
            store,
            classifier,
            indexer,
            cache,
            config,
            block_time_seconds,
            Box::new(|| chrono::Utc::now().timestamp()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_timestamp_fn(
        store: Arc<FlowStore>,
        classifier: Arc<AddressClassifier>,
        indexer: Arc<dyn IndexerApi>,
        cache: Arc<EnhancementCache>,
        config: EnhancementConfig,
        block_time_seconds: u64,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            store,
            classifier,
            indexer,
            cache,
            config,
            block_time_seconds,
            running: AtomicBool::new(false),
            circulars: AtomicU64::new(0),
            counters: Mutex::new(EnhancementCounters::default()),
            now_fn,
        }
    }

    fn now(&self) -> i64 {
        (self.now_fn)()
    }

    pub fn counters(&self) -> EnhancementCounters {
        let mut counters = self.counters.lock().unwrap().clone();
        counters.circular_detections = self.circulars.load(Ordering::Relaxed);
        counters
    }

    /// Analyze every unknown-side event currently outside the cooldown.
    ///
    /// Unknowns are partitioned into fixed-size batches; events within a
    /// batch run concurrently (when parallel processing is enabled), batches
    /// run serially. Each event ends in exactly one store write, so a crash
    /// never leaks partial state.
    pub async fn enhance_unknowns(
        self: Arc<Self>,
    ) -> Result<RunOutcome, Box<dyn std::error::Error + Send + Sync>> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::info!("⏭️  Enhancement run still in flight, skipping");
            return Ok(RunOutcome::Skipped);
        }
        let result = self.clone().run().await;
        self.running.store(false, Ordering::SeqCst);
        result.map(RunOutcome::Completed)
    }

    async fn run(
        self: Arc<Self>,
    ) -> Result<EnhancementSummary, Box<dyn std::error::Error + Send + Sync>> {
        let started = Instant::now();
        let retry_secs = (self.config.failed_retry_hours * 3600) as i64;
        let unknowns = self.store.get_unknown_wallets(retry_secs)?;

        // One task per event id; an event unknown on both sides is analyzed
        // once (buy side wins), which keeps writes within a run disjoint.
        let mut seen = HashSet::new();
        let mut tasks: Vec<(FlowEvent, AnalysisDirection)> = Vec::new();
        for event in unknowns.buys {
            if let Some(id) = event.id {
                if seen.insert(id) {
                    tasks.push((event, AnalysisDirection::Outbound));
                }
            }
        }
        for event in unknowns.sells {
            if let Some(id) = event.id {
                if seen.insert(id) {
                    tasks.push((event, AnalysisDirection::Inbound));
                }
            }
        }

        if tasks.is_empty() {
            log::debug!("enhancement: no unknown wallets outside cooldown");
            return Ok(EnhancementSummary::default());
        }

        log::info!(
            "🔍 Enhancement run: {} unknown events, batches of {}",
            tasks.len(),
            self.config.parallel_batch_size.max(1)
        );

        let mut enhanced = 0usize;
        let mut missed = 0usize;
        let processed = tasks.len();
        let batch_size = self.config.parallel_batch_size.max(1);

        for batch in tasks.chunks(batch_size) {
            if self.config.parallel_enabled && batch.len() > 1 {
                let mut set: JoinSet<bool> = JoinSet::new();
                for (event, direction) in batch {
                    let engine = Arc::clone(&self);
                    let event = event.clone();
                    let direction = *direction;
                    set.spawn(async move {
                        engine.analyze_and_record(&event, direction).await
                    });
                }
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(true) => enhanced += 1,
                        Ok(false) => missed += 1,
                        Err(e) => {
                            missed += 1;
                            log::warn!("enhancement task failed: {}", e);
                        }
                    }
                }
            } else {
                for (event, direction) in batch {
                    if self.analyze_and_record(event, *direction).await {
                        enhanced += 1;
                    } else {
                        missed += 1;
                    }
                }
            }
        }

        let removed = self.cache.clear_expired();
        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut counters = self.counters.lock().unwrap();
            counters.runs += 1;
            counters.events_enhanced += enhanced as u64;
            counters.events_missed += missed as u64;
            counters.last_run_time = Some(self.now());
        }
        log::info!(
            "✅ Enhancement run done: {}/{} enhanced in {}ms (cache: {}; {} expired entries dropped)",
            enhanced,
            processed,
            duration_ms,
            self.cache.summary(),
            removed
        );

        Ok(EnhancementSummary {
            processed,
            enhanced,
            missed,
            duration_ms,
        })
    }

    /// Analyze one event and write the outcome. Returns true on a hit.
    /// Upstream failures count as a miss: the cooldown stamp keeps the event
    /// from hot-looping while the source recovers.
    async fn analyze_and_record(&self, event: &FlowEvent, direction: AnalysisDirection) -> bool {
        let Some(id) = event.id else {
            return false;
        };
        let now = self.now();
        let wallet = match direction {
            AnalysisDirection::Outbound => event.to_address.clone(),
            AnalysisDirection::Inbound => event.from_address.clone(),
        };

        let outcome = match &wallet {
            Some(wallet) => self.detect(event, wallet, direction).await,
            None => Ok(None),
        };

        let patch = match outcome {
            Ok(Some(hit)) => {
                log::info!(
                    "🎯 Event {} enhanced to level {} ({})",
                    id,
                    hit.level,
                    wallet.as_deref().unwrap_or("?"),
                );
                hit_patch(&hit, direction, now)
            }
            Ok(None) => cooldown_patch(now),
            Err(e) => {
                log::debug!("enhancement of event {} hit an upstream error: {}", id, e);
                cooldown_patch(now)
            }
        };
        let is_hit = patch.classification_level.is_some() || patch.data_source.is_some();

        if let Err(e) = self.store.update_flow_event_classification(id, &patch) {
            log::error!("failed to write enhancement result for event {}: {}", id, e);
            return false;
        }
        is_hit
    }

    async fn detect(
        &self,
        event: &FlowEvent,
        wallet: &str,
        direction: AnalysisDirection,
    ) -> Result<Option<DetectionHit>, Box<dyn std::error::Error + Send + Sync>> {
        if self.config.historical_detection_enabled {
            if let Some(evidence) = self.coinbase_evidence(wallet, event.block_height).await? {
                return Ok(Some(DetectionHit {
                    level: 0,
                    hop_chain: None,
                    details: AddressDetails::EnhancedNode {
                        node_wallet: wallet.to_string(),
                        detection_method: METHOD_HISTORICAL_COINBASE.to_string(),
                        status: STATUS_HISTORICAL.to_string(),
                        hop_count: 0,
                        intermediary_txids: Vec::new(),
                        node_count: None,
                        tiers: None,
                        last_block: Some(evidence.last_block),
                        days_inactive: Some(
                            self.blocks_to_days(evidence.last_block, event.block_height),
                        ),
                        coinbase_count: Some(evidence.count),
                    },
                }));
            }

            if self.config.historical_connections_enabled {
                if let Some(evidence) = self
                    .connection_evidence(wallet, event.block_height, direction)
                    .await?
                {
                    return Ok(Some(DetectionHit {
                        level: 0,
                        hop_chain: None,
                        details: AddressDetails::HistoricalConnection {
                            node_wallet: evidence.node_wallet,
                            connection_txid: evidence.connection_txid,
                            days_ago: self
                                .blocks_to_days(evidence.block_height, event.block_height),
                            coinbase_count: evidence.coinbase_count,
                        },
                    }));
                }
            }
        }

        self.bfs_search(event, wallet, direction).await
    }

    /// Coinbase receipts of `wallet` within the historical window ending at
    /// the event block. Cached, misses included.
    async fn coinbase_evidence(
        &self,
        wallet: &str,
        event_block: u64,
    ) -> Result<Option<CoinbaseEvidence>, Box<dyn std::error::Error + Send + Sync>> {
        let from_block = event_block.saturating_sub(self.config.historical_time_window_blocks);
        let key = (wallet.to_string(), from_block, event_block);
        let now = self.cache.now();
        if let Some(cached) = self.cache.coinbase.get(&key, now) {
            return Ok(cached);
        }

        let txs = self.wallet_txs(wallet).await?;
        let mut count = 0u32;
        let mut last_block = 0u64;
        for tx in &txs {
            if tx.is_coinbase
                && tx.direction == TxDirection::Received
                && tx.block_height >= from_block
                && tx.block_height <= event_block
            {
                count += 1;
                last_block = last_block.max(tx.block_height);
            }
        }
        let evidence = if count > 0 {
            Some(CoinbaseEvidence { last_block, count })
        } else {
            None
        };
        self.cache.coinbase.set(key, evidence, now);
        Ok(evidence)
    }

    /// Most recent in-window counterparties of `wallet`, checked against the
    /// current registry first, then coinbase history. Short-circuits on the
    /// first hit; counterparties are deduplicated within the call.
    async fn connection_evidence(
        &self,
        wallet: &str,
        event_block: u64,
        direction: AnalysisDirection,
    ) -> Result<Option<ConnectionEvidence>, Box<dyn std::error::Error + Send + Sync>> {
        let from_block = event_block.saturating_sub(self.config.historical_time_window_blocks);
        let key = (wallet.to_string(), direction.hop_direction(), from_block);
        let now = self.cache.now();
        if let Some(cached) = self.cache.connection.get(&key, now) {
            return Ok(cached);
        }

        let txs = self.wallet_txs(wallet).await?;
        let hop_direction = direction.hop_direction();
        let mut candidates: Vec<&AddressTx> = txs
            .iter()
            .filter(|tx| {
                tx.direction == hop_direction
                    && !tx.is_coinbase
                    && tx.block_height >= from_block
                    && tx.block_height <= event_block
            })
            .collect();
        candidates.sort_by_key(|tx| std::cmp::Reverse((tx.block_height, tx.timestamp)));
        candidates.truncate(MAX_CONNECTION_LOOKBACK);

        let mut checked = HashSet::new();
        let mut evidence = None;
        for candidate in candidates {
            let Some(body) = self.tx_body(&candidate.txid).await? else {
                continue;
            };
            let Some(counterparty) = counterparty_of(&body, wallet, direction) else {
                continue;
            };
            if !checked.insert(counterparty.clone()) {
                continue;
            }
            if self.operator_status(&counterparty).is_some() {
                evidence = Some(ConnectionEvidence {
                    node_wallet: counterparty,
                    connection_txid: candidate.txid.clone(),
                    block_height: candidate.block_height,
                    coinbase_count: None,
                });
                break;
            }
            if let Some(coinbase) = self.coinbase_evidence(&counterparty, event_block).await? {
                evidence = Some(ConnectionEvidence {
                    node_wallet: counterparty,
                    connection_txid: candidate.txid.clone(),
                    block_height: candidate.block_height,
                    coinbase_count: Some(coinbase.count),
                });
                break;
            }
        }

        self.cache.connection.set(key, evidence.clone(), now);
        Ok(evidence)
    }

    /// Bounded BFS over the transaction graph. Terminates on a hit, an
    /// empty queue, or the hop limit; a wallet never expands twice and a
    /// re-encounter bumps the circular-detection counter.
    async fn bfs_search(
        &self,
        event: &FlowEvent,
        wallet: &str,
        direction: AnalysisDirection,
    ) -> Result<Option<DetectionHit>, Box<dyn std::error::Error + Send + Sync>> {
        let max_hops = self.config.max_hops.min(self.config.multi_hop_max_depth).max(1);

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(wallet.to_string());
        let mut queue = VecDeque::new();
        queue.push_back(BfsEntry {
            wallet: wallet.to_string(),
            depth: 0,
            chain: vec![wallet.to_string()],
            txids: Vec::new(),
        });

        while let Some(entry) = queue.pop_front() {
            let candidates = self.hop_candidates(&entry.wallet, event, direction).await?;
            for candidate in candidates {
                let Some(body) = self.tx_body(&candidate.txid).await? else {
                    continue;
                };
                let Some(counterparty) = counterparty_of(&body, &entry.wallet, direction) else {
                    continue;
                };
                if visited.contains(&counterparty) {
                    self.circulars.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "circular path suppressed at {} (depth {})",
                        counterparty,
                        entry.depth
                    );
                    continue;
                }

                let level = entry.depth + 1;
                let mut txids = entry.txids.clone();
                txids.push(candidate.txid.clone());

                if let Some(info) = self.operator_status(&counterparty) {
                    return Ok(Some(DetectionHit {
                        level,
                        hop_chain: Some(entry.chain.clone()),
                        details: AddressDetails::EnhancedNode {
                            node_wallet: counterparty,
                            detection_method: METHOD_CURRENT_API.to_string(),
                            status: STATUS_ACTIVE.to_string(),
                            hop_count: level,
                            intermediary_txids: txids,
                            node_count: Some(info.node_count),
                            tiers: Some(info.tiers),
                            last_block: None,
                            days_inactive: None,
                            coinbase_count: None,
                        },
                    }));
                }

                if self.config.historical_detection_enabled {
                    if let Some(evidence) =
                        self.coinbase_evidence(&counterparty, event.block_height).await?
                    {
                        return Ok(Some(DetectionHit {
                            level,
                            hop_chain: Some(entry.chain.clone()),
                            details: AddressDetails::EnhancedNode {
                                node_wallet: counterparty,
                                detection_method: METHOD_HISTORICAL_COINBASE.to_string(),
                                status: STATUS_HISTORICAL.to_string(),
                                hop_count: level,
                                intermediary_txids: txids,
                                node_count: None,
                                tiers: None,
                                last_block: Some(evidence.last_block),
                                days_inactive: Some(
                                    self.blocks_to_days(evidence.last_block, event.block_height),
                                ),
                                coinbase_count: Some(evidence.count),
                            },
                        }));
                    }
                }

                if level < max_hops {
                    visited.insert(counterparty.clone());
                    let mut chain = entry.chain.clone();
                    chain.push(counterparty.clone());
                    queue.push_back(BfsEntry {
                        wallet: counterparty,
                        depth: level,
                        chain,
                        txids,
                    });
                }
            }
        }

        Ok(None)
    }

    /// Next-hop candidate transactions for one wallet: the next `sent`
    /// transactions strictly after the event for buys, the most recent
    /// `received` strictly before it for sells, bounded by the multi-hop
    /// window and the branch cap.
    async fn hop_candidates(
        &self,
        wallet: &str,
        event: &FlowEvent,
        direction: AnalysisDirection,
    ) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>> {
        let window = self.config.multi_hop_time_window_blocks;
        let txs = self.wallet_txs(wallet).await?;
        let hop_direction = direction.hop_direction();

        let mut candidates: Vec<AddressTx> = txs
            .iter()
            .filter(|tx| tx.direction == hop_direction && !tx.is_coinbase)
            .filter(|tx| match direction {
                AnalysisDirection::Outbound => {
                    let after = tx.block_height > event.block_height
                        || (tx.block_height == event.block_height
                            && tx.timestamp > event.block_time);
                    after && tx.block_height <= event.block_height + window
                }
                AnalysisDirection::Inbound => {
                    let before = tx.block_height < event.block_height
                        || (tx.block_height == event.block_height
                            && tx.timestamp < event.block_time);
                    before && tx.block_height >= event.block_height.saturating_sub(window)
                }
            })
            .cloned()
            .collect();

        match direction {
            AnalysisDirection::Outbound => {
                candidates.sort_by_key(|tx| (tx.block_height, tx.timestamp));
            }
            AnalysisDirection::Inbound => {
                candidates.sort_by_key(|tx| std::cmp::Reverse((tx.block_height, tx.timestamp)));
            }
        }
        candidates.truncate(self.config.max_branches_per_wallet.max(1));
        Ok(candidates)
    }

    async fn wallet_txs(
        &self,
        wallet: &str,
    ) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>> {
        let now = self.cache.now();
        let key = wallet.to_string();
        if let Some(cached) = self.cache.wallet_txs.get(&key, now) {
            return Ok(cached);
        }
        let txs = self.indexer.get_address_transactions(wallet).await?;
        self.cache.wallet_txs.set(key, txs.clone(), now);
        Ok(txs)
    }

    /// Full transaction body, cached. A fetch failure is reported as `None`
    /// so one missing body only prunes that branch.
    async fn tx_body(
        &self,
        txid: &str,
    ) -> Result<Option<NormalizedTx>, Box<dyn std::error::Error + Send + Sync>> {
        let now = self.cache.now();
        let key = txid.to_string();
        if let Some(cached) = self.cache.tx_bodies.get(&key, now) {
            return Ok(Some(cached));
        }
        match self.indexer.get_transaction(txid).await {
            Ok(tx) => {
                self.cache.tx_bodies.set(key, tx.clone(), now);
                Ok(Some(tx))
            }
            Err(e) => {
                log::debug!("tx body {} unavailable: {}", txid, e);
                Ok(None)
            }
        }
    }

    fn operator_status(&self, address: &str) -> Option<NodeOperatorInfo> {
        let now = self.cache.now();
        let key = address.to_string();
        if let Some(cached) = self.cache.operator_status.get(&key, now) {
            return cached;
        }
        let info = self.classifier.operator_info(address);
        self.cache.operator_status.set(key, info, now);
        info
    }

    fn blocks_to_days(&self, from_block: u64, to_block: u64) -> i64 {
        (to_block.saturating_sub(from_block) * self.block_time_seconds / 86_400) as i64
    }
}

/// The counterparty on the far side of a hop transaction: the first output
/// address that is not the wallet itself for buys, the first input address
/// that is not the wallet for sells.
fn counterparty_of(
    tx: &NormalizedTx,
    wallet: &str,
    direction: AnalysisDirection,
) -> Option<String> {
    match direction {
        AnalysisDirection::Outbound => tx
            .vout
            .iter()
            .flat_map(|out| out.addresses.iter())
            .find(|a| a.as_str() != wallet)
            .cloned(),
        AnalysisDirection::Inbound => tx
            .vin
            .iter()
            .filter_map(|input| input.address.as_deref())
            .find(|a| *a != wallet)
            .map(|a| a.to_string()),
    }
}

fn cooldown_patch(now: i64) -> ClassificationPatch {
    ClassificationPatch {
        analysis_timestamp: Some(now),
        ..Default::default()
    }
}

fn hit_patch(hit: &DetectionHit, direction: AnalysisDirection, now: i64) -> ClassificationPatch {
    let mut patch = ClassificationPatch {
        classification_level: Some(hit.level),
        hop_chain: hit.hop_chain.clone(),
        intermediary_wallet: hit.hop_chain.as_ref().and_then(|c| c.first().cloned()),
        analysis_timestamp: Some(now),
        data_source: Some(DataOrigin::Enhanced),
        ..Default::default()
    };
    match direction {
        AnalysisDirection::Outbound => {
            patch.to_type = Some(AddressType::NodeOperator);
            patch.to_details = Some(hit.details.clone());
        }
        AnalysisDirection::Inbound => {
            patch.from_type = Some(AddressType::NodeOperator);
            patch.from_details = Some(hit.details.clone());
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::AddressBook;
    use crate::indexer::{NormalizedBlock, TxInput, TxOutput};
    use crate::model::{FlowType, TierCounts};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    const NOW: i64 = 1_700_060_000;

    struct MockGraph {
        histories: HashMap<String, Vec<AddressTx>>,
        bodies: HashMap<String, NormalizedTx>,
    }

    impl MockGraph {
        fn new() -> Self {
            Self {
                histories: HashMap::new(),
                bodies: HashMap::new(),
            }
        }

        fn history(mut self, wallet: &str, txs: Vec<AddressTx>) -> Self {
            self.histories.insert(wallet.to_string(), txs);
            self
        }

        /// Register a simple one-input one-output transfer body.
        fn transfer(mut self, txid: &str, from: &str, to: &str, sat: i64) -> Self {
            self.bodies.insert(
                txid.to_string(),
                NormalizedTx {
                    txid: txid.to_string(),
                    kind: Some("transfer".to_string()),
                    vin: vec![TxInput {
                        address: Some(from.to_string()),
                        value_sat: sat,
                        is_coinbase: false,
                    }],
                    vout: vec![TxOutput {
                        n: 0,
                        addresses: vec![to.to_string()],
                        value_sat: sat,
                    }],
                },
            );
            self
        }
    }

    #[async_trait]
    impl IndexerApi for MockGraph {
        async fn chain_height(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
            Ok(0)
        }
        async fn get_block(
            &self,
            _height: u64,
        ) -> Result<NormalizedBlock, Box<dyn std::error::Error + Send + Sync>> {
            Err("not a block source".into())
        }
        async fn get_transaction(
            &self,
            txid: &str,
        ) -> Result<NormalizedTx, Box<dyn std::error::Error + Send + Sync>> {
            self.bodies
                .get(txid)
                .cloned()
                .ok_or_else(|| format!("unknown txid {}", txid).into())
        }
        async fn get_address_transactions(
            &self,
            address: &str,
        ) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.histories.get(address).cloned().unwrap_or_default())
        }
    }

    fn entry(txid: &str, block: u64, direction: TxDirection, is_coinbase: bool) -> AddressTx {
        AddressTx {
            txid: txid.to_string(),
            block_height: block,
            timestamp: 1_700_000_000 + block as i64 * 30,
            direction,
            is_coinbase,
        }
    }

    fn test_config() -> EnhancementConfig {
        EnhancementConfig {
            max_hops: 3,
            time_window_blocks: 86_400,
            min_confidence: 0.8,
            failed_retry_hours: 24,
            job_enabled: true,
            job_interval_minutes: 10,
            run_on_start: false,
            min_unknowns_threshold: 1,
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
        }
    }

    fn harness(
        operators: &[&str],
        graph: MockGraph,
        config: EnhancementConfig,
    ) -> (NamedTempFile, Arc<FlowStore>, Arc<EnhancementEngine>) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(
            FlowStore::open_with_timestamp_fn(
                temp.path().to_str().unwrap(),
                Box::new(|| NOW),
            )
            .unwrap(),
        );
        let classifier = Arc::new(
            AddressClassifier::new(
                AddressBook::from_value(&json!({"exchanges": {}, "foundation": {}})).unwrap(),
                "http://localhost/registry".to_string(),
            )
            .unwrap(),
        );
        let mut operator_map = HashMap::new();
        for operator in operators {
            operator_map.insert(
                operator.to_string(),
                NodeOperatorInfo {
                    node_count: 3,
                    tiers: TierCounts {
                        cumulus: 3,
                        nimbus: 0,
                        stratus: 0,
                    },
                },
            );
        }
        classifier.set_node_operators(operator_map);

        let cache = Arc::new(EnhancementCache::with_timestamp_fn(Box::new(|| NOW)));
        let engine = Arc::new(EnhancementEngine::with_timestamp_fn(
            store.clone(),
            classifier,
            Arc::new(graph),
            cache,
            config,
            30,
            Box::new(|| NOW),
        ));
        (temp, store, engine)
    }

    fn unknown_buy(txid: &str, block: u64, to_wallet: &str) -> FlowEvent {
        FlowEvent {
            id: None,
            txid: txid.to_string(),
            vout: 0,
            block_height: block,
            block_time: 1_700_000_000 + block as i64 * 30,
            from_address: Some("t1Exchange".to_string()),
            from_type: AddressType::Exchange,
            from_details: Some(AddressDetails::Exchange {
                name: "Binance".to_string(),
                logo: None,
            }),
            to_address: Some(to_wallet.to_string()),
            to_type: AddressType::Unknown,
            to_details: None,
            flow_type: FlowType::Buying,
            amount: 50.0,
            classification_level: 0,
            intermediary_wallet: None,
            hop_chain: None,
            analysis_timestamp: None,
            data_source: DataOrigin::Sync,
        }
    }

    fn unknown_sell(txid: &str, block: u64, from_wallet: &str) -> FlowEvent {
        let mut event = unknown_buy(txid, block, "t1Exchange");
        event.from_address = Some(from_wallet.to_string());
        event.from_type = AddressType::Unknown;
        event.from_details = None;
        event.to_type = AddressType::Exchange;
        event.to_details = Some(AddressDetails::Exchange {
            name: "Binance".to_string(),
            logo: None,
        });
        event.flow_type = FlowType::Selling;
        event
    }

    async fn run(engine: &Arc<EnhancementEngine>) -> EnhancementSummary {
        match engine.clone().enhance_unknowns().await.unwrap() {
            RunOutcome::Completed(summary) => summary,
            RunOutcome::Skipped => panic!("run was skipped"),
        }
    }

    #[tokio::test]
    async fn test_one_hop_buy_via_current_registry() {
        // E -> U at block 1000; U sends the funds on to operator N at 1050.
        let graph = MockGraph::new()
            .history("t1U", vec![entry("u_to_n", 1050, TxDirection::Sent, false)])
            .transfer("u_to_n", "t1U", "t1N", 5_000_000_000);
        let (_temp, store, engine) = harness(&["t1N"], graph, test_config());
        store
            .save_flow_events_batch(&[unknown_buy("buy1", 1000, "t1U")])
            .unwrap();

        let summary = run(&engine).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.enhanced, 1);

        let event = store.get_flow_events(1000, 1000).unwrap().remove(0);
        assert_eq!(event.to_type, AddressType::NodeOperator);
        assert_eq!(event.classification_level, 1);
        assert_eq!(event.hop_chain, Some(vec!["t1U".to_string()]));
        assert_eq!(event.intermediary_wallet.as_deref(), Some("t1U"));
        assert_eq!(event.data_source, DataOrigin::Enhanced);
        assert_eq!(event.analysis_timestamp, Some(NOW));
        match event.to_details {
            Some(AddressDetails::EnhancedNode {
                node_wallet,
                detection_method,
                status,
                hop_count,
                intermediary_txids,
                node_count,
                ..
            }) => {
                assert_eq!(node_wallet, "t1N");
                assert_eq!(detection_method, "current_api");
                assert_eq!(status, "active");
                assert_eq!(hop_count, 1);
                assert_eq!(intermediary_txids, vec!["u_to_n".to_string()]);
                assert_eq!(node_count, Some(3));
            }
            other => panic!("expected enhanced node details, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_hop_sell_via_historical_coinbase() {
        // U sells to the exchange at block 2000. Backward: U received from V
        // at 1800, V received from W at 1500, and W mined three blocks in
        // the prior year but runs no current node.
        let graph = MockGraph::new()
            .history(
                "t1U",
                vec![entry("v_to_u", 1800, TxDirection::Received, false)],
            )
            .history(
                "t1V",
                vec![entry("w_to_v", 1500, TxDirection::Received, false)],
            )
            .history(
                "t1W",
                vec![
                    entry("cb1", 100, TxDirection::Received, true),
                    entry("cb2", 200, TxDirection::Received, true),
                    entry("cb3", 300, TxDirection::Received, true),
                ],
            )
            .transfer("v_to_u", "t1V", "t1U", 1_000_000_000)
            .transfer("w_to_v", "t1W", "t1V", 1_000_000_000);
        let (_temp, store, engine) = harness(&[], graph, test_config());
        store
            .save_flow_events_batch(&[unknown_sell("sell1", 2000, "t1U")])
            .unwrap();

        let summary = run(&engine).await;
        assert_eq!(summary.enhanced, 1);

        let event = store.get_flow_events(2000, 2000).unwrap().remove(0);
        assert_eq!(event.from_type, AddressType::NodeOperator);
        assert_eq!(event.classification_level, 2);
        assert_eq!(
            event.hop_chain,
            Some(vec!["t1U".to_string(), "t1V".to_string()])
        );
        assert_eq!(event.intermediary_wallet.as_deref(), Some("t1U"));
        match event.from_details {
            Some(AddressDetails::EnhancedNode {
                node_wallet,
                detection_method,
                status,
                hop_count,
                intermediary_txids,
                coinbase_count,
                last_block,
                ..
            }) => {
                assert_eq!(node_wallet, "t1W");
                assert_eq!(detection_method, "historical_coinbase");
                assert_eq!(status, "historical");
                assert_eq!(hop_count, 2);
                assert_eq!(
                    intermediary_txids,
                    vec!["v_to_u".to_string(), "w_to_v".to_string()]
                );
                assert_eq!(coinbase_count, Some(3));
                assert_eq!(last_block, Some(300));
            }
            other => panic!("expected enhanced node details, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_circular_path_suppressed() {
        // U -> V -> U loops; no operator anywhere.
        let graph = MockGraph::new()
            .history("t1U", vec![entry("u_to_v", 1100, TxDirection::Sent, false)])
            .history("t1V", vec![entry("v_to_u", 1200, TxDirection::Sent, false)])
            .transfer("u_to_v", "t1U", "t1V", 100)
            .transfer("v_to_u", "t1V", "t1U", 100);
        let (_temp, store, engine) = harness(&[], graph, test_config());
        store
            .save_flow_events_batch(&[unknown_buy("buy1", 1000, "t1U")])
            .unwrap();

        let summary = run(&engine).await;
        assert_eq!(summary.enhanced, 0);
        assert_eq!(summary.missed, 1);
        assert_eq!(engine.counters().circular_detections, 1);

        let event = store.get_flow_events(1000, 1000).unwrap().remove(0);
        assert_eq!(event.classification_level, 0);
        assert_eq!(event.to_type, AddressType::Unknown);
        assert_eq!(event.analysis_timestamp, Some(NOW));
        assert_eq!(event.data_source, DataOrigin::Sync);
    }

    #[tokio::test]
    async fn test_wallet_with_no_history_cooldown_stamped() {
        let (_temp, store, engine) = harness(&[], MockGraph::new(), test_config());
        store
            .save_flow_events_batch(&[unknown_buy("buy1", 1000, "t1Ghost")])
            .unwrap();

        let summary = run(&engine).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.missed, 1);

        let event = store.get_flow_events(1000, 1000).unwrap().remove(0);
        assert_eq!(event.classification_level, 0);
        assert_eq!(event.analysis_timestamp, Some(NOW));
    }

    #[tokio::test]
    async fn test_rerun_after_full_run_processes_nothing() {
        let (_temp, store, engine) = harness(&[], MockGraph::new(), test_config());
        store
            .save_flow_events_batch(&[
                unknown_buy("buy1", 1000, "t1Ghost"),
                unknown_sell("sell1", 1001, "t1Other"),
            ])
            .unwrap();

        let first = run(&engine).await;
        assert_eq!(first.processed, 2);

        // Every event is now either enhanced or inside the cooldown.
        let second = run(&engine).await;
        assert_eq!(second.processed, 0);
        assert_eq!(engine.counters().runs, 2);
    }

    #[tokio::test]
    async fn test_level_zero_coinbase_detection_on_observed_wallet() {
        let graph = MockGraph::new().history(
            "t1Miner",
            vec![
                entry("cb1", 500, TxDirection::Received, true),
                entry("cb2", 800, TxDirection::Received, true),
            ],
        );
        let (_temp, store, engine) = harness(&[], graph, test_config());
        store
            .save_flow_events_batch(&[unknown_buy("buy1", 1000, "t1Miner")])
            .unwrap();

        let summary = run(&engine).await;
        assert_eq!(summary.enhanced, 1);

        let event = store.get_flow_events(1000, 1000).unwrap().remove(0);
        assert_eq!(event.classification_level, 0);
        assert_eq!(event.to_type, AddressType::NodeOperator);
        assert_eq!(event.data_source, DataOrigin::Enhanced);
        // Level 0 carries no chain.
        assert_eq!(event.hop_chain, None);
        assert_eq!(event.intermediary_wallet, None);
        match event.to_details {
            Some(AddressDetails::EnhancedNode {
                detection_method,
                hop_count,
                coinbase_count,
                last_block,
                ..
            }) => {
                assert_eq!(detection_method, "historical_coinbase");
                assert_eq!(hop_count, 0);
                assert_eq!(coinbase_count, Some(2));
                assert_eq!(last_block, Some(800));
            }
            other => panic!("expected enhanced node details, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_level_zero_historical_connection() {
        // U received from a current operator N shortly before selling.
        let graph = MockGraph::new()
            .history(
                "t1U",
                vec![entry("n_to_u", 1900, TxDirection::Received, false)],
            )
            .transfer("n_to_u", "t1N", "t1U", 2_000_000_000);
        let (_temp, store, engine) = harness(&["t1N"], graph, test_config());
        store
            .save_flow_events_batch(&[unknown_sell("sell1", 2000, "t1U")])
            .unwrap();

        let summary = run(&engine).await;
        assert_eq!(summary.enhanced, 1);

        let event = store.get_flow_events(2000, 2000).unwrap().remove(0);
        assert_eq!(event.classification_level, 0);
        assert_eq!(event.from_type, AddressType::NodeOperator);
        assert_eq!(event.hop_chain, None);
        match event.from_details {
            Some(AddressDetails::HistoricalConnection {
                node_wallet,
                connection_txid,
                days_ago,
                coinbase_count,
            }) => {
                assert_eq!(node_wallet, "t1N");
                assert_eq!(connection_txid, "n_to_u");
                assert_eq!(days_ago, 0);
                assert_eq!(coinbase_count, None);
            }
            other => panic!("expected historical connection details, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_unknown_on_both_sides_analyzed_once() {
        let mut event = unknown_buy("p2p1", 1000, "t1U");
        event.from_address = Some("t1Other".to_string());
        event.from_type = AddressType::Unknown;
        event.from_details = None;
        event.flow_type = FlowType::P2p;

        let (_temp, store, engine) = harness(&[], MockGraph::new(), test_config());
        store.save_flow_events_batch(&[event]).unwrap();

        let summary = run(&engine).await;
        assert_eq!(summary.processed, 1);
    }

    #[tokio::test]
    async fn test_parallel_batches_enhance_all() {
        let mut config = test_config();
        config.parallel_enabled = true;
        config.parallel_batch_size = 2;

        let graph = MockGraph::new()
            .history("t1A", vec![entry("a_to_n", 1050, TxDirection::Sent, false)])
            .history("t1B", vec![entry("b_to_n", 1060, TxDirection::Sent, false)])
            .history("t1C", vec![entry("c_to_n", 1070, TxDirection::Sent, false)])
            .transfer("a_to_n", "t1A", "t1N", 100)
            .transfer("b_to_n", "t1B", "t1N", 100)
            .transfer("c_to_n", "t1C", "t1N", 100);
        let (_temp, store, engine) = harness(&["t1N"], graph, config);
        store
            .save_flow_events_batch(&[
                unknown_buy("buy_a", 1000, "t1A"),
                unknown_buy("buy_b", 1000, "t1B"),
                unknown_buy("buy_c", 1000, "t1C"),
            ])
            .unwrap();

        let summary = run(&engine).await;
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.enhanced, 3);
        for event in store.get_flow_events(1000, 1000).unwrap() {
            assert_eq!(event.classification_level, 1);
            assert_eq!(event.to_type, AddressType::NodeOperator);
        }
    }
}
