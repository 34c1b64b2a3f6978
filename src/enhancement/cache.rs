//! TTL caches for the enhancement engine
//!
//! Five independent maps keyed by structured keys, each with its own TTL.
//! Negative results are cached with the same TTL; that is what keeps the
//! BFS from re-walking shared subgraphs on every event. The cache is a
//! memoization layer, not a coherence mechanism: briefly stale entries are
//! fine because the TTLs are short relative to one enhancement run.

use crate::classifier::NodeOperatorInfo;
use crate::enhancement::{CoinbaseEvidence, ConnectionEvidence};
use crate::indexer::{AddressTx, NormalizedTx, TxDirection};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const WALLET_TXS_TTL_SECS: i64 = 5 * 60;
const COINBASE_TTL_SECS: i64 = 60 * 60;
const CONNECTION_TTL_SECS: i64 = 60 * 60;
const OPERATOR_STATUS_TTL_SECS: i64 = 5 * 60;
const TX_BODY_TTL_SECS: i64 = 10 * 60;

/// Hit/miss counters for one sub-cache. `saves` counts upstream calls the
/// cache absorbed (equal to hits, kept separate for the status surface).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub saves: u64,
    pub entries: usize,
}

struct Entry<V> {
    value: V,
    expires_at: i64,
}

/// One TTL map. Expired entries are evicted lazily on `get`.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl_secs: i64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_secs,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K, now: i64) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: K, value: V, now: i64) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl_secs,
            },
        );
    }

    /// Drop all expired entries; returns how many were removed.
    pub fn clear_expired(&self, now: i64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            saves: hits,
            entries: self.entries.lock().unwrap().len(),
        }
    }
}

/// The five sub-caches used by one enhancement run.
pub struct EnhancementCache {
    /// address -> chronological wallet history
    pub wallet_txs: TtlCache<String, Vec<AddressTx>>,
    /// (address, from_block, to_block) -> coinbase evidence (or cached miss)
    pub coinbase: TtlCache<(String, u64, u64), Option<CoinbaseEvidence>>,
    /// (address, direction, from_block) -> connection evidence (or miss)
    pub connection: TtlCache<(String, TxDirection, u64), Option<ConnectionEvidence>>,
    /// address -> current registry entry (or cached miss)
    pub operator_status: TtlCache<String, Option<NodeOperatorInfo>>,
    /// txid -> full transaction body
    pub tx_bodies: TtlCache<String, NormalizedTx>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl EnhancementCache {
    pub fn new() -> Self {
        Self::with_timestamp_fn(Box::new(|| chrono::Utc::now().timestamp()))
    }

    pub fn with_timestamp_fn(now_fn: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        Self {
            wallet_txs: TtlCache::new(WALLET_TXS_TTL_SECS),
            coinbase: TtlCache::new(COINBASE_TTL_SECS),
            connection: TtlCache::new(CONNECTION_TTL_SECS),
            operator_status: TtlCache::new(OPERATOR_STATUS_TTL_SECS),
            tx_bodies: TtlCache::new(TX_BODY_TTL_SECS),
            now_fn,
        }
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }

    /// End-of-run housekeeping across all sub-caches.
    pub fn clear_expired(&self) -> usize {
        let now = self.now();
        self.wallet_txs.clear_expired(now)
            + self.coinbase.clear_expired(now)
            + self.connection.clear_expired(now)
            + self.operator_status.clear_expired(now)
            + self.tx_bodies.clear_expired(now)
    }

    /// One-line stats summary for run logging.
    pub fn summary(&self) -> String {
        let wallet = self.wallet_txs.stats();
        let coinbase = self.coinbase.stats();
        let connection = self.connection.stats();
        let operator = self.operator_status.stats();
        let bodies = self.tx_bodies.stats();
        format!(
            "wallet_txs {}/{} coinbase {}/{} connection {}/{} operator {}/{} tx_bodies {}/{}",
            wallet.hits,
            wallet.hits + wallet.misses,
            coinbase.hits,
            coinbase.hits + coinbase.misses,
            connection.hits,
            connection.hits + connection.misses,
            operator.hits,
            operator.hits + operator.misses,
            bodies.hits,
            bodies.hits + bodies.misses,
        )
    }
}

impl Default for EnhancementCache {
    fn default() -> Self {
        Self::new()
    }
}
