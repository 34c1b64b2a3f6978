//! Wallet enhancement
//!
//! Upgrades flow events whose counterparty is `unknown`: historical
//! detection on the observed wallet (coinbase receipts, past connections to
//! known operators) and a bounded breadth-first search over the transaction
//! graph for operators hidden behind intermediary wallets. A TTL cache
//! suppresses redundant upstream calls within and across runs.

pub mod cache;
pub mod engine;

pub use cache::{CacheStats, EnhancementCache, TtlCache};
pub use engine::{EnhancementEngine, EnhancementSummary, RunOutcome};

/// Coinbase receipts found for a wallet inside a block window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinbaseEvidence {
    pub last_block: u64,
    pub count: u32,
}

/// A past transfer connecting a wallet to a (current or historical) node
/// operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvidence {
    pub node_wallet: String,
    pub connection_txid: String,
    pub block_height: u64,
    /// Set when the operator was identified by coinbase history rather than
    /// the current registry.
    pub coinbase_count: Option<u32>,
}
