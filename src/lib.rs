//! fluxflow — exchange flow tracker for the Flux chain
//!
//! Ingests blocks from an indexer, classifies transactions touching known
//! exchange addresses into buy/sell/p2p flow events, and upgrades `unknown`
//! counterparties to node operators through historical detection and a
//! bounded multi-hop search over the transaction graph.
//!
//! ```text
//! Indexer (primary | fallback)
//!     ↓ normalized blocks
//! SyncEngine ──── relevance filter ──── flow events ───▶ FlowStore (SQLite)
//!                                                           ▲
//! EnhancementEngine ◀── unknown events ─────────────────────┘
//!     │  historical checks + bounded BFS (via TTL cache)
//!     └─▶ in-place classification upgrades
//! ```

pub mod classifier;
pub mod config;
pub mod db;
pub mod enhancement;
pub mod indexer;
pub mod model;
pub mod pipeline;
pub mod scheduler;

pub use classifier::{AddressBook, AddressClassifier, Classification, NodeOperatorInfo};
pub use config::{Config, EnhancementConfig, SourceKind, SourceSettings};
pub use db::{FlowStore, StoreStats, UnknownWallets};
pub use enhancement::{EnhancementCache, EnhancementEngine, EnhancementSummary, RunOutcome};
pub use indexer::{IndexerApi, IndexerClient};
pub use model::{AddressDetails, AddressType, DataOrigin, FlowEvent, FlowType};
pub use pipeline::{SyncEngine, SyncStats, TickOutcome};
