//! Block ingestion pipeline
//!
//! Keeps the store's flow events within the retention window of the chain
//! tip: forward sync toward the tip, backward fill until the window is
//! covered, relevance filtering, flow-event construction and batched
//! commits, plus the rolling retention sweep.

pub mod engine;

pub use engine::{SyncEngine, SyncPhase, SyncStats, TickOutcome};
