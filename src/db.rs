//! SQLite flow store
//!
//! Single owner of all durable state: blocks, transactions, flow events and
//! the sync-state scratchpad, in one database file with WAL journaling.
//! Writes are serialized behind the connection mutex; the batch entry points
//! commit in a single transaction so the sync pipeline and the enhancement
//! engine never interleave partial batches.

use crate::model::{
    AddressDetails, AddressType, BlockRow, ClassificationPatch, DataOrigin, FlowEvent, FlowType,
    TxRow,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Row};
use std::sync::{Arc, Mutex};

/// Maximum events returned per side by the unknown-wallet query.
const UNKNOWN_WALLETS_CAP: usize = 1000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    height      INTEGER PRIMARY KEY,
    hash        TEXT NOT NULL,
    time        INTEGER NOT NULL,
    tx_count    INTEGER NOT NULL DEFAULT 0,
    size        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS transactions (
    txid         TEXT PRIMARY KEY,
    block_height INTEGER NOT NULL,
    input_count  INTEGER NOT NULL DEFAULT 0,
    output_count INTEGER NOT NULL DEFAULT 0,
    total_input  REAL NOT NULL DEFAULT 0,
    total_output REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS flow_events (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    txid                 TEXT NOT NULL,
    vout                 INTEGER NOT NULL,
    block_height         INTEGER NOT NULL,
    block_time           INTEGER NOT NULL,
    from_address         TEXT,
    from_type            TEXT NOT NULL,
    from_details         TEXT,
    to_address           TEXT,
    to_type              TEXT NOT NULL,
    to_details           TEXT,
    flow_type            TEXT NOT NULL,
    amount               REAL NOT NULL,
    classification_level INTEGER NOT NULL DEFAULT 0,
    intermediary_wallet  TEXT,
    hop_chain            TEXT,
    analysis_timestamp   INTEGER,
    data_source          TEXT NOT NULL DEFAULT 'sync',
    UNIQUE(txid, vout)
);

CREATE TABLE IF NOT EXISTS sync_state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tx_block_height ON transactions(block_height);
CREATE INDEX IF NOT EXISTS idx_flow_block_height ON flow_events(block_height);
CREATE INDEX IF NOT EXISTS idx_flow_block_time ON flow_events(block_time);
CREATE INDEX IF NOT EXISTS idx_flow_type ON flow_events(flow_type);
CREATE INDEX IF NOT EXISTS idx_flow_from_type ON flow_events(from_type);
CREATE INDEX IF NOT EXISTS idx_flow_to_type ON flow_events(to_type);
CREATE INDEX IF NOT EXISTS idx_flow_from_address ON flow_events(from_address);
CREATE INDEX IF NOT EXISTS idx_flow_to_address ON flow_events(to_address);
CREATE INDEX IF NOT EXISTS idx_flow_level ON flow_events(classification_level);
CREATE INDEX IF NOT EXISTS idx_flow_data_source ON flow_events(data_source);
"#;

/// Unknown-side flow events awaiting enhancement.
#[derive(Debug, Default)]
pub struct UnknownWallets {
    /// Buying events whose destination is unknown.
    pub buys: Vec<FlowEvent>,
    /// Selling events whose source is unknown.
    pub sells: Vec<FlowEvent>,
}

impl UnknownWallets {
    pub fn total(&self) -> usize {
        self.buys.len() + self.sells.len()
    }
}

/// Rows removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub flow_events: usize,
    pub transactions: usize,
    pub blocks: usize,
}

#[derive(Debug, Clone)]
pub struct FlowTypeStat {
    pub flow_type: FlowType,
    pub count: u64,
    pub total_amount: f64,
}

#[derive(Debug, Clone)]
pub struct LevelStat {
    pub classification_level: u32,
    pub data_source: DataOrigin,
    pub count: u64,
}

/// Aggregated totals for one address over a height range.
#[derive(Debug, Clone)]
pub struct TopFlow {
    pub address: String,
    pub events: u64,
    pub total_amount: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub block_count: u64,
    pub tx_count: u64,
    pub flow_event_count: u64,
    pub flow_types: Vec<FlowTypeStat>,
    pub levels: Vec<LevelStat>,
    pub db_bytes: u64,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
}

/// Durable store for the exchange-flow dataset.
pub struct FlowStore {
    conn: Arc<Mutex<Connection>>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl FlowStore {
    /// Open (or create) the database file, enable WAL and apply the schema.
    pub fn open(db_path: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Self::open_with_timestamp_fn(db_path, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Open with a custom clock. Used by tests that need deterministic
    /// cooldown arithmetic.
    pub fn open_with_timestamp_fn(
        db_path: &str,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            now_fn,
        })
    }

    fn now(&self) -> i64 {
        (self.now_fn)()
    }

    // ---- blocks and transactions ----

    pub fn save_block(&self, block: &BlockRow) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();
        upsert_block(&conn, block)?;
        Ok(())
    }

    pub fn save_tx(&self, tx: &TxRow) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();
        upsert_tx(&conn, tx)?;
        Ok(())
    }

    /// Upsert a batch of blocks in one transaction.
    pub fn save_blocks_batch(
        &self,
        blocks: &[BlockRow],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for block in blocks {
            upsert_block(&tx, block)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Upsert a batch of transactions in one transaction.
    pub fn save_txs_batch(
        &self,
        txs: &[TxRow],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if txs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for row in txs {
            upsert_tx(&tx, row)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- flow events ----

    /// Commit a batch of flow events in a single transaction.
    ///
    /// The whole batch lands atomically; a conflicting `(txid, vout)` row is
    /// overwritten (last write wins). Per-event transactions are not an
    /// option here: the pipeline writes hundreds of events per batch and
    /// would otherwise contend with the enhancement engine on every row.
    pub fn save_flow_events_batch(
        &self,
        events: &[FlowEvent],
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for event in events {
            tx.execute(
                r#"
                INSERT INTO flow_events (
                    txid, vout, block_height, block_time,
                    from_address, from_type, from_details,
                    to_address, to_type, to_details,
                    flow_type, amount,
                    classification_level, intermediary_wallet, hop_chain,
                    analysis_timestamp, data_source
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(txid, vout) DO UPDATE SET
                    block_height = excluded.block_height,
                    block_time = excluded.block_time,
                    from_address = excluded.from_address,
                    from_type = excluded.from_type,
                    from_details = excluded.from_details,
                    to_address = excluded.to_address,
                    to_type = excluded.to_type,
                    to_details = excluded.to_details,
                    flow_type = excluded.flow_type,
                    amount = excluded.amount,
                    classification_level = excluded.classification_level,
                    intermediary_wallet = excluded.intermediary_wallet,
                    hop_chain = excluded.hop_chain,
                    analysis_timestamp = excluded.analysis_timestamp,
                    data_source = excluded.data_source
                "#,
                params![
                    event.txid,
                    event.vout,
                    event.block_height as i64,
                    event.block_time,
                    event.from_address,
                    event.from_type.as_str(),
                    details_to_json(&event.from_details)?,
                    event.to_address,
                    event.to_type.as_str(),
                    details_to_json(&event.to_details)?,
                    event.flow_type.as_str(),
                    event.amount,
                    event.classification_level,
                    event.intermediary_wallet,
                    chain_to_json(&event.hop_chain)?,
                    event.analysis_timestamp,
                    event.data_source.as_str(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(events.len())
    }

    /// Range scan by block height (inclusive), newest first, JSON detail
    /// columns parsed.
    pub fn get_flow_events(
        &self,
        low: u64,
        high: u64,
    ) -> Result<Vec<FlowEvent>, Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM flow_events WHERE block_height >= ? AND block_height <= ? \
             ORDER BY block_height DESC, id DESC",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![low as i64, high as i64], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Level-0 flow events with an unknown side, excluding rows whose last
    /// enhancement attempt is inside the cooldown. Capped per side, newest
    /// first.
    pub fn get_unknown_wallets(
        &self,
        retry_after_seconds: i64,
    ) -> Result<UnknownWallets, Box<dyn std::error::Error + Send + Sync>> {
        let cutoff = self.now() - retry_after_seconds;
        let conn = self.conn.lock().unwrap();

        let fetch = |side_column: &str| -> Result<Vec<FlowEvent>, Box<dyn std::error::Error + Send + Sync>> {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM flow_events \
                 WHERE classification_level = 0 AND {} = 'unknown' \
                   AND (analysis_timestamp IS NULL OR analysis_timestamp < ?) \
                 ORDER BY block_height DESC, id DESC LIMIT ?",
                EVENT_COLUMNS, side_column
            ))?;
            let rows = stmt.query_map(params![cutoff, UNKNOWN_WALLETS_CAP as i64], row_to_event)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        };

        Ok(UnknownWallets {
            buys: fetch("to_type")?,
            sells: fetch("from_type")?,
        })
    }

    /// Count of level-0 unknown-side events outside the cooldown. Cheap
    /// check used by the enhancement scheduler threshold.
    pub fn count_unknown_wallets(
        &self,
        retry_after_seconds: i64,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let cutoff = self.now() - retry_after_seconds;
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM flow_events \
             WHERE classification_level = 0 \
               AND (to_type = 'unknown' OR from_type = 'unknown') \
               AND (analysis_timestamp IS NULL OR analysis_timestamp < ?)",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Partial update of one flow event's classification columns. Fields
    /// left `None` in the patch are untouched; re-applying the same patch is
    /// a no-op in effect.
    pub fn update_flow_event_classification(
        &self,
        id: i64,
        patch: &ClassificationPatch,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(level) = patch.classification_level {
            sets.push("classification_level = ?");
            values.push(SqlValue::Integer(level as i64));
        }
        if let Some(wallet) = &patch.intermediary_wallet {
            sets.push("intermediary_wallet = ?");
            values.push(SqlValue::Text(wallet.clone()));
        }
        if let Some(chain) = &patch.hop_chain {
            sets.push("hop_chain = ?");
            values.push(SqlValue::Text(serde_json::to_string(chain)?));
        }
        if let Some(ts) = patch.analysis_timestamp {
            sets.push("analysis_timestamp = ?");
            values.push(SqlValue::Integer(ts));
        }
        if let Some(origin) = patch.data_source {
            sets.push("data_source = ?");
            values.push(SqlValue::Text(origin.as_str().to_string()));
        }
        if let Some(t) = patch.from_type {
            sets.push("from_type = ?");
            values.push(SqlValue::Text(t.as_str().to_string()));
        }
        if let Some(details) = &patch.from_details {
            sets.push("from_details = ?");
            values.push(SqlValue::Text(serde_json::to_string(details)?));
        }
        if let Some(t) = patch.to_type {
            sets.push("to_type = ?");
            values.push(SqlValue::Text(t.as_str().to_string()));
        }
        if let Some(details) = &patch.to_details {
            sets.push("to_details = ?");
            values.push(SqlValue::Text(serde_json::to_string(details)?));
        }

        if sets.is_empty() {
            return Ok(());
        }
        values.push(SqlValue::Integer(id));

        let sql = format!("UPDATE flow_events SET {} WHERE id = ?", sets.join(", "));
        let conn = self.conn.lock().unwrap();
        conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    // ---- retention ----

    /// Delete flow events, transactions and blocks below the retention
    /// cutoff in one transaction, then compact the file.
    pub fn cleanup_old_data(
        &self,
        current_block: u64,
        window_blocks: u64,
    ) -> Result<CleanupSummary, Box<dyn std::error::Error + Send + Sync>> {
        let cutoff = current_block.saturating_sub(window_blocks) as i64;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let flow_events = tx.execute("DELETE FROM flow_events WHERE block_height < ?", params![cutoff])?;
        let transactions =
            tx.execute("DELETE FROM transactions WHERE block_height < ?", params![cutoff])?;
        let blocks = tx.execute("DELETE FROM blocks WHERE height < ?", params![cutoff])?;
        tx.commit()?;

        // Reclaim the freed pages; VACUUM cannot run inside the transaction.
        conn.execute_batch("VACUUM")?;

        Ok(CleanupSummary {
            flow_events,
            transactions,
            blocks,
        })
    }

    // ---- stats and read surface ----

    pub fn get_stats(&self) -> Result<StoreStats, Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();

        let block_count: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |r| r.get(0))?;
        let tx_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))?;
        let flow_event_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM flow_events", [], |r| r.get(0))?;

        let mut flow_types = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT flow_type, COUNT(*), COALESCE(SUM(amount), 0) \
                 FROM flow_events GROUP BY flow_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?;
            for row in rows {
                let (kind, count, total_amount) = row?;
                if let Some(flow_type) = FlowType::parse(&kind) {
                    flow_types.push(FlowTypeStat {
                        flow_type,
                        count: count as u64,
                        total_amount,
                    });
                }
            }
        }

        let mut levels = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT classification_level, data_source, COUNT(*) \
                 FROM flow_events GROUP BY classification_level, data_source",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (level, origin, count) = row?;
                if let Some(data_source) = DataOrigin::parse(&origin) {
                    levels.push(LevelStat {
                        classification_level: level as u32,
                        data_source,
                        count: count as u64,
                    });
                }
            }
        }

        let (min_height, max_height): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(height), MAX(height) FROM blocks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let db_bytes: i64 = conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            block_count: block_count as u64,
            tx_count: tx_count as u64,
            flow_event_count: flow_event_count as u64,
            flow_types,
            levels,
            db_bytes: db_bytes as u64,
            min_height: min_height.map(|h| h as u64),
            max_height: max_height.map(|h| h as u64),
        })
    }

    /// Stored block height range, if any blocks exist.
    pub fn height_range(
        &self,
    ) -> Result<Option<(u64, u64)>, Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();
        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(height), MAX(height) FROM blocks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match (min, max) {
            (Some(min), Some(max)) => Some((min as u64, max as u64)),
            _ => None,
        })
    }

    pub fn block_count(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Per-flow-type counts and sums since a height. Thin read used by the
    /// aggregation surface.
    pub fn get_flow_summary(
        &self,
        since_height: u64,
    ) -> Result<Vec<FlowTypeStat>, Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT flow_type, COUNT(*), COALESCE(SUM(amount), 0) \
             FROM flow_events WHERE block_height >= ? GROUP BY flow_type",
        )?;
        let rows = stmt.query_map(params![since_height as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        let mut summary = Vec::new();
        for row in rows {
            let (kind, count, total_amount) = row?;
            if let Some(flow_type) = FlowType::parse(&kind) {
                summary.push(FlowTypeStat {
                    flow_type,
                    count: count as u64,
                    total_amount,
                });
            }
        }
        Ok(summary)
    }

    /// Top buyers (destination side of buying events) or sellers (source
    /// side of selling events) since a height, by total amount.
    pub fn get_top_flows(
        &self,
        flow_type: FlowType,
        since_height: u64,
        limit: usize,
    ) -> Result<Vec<TopFlow>, Box<dyn std::error::Error + Send + Sync>> {
        let side = match flow_type {
            FlowType::Buying => "to_address",
            FlowType::Selling => "from_address",
            FlowType::P2p => return Err("top flows are defined for buying or selling only".into()),
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {side}, COUNT(*), SUM(amount) FROM flow_events \
             WHERE flow_type = ? AND block_height >= ? AND {side} IS NOT NULL \
             GROUP BY {side} ORDER BY SUM(amount) DESC LIMIT ?",
            side = side
        ))?;
        let rows = stmt.query_map(
            params![flow_type.as_str(), since_height as i64, limit as i64],
            |row| {
                Ok(TopFlow {
                    address: row.get(0)?,
                    events: row.get::<_, i64>(1)? as u64,
                    total_amount: row.get(2)?,
                })
            },
        )?;
        let mut flows = Vec::new();
        for row in rows {
            flows.push(row?);
        }
        Ok(flows)
    }

    // ---- sync state ----

    pub fn set_sync_value(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_state (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_sync_value(
        &self,
        key: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM sync_state WHERE key = ?")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(value) => Ok(Some(value?)),
            None => Ok(None),
        }
    }
}

const EVENT_COLUMNS: &str = "id, txid, vout, block_height, block_time, \
    from_address, from_type, from_details, to_address, to_type, to_details, \
    flow_type, amount, classification_level, intermediary_wallet, hop_chain, \
    analysis_timestamp, data_source";

fn upsert_block(conn: &Connection, block: &BlockRow) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO blocks (height, hash, time, tx_count, size) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(height) DO UPDATE SET \
             hash = excluded.hash, time = excluded.time, \
             tx_count = excluded.tx_count, size = excluded.size",
        params![
            block.height as i64,
            block.hash,
            block.time,
            block.tx_count,
            block.size as i64
        ],
    )
}

fn upsert_tx(conn: &Connection, tx: &TxRow) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO transactions \
             (txid, block_height, input_count, output_count, total_input, total_output) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(txid) DO UPDATE SET \
             block_height = excluded.block_height, \
             input_count = excluded.input_count, \
             output_count = excluded.output_count, \
             total_input = excluded.total_input, \
             total_output = excluded.total_output",
        params![
            tx.txid,
            tx.block_height as i64,
            tx.input_count,
            tx.output_count,
            tx.total_input,
            tx.total_output
        ],
    )
}

fn details_to_json(
    details: &Option<AddressDetails>,
) -> Result<Option<String>, serde_json::Error> {
    details.as_ref().map(serde_json::to_string).transpose()
}

fn chain_to_json(chain: &Option<Vec<String>>) -> Result<Option<String>, serde_json::Error> {
    chain.as_ref().map(serde_json::to_string).transpose()
}

fn column_error(index: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
}

#[derive(Debug)]
struct BadEnumValue(String);

impl std::fmt::Display for BadEnumValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unrecognized enum value '{}'", self.0)
    }
}

impl std::error::Error for BadEnumValue {}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<FlowEvent> {
    let from_type_raw: String = row.get(6)?;
    let to_type_raw: String = row.get(9)?;
    let flow_type_raw: String = row.get(11)?;
    let data_source_raw: String = row.get(17)?;

    let from_details: Option<String> = row.get(7)?;
    let to_details: Option<String> = row.get(10)?;
    let hop_chain: Option<String> = row.get(15)?;

    Ok(FlowEvent {
        id: Some(row.get(0)?),
        txid: row.get(1)?,
        vout: row.get(2)?,
        block_height: row.get::<_, i64>(3)? as u64,
        block_time: row.get(4)?,
        from_address: row.get(5)?,
        from_type: AddressType::parse(&from_type_raw)
            .ok_or_else(|| column_error(6, BadEnumValue(from_type_raw)))?,
        from_details: from_details
            .map(|raw| serde_json::from_str(&raw).map_err(|e| column_error(7, e)))
            .transpose()?,
        to_address: row.get(8)?,
        to_type: AddressType::parse(&to_type_raw)
            .ok_or_else(|| column_error(9, BadEnumValue(to_type_raw)))?,
        to_details: to_details
            .map(|raw| serde_json::from_str(&raw).map_err(|e| column_error(10, e)))
            .transpose()?,
        flow_type: FlowType::parse(&flow_type_raw)
            .ok_or_else(|| column_error(11, BadEnumValue(flow_type_raw)))?,
        amount: row.get(12)?,
        classification_level: row.get::<_, i64>(13)? as u32,
        intermediary_wallet: row.get(14)?,
        hop_chain: hop_chain
            .map(|raw| serde_json::from_str(&raw).map_err(|e| column_error(15, e)))
            .transpose()?,
        analysis_timestamp: row.get(16)?,
        data_source: DataOrigin::parse(&data_source_raw)
            .ok_or_else(|| column_error(17, BadEnumValue(data_source_raw)))?,
    })
}
