//! Private indexer source (api/v1)
//!
//! The primary source exposes a transaction kind summary inline on the
//! block payload, so coinbase and node-confirmation transactions are
//! dropped before any full transaction fetch.

use super::types::{AddressTx, NormalizedBlock, NormalizedTx, TxDirection, TxInput, TxOutput};
use super::{parse_height, sat_from_entry, HttpStatusError, IndexerApi};
use crate::config::SourceSettings;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

pub struct PrimarySource {
    http: reqwest::Client,
    base_url: String,
    tx_fetch_limit: usize,
}

impl PrimarySource {
    pub fn new(
        settings: &SourceSettings,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            tx_fetch_limit: settings.tx_fetch_limit,
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Box::new(HttpStatusError {
                status: response.status().as_u16(),
                url,
            }));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl IndexerApi for PrimarySource {
    async fn chain_height(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let mut last_err: Option<Box<dyn std::error::Error + Send + Sync>> = None;
        for path in ["/api/v1/blocks/latest", "/api/v1/status"] {
            match self.get_json(path).await {
                Ok(value) => {
                    if let Some(height) = parse_height(&value) {
                        return Ok(height);
                    }
                    last_err = Some(format!("no chain height in {} payload", path).into());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| "chain height unavailable".into()))
    }

    async fn get_block(
        &self,
        height: u64,
    ) -> Result<NormalizedBlock, Box<dyn std::error::Error + Send + Sync>> {
        let value = self.get_json(&format!("/api/v1/blocks/{}", height)).await?;
        let summary = parse_block_summary(&value, height)?;

        let mut txs = Vec::new();
        for txid in summary.transfer_txids().into_iter().take(self.tx_fetch_limit) {
            match self.get_transaction(&txid).await {
                Ok(mut tx) => {
                    tx.kind = summary.kinds.get(&txid).cloned();
                    txs.push(tx);
                }
                Err(e) => {
                    // One bad transaction never sinks the block.
                    log::warn!("skipping tx {} in block {}: {}", txid, height, e);
                }
            }
        }

        Ok(NormalizedBlock {
            height: summary.height,
            hash: summary.hash,
            time: summary.time,
            tx_count: summary.txids.len() as u32,
            size: summary.size,
            txs,
        })
    }

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<NormalizedTx, Box<dyn std::error::Error + Send + Sync>> {
        let value = self.get_json(&format!("/api/v1/transactions/{}", txid)).await?;
        parse_transaction(&value, txid)
    }

    async fn get_address_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>> {
        let value = self
            .get_json(&format!("/api/v1/addresses/{}/transactions", address))
            .await?;
        parse_address_txs(&value)
    }
}

/// Block payload before full transaction resolution.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub time: i64,
    pub size: u64,
    pub txids: Vec<String>,
    /// txid -> kind, from the inline `txDetails` summary.
    pub kinds: HashMap<String, String>,
}

impl BlockSummary {
    /// Transaction ids worth a full fetch: kind `transfer`, or no kind
    /// summary at all for that id.
    pub fn transfer_txids(&self) -> Vec<String> {
        self.txids
            .iter()
            .filter(|txid| match self.kinds.get(*txid) {
                Some(kind) => kind == "transfer",
                None => true,
            })
            .cloned()
            .collect()
    }
}

/// Parse the api/v1 block payload. The tx list can be bare txids or
/// objects carrying a `txid` field.
pub fn parse_block_summary(
    value: &Value,
    requested_height: u64,
) -> Result<BlockSummary, Box<dyn std::error::Error + Send + Sync>> {
    let body = value.get("data").unwrap_or(value);

    let height = body
        .get("height")
        .and_then(|h| h.as_u64())
        .unwrap_or(requested_height);
    let hash = body
        .get("hash")
        .and_then(|h| h.as_str())
        .ok_or("block payload has no hash")?
        .to_string();
    let time = body
        .get("time")
        .or_else(|| body.get("blockTime"))
        .and_then(|t| t.as_i64())
        .ok_or("block payload has no time")?;

    let mut txids = Vec::new();
    if let Some(entries) = body.get("tx").and_then(|t| t.as_array()) {
        for entry in entries {
            match entry {
                Value::String(txid) => txids.push(txid.clone()),
                Value::Object(_) => {
                    if let Some(txid) = entry.get("txid").and_then(|t| t.as_str()) {
                        txids.push(txid.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    let mut kinds = HashMap::new();
    if let Some(details) = body.get("txDetails").and_then(|d| d.as_array()) {
        for detail in details {
            let txid = detail.get("txid").and_then(|t| t.as_str());
            let kind = detail.get("kind").and_then(|k| k.as_str());
            if let (Some(txid), Some(kind)) = (txid, kind) {
                kinds.insert(txid.to_string(), kind.to_string());
            }
        }
    }

    Ok(BlockSummary {
        height,
        hash,
        time,
        size: body.get("size").and_then(|s| s.as_u64()).unwrap_or(0),
        txids,
        kinds,
    })
}

/// Parse an api/v1 transaction body. `scriptPubKey.addresses` is lifted to
/// `vout[].addresses`.
pub fn parse_transaction(
    value: &Value,
    requested_txid: &str,
) -> Result<NormalizedTx, Box<dyn std::error::Error + Send + Sync>> {
    let body = value.get("data").unwrap_or(value);

    let txid = body
        .get("txid")
        .and_then(|t| t.as_str())
        .unwrap_or(requested_txid)
        .to_string();

    let mut vin = Vec::new();
    if let Some(entries) = body.get("vin").and_then(|v| v.as_array()) {
        for entry in entries {
            let is_coinbase = entry.get("coinbase").is_some();
            let address = entry
                .get("addr")
                .or_else(|| entry.get("address"))
                .and_then(|a| a.as_str())
                .map(|a| a.to_string())
                .or_else(|| {
                    entry
                        .get("addresses")
                        .and_then(|a| a.as_array())
                        .and_then(|a| a.first())
                        .and_then(|a| a.as_str())
                        .map(|a| a.to_string())
                });
            vin.push(TxInput {
                address,
                value_sat: sat_from_entry(entry),
                is_coinbase,
            });
        }
    }

    let mut vout = Vec::new();
    if let Some(entries) = body.get("vout").and_then(|v| v.as_array()) {
        for (index, entry) in entries.iter().enumerate() {
            let n = entry
                .get("n")
                .and_then(|n| n.as_u64())
                .unwrap_or(index as u64) as u32;
            let addresses = entry
                .get("scriptPubKey")
                .and_then(|s| s.get("addresses"))
                .or_else(|| entry.get("addresses"))
                .and_then(|a| a.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default();
            vout.push(TxOutput {
                n,
                addresses,
                value_sat: sat_from_entry(entry),
            });
        }
    }

    Ok(NormalizedTx {
        txid,
        kind: None,
        vin,
        vout,
    })
}

/// Parse the api/v1 wallet history list. Entries missing a txid or a
/// recognizable direction are skipped.
pub fn parse_address_txs(
    value: &Value,
) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>> {
    let entries = value
        .get("transactions")
        .or_else(|| value.get("data"))
        .unwrap_or(value)
        .as_array()
        .ok_or("address history payload is not an array")?;

    let mut txs = Vec::new();
    let mut skipped = 0usize;
    for entry in entries {
        let txid = entry.get("txid").and_then(|t| t.as_str());
        let direction = entry
            .get("direction")
            .and_then(|d| d.as_str())
            .and_then(TxDirection::parse);
        let (Some(txid), Some(direction)) = (txid, direction) else {
            skipped += 1;
            continue;
        };
        txs.push(AddressTx {
            txid: txid.to_string(),
            block_height: entry
                .get("blockHeight")
                .or_else(|| entry.get("block_height"))
                .or_else(|| entry.get("height"))
                .and_then(|h| h.as_u64())
                .unwrap_or(0),
            timestamp: entry
                .get("timestamp")
                .or_else(|| entry.get("time"))
                .or_else(|| entry.get("blockTime"))
                .and_then(|t| t.as_i64())
                .unwrap_or(0),
            direction,
            is_coinbase: entry
                .get("isCoinbase")
                .or_else(|| entry.get("is_coinbase"))
                .and_then(|c| c.as_bool())
                .unwrap_or(false),
        });
    }
    if skipped > 0 {
        log::debug!("address history: skipped {} malformed entries", skipped);
    }
    Ok(txs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_block_summary_kind_filter() {
        let value = json!({
            "height": 12000,
            "hash": "00abc",
            "time": 1700000000,
            "tx": ["cb", "t1", "t2", "conf"],
            "txDetails": [
                {"txid": "cb", "kind": "coinbase"},
                {"txid": "t1", "kind": "transfer"},
                {"txid": "t2", "kind": "transfer"},
                {"txid": "conf", "kind": "fluxnode_confirm"}
            ]
        });
        let summary = parse_block_summary(&value, 12000).unwrap();
        assert_eq!(summary.height, 12000);
        assert_eq!(summary.txids.len(), 4);
        assert_eq!(summary.transfer_txids(), vec!["t1", "t2"]);
    }

    #[test]
    fn test_parse_block_summary_without_details_keeps_all() {
        let value = json!({
            "hash": "00abc",
            "time": 1700000000,
            "tx": [{"txid": "t1"}, {"txid": "t2"}]
        });
        let summary = parse_block_summary(&value, 500).unwrap();
        assert_eq!(summary.height, 500);
        assert_eq!(summary.transfer_txids(), vec!["t1", "t2"]);
    }

    #[test]
    fn test_parse_transaction_lifts_script_pub_key_addresses() {
        let value = json!({
            "txid": "t1",
            "vin": [
                {"addr": "t1Sender", "valueSat": 1_050_000_000i64}
            ],
            "vout": [
                {"n": 0, "valueSat": 1_000_000_000i64,
                 "scriptPubKey": {"addresses": ["t1Receiver"]}},
                {"n": 1, "value": 0.5,
                 "scriptPubKey": {"addresses": ["t1Sender"]}}
            ]
        });
        let tx = parse_transaction(&value, "t1").unwrap();
        assert_eq!(tx.vin[0].address.as_deref(), Some("t1Sender"));
        assert_eq!(tx.vout[0].addresses, vec!["t1Receiver"]);
        assert_eq!(tx.vout[0].value_sat, 1_000_000_000);
        // Decimal FLUX values convert to satoshis.
        assert_eq!(tx.vout[1].value_sat, 50_000_000);
    }

    #[test]
    fn test_parse_transaction_coinbase_input() {
        let value = json!({
            "txid": "cb",
            "vin": [{"coinbase": "044c86..."}],
            "vout": [{"n": 0, "valueSat": 7_500_000_000i64,
                      "scriptPubKey": {"addresses": ["t1Miner"]}}]
        });
        let tx = parse_transaction(&value, "cb").unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.vin[0].address, None);
    }

    #[test]
    fn test_parse_address_txs_skips_malformed() {
        let value = json!([
            {"txid": "a", "blockHeight": 1000, "timestamp": 1700000000,
             "direction": "sent", "isCoinbase": false},
            {"txid": "b", "blockHeight": 1001, "timestamp": 1700000030,
             "direction": "received", "isCoinbase": true},
            {"blockHeight": 1002, "direction": "sent"},
            {"txid": "c", "direction": "teleported"}
        ]);
        let txs = parse_address_txs(&value).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].direction, TxDirection::Sent);
        assert!(txs[1].is_coinbase);
    }
}
