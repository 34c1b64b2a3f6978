//! Public explorer source (api/v2)
//!
//! Blockbook-shaped payloads: blocks carry full transactions inline, wallet
//! history comes back as full transactions from which direction is derived
//! relative to the queried address.

use super::types::{AddressTx, NormalizedBlock, NormalizedTx, TxDirection, TxInput, TxOutput};
use super::{parse_height, sat_from_entry, HttpStatusError, IndexerApi};
use crate::config::SourceSettings;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub struct FallbackSource {
    http: reqwest::Client,
    base_url: String,
    tx_fetch_limit: usize,
}

impl FallbackSource {
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
impl IndexerApi for FallbackSource {
    async fn chain_height(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let mut last_err: Option<Box<dyn std::error::Error + Send + Sync>> = None;
        for path in ["/api/v2", "/api/v2/status"] {
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
        let value = self.get_json(&format!("/api/v2/block/{}", height)).await?;
        parse_block(&value, height, self.tx_fetch_limit)
    }

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<NormalizedTx, Box<dyn std::error::Error + Send + Sync>> {
        let value = self.get_json(&format!("/api/v2/tx/{}", txid)).await?;
        parse_transaction(&value, txid)
    }

    async fn get_address_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>> {
        let value = self
            .get_json(&format!("/api/v2/address/{}?details=txs", address))
            .await?;
        Ok(parse_address_txs(&value, address))
    }
}

/// Parse an api/v2 block with inline transactions, capped at
/// `tx_fetch_limit` full bodies.
pub fn parse_block(
    value: &Value,
    requested_height: u64,
    tx_fetch_limit: usize,
) -> Result<NormalizedBlock, Box<dyn std::error::Error + Send + Sync>> {
    let height = value
        .get("height")
        .and_then(|h| h.as_u64())
        .unwrap_or(requested_height);
    let hash = value
        .get("hash")
        .and_then(|h| h.as_str())
        .ok_or("block payload has no hash")?
        .to_string();
    let time = value
        .get("time")
        .or_else(|| value.get("blockTime"))
        .and_then(|t| t.as_i64())
        .ok_or("block payload has no time")?;

    let mut txs = Vec::new();
    let mut total_txs = 0u32;
    if let Some(entries) = value.get("txs").and_then(|t| t.as_array()) {
        total_txs = entries.len() as u32;
        for entry in entries.iter().take(tx_fetch_limit) {
            let txid = entry.get("txid").and_then(|t| t.as_str()).unwrap_or("");
            if txid.is_empty() {
                continue;
            }
            match parse_transaction(entry, txid) {
                Ok(tx) => txs.push(tx),
                Err(e) => log::debug!("skipping malformed tx in block {}: {}", height, e),
            }
        }
    }

    Ok(NormalizedBlock {
        height,
        hash,
        time,
        tx_count: value
            .get("txCount")
            .and_then(|c| c.as_u64())
            .map(|c| c as u32)
            .unwrap_or(total_txs),
        size: value.get("size").and_then(|s| s.as_u64()).unwrap_or(0),
        txs,
    })
}

/// Parse an api/v2 transaction. Inputs and outputs carry flat `addresses`
/// arrays; values are satoshi strings.
pub fn parse_transaction(
    value: &Value,
    requested_txid: &str,
) -> Result<NormalizedTx, Box<dyn std::error::Error + Send + Sync>> {
    let txid = value
        .get("txid")
        .and_then(|t| t.as_str())
        .unwrap_or(requested_txid)
        .to_string();

    let mut vin = Vec::new();
    if let Some(entries) = value.get("vin").and_then(|v| v.as_array()) {
        for entry in entries {
            let address = entry
                .get("addresses")
                .and_then(|a| a.as_array())
                .and_then(|a| a.first())
                .and_then(|a| a.as_str())
                .map(|a| a.to_string());
            let is_coinbase = entry.get("coinbase").is_some() || address.is_none();
            vin.push(TxInput {
                address,
                value_sat: sat_from_entry(entry),
                is_coinbase,
            });
        }
    }

    let mut vout = Vec::new();
    if let Some(entries) = value.get("vout").and_then(|v| v.as_array()) {
        for (index, entry) in entries.iter().enumerate() {
            vout.push(TxOutput {
                n: entry
                    .get("n")
                    .and_then(|n| n.as_u64())
                    .unwrap_or(index as u64) as u32,
                addresses: entry
                    .get("addresses")
                    .or_else(|| entry.get("scriptPubKey").and_then(|s| s.get("addresses")))
                    .and_then(|a| a.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str())
                            .map(|s| s.to_string())
                            .collect()
                    })
                    .unwrap_or_default(),
                value_sat: sat_from_entry(entry),
            });
        }
    }

    // The v2 shape carries no kind summary; coinbase shows in the inputs.
    let kind = if vin.iter().any(|input| input.is_coinbase) {
        Some("coinbase".to_string())
    } else {
        None
    };

    Ok(NormalizedTx {
        txid,
        kind,
        vin,
        vout,
    })
}

/// Derive the wallet history from `?details=txs` full transactions:
/// direction is `sent` when the address appears on the input side,
/// otherwise `received`.
pub fn parse_address_txs(value: &Value, address: &str) -> Vec<AddressTx> {
    let Some(entries) = value
        .get("transactions")
        .or_else(|| value.get("txs"))
        .and_then(|t| t.as_array())
    else {
        return Vec::new();
    };

    let mut txs = Vec::new();
    for entry in entries {
        let Some(txid) = entry.get("txid").and_then(|t| t.as_str()) else {
            continue;
        };
        let Ok(tx) = parse_transaction(entry, txid) else {
            continue;
        };
        let in_inputs = tx
            .vin
            .iter()
            .any(|input| input.address.as_deref() == Some(address));
        let direction = if in_inputs {
            TxDirection::Sent
        } else {
            TxDirection::Received
        };
        txs.push(AddressTx {
            txid: txid.to_string(),
            block_height: entry
                .get("blockHeight")
                .or_else(|| entry.get("height"))
                .and_then(|h| h.as_u64())
                .unwrap_or(0),
            timestamp: entry
                .get("blockTime")
                .or_else(|| entry.get("time"))
                .and_then(|t| t.as_i64())
                .unwrap_or(0),
            direction,
            is_coinbase: tx.is_coinbase(),
        });
    }
    txs
}
