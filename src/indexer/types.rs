//! Normalized upstream shapes
//!
//! Both sources are reduced to these structs during parsing so the pipeline
//! and the enhancement engine never see source-specific JSON.

use serde::{Deserialize, Serialize};

/// One block with its relevant transactions fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBlock {
    pub height: u64,
    pub hash: String,
    pub time: i64,
    /// Total transactions in the block, before any relevance filtering.
    pub tx_count: u32,
    /// Block size in bytes, when the source reports it.
    pub size: u64,
    pub txs: Vec<NormalizedTx>,
}

/// One transaction with inputs and outputs normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTx {
    pub txid: String,
    /// Source-provided kind summary (`transfer`, `coinbase`, ...), when the
    /// source exposes one.
    pub kind: Option<String>,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxInput {
    pub address: Option<String>,
    pub value_sat: i64,
    pub is_coinbase: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxOutput {
    pub n: u32,
    /// Lifted from `scriptPubKey.addresses` during normalization when the
    /// source nests them.
    pub addresses: Vec<String>,
    pub value_sat: i64,
}

impl NormalizedTx {
    /// All distinct input addresses, in order of first appearance.
    pub fn input_addresses(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for input in &self.vin {
            if let Some(address) = input.address.as_deref() {
                if !seen.contains(&address) {
                    seen.push(address);
                }
            }
        }
        seen
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.iter().any(|input| input.is_coinbase)
    }

    pub fn total_input_sat(&self) -> i64 {
        self.vin.iter().map(|input| input.value_sat).sum()
    }

    pub fn total_output_sat(&self) -> i64 {
        self.vout.iter().map(|output| output.value_sat).sum()
    }
}

impl TxOutput {
    /// The first (usually only) destination address of this output.
    pub fn first_address(&self) -> Option<&str> {
        self.addresses.first().map(|a| a.as_str())
    }
}

/// Direction of a wallet-history entry relative to the queried address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxDirection {
    Sent,
    Received,
}

impl TxDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" | "out" => Some(TxDirection::Sent),
            "received" | "in" => Some(TxDirection::Received),
            _ => None,
        }
    }
}

/// One entry of a wallet's chronological transaction list.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressTx {
    pub txid: String,
    pub block_height: u64,
    pub timestamp: i64,
    pub direction: TxDirection,
    pub is_coinbase: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_addresses_dedup_ordered() {
        let tx = NormalizedTx {
            txid: "t".to_string(),
            kind: None,
            vin: vec![
                TxInput {
                    address: Some("a".to_string()),
                    value_sat: 1,
                    is_coinbase: false,
                },
                TxInput {
                    address: Some("b".to_string()),
                    value_sat: 2,
                    is_coinbase: false,
                },
                TxInput {
                    address: Some("a".to_string()),
                    value_sat: 3,
                    is_coinbase: false,
                },
                TxInput {
                    address: None,
                    value_sat: 4,
                    is_coinbase: false,
                },
            ],
            vout: vec![],
        };
        assert_eq!(tx.input_addresses(), vec!["a", "b"]);
        assert_eq!(tx.total_input_sat(), 10);
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(TxDirection::parse("sent"), Some(TxDirection::Sent));
        assert_eq!(TxDirection::parse("received"), Some(TxDirection::Received));
        assert_eq!(TxDirection::parse("sideways"), None);
    }
}
