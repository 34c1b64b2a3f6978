//! Core row types and classification enums shared by the store, the sync
//! pipeline and the enhancement engine.
//!
//! Detail payloads are a tagged sum serialized as self-describing JSON so
//! the TEXT columns stay readable and schema evolution is free.

use serde::{Deserialize, Serialize};

/// Classification of a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    Exchange,
    Foundation,
    NodeOperator,
    Unknown,
}

impl AddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::Exchange => "exchange",
            AddressType::Foundation => "foundation",
            AddressType::NodeOperator => "node_operator",
            AddressType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exchange" => Some(AddressType::Exchange),
            "foundation" => Some(AddressType::Foundation),
            "node_operator" => Some(AddressType::NodeOperator),
            "unknown" => Some(AddressType::Unknown),
            _ => None,
        }
    }
}

/// Direction of value relative to exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Buying,
    Selling,
    P2p,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Buying => "buying",
            FlowType::Selling => "selling",
            FlowType::P2p => "p2p",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buying" => Some(FlowType::Buying),
            "selling" => Some(FlowType::Selling),
            "p2p" => Some(FlowType::P2p),
            _ => None,
        }
    }
}

/// Whether a row was written by the sync pipeline or rewritten by the
/// enhancement engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    Sync,
    Enhanced,
}

impl DataOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataOrigin::Sync => "sync",
            DataOrigin::Enhanced => "enhanced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(DataOrigin::Sync),
            "enhanced" => Some(DataOrigin::Enhanced),
            _ => None,
        }
    }
}

/// Deterministic flow direction from the (from, to) classification pair.
///
/// Exchange on the input side and not on the output side is a buy; exchange
/// on the output side and not on the input side is a sell; everything else
/// (including exchange-to-exchange change outputs) is p2p.
pub fn flow_type_for(from: AddressType, to: AddressType) -> FlowType {
    if from == AddressType::Exchange && to != AddressType::Exchange {
        FlowType::Buying
    } else if to == AddressType::Exchange && from != AddressType::Exchange {
        FlowType::Selling
    } else {
        FlowType::P2p
    }
}

/// Node counts per tier for one payment address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    #[serde(rename = "CUMULUS")]
    pub cumulus: u32,
    #[serde(rename = "NIMBUS")]
    pub nimbus: u32,
    #[serde(rename = "STRATUS")]
    pub stratus: u32,
}

impl TierCounts {
    pub fn total(&self) -> u32 {
        self.cumulus + self.nimbus + self.stratus
    }

    pub fn add_tier(&mut self, tier: &str) {
        match tier.to_ascii_uppercase().as_str() {
            "CUMULUS" => self.cumulus += 1,
            "NIMBUS" => self.nimbus += 1,
            "STRATUS" => self.stratus += 1,
            _ => {}
        }
    }
}

/// Side-car details for a classified address, persisted as JSON in the
/// `from_details` / `to_details` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AddressDetails {
    Exchange {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        logo: Option<String>,
    },
    Foundation {
        name: String,
    },
    Node {
        node_count: u32,
        tiers: TierCounts,
    },
    /// Written by the enhancement engine when a side is rewritten to
    /// node_operator. `hopCount` 0 means the observed wallet itself was
    /// detected (historical lanes); higher counts come from the BFS.
    #[serde(rename_all = "camelCase")]
    EnhancedNode {
        node_wallet: String,
        detection_method: String,
        status: String,
        hop_count: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        intermediary_txids: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_count: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tiers: Option<TierCounts>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_block: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        days_inactive: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        coinbase_count: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    HistoricalConnection {
        node_wallet: String,
        connection_txid: String,
        days_ago: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        coinbase_count: Option<u32>,
    },
}

/// One (txid, vout) pair whose transaction involves at least one classified
/// address. The unit of persistence for this system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Row id, assigned by the store on insert.
    pub id: Option<i64>,
    pub txid: String,
    pub vout: u32,
    pub block_height: u64,
    pub block_time: i64,
    pub from_address: Option<String>,
    pub from_type: AddressType,
    pub from_details: Option<AddressDetails>,
    pub to_address: Option<String>,
    pub to_type: AddressType,
    pub to_details: Option<AddressDetails>,
    pub flow_type: FlowType,
    /// Decimal FLUX (vout value / 1e8).
    pub amount: f64,
    /// Number of intermediary wallets between the observed address and a
    /// node operator; 0 for directly classified rows.
    pub classification_level: u32,
    pub intermediary_wallet: Option<String>,
    pub hop_chain: Option<Vec<String>>,
    /// Epoch seconds of the last enhancement attempt.
    pub analysis_timestamp: Option<i64>,
    pub data_source: DataOrigin,
}

/// Block header row, keyed by height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRow {
    pub height: u64,
    pub hash: String,
    pub time: i64,
    pub tx_count: u32,
    pub size: u64,
}

/// Transaction aggregate row, keyed by txid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRow {
    pub txid: String,
    pub block_height: u64,
    pub input_count: u32,
    pub output_count: u32,
    pub total_input: f64,
    pub total_output: f64,
}

/// Partial update applied to one flow event by the enhancement engine.
/// `None` fields are left untouched, so the update is idempotent when
/// re-applied with the same values.
#[derive(Debug, Clone, Default)]
pub struct ClassificationPatch {
    pub classification_level: Option<u32>,
    pub intermediary_wallet: Option<String>,
    pub hop_chain: Option<Vec<String>>,
    pub analysis_timestamp: Option<i64>,
    pub data_source: Option<DataOrigin>,
    pub from_type: Option<AddressType>,
    pub from_details: Option<AddressDetails>,
    pub to_type: Option<AddressType>,
    pub to_details: Option<AddressDetails>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_type_matrix() {
        use AddressType::*;
        // Exchange on exactly one side decides the direction.
        assert_eq!(flow_type_for(Exchange, NodeOperator), FlowType::Buying);
        assert_eq!(flow_type_for(Exchange, Unknown), FlowType::Buying);
        assert_eq!(flow_type_for(Exchange, Foundation), FlowType::Buying);
        assert_eq!(flow_type_for(NodeOperator, Exchange), FlowType::Selling);
        assert_eq!(flow_type_for(Unknown, Exchange), FlowType::Selling);
        assert_eq!(flow_type_for(Foundation, Exchange), FlowType::Selling);
        // Both or neither side exchange is p2p.
        assert_eq!(flow_type_for(Exchange, Exchange), FlowType::P2p);
        assert_eq!(flow_type_for(Unknown, Unknown), FlowType::P2p);
        assert_eq!(flow_type_for(NodeOperator, Foundation), FlowType::P2p);
    }

    #[test]
    fn enum_text_round_trips() {
        for t in [
            AddressType::Exchange,
            AddressType::Foundation,
            AddressType::NodeOperator,
            AddressType::Unknown,
        ] {
            assert_eq!(AddressType::parse(t.as_str()), Some(t));
        }
        for f in [FlowType::Buying, FlowType::Selling, FlowType::P2p] {
            assert_eq!(FlowType::parse(f.as_str()), Some(f));
        }
        for d in [DataOrigin::Sync, DataOrigin::Enhanced] {
            assert_eq!(DataOrigin::parse(d.as_str()), Some(d));
        }
        assert_eq!(AddressType::parse("miner"), None);
    }

    #[test]
    fn details_serialize_self_describing() {
        let details = AddressDetails::EnhancedNode {
            node_wallet: "t1NodeWallet".to_string(),
            detection_method: "current_api".to_string(),
            status: "active".to_string(),
            hop_count: 1,
            intermediary_txids: vec!["aaa".to_string()],
            node_count: Some(3),
            tiers: Some(TierCounts {
                cumulus: 2,
                nimbus: 1,
                stratus: 0,
            }),
            last_block: None,
            days_inactive: None,
            coinbase_count: None,
        };

        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["kind"], "enhanced_node");
        assert_eq!(json["nodeWallet"], "t1NodeWallet");
        assert_eq!(json["detectionMethod"], "current_api");
        assert_eq!(json["hopCount"], 1);
        assert_eq!(json["tiers"]["CUMULUS"], 2);
        // Unset optionals are absent, not null.
        assert!(json.get("daysInactive").is_none());

        let back: AddressDetails = serde_json::from_value(json).unwrap();
        assert_eq!(back, details);
    }

    #[test]
    fn historical_connection_detail_round_trip() {
        let details = AddressDetails::HistoricalConnection {
            node_wallet: "t1Historic".to_string(),
            connection_txid: "deadbeef".to_string(),
            days_ago: 42,
            coinbase_count: Some(3),
        };
        let json = serde_json::to_string(&details).unwrap();
        assert!(json.contains("\"connectionTxid\":\"deadbeef\""));
        let back: AddressDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back, details);
    }

    #[test]
    fn tier_counts_grouping() {
        let mut tiers = TierCounts::default();
        tiers.add_tier("CUMULUS");
        tiers.add_tier("cumulus");
        tiers.add_tier("STRATUS");
        tiers.add_tier("BOGUS");
        assert_eq!(tiers.cumulus, 2);
        assert_eq!(tiers.stratus, 1);
        assert_eq!(tiers.nimbus, 0);
        assert_eq!(tiers.total(), 3);
    }
}
