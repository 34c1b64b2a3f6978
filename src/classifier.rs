//! Address classification
//!
//! Maps any address to {exchange, foundation, node_operator, unknown} with
//! side-car details. The exchange and foundation sets come from a static
//! address book loaded once at startup; the node-operator set is refreshed
//! periodically from the node registry and swapped in atomically so readers
//! never observe a partially built snapshot.

use crate::model::{AddressDetails, AddressType, TierCounts};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Static exchange entry from the address book.
#[derive(Debug, Clone)]
pub struct ExchangeInfo {
    pub name: String,
    pub logo: Option<String>,
}

/// Aggregated registry entry for one payment address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeOperatorInfo {
    pub node_count: u32,
    pub tiers: TierCounts,
}

/// Result of classifying one address.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub address_type: AddressType,
    pub details: Option<AddressDetails>,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            address_type: AddressType::Unknown,
            details: None,
        }
    }
}

/// Exchange and foundation address sets, immutable after startup.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    pub exchanges: HashMap<String, ExchangeInfo>,
    pub foundation: HashMap<String, String>,
}

impl AddressBook {
    /// Load the address book JSON from disk. A missing or malformed file is
    /// a startup error.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        if !Path::new(path).exists() {
            return Err(format!("address book not found: {}", path).into());
        }
        let raw = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)?;
        Self::from_value(&value)
    }

    /// Parse the address book from JSON. Exchanges are a map of address to
    /// `{name, logo?}`; foundation accepts either a map of address to label
    /// or a bare address array.
    pub fn from_value(value: &Value) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut exchanges = HashMap::new();
        if let Some(map) = value.get("exchanges").and_then(|v| v.as_object()) {
            for (address, entry) in map {
                let name = entry
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| format!("exchange entry {} has no name", address))?;
                exchanges.insert(
                    address.clone(),
                    ExchangeInfo {
                        name: name.to_string(),
                        logo: entry
                            .get("logo")
                            .and_then(|l| l.as_str())
                            .map(|l| l.to_string()),
                    },
                );
            }
        }

        let mut foundation = HashMap::new();
        match value.get("foundation") {
            Some(Value::Object(map)) => {
                for (address, label) in map {
                    let label = label.as_str().unwrap_or("Flux Foundation");
                    foundation.insert(address.clone(), label.to_string());
                }
            }
            Some(Value::Array(addresses)) => {
                for address in addresses.iter().filter_map(|a| a.as_str()) {
                    foundation.insert(address.to_string(), "Flux Foundation".to_string());
                }
            }
            _ => {}
        }

        Ok(Self {
            exchanges,
            foundation,
        })
    }
}

/// Constant-time classifier with a periodically refreshed node-operator
/// snapshot.
pub struct AddressClassifier {
    book: AddressBook,
    node_operators: RwLock<Arc<HashMap<String, NodeOperatorInfo>>>,
    last_refresh: Mutex<Option<i64>>,
    registry_url: String,
    http: reqwest::Client,
}

impl AddressClassifier {
    pub fn new(
        book: AddressBook,
        registry_url: String,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            book,
            node_operators: RwLock::new(Arc::new(HashMap::new())),
            last_refresh: Mutex::new(None),
            registry_url,
            http,
        })
    }

    /// Classify one address. Evaluation order: exchange, foundation,
    /// node_operator, unknown.
    pub fn classify(&self, address: &str) -> Classification {
        if let Some(info) = self.book.exchanges.get(address) {
            return Classification {
                address_type: AddressType::Exchange,
                details: Some(AddressDetails::Exchange {
                    name: info.name.clone(),
                    logo: info.logo.clone(),
                }),
            };
        }
        if let Some(label) = self.book.foundation.get(address) {
            return Classification {
                address_type: AddressType::Foundation,
                details: Some(AddressDetails::Foundation {
                    name: label.clone(),
                }),
            };
        }
        if let Some(info) = self.operator_info(address) {
            return Classification {
                address_type: AddressType::NodeOperator,
                details: Some(AddressDetails::Node {
                    node_count: info.node_count,
                    tiers: info.tiers,
                }),
            };
        }
        Classification::unknown()
    }

    /// Registry entry for an address, if it currently runs nodes.
    pub fn operator_info(&self, address: &str) -> Option<NodeOperatorInfo> {
        let snapshot = self.node_operators.read().unwrap().clone();
        snapshot.get(address).copied()
    }

    pub fn is_node_operator(&self, address: &str) -> bool {
        self.operator_info(address).is_some()
    }

    pub fn operator_count(&self) -> usize {
        self.node_operators.read().unwrap().len()
    }

    /// Replace the node-operator snapshot directly. Used at startup seeding
    /// and by tests.
    pub fn set_node_operators(&self, operators: HashMap<String, NodeOperatorInfo>) {
        *self.node_operators.write().unwrap() = Arc::new(operators);
    }

    /// Fetch the node registry and replace the operator snapshot.
    ///
    /// Fail-open: on any fetch or parse error the previous snapshot is kept
    /// and a warning is logged. The swap itself is a single pointer
    /// replacement, so concurrent `classify` calls always see a complete
    /// map.
    pub async fn refresh_node_operators(&self) {
        let started = std::time::Instant::now();
        let result: Result<HashMap<String, NodeOperatorInfo>, Box<dyn std::error::Error + Send + Sync>> = async {
            let response = self.http.get(&self.registry_url).send().await?;
            if !response.status().is_success() {
                return Err(format!("node registry returned {}", response.status()).into());
            }
            let value: Value = response.json().await?;
            parse_registry(&value)
        }
        .await;

        match result {
            Ok(operators) => {
                let count = operators.len();
                self.set_node_operators(operators);
                *self.last_refresh.lock().unwrap() = Some(chrono::Utc::now().timestamp());
                log::info!(
                    "🔄 Node registry refreshed: {} payment addresses in {:?}",
                    count,
                    started.elapsed()
                );
            }
            Err(e) => {
                log::warn!(
                    "⚠️  Node registry refresh failed, keeping previous snapshot ({} entries): {}",
                    self.operator_count(),
                    e
                );
            }
        }
    }

    /// Refresh when the snapshot is older than `max_age_secs` (or has never
    /// been loaded).
    pub async fn refresh_if_stale(&self, max_age_secs: i64) {
        let stale = {
            let last = self.last_refresh.lock().unwrap();
            match *last {
                Some(ts) => chrono::Utc::now().timestamp() - ts >= max_age_secs,
                None => true,
            }
        };
        if stale {
            self.refresh_node_operators().await;
        }
    }
}

/// Parse the node registry payload: `{FluxNodes: [...]}`, `{fluxNodes:
/// [...]}` or a bare array, each record carrying at least `payment_address`
/// and `tier`. Records without a payment address are skipped and counted.
pub fn parse_registry(
    value: &Value,
) -> Result<HashMap<String, NodeOperatorInfo>, Box<dyn std::error::Error + Send + Sync>> {
    let records = value
        .get("FluxNodes")
        .or_else(|| value.get("fluxNodes"))
        .or_else(|| value.get("data"))
        .unwrap_or(value)
        .as_array()
        .ok_or("node registry payload is not an array")?;

    let mut operators: HashMap<String, NodeOperatorInfo> = HashMap::new();
    let mut skipped = 0usize;
    for record in records {
        let address = record
            .get("payment_address")
            .and_then(|a| a.as_str())
            .filter(|a| !a.is_empty());
        let Some(address) = address else {
            skipped += 1;
            continue;
        };
        let entry = operators.entry(address.to_string()).or_default();
        entry.node_count += 1;
        if let Some(tier) = record.get("tier").and_then(|t| t.as_str()) {
            entry.tiers.add_tier(tier);
        }
    }
    if skipped > 0 {
        log::debug!("node registry: skipped {} records without payment_address", skipped);
    }
    Ok(operators)
}
