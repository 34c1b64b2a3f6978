//! Runtime configuration from environment variables
//!
//! Loaded once at startup (after `dotenv`), with sensible defaults for every
//! option. Only `ACTIVE_DATA_SOURCE` can make loading fail: an unrecognized
//! source name is a startup error, not something to limp along with.

use std::env;

/// Which upstream data source is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Private local indexer (aggressive throughput settings).
    Primary,
    /// Public explorer (conservative settings, rate limited).
    Fallback,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Primary => "primary",
            SourceKind::Fallback => "fallback",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            SourceKind::Primary => SourceKind::Fallback,
            SourceKind::Fallback => SourceKind::Primary,
        }
    }
}

/// Throughput tuning for one upstream source. Selected when the active
/// source changes and applied to every subsequent fetch.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub base_url: String,
    /// Block heights fetched per sync tick.
    pub batch_size: u64,
    /// Concurrent requests within one chunk.
    pub max_concurrent: usize,
    /// Minimum delay before each request; doubles with consecutive errors
    /// when rate limiting is enabled.
    pub min_request_delay_ms: u64,
    /// Pause between chunks of a batch.
    pub batch_delay_ms: u64,
    pub rate_limited: bool,
    /// Cap on full transaction fetches per block.
    pub tx_fetch_limit: usize,
    pub request_timeout_secs: u64,
}

/// Enhancement engine knobs (multi-hop search, historical detection,
/// background job, parallel scheduling).
#[derive(Debug, Clone)]
pub struct EnhancementConfig {
    pub max_hops: u32,
    pub time_window_blocks: u64,
    pub min_confidence: f64,
    pub failed_retry_hours: u64,
    pub job_enabled: bool,
    pub job_interval_minutes: u64,
    pub run_on_start: bool,
    pub min_unknowns_threshold: usize,
    pub multi_hop_default_depth: u32,
    pub multi_hop_max_depth: u32,
    pub multi_hop_time_window_blocks: u64,
    pub max_branches_per_wallet: usize,
    pub historical_detection_enabled: bool,
    pub historical_time_window_blocks: u64,
    pub historical_connections_enabled: bool,
    pub parallel_enabled: bool,
    pub parallel_batch_size: usize,
    pub parallel_max_concurrent: usize,
}

/// Full runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub address_book_path: String,
    pub node_registry_url: String,
    pub block_time_seconds: u64,
    /// Time-window block counts per label, e.g. `[("24h", 2880)]`.
    pub periods: Vec<(String, u64)>,
    pub active_source: SourceKind,
    pub primary: SourceSettings,
    pub fallback: SourceSettings,
    pub retention_window_blocks: u64,
    pub sync_interval_seconds: u64,
    pub enhancement: EnhancementConfig,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse a `label:blocks` comma list, e.g. `1h:120,24h:2880`.
fn parse_periods(raw: &str) -> Vec<(String, u64)> {
    raw.split(',')
        .filter_map(|entry| {
            let (label, blocks) = entry.trim().split_once(':')?;
            let blocks: u64 = blocks.trim().parse().ok()?;
            Some((label.trim().to_string(), blocks))
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Fails only on a configuration invariant violation
    /// (`ACTIVE_DATA_SOURCE` outside {primary, fallback}).
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let active_source = match env_string("ACTIVE_DATA_SOURCE", "primary").as_str() {
            "primary" => SourceKind::Primary,
            "fallback" => SourceKind::Fallback,
            other => {
                return Err(format!(
                    "ACTIVE_DATA_SOURCE must be 'primary' or 'fallback', got '{}'",
                    other
                )
                .into())
            }
        };

        let primary = SourceSettings {
            base_url: env_string("PRIMARY_URL", "http://127.0.0.1:3000"),
            batch_size: env_u64("PRIMARY_BATCH_SIZE", 50),
            max_concurrent: env_usize("PRIMARY_MAX_CONCURRENT", 10),
            min_request_delay_ms: env_u64("PRIMARY_MIN_REQUEST_DELAY_MS", 0),
            batch_delay_ms: env_u64("PRIMARY_BATCH_DELAY_MS", 100),
            rate_limited: env_bool("PRIMARY_ENABLE_RATE_LIMITING", false),
            tx_fetch_limit: env_usize("PRIMARY_TRANSACTION_FETCH_LIMIT", 200),
            request_timeout_secs: env_u64("PRIMARY_REQUEST_TIMEOUT_SECS", 30),
        };

        let fallback = SourceSettings {
            base_url: env_string("FALLBACK_URL", "https://explorer.runonflux.io"),
            batch_size: env_u64("FALLBACK_BATCH_SIZE", 10),
            max_concurrent: env_usize("FALLBACK_MAX_CONCURRENT", 2),
            min_request_delay_ms: env_u64("FALLBACK_MIN_REQUEST_DELAY_MS", 500),
            batch_delay_ms: env_u64("FALLBACK_BATCH_DELAY_MS", 2000),
            rate_limited: env_bool("FALLBACK_ENABLE_RATE_LIMITING", true),
            tx_fetch_limit: env_usize("FALLBACK_TRANSACTION_FETCH_LIMIT", 50),
            request_timeout_secs: env_u64("FALLBACK_REQUEST_TIMEOUT_SECS", 30),
        };

        let enhancement = EnhancementConfig {
            max_hops: env_u32("ENHANCEMENT_MAX_HOPS", 3),
            time_window_blocks: env_u64("ENHANCEMENT_TIME_WINDOW_BLOCKS", 86_400),
            min_confidence: env_f64("ENHANCEMENT_MIN_CONFIDENCE", 0.8),
            failed_retry_hours: env_u64("ENHANCEMENT_FAILED_RETRY_HOURS", 24),
            job_enabled: env_bool("ENHANCEMENT_JOB_ENABLED", true),
            job_interval_minutes: env_u64("ENHANCEMENT_JOB_INTERVAL_MINUTES", 10),
            run_on_start: env_bool("ENHANCEMENT_JOB_RUN_ON_START", false),
            min_unknowns_threshold: env_usize("ENHANCEMENT_MIN_UNKNOWNS", 5),
            multi_hop_default_depth: env_u32("MULTIHOP_DEFAULT_DEPTH", 2),
            multi_hop_max_depth: env_u32("MULTIHOP_MAX_DEPTH", 5),
            multi_hop_time_window_blocks: env_u64("MULTIHOP_TIME_WINDOW_BLOCKS", 20_160),
            max_branches_per_wallet: env_usize("MULTIHOP_MAX_BRANCHES", 3),
            historical_detection_enabled: env_bool("HISTORICAL_DETECTION_ENABLED", true),
            historical_time_window_blocks: env_u64("HISTORICAL_TIME_WINDOW_BLOCKS", 1_051_200),
            historical_connections_enabled: env_bool("HISTORICAL_CONNECTIONS_ENABLED", true),
            parallel_enabled: env_bool("PARALLEL_ENABLED", true),
            parallel_batch_size: env_usize("PARALLEL_BATCH_SIZE", 6),
            parallel_max_concurrent: env_usize("PARALLEL_MAX_CONCURRENT", 6),
        };

        Ok(Self {
            db_path: env_string("FLUXFLOW_DB_PATH", "fluxflow.db"),
            address_book_path: env_string("ADDRESS_BOOK_PATH", "address_book.json"),
            node_registry_url: env_string(
                "NODE_REGISTRY_URL",
                "https://api.runonflux.io/daemon/viewdeterministiczelnodelist",
            ),
            block_time_seconds: env_u64("BLOCK_TIME_SECONDS", 30),
            periods: parse_periods(&env_string(
                "PERIODS",
                "1h:120,24h:2880,7d:20160,30d:86400",
            )),
            active_source,
            primary,
            fallback,
            // Six months of 30-second blocks.
            retention_window_blocks: env_u64("RETENTION_WINDOW_BLOCKS", 525_600),
            sync_interval_seconds: env_u64("SYNC_INTERVAL_SECONDS", 120),
            enhancement,
        })
    }

    /// Settings for the given source.
    pub fn source_settings(&self, kind: SourceKind) -> &SourceSettings {
        match kind {
            SourceKind::Primary => &self.primary,
            SourceKind::Fallback => &self.fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Default and override assertions share env vars, so they run in one
    // test to avoid interference under the parallel test runner.
    #[test]
    fn test_from_env_defaults_and_overrides() {
        env::remove_var("ACTIVE_DATA_SOURCE");
        env::remove_var("PRIMARY_BATCH_SIZE");
        env::remove_var("PERIODS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.active_source, SourceKind::Primary);
        assert_eq!(config.primary.batch_size, 50);
        assert_eq!(config.fallback.batch_size, 10);
        assert!(config.fallback.rate_limited);
        assert!(!config.primary.rate_limited);
        assert_eq!(config.block_time_seconds, 30);
        assert_eq!(config.retention_window_blocks, 525_600);
        assert_eq!(config.enhancement.max_hops, 3);
        assert!(config
            .periods
            .iter()
            .any(|(label, blocks)| label == "24h" && *blocks == 2880));

        env::set_var("ACTIVE_DATA_SOURCE", "fallback");
        env::set_var("PRIMARY_BATCH_SIZE", "25");
        env::set_var("PERIODS", "6h:720, 48h:5760");

        let config = Config::from_env().unwrap();
        assert_eq!(config.active_source, SourceKind::Fallback);
        assert_eq!(config.primary.batch_size, 25);
        assert_eq!(
            config.periods,
            vec![("6h".to_string(), 720), ("48h".to_string(), 5760)]
        );

        env::set_var("ACTIVE_DATA_SOURCE", "mainnet");
        assert!(Config::from_env().is_err());

        env::remove_var("ACTIVE_DATA_SOURCE");
        env::remove_var("PRIMARY_BATCH_SIZE");
        env::remove_var("PERIODS");
    }

    #[test]
    fn test_parse_periods_skips_malformed() {
        let periods = parse_periods("1h:120,bogus,7d:20160,x:y");
        assert_eq!(
            periods,
            vec![("1h".to_string(), 120), ("7d".to_string(), 20160)]
        );
    }

    #[test]
    fn test_source_kind_other() {
        assert_eq!(SourceKind::Primary.other(), SourceKind::Fallback);
        assert_eq!(SourceKind::Fallback.other(), SourceKind::Primary);
        assert_eq!(SourceKind::Primary.as_str(), "primary");
    }
}
