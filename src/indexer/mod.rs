//! Upstream data-source abstraction
//!
//! Two sources sit behind one capability set: the private indexer
//! (aggressive settings) and the public explorer (conservative settings,
//! rate limited). `IndexerClient` adds retry with exponential backoff and a
//! one-shot primary/fallback switch per call, so a dying source degrades
//! throughput instead of killing a sync tick.

pub mod fallback;
pub mod primary;
pub mod types;

pub use fallback::FallbackSource;
pub use primary::PrimarySource;
pub use types::{AddressTx, NormalizedBlock, NormalizedTx, TxDirection, TxInput, TxOutput};

use crate::config::{Config, SourceKind, SourceSettings};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 8_000;
/// Cap on the consecutive-error count so the throttled delay stays bounded.
const ERROR_COUNT_CAP: u32 = 6;

/// Non-success HTTP response. Kept as a dedicated type so callers can
/// recognize 429 without string matching.
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: u16,
    pub url: String,
}

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {} from {}", self.status, self.url)
    }
}

impl std::error::Error for HttpStatusError {}

/// The capability set both upstream sources satisfy.
#[async_trait]
pub trait IndexerApi: Send + Sync {
    async fn chain_height(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>>;

    async fn get_block(
        &self,
        height: u64,
    ) -> Result<NormalizedBlock, Box<dyn std::error::Error + Send + Sync>>;

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<NormalizedTx, Box<dyn std::error::Error + Send + Sync>>;

    async fn get_address_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Chain height can sit in several positions depending on the source and
/// endpoint; probe all known ones.
pub fn parse_height(value: &Value) -> Option<u64> {
    fn as_height(v: &Value) -> Option<u64> {
        v.as_u64().or_else(|| v.as_str()?.parse().ok())
    }

    value
        .get("height")
        .and_then(as_height)
        .or_else(|| value.get("blockHeight").and_then(as_height))
        .or_else(|| value.get("blocks").and_then(as_height))
        .or_else(|| value.get("data")?.get("height").and_then(as_height))
        .or_else(|| value.get("data")?.get("blocks").and_then(as_height))
        .or_else(|| value.get("info")?.get("blocks").and_then(as_height))
        .or_else(|| value.get("blockbook")?.get("bestHeight").and_then(as_height))
        .or_else(|| value.get("backend")?.get("blocks").and_then(as_height))
}

/// Satoshi value of a vin/vout entry. `valueSat` wins; string `value`
/// fields are satoshis (v2 shape), numeric `value` fields are decimal FLUX
/// (v1 shape).
pub(crate) fn sat_from_entry(entry: &Value) -> i64 {
    if let Some(sat) = entry.get("valueSat").and_then(|v| v.as_i64()) {
        return sat;
    }
    match entry.get("value") {
        Some(Value::String(s)) => s
            .parse::<i64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| (f * 1e8).round() as i64))
            .unwrap_or(0),
        Some(Value::Number(n)) => n.as_f64().map(|f| (f * 1e8).round() as i64).unwrap_or(0),
        _ => 0,
    }
}

struct ActiveState {
    kind: SourceKind,
    settings: SourceSettings,
}

type ApiFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, Box<dyn std::error::Error + Send + Sync>>> + Send + 'a>>;

/// Source-agnostic client: retry, backoff, throttling and primary/fallback
/// switching. Settings are re-read only when the source switches and are
/// swapped together with the source kind under one lock, so a caller never
/// observes torn settings.
pub struct IndexerClient {
    primary: Box<dyn IndexerApi>,
    fallback: Box<dyn IndexerApi>,
    primary_settings: SourceSettings,
    fallback_settings: SourceSettings,
    active: Mutex<ActiveState>,
    consecutive_errors: AtomicU32,
}

impl IndexerClient {
    pub fn from_config(config: &Config) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self::with_sources(
            Box::new(PrimarySource::new(&config.primary)?),
            Box::new(FallbackSource::new(&config.fallback)?),
            config.primary.clone(),
            config.fallback.clone(),
            config.active_source,
        ))
    }

    /// Assemble from explicit sources. Tests inject mock implementations
    /// here.
    pub fn with_sources(
        primary: Box<dyn IndexerApi>,
        fallback: Box<dyn IndexerApi>,
        primary_settings: SourceSettings,
        fallback_settings: SourceSettings,
        active: SourceKind,
    ) -> Self {
        let settings = match active {
            SourceKind::Primary => primary_settings.clone(),
            SourceKind::Fallback => fallback_settings.clone(),
        };
        Self {
            primary,
            fallback,
            primary_settings,
            fallback_settings,
            active: Mutex::new(ActiveState {
                kind: active,
                settings,
            }),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn active_kind(&self) -> SourceKind {
        self.active.lock().unwrap().kind
    }

    /// Snapshot of the active source's settings.
    pub fn active_settings(&self) -> SourceSettings {
        self.active.lock().unwrap().settings.clone()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    fn source(&self, kind: SourceKind) -> &dyn IndexerApi {
        match kind {
            SourceKind::Primary => self.primary.as_ref(),
            SourceKind::Fallback => self.fallback.as_ref(),
        }
    }

    /// Switch away from `from`, reloading the other source's settings. A
    /// no-op when another caller already switched, so concurrent failures
    /// cannot ping-pong the sources.
    fn switch_source(&self, from: SourceKind) {
        let mut state = self.active.lock().unwrap();
        if state.kind != from {
            return;
        }
        let to = from.other();
        state.kind = to;
        state.settings = match to {
            SourceKind::Primary => self.primary_settings.clone(),
            SourceKind::Fallback => self.fallback_settings.clone(),
        };
        log::warn!(
            "🔁 Data source switched: {} -> {}",
            from.as_str(),
            to.as_str()
        );
    }

    fn note_success(&self) {
        let _ = self
            .consecutive_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    fn note_failure(&self) {
        let _ = self
            .consecutive_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some((v + 1).min(ERROR_COUNT_CAP))
            });
    }

    /// Pre-request delay per the active settings. On a rate-limited source
    /// the minimum delay doubles with each consecutive error.
    async fn throttle(&self) {
        let (delay_ms, rate_limited) = {
            let state = self.active.lock().unwrap();
            (
                state.settings.min_request_delay_ms,
                state.settings.rate_limited,
            )
        };
        if delay_ms == 0 {
            return;
        }
        let effective = if rate_limited {
            delay_ms << self.consecutive_errors().min(ERROR_COUNT_CAP)
        } else {
            delay_ms
        };
        tokio::time::sleep(Duration::from_millis(effective)).await;
    }

    async fn call<T, F>(
        &self,
        what: &str,
        op: F,
    ) -> Result<T, Box<dyn std::error::Error + Send + Sync>>
    where
        T: Send,
        F: for<'a> Fn(&'a dyn IndexerApi) -> ApiFuture<'a, T> + Send + Sync,
    {
        let mut switched = false;
        loop {
            let kind = self.active_kind();
            let source = self.source(kind);
            let mut last_err: Option<Box<dyn std::error::Error + Send + Sync>> = None;

            for attempt in 0..RETRY_ATTEMPTS {
                if attempt > 0 {
                    let delay =
                        (RETRY_BASE_DELAY_MS << (attempt - 1)).min(RETRY_MAX_DELAY_MS);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                self.throttle().await;
                match op(source).await {
                    Ok(value) => {
                        self.note_success();
                        return Ok(value);
                    }
                    Err(e) => {
                        self.note_failure();
                        if is_rate_limit(&e) {
                            log::warn!(
                                "⏳ {} rate limited on {} (consecutive errors: {})",
                                what,
                                kind.as_str(),
                                self.consecutive_errors()
                            );
                        } else {
                            log::debug!(
                                "{} attempt {}/{} failed on {}: {}",
                                what,
                                attempt + 1,
                                RETRY_ATTEMPTS,
                                kind.as_str(),
                                e
                            );
                        }
                        last_err = Some(e);
                    }
                }
            }

            // One switch per call, so a dual outage fails cleanly instead of
            // bouncing between sources.
            if switched {
                return Err(last_err
                    .unwrap_or_else(|| format!("{} failed on both sources", what).into()));
            }
            switched = true;
            log::warn!(
                "🔁 {} failed on {} after {} attempts, trying the other source",
                what,
                kind.as_str(),
                RETRY_ATTEMPTS
            );
            self.switch_source(kind);
        }
    }
}

fn is_rate_limit(e: &Box<dyn std::error::Error + Send + Sync>) -> bool {
    e.downcast_ref::<HttpStatusError>()
        .map(|h| h.status == 429)
        .unwrap_or(false)
}

#[async_trait]
impl IndexerApi for IndexerClient {
    async fn chain_height(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        self.call("chain_height", |api| Box::pin(api.chain_height()))
            .await
    }

    async fn get_block(
        &self,
        height: u64,
    ) -> Result<NormalizedBlock, Box<dyn std::error::Error + Send + Sync>> {
        self.call("get_block", move |api| Box::pin(api.get_block(height)))
            .await
    }

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<NormalizedTx, Box<dyn std::error::Error + Send + Sync>> {
        let txid = txid.to_string();
        self.call("get_transaction", move |api| {
            let txid = txid.clone();
            Box::pin(async move { api.get_transaction(&txid).await })
        })
        .await
    }

    async fn get_address_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<AddressTx>, Box<dyn std::error::Error + Send + Sync>> {
        let address = address.to_string();
        self.call("get_address_transactions", move |api| {
            let address = address.clone();
            Box::pin(async move { api.get_address_transactions(&address).await })
        })
        .await
    }
}
