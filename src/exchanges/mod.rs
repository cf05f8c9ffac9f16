//! Venue Adapter Layer
//! Mission: Normalize four heterogeneous spot exchanges into one contract
//!
//! Each adapter speaks its venue's REST + WebSocket dialect and exposes the
//! same three capabilities: list tradable pairs, fetch historical candles,
//! stream a top-10 order book. Everything past this module only sees
//! canonical symbols and `Decimal` numbers.

pub mod binance;
pub mod book;
pub mod bybit;
pub mod coinbase;
pub mod kucoin;
pub mod multi;

pub use binance::ExchangeBinance;
pub use bybit::ExchangeBybit;
pub use coinbase::ExchangeCoinbase;
pub use kucoin::ExchangeKucoin;
pub use multi::{ConsolidatedStream, MultiBook};

use crate::errors::ExchangeError;
use crate::models::{BookSnapshot, Candle, Config, Interval};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Canonical symbol (uppercase, no separators) -> venue-native symbol.
pub type PairMap = Arc<HashMap<String, String>>;

/// Sleep between candle pages to respect venue rate limits.
pub(crate) const PAGE_SLEEP: Duration = Duration::from_secs(1);
/// Back-off before retrying a malformed candle page once.
pub(crate) const MALFORMED_SLEEP: Duration = Duration::from_secs(5);
/// Back-off between WebSocket reconnect attempts.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Book snapshots are emitted at most once per this interval.
pub(crate) const EMIT_INTERVAL: Duration = Duration::from_secs(1);
/// A venue socket that stays silent this long is assumed dead and
/// reconnected.
pub(crate) const WS_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The uniform venue contract.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Short venue name, also used as the level tag in consolidated books.
    fn name(&self) -> &'static str;

    /// Canonical -> native symbol table, fetched once and cached for the
    /// process lifetime.
    async fn trading_pairs(&self) -> Result<PairMap, ExchangeError>;

    /// Historical candles, ascending open time, deduplicated, paginated
    /// against the venue REST API.
    async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Infinite top-10 book stream for a canonical symbol, at most one
    /// snapshot per second. Reconnects forever; ends only when the returned
    /// handle is dropped.
    fn stream_book(&self, symbol: &str) -> BookStream;
}

/// Consumer handle for one venue book stream.
///
/// The producer task owns the socket and pushes into a bounded channel;
/// dropping the handle aborts the producer, which releases the connection.
pub struct BookStream {
    rx: mpsc::Receiver<BookSnapshot>,
    task: JoinHandle<()>,
}

impl BookStream {
    pub(crate) fn new(rx: mpsc::Receiver<BookSnapshot>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Await the next snapshot. `None` means the producer has given up for
    /// good (e.g. the symbol is unknown on this venue).
    pub async fn next(&mut self) -> Option<BookSnapshot> {
        self.rx.recv().await
    }

    /// Non-blocking poll, used by the aggregator to let a degraded venue
    /// rejoin without stalling the round.
    pub fn try_next(&mut self) -> Option<BookSnapshot> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BookStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Capacity of the per-stream snapshot channel. Emission is ~1 Hz, so a
/// small buffer is plenty; a stalled consumer exerts backpressure instead of
/// queueing stale books.
pub(crate) const BOOK_CHANNEL_CAPACITY: usize = 8;

/// Shared HTTP client for all venue REST calls, 30 s per request.
pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client")
    })
}

/// GET a JSON document; on transport failure, sleep 5 s and retry once
/// before surfacing `UpstreamUnavailable`.
pub(crate) async fn rest_get_json(
    url: &str,
    params: &[(&str, String)],
) -> Result<serde_json::Value, ExchangeError> {
    let mut attempt = 0;
    loop {
        let result = http_client().get(url).query(params).send().await;
        match result {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(json) => return Ok(json),
                Err(e) if attempt == 0 => {
                    tracing::warn!(url, error = %e, "malformed venue response, retrying once");
                    tokio::time::sleep(MALFORMED_SLEEP).await;
                    attempt += 1;
                }
                Err(e) => return Err(ExchangeError::UpstreamUnavailable(e.to_string())),
            },
            Err(e) if attempt == 0 => {
                tracing::warn!(url, error = %e, "venue request failed, retrying once");
                tokio::time::sleep(MALFORMED_SLEEP).await;
                attempt += 1;
            }
            Err(e) => return Err(ExchangeError::UpstreamUnavailable(e.to_string())),
        }
    }
}

/// Parse a venue price/volume string into a fixed-precision decimal.
pub(crate) fn parse_decimal(raw: &str) -> Option<Decimal> {
    raw.parse::<Decimal>().ok()
}

/// Pull a decimal out of a JSON value that may be a string or a number.
pub(crate) fn json_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => parse_decimal(s),
        serde_json::Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

/// Process-wide, read-only venue table. Built once at startup; iteration
/// order is registration order and drives both `/exchanges` and the
/// aggregator's tie-breaks.
pub struct ExchangeRegistry {
    entries: Vec<(&'static str, Arc<dyn Exchange>)>,
}

impl ExchangeRegistry {
    pub fn from_config(config: &Config) -> Self {
        let entries: Vec<(&'static str, Arc<dyn Exchange>)> = vec![
            ("Binance", Arc::new(ExchangeBinance::new())),
            ("Bybit", Arc::new(ExchangeBybit::new())),
            (
                "Coinbase",
                Arc::new(ExchangeCoinbase::new(
                    config.coinbase_api_key.clone(),
                    config.coinbase_api_secret.clone(),
                )),
            ),
            ("Kucoin", Arc::new(ExchangeKucoin::new())),
        ];
        Self { entries }
    }

    /// Build a registry over arbitrary adapters. Exists for tests.
    pub fn with_entries(entries: Vec<(&'static str, Arc<dyn Exchange>)>) -> Self {
        Self { entries }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Exchange>> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, ex)| ex.clone())
    }

    /// Resolve a requested venue list, preserving request order and
    /// dropping names the registry does not know.
    pub fn resolve(&self, names: &[String]) -> Vec<Arc<dyn Exchange>> {
        names.iter().filter_map(|n| self.get(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_and_lookup() {
        let registry = ExchangeRegistry::from_config(&Config {
            listen_addr: String::new(),
            db_path: String::new(),
            jwt_secret: String::new(),
            coinbase_api_key: String::new(),
            coinbase_api_secret: String::new(),
        });

        assert_eq!(
            registry.names(),
            vec!["Binance", "Bybit", "Coinbase", "Kucoin"]
        );
        assert!(registry.get("Binance").is_some());
        assert!(registry.get("Kraken").is_none());
    }

    #[test]
    fn test_resolve_preserves_order_and_drops_unknown() {
        let registry = ExchangeRegistry::from_config(&Config {
            listen_addr: String::new(),
            db_path: String::new(),
            jwt_secret: String::new(),
            coinbase_api_key: String::new(),
            coinbase_api_secret: String::new(),
        });

        let resolved = registry.resolve(&[
            "Coinbase".to_string(),
            "Mt.Gox".to_string(),
            "Binance".to_string(),
        ]);
        let names: Vec<_> = resolved.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["Coinbase", "Binance"]);
    }

    #[test]
    fn test_json_decimal_accepts_strings_and_numbers() {
        assert_eq!(
            json_decimal(&serde_json::json!("102429.56")),
            parse_decimal("102429.56")
        );
        assert_eq!(json_decimal(&serde_json::json!(5)), parse_decimal("5"));
        assert_eq!(json_decimal(&serde_json::json!(null)), None);
    }
}
