//! Binance spot adapter.
//!
//! Simplest of the four venue protocols: the partial-depth WebSocket stream
//! pushes the whole top-10 every frame, so the local book is replaced
//! wholesale. Native symbols are already canonical (`BTCUSDT`).

use crate::errors::ExchangeError;
use crate::exchanges::{
    book::LocalBook, parse_decimal, rest_get_json, BookStream, Exchange, PairMap,
    BOOK_CHANNEL_CAPACITY, EMIT_INTERVAL, MALFORMED_SLEEP, PAGE_SLEEP, RECONNECT_DELAY,
    WS_IDLE_TIMEOUT,
};
use crate::models::{BookSnapshot, Candle, Interval};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const BINANCE_REST_URL: &str = "https://api.binance.com/api/v3";
const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";

const SUPPORTED_INTERVALS: &[Interval] = &[
    Interval::M1,
    Interval::M3,
    Interval::M5,
    Interval::M15,
    Interval::M30,
    Interval::H1,
    Interval::H2,
    Interval::H3,
    Interval::H6,
    Interval::H8,
    Interval::H12,
    Interval::D1,
    Interval::D3,
    Interval::W1,
    Interval::Mo1,
];

pub struct ExchangeBinance {
    pairs: tokio::sync::OnceCell<PairMap>,
}

impl ExchangeBinance {
    pub fn new() -> Self {
        Self {
            pairs: tokio::sync::OnceCell::new(),
        }
    }

    async fn fetch_pairs(&self) -> Result<PairMap, ExchangeError> {
        let json = rest_get_json(&format!("{BINANCE_REST_URL}/exchangeInfo"), &[]).await?;
        let symbols = json
            .get("symbols")
            .and_then(|s| s.as_array())
            .ok_or_else(|| {
                ExchangeError::UpstreamUnavailable("exchangeInfo missing symbols".to_string())
            })?;

        let mut pairs = HashMap::with_capacity(symbols.len());
        for entry in symbols {
            if let Some(symbol) = entry.get("symbol").and_then(|s| s.as_str()) {
                pairs.insert(symbol.to_string(), symbol.to_string());
            }
        }
        Ok(Arc::new(pairs))
    }
}

impl Default for ExchangeBinance {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for ExchangeBinance {
    fn name(&self) -> &'static str {
        "Binance"
    }

    async fn trading_pairs(&self) -> Result<PairMap, ExchangeError> {
        self.pairs
            .get_or_try_init(|| self.fetch_pairs())
            .await
            .cloned()
    }

    async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ExchangeError> {
        if !SUPPORTED_INTERVALS.contains(&interval) {
            return Err(ExchangeError::UnsupportedInterval(interval.to_string()));
        }
        let pairs = self.trading_pairs().await?;
        if !pairs.contains_key(symbol) {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        }

        let endpoint = format!("{BINANCE_REST_URL}/klines");
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start;
        let mut retried = false;

        while cursor < end {
            let params = [
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", cursor.timestamp_millis().to_string()),
                ("limit", "1500".to_string()),
            ];
            let json = rest_get_json(&endpoint, &params).await?;

            let Some(rows) = json.as_array() else {
                // Error payloads come back as objects; retry the page once.
                if retried {
                    return Err(ExchangeError::UpstreamUnavailable(json.to_string()));
                }
                debug!(%symbol, payload = %json, "unexpected klines payload, sleeping");
                retried = true;
                sleep(MALFORMED_SLEEP).await;
                continue;
            };
            if rows.is_empty() {
                break;
            }

            let mut last_open = None;
            for row in rows {
                let Some(candle) = parse_kline_row(row) else {
                    continue;
                };
                last_open = Some(candle.open_time);
                if candle.open_time > end {
                    break;
                }
                if candles.last().map(|c| c.open_time) != Some(candle.open_time) {
                    candles.push(candle);
                }
            }

            let Some(last_open) = last_open else {
                if retried {
                    return Err(ExchangeError::UpstreamUnavailable(
                        "unparseable klines page".to_string(),
                    ));
                }
                retried = true;
                sleep(MALFORMED_SLEEP).await;
                continue;
            };

            retried = false;
            cursor = last_open + chrono::Duration::minutes(interval.minutes());
            sleep(PAGE_SLEEP).await;
        }

        Ok(candles)
    }

    fn stream_book(&self, symbol: &str) -> BookStream {
        let (tx, rx) = mpsc::channel(BOOK_CHANNEL_CAPACITY);
        let symbol = symbol.to_string();
        let task = tokio::spawn(async move {
            run_book_stream(symbol, tx).await;
        });
        BookStream::new(rx, task)
    }
}

/// One kline row: `[openTimeMs, "o", "h", "l", "c", "v", ...]`.
fn parse_kline_row(row: &serde_json::Value) -> Option<Candle> {
    let fields = row.as_array()?;
    let open_ms = fields.first()?.as_i64()?;
    let decimal_at = |i: usize| fields.get(i)?.as_str().and_then(parse_decimal);
    Some(Candle {
        open_time: Utc.timestamp_millis_opt(open_ms).single()?,
        open: decimal_at(1)?,
        high: decimal_at(2)?,
        low: decimal_at(3)?,
        close: decimal_at(4)?,
        volume: decimal_at(5)?,
    })
}

/// One partial-depth frame: the full top-10 for both sides.
fn parse_depth_frame(text: &str) -> Option<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>)> {
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    let side = |key: &str| -> Option<Vec<(Decimal, Decimal)>> {
        json.get(key)?
            .as_array()?
            .iter()
            .map(|level| {
                let pair = level.as_array()?;
                let price = pair.first()?.as_str().and_then(parse_decimal)?;
                let volume = pair.get(1)?.as_str().and_then(parse_decimal)?;
                Some((price, volume))
            })
            .collect()
    };
    Some((side("bids")?, side("asks")?))
}

async fn run_book_stream(symbol: String, tx: mpsc::Sender<BookSnapshot>) {
    let url = format!("{BINANCE_WS_URL}/{}@depth10@1000ms", symbol.to_lowercase());
    let mut book = LocalBook::new();

    loop {
        let (mut ws, _) = match connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%symbol, error = %e, "Binance WS connect failed; retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!(%symbol, "📶 Connected to Binance WebSocket");

        let mut last_emit: Option<Instant> = None;
        loop {
            let msg = match timeout(WS_IDLE_TIMEOUT, ws.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    warn!(%symbol, "Binance WS stream ended; reconnecting");
                    break;
                }
                Err(_) => {
                    warn!(%symbol, "Binance WS idle too long; reconnecting");
                    break;
                }
            };
            match msg {
                Ok(Message::Text(text)) => {
                    let Some((bids, asks)) = parse_depth_frame(&text) else {
                        continue;
                    };
                    book.replace(bids, asks);

                    let due = last_emit.map_or(true, |t| t.elapsed() >= EMIT_INTERVAL);
                    if due {
                        if tx.send(book.top10()).await.is_err() {
                            return;
                        }
                        last_emit = Some(Instant::now());
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(frame)) => {
                    debug!(%symbol, ?frame, "Binance WS close");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%symbol, error = %e, "Binance WS error; reconnecting");
                    break;
                }
            }
        }

        sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_kline_row() {
        let row = serde_json::json!([
            1738368000000i64,
            "102429.56",
            "102783.71",
            "100279.51",
            "100635.65",
            "12290.95747",
            1738454399999i64,
            "0"
        ]);
        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(
            candle.open_time,
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(candle.open, dec!(102429.56));
        assert_eq!(candle.volume, dec!(12290.95747));
    }

    #[test]
    fn test_parse_kline_row_rejects_garbage() {
        assert!(parse_kline_row(&serde_json::json!({"code": -1121})).is_none());
        assert!(parse_kline_row(&serde_json::json!(["not-a-ts", "1", "2", "3", "4", "5"])).is_none());
    }

    #[test]
    fn test_parse_depth_frame() {
        let text = r#"{
            "lastUpdateId": 160,
            "bids": [["96999.50", "0.25"], ["96998.00", "1.00"]],
            "asks": [["97000.00", "1.50"]]
        }"#;
        let (bids, asks) = parse_depth_frame(text).unwrap();
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0], (dec!(96999.50), dec!(0.25)));
        assert_eq!(asks[0], (dec!(97000.00), dec!(1.50)));
    }

    #[test]
    fn test_supported_intervals_match_venue() {
        // Binance has no 4h bucket in this API surface.
        assert!(!SUPPORTED_INTERVALS.contains(&Interval::H4));
        assert!(SUPPORTED_INTERVALS.contains(&Interval::Mo1));
    }
}
