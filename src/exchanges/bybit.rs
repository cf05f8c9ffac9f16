//! Bybit spot adapter.
//!
//! The WebSocket speaks snapshot-then-delta: the first book frame carries
//! the full depth, later frames carry `(price, new_volume)` changes where a
//! zero volume deletes the level. Kline pages arrive newest-first and are
//! reversed before use. Native symbols are already canonical.

use crate::errors::ExchangeError;
use crate::exchanges::{
    book::LocalBook, json_decimal, rest_get_json, BookStream, Exchange, PairMap,
    BOOK_CHANNEL_CAPACITY, EMIT_INTERVAL, MALFORMED_SLEEP, PAGE_SLEEP, RECONNECT_DELAY,
    WS_IDLE_TIMEOUT,
};
use crate::models::{BookSnapshot, Candle, Interval};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval as tokio_interval, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const BYBIT_REST_URL: &str = "https://api.bybit.com/v5";
const BYBIT_WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct ExchangeBybit {
    pairs: tokio::sync::OnceCell<PairMap>,
}

impl ExchangeBybit {
    pub fn new() -> Self {
        Self {
            pairs: tokio::sync::OnceCell::new(),
        }
    }

    /// Bybit's native interval encoding: minutes as bare numbers, then
    /// `D`/`W`/`M`. Unsupported labels return `None`.
    fn native_interval(interval: Interval) -> Option<&'static str> {
        match interval {
            Interval::M1 => Some("1"),
            Interval::M3 => Some("3"),
            Interval::M5 => Some("5"),
            Interval::M15 => Some("15"),
            Interval::M30 => Some("30"),
            Interval::H1 => Some("60"),
            Interval::H2 => Some("120"),
            Interval::H4 => Some("240"),
            Interval::H6 => Some("360"),
            Interval::H12 => Some("720"),
            Interval::D1 => Some("D"),
            Interval::W1 => Some("W"),
            Interval::Mo1 => Some("M"),
            Interval::H3 | Interval::H8 | Interval::D3 => None,
        }
    }

    async fn fetch_pairs(&self) -> Result<PairMap, ExchangeError> {
        let json = rest_get_json(
            &format!("{BYBIT_REST_URL}/market/instruments-info"),
            &[("category", "spot".to_string())],
        )
        .await?;
        let list = json
            .pointer("/result/list")
            .and_then(|l| l.as_array())
            .ok_or_else(|| {
                ExchangeError::UpstreamUnavailable("instruments-info missing list".to_string())
            })?;

        let mut pairs = HashMap::with_capacity(list.len());
        for entry in list {
            if let Some(symbol) = entry.get("symbol").and_then(|s| s.as_str()) {
                pairs.insert(symbol.to_string(), symbol.to_string());
            }
        }
        Ok(Arc::new(pairs))
    }
}

impl Default for ExchangeBybit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for ExchangeBybit {
    fn name(&self) -> &'static str {
        "Bybit"
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
        let Some(native_interval) = Self::native_interval(interval) else {
            return Err(ExchangeError::UnsupportedInterval(interval.to_string()));
        };
        let pairs = self.trading_pairs().await?;
        if !pairs.contains_key(symbol) {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        }

        let endpoint = format!("{BYBIT_REST_URL}/market/kline");
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start;
        let mut retried = false;

        while cursor < end {
            let params = [
                ("category", "spot".to_string()),
                ("symbol", symbol.to_string()),
                ("interval", native_interval.to_string()),
                ("start", cursor.timestamp_millis().to_string()),
                ("limit", "200".to_string()),
            ];
            let json = rest_get_json(&endpoint, &params).await?;

            let rows = json.pointer("/result/list").and_then(|l| l.as_array());
            let Some(rows) = rows else {
                if retried {
                    return Err(ExchangeError::UpstreamUnavailable(json.to_string()));
                }
                debug!(%symbol, payload = %json, "unexpected kline payload, sleeping");
                retried = true;
                sleep(MALFORMED_SLEEP).await;
                continue;
            };
            if rows.is_empty() {
                break;
            }

            // Pages arrive newest-first; walk them oldest-first.
            let mut last_open = None;
            for row in rows.iter().rev() {
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
                        "unparseable kline page".to_string(),
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

/// One kline row: `["startMs", open, high, low, close, volume, turnover]`.
fn parse_kline_row(row: &serde_json::Value) -> Option<Candle> {
    let fields = row.as_array()?;
    let open_ms = fields.first()?.as_str()?.parse::<i64>().ok()?;
    Some(Candle {
        open_time: Utc.timestamp_millis_opt(open_ms).single()?,
        open: json_decimal(fields.get(1)?)?,
        high: json_decimal(fields.get(2)?)?,
        low: json_decimal(fields.get(3)?)?,
        close: json_decimal(fields.get(4)?)?,
        volume: json_decimal(fields.get(5)?)?,
    })
}

/// Apply one `orderbook.*` message. Returns true when the book changed.
fn apply_book_msg(book: &mut LocalBook, text: &str) -> bool {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
        return false;
    };
    let topic = json.get("topic").and_then(|t| t.as_str()).unwrap_or("");
    if !topic.starts_with("orderbook") {
        return false;
    }

    let msg_type = json.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if msg_type == "snapshot" {
        book.clear();
    } else if msg_type != "delta" {
        return false;
    }

    let mut changed = false;
    for (key, is_bid) in [("b", true), ("a", false)] {
        let Some(levels) = json.pointer(&format!("/data/{key}")).and_then(|l| l.as_array()) else {
            continue;
        };
        for level in levels {
            let Some(pair) = level.as_array() else {
                continue;
            };
            let (Some(price), Some(volume)) = (
                pair.first().and_then(json_decimal),
                pair.get(1).and_then(json_decimal),
            ) else {
                continue;
            };
            if is_bid {
                book.apply_bid(price, volume);
            } else {
                book.apply_ask(price, volume);
            }
            changed = true;
        }
    }
    changed
}

async fn run_book_stream(symbol: String, tx: mpsc::Sender<BookSnapshot>) {
    let subscribe = serde_json::json!({
        "op": "subscribe",
        "args": [format!("orderbook.50.{symbol}")],
    });
    let mut book = LocalBook::new();

    loop {
        let (ws, _) = match connect_async(BYBIT_WS_URL).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%symbol, error = %e, "Bybit WS connect failed; retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!(%symbol, "📶 Connected to Bybit WebSocket");
        let (mut write, mut read) = ws.split();

        if write
            .send(Message::Text(subscribe.to_string()))
            .await
            .is_err()
        {
            sleep(RECONNECT_DELAY).await;
            continue;
        }

        // A reconnect starts from a fresh venue snapshot.
        book.clear();
        let mut ping = tokio_interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_emit: Option<Instant> = None;
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if last_frame.elapsed() >= WS_IDLE_TIMEOUT {
                        warn!(%symbol, "Bybit WS idle too long; reconnecting");
                        break;
                    }
                    let _ = write.send(Message::Text(r#"{"op":"ping"}"#.to_string())).await;
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        warn!(%symbol, "Bybit WS stream ended; reconnecting");
                        break;
                    };
                    last_frame = Instant::now();
                    match msg {
                        Ok(Message::Text(text)) => {
                            if !apply_book_msg(&mut book, &text) {
                                continue;
                            }
                            let due = last_emit.map_or(true, |t| t.elapsed() >= EMIT_INTERVAL);
                            if due && !book.is_empty() {
                                if tx.send(book.top10()).await.is_err() {
                                    return;
                                }
                                last_emit = Some(Instant::now());
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(%symbol, ?frame, "Bybit WS close");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(%symbol, error = %e, "Bybit WS error; reconnecting");
                            break;
                        }
                    }
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
    fn test_native_interval_mapping() {
        assert_eq!(ExchangeBybit::native_interval(Interval::M1), Some("1"));
        assert_eq!(ExchangeBybit::native_interval(Interval::H4), Some("240"));
        assert_eq!(ExchangeBybit::native_interval(Interval::D1), Some("D"));
        assert_eq!(ExchangeBybit::native_interval(Interval::Mo1), Some("M"));
        assert_eq!(ExchangeBybit::native_interval(Interval::H3), None);
        assert_eq!(ExchangeBybit::native_interval(Interval::H8), None);
    }

    #[test]
    fn test_parse_kline_row() {
        let row = serde_json::json!([
            "1738368000000",
            "102400.1",
            "102800.9",
            "100200.0",
            "100600.5",
            "8000.25",
            "815000000.0"
        ]);
        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(
            candle.open_time,
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(candle.high, dec!(102800.9));
    }

    #[test]
    fn test_snapshot_then_delta() {
        let mut book = LocalBook::new();

        let snapshot = r#"{
            "topic": "orderbook.50.BTCUSDT",
            "type": "snapshot",
            "data": {
                "s": "BTCUSDT",
                "b": [["96999.5", "0.5"], ["96998.0", "1.0"]],
                "a": [["97000.0", "0.8"]]
            }
        }"#;
        assert!(apply_book_msg(&mut book, snapshot));
        assert_eq!(book.top10().bids.len(), 2);

        // Delta removes one level and replaces another.
        let delta = r#"{
            "topic": "orderbook.50.BTCUSDT",
            "type": "delta",
            "data": {
                "b": [["96998.0", "0"]],
                "a": [["97000.0", "2.4"]]
            }
        }"#;
        assert!(apply_book_msg(&mut book, delta));
        let snap = book.top10();
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.asks[0].volume, dec!(2.4));
    }

    #[test]
    fn test_non_book_frames_ignored() {
        let mut book = LocalBook::new();
        assert!(!apply_book_msg(&mut book, r#"{"success":true,"op":"subscribe"}"#));
        assert!(!apply_book_msg(&mut book, r#"{"op":"pong"}"#));
        assert!(!apply_book_msg(&mut book, "not json"));
        assert!(book.is_empty());
    }
}
