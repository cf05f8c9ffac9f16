//! Kucoin adapter.
//!
//! The most ceremonial venue protocol: a bootstrap REST call issues a
//! connect token and the WebSocket endpoint, the book is seeded from a
//! separate REST snapshot, and only then do `trade.l2update` deltas apply.
//! Native symbols are dash-separated (`BTC-USDT`).

use crate::errors::ExchangeError;
use crate::exchanges::{
    book::LocalBook, http_client, json_decimal, rest_get_json, BookStream, Exchange, PairMap,
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
use uuid::Uuid;

const KUCOIN_REST_URL: &str = "https://api.kucoin.com";
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(18);

pub struct ExchangeKucoin {
    inner: Arc<Inner>,
}

struct Inner {
    pairs: tokio::sync::OnceCell<PairMap>,
}

impl Inner {
    async fn fetch_pairs(&self) -> Result<PairMap, ExchangeError> {
        let json = rest_get_json(&format!("{KUCOIN_REST_URL}/api/v2/symbols"), &[]).await?;
        let list = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
            ExchangeError::UpstreamUnavailable("symbols payload missing data".to_string())
        })?;

        let mut pairs = HashMap::with_capacity(list.len());
        for entry in list {
            if let Some(symbol) = entry.get("symbol").and_then(|s| s.as_str()) {
                pairs.insert(symbol.replace('-', ""), symbol.to_string());
            }
        }
        Ok(Arc::new(pairs))
    }

    async fn trading_pairs(&self) -> Result<PairMap, ExchangeError> {
        self.pairs
            .get_or_try_init(|| self.fetch_pairs())
            .await
            .cloned()
    }
}

impl ExchangeKucoin {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pairs: tokio::sync::OnceCell::new(),
            }),
        }
    }

    /// Kucoin's native interval encoding (`1min` .. `1month`).
    fn native_interval(interval: Interval) -> Option<&'static str> {
        match interval {
            Interval::M1 => Some("1min"),
            Interval::M3 => Some("3min"),
            Interval::M5 => Some("5min"),
            Interval::M15 => Some("15min"),
            Interval::M30 => Some("30min"),
            Interval::H1 => Some("1hour"),
            Interval::H2 => Some("2hour"),
            Interval::H4 => Some("4hour"),
            Interval::H6 => Some("6hour"),
            Interval::H8 => Some("8hour"),
            Interval::H12 => Some("12hour"),
            Interval::D1 => Some("1day"),
            Interval::W1 => Some("1week"),
            Interval::Mo1 => Some("1month"),
            Interval::H3 | Interval::D3 => None,
        }
    }
}

impl Default for ExchangeKucoin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for ExchangeKucoin {
    fn name(&self) -> &'static str {
        "Kucoin"
    }

    async fn trading_pairs(&self) -> Result<PairMap, ExchangeError> {
        self.inner.trading_pairs().await
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
        let Some(native) = pairs.get(symbol) else {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        };

        let endpoint = format!("{KUCOIN_REST_URL}/api/v1/market/candles");
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start;
        let mut retried = false;

        while cursor < end {
            let params = [
                ("symbol", native.clone()),
                ("type", native_interval.to_string()),
                ("startAt", cursor.timestamp().to_string()),
            ];
            let json = rest_get_json(&endpoint, &params).await?;

            let rows = json.get("data").and_then(|d| d.as_array());
            let Some(rows) = rows else {
                if retried {
                    return Err(ExchangeError::UpstreamUnavailable(json.to_string()));
                }
                debug!(%symbol, payload = %json, "unexpected candles payload, sleeping");
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
                let Some(candle) = parse_candle_row(row) else {
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
                        "unparseable candles page".to_string(),
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
        let inner = self.inner.clone();
        let symbol = symbol.to_string();
        let task = tokio::spawn(async move {
            run_book_stream(inner, symbol, tx).await;
        });
        BookStream::new(rx, task)
    }
}

/// One candle row: `["time", open, close, high, low, volume, turnover]`,
/// seconds epoch as a string.
fn parse_candle_row(row: &serde_json::Value) -> Option<Candle> {
    let fields = row.as_array()?;
    let open_secs = fields.first()?.as_str()?.parse::<i64>().ok()?;
    Some(Candle {
        open_time: Utc.timestamp_opt(open_secs, 0).single()?,
        open: json_decimal(fields.get(1)?)?,
        close: json_decimal(fields.get(2)?)?,
        high: json_decimal(fields.get(3)?)?,
        low: json_decimal(fields.get(4)?)?,
        volume: json_decimal(fields.get(5)?)?,
    })
}

/// Connect token + WS endpoint + advertised ping cadence.
struct Bullet {
    endpoint: String,
    token: String,
    ping_interval: Duration,
}

async fn fetch_bullet() -> Result<Bullet, ExchangeError> {
    let resp = http_client()
        .post(format!("{KUCOIN_REST_URL}/api/v1/bullet-public"))
        .send()
        .await
        .map_err(|e| ExchangeError::UpstreamUnavailable(e.to_string()))?;
    let json: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| ExchangeError::UpstreamUnavailable(e.to_string()))?;

    let token = json
        .pointer("/data/token")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ExchangeError::UpstreamUnavailable("bullet missing token".to_string()))?;
    let server = json
        .pointer("/data/instanceServers/0")
        .ok_or_else(|| ExchangeError::UpstreamUnavailable("bullet missing servers".to_string()))?;
    let endpoint = server
        .get("endpoint")
        .and_then(|e| e.as_str())
        .ok_or_else(|| ExchangeError::UpstreamUnavailable("bullet missing endpoint".to_string()))?;
    let ping_interval = server
        .get("pingInterval")
        .and_then(|p| p.as_u64())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_PING_INTERVAL);

    Ok(Bullet {
        endpoint: endpoint.to_string(),
        token: token.to_string(),
        ping_interval,
    })
}

/// Seed the local book from the REST level2 snapshot.
async fn seed_book(book: &mut LocalBook, native: &str) -> Result<(), ExchangeError> {
    let json = rest_get_json(
        &format!("{KUCOIN_REST_URL}/api/v1/market/orderbook/level2_100"),
        &[("symbol", native.to_string())],
    )
    .await?;

    book.clear();
    for (key, is_bid) in [("bids", true), ("asks", false)] {
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
        }
    }
    Ok(())
}

/// Apply one `trade.l2update` message. Returns true when the book changed.
fn apply_l2_update(book: &mut LocalBook, text: &str) -> bool {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
        return false;
    };
    if json.get("subject").and_then(|s| s.as_str()) != Some("trade.l2update") {
        return false;
    }

    let mut changed = false;
    for (key, is_bid) in [("bids", true), ("asks", false)] {
        let Some(levels) = json
            .pointer(&format!("/data/changes/{key}"))
            .and_then(|l| l.as_array())
        else {
            continue;
        };
        for level in levels {
            let Some(change) = level.as_array() else {
                continue;
            };
            // Rows are [price, size, sequence]; a zero price marks a
            // sequence-only placeholder and is skipped.
            let (Some(price), Some(volume)) = (
                change.first().and_then(json_decimal),
                change.get(1).and_then(json_decimal),
            ) else {
                continue;
            };
            if price.is_zero() {
                continue;
            }
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

async fn run_book_stream(inner: Arc<Inner>, symbol: String, tx: mpsc::Sender<BookSnapshot>) {
    let native = loop {
        match inner.trading_pairs().await {
            Ok(pairs) => match pairs.get(&symbol) {
                Some(native) => break native.clone(),
                None => {
                    warn!(%symbol, "symbol unknown on Kucoin; book stream ends");
                    return;
                }
            },
            Err(e) => {
                warn!(%symbol, error = %e, "Kucoin pair fetch failed; retrying");
                sleep(RECONNECT_DELAY).await;
            }
        }
    };

    let mut book = LocalBook::new();

    loop {
        let bullet = match fetch_bullet().await {
            Ok(bullet) => bullet,
            Err(e) => {
                warn!(%symbol, error = %e, "Kucoin bullet request failed; retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        let url = format!(
            "{}?token={}&connectId={}",
            bullet.endpoint,
            bullet.token,
            Uuid::new_v4().simple()
        );
        let (ws, _) = match connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%symbol, error = %e, "Kucoin WS connect failed; retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!(%symbol, "📶 Connected to Kucoin WebSocket");
        let (mut write, mut read) = ws.split();

        // Snapshot seed happens before deltas start flowing; late deltas
        // simply overwrite seeded levels.
        if let Err(e) = seed_book(&mut book, &native).await {
            warn!(%symbol, error = %e, "Kucoin snapshot seed failed; reconnecting");
            sleep(RECONNECT_DELAY).await;
            continue;
        }

        let subscribe = serde_json::json!({
            "id": Uuid::new_v4().simple().to_string(),
            "type": "subscribe",
            "topic": format!("/market/level2:{native}"),
            "response": true,
        });
        if write
            .send(Message::Text(subscribe.to_string()))
            .await
            .is_err()
        {
            sleep(RECONNECT_DELAY).await;
            continue;
        }

        let mut ping = tokio_interval(bullet.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_emit: Option<Instant> = None;
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if last_frame.elapsed() >= WS_IDLE_TIMEOUT {
                        warn!(%symbol, "Kucoin WS idle too long; reconnecting");
                        break;
                    }
                    let ping_msg = serde_json::json!({
                        "id": Uuid::new_v4().simple().to_string(),
                        "type": "ping",
                    });
                    let _ = write.send(Message::Text(ping_msg.to_string())).await;
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        warn!(%symbol, "Kucoin WS stream ended; reconnecting");
                        break;
                    };
                    last_frame = Instant::now();
                    match msg {
                        Ok(Message::Text(text)) => {
                            // welcome / ack / pong frames fall through here.
                            if !apply_l2_update(&mut book, &text) {
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
                            debug!(%symbol, ?frame, "Kucoin WS close");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(%symbol, error = %e, "Kucoin WS error; reconnecting");
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
        assert_eq!(ExchangeKucoin::native_interval(Interval::M1), Some("1min"));
        assert_eq!(ExchangeKucoin::native_interval(Interval::H8), Some("8hour"));
        assert_eq!(ExchangeKucoin::native_interval(Interval::Mo1), Some("1month"));
        assert_eq!(ExchangeKucoin::native_interval(Interval::H3), None);
        assert_eq!(ExchangeKucoin::native_interval(Interval::D3), None);
    }

    #[test]
    fn test_parse_candle_row_reorders_fields() {
        // Venue order is [time, open, close, high, low, volume, turnover].
        let row = serde_json::json!([
            "1738368000",
            "102429.56",
            "100635.65",
            "102783.71",
            "100279.51",
            "9000.5",
            "912000000"
        ]);
        let candle = parse_candle_row(&row).unwrap();
        assert_eq!(candle.open, dec!(102429.56));
        assert_eq!(candle.close, dec!(100635.65));
        assert_eq!(candle.high, dec!(102783.71));
        assert_eq!(candle.low, dec!(100279.51));
    }

    #[test]
    fn test_apply_l2_update() {
        let mut book = LocalBook::new();
        book.apply_bid(dec!(96999.5), dec!(0.5));

        let update = r#"{
            "type": "message",
            "topic": "/market/level2:BTC-USDT",
            "subject": "trade.l2update",
            "data": {
                "changes": {
                    "bids": [["96999.5", "0", "176"], ["96990.0", "1.5", "177"]],
                    "asks": [["97001.0", "0.7", "178"]]
                }
            }
        }"#;
        assert!(apply_l2_update(&mut book, update));
        let snap = book.top10();
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.bids[0].price, dec!(96990.0));
        assert_eq!(snap.asks[0].volume, dec!(0.7));
    }

    #[test]
    fn test_welcome_and_ack_ignored() {
        let mut book = LocalBook::new();
        assert!(!apply_l2_update(&mut book, r#"{"id":"x","type":"welcome"}"#));
        assert!(!apply_l2_update(&mut book, r#"{"id":"x","type":"ack"}"#));
        assert!(!apply_l2_update(&mut book, r#"{"id":"x","type":"pong"}"#));
    }
}
