//! Coinbase adapter.
//!
//! The only venue that authenticates its market-data stream: each connect
//! mints a short-lived ES256 JWT from the configured API key pair and sends
//! it with the level2 subscription. Book maintenance itself is plain
//! snapshot-plus-delta. Native symbols are dash-separated (`BTC-USD`).

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
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const COINBASE_REST_URL: &str = "https://api.exchange.coinbase.com";
const COINBASE_WS_URL: &str = "wss://advanced-trade-ws.coinbase.com";
/// Stream JWTs are valid for five minutes; one is minted per connect.
const JWT_TTL_SECS: i64 = 300;

pub struct ExchangeCoinbase {
    inner: Arc<Inner>,
}

struct Inner {
    api_key: String,
    api_secret: String,
    pairs: tokio::sync::OnceCell<PairMap>,
}

#[derive(Debug, Serialize)]
struct StreamClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl Inner {
    /// Mint the ES256 bearer for the level2 subscription.
    fn mint_jwt(&self) -> Result<String, ExchangeError> {
        let now = Utc::now().timestamp();
        let claims = StreamClaims {
            iss: &self.api_key,
            sub: &self.api_key,
            aud: "coinbase-cloud",
            iat: now,
            exp: now + JWT_TTL_SECS,
        };
        let key = EncodingKey::from_ec_pem(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::UpstreamUnavailable(format!("bad EC key: {e}")))?;
        encode(&Header::new(Algorithm::ES256), &claims, &key)
            .map_err(|e| ExchangeError::UpstreamUnavailable(format!("jwt encode: {e}")))
    }

    async fn fetch_pairs(&self) -> Result<PairMap, ExchangeError> {
        let json = rest_get_json(&format!("{COINBASE_REST_URL}/products"), &[]).await?;
        let products = json.as_array().ok_or_else(|| {
            ExchangeError::UpstreamUnavailable("products payload not a list".to_string())
        })?;

        let mut pairs = HashMap::with_capacity(products.len());
        for entry in products {
            if let Some(id) = entry.get("id").and_then(|s| s.as_str()) {
                pairs.insert(id.replace('-', ""), id.to_string());
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

impl ExchangeCoinbase {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                api_key,
                api_secret,
                pairs: tokio::sync::OnceCell::new(),
            }),
        }
    }

    /// Granularity in seconds, the venue's native interval encoding.
    fn granularity(interval: Interval) -> Option<u32> {
        match interval {
            Interval::M1 => Some(60),
            Interval::M5 => Some(300),
            Interval::M15 => Some(900),
            Interval::H1 => Some(3600),
            Interval::H6 => Some(21600),
            Interval::D1 => Some(86400),
            _ => None,
        }
    }
}

#[async_trait]
impl Exchange for ExchangeCoinbase {
    fn name(&self) -> &'static str {
        "Coinbase"
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
        let Some(granularity) = Self::granularity(interval) else {
            return Err(ExchangeError::UnsupportedInterval(interval.to_string()));
        };
        let pairs = self.trading_pairs().await?;
        let Some(native) = pairs.get(symbol) else {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        };

        // 300 candles per page, the venue's maximum.
        let page_span = chrono::Duration::seconds(granularity as i64 * 300);
        let endpoint = format!("{COINBASE_REST_URL}/products/{native}/candles");
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start;
        let mut retried = false;

        while cursor < end {
            let params = [
                ("start", cursor.to_rfc3339()),
                ("end", (cursor + page_span).min(end).to_rfc3339()),
                ("granularity", granularity.to_string()),
            ];
            let json = rest_get_json(&endpoint, &params).await?;

            let Some(rows) = json.as_array() else {
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
            cursor = last_open + chrono::Duration::seconds(granularity as i64);
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

/// One candle row: `[time, low, high, open, close, volume]`, seconds epoch.
fn parse_candle_row(row: &serde_json::Value) -> Option<Candle> {
    let fields = row.as_array()?;
    let open_secs = fields.first()?.as_i64()?;
    let decimal_at = |i: usize| {
        let v = fields.get(i)?;
        v.as_str()
            .and_then(parse_decimal)
            .or_else(|| v.as_f64().and_then(|f| parse_decimal(&f.to_string())))
    };
    Some(Candle {
        open_time: Utc.timestamp_opt(open_secs, 0).single()?,
        open: decimal_at(3)?,
        high: decimal_at(2)?,
        low: decimal_at(1)?,
        close: decimal_at(4)?,
        volume: decimal_at(5)?,
    })
}

/// Apply one `l2_data` message. Returns true when the book changed.
fn apply_l2_msg(book: &mut LocalBook, text: &str) -> bool {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
        return false;
    };
    if json.get("channel").and_then(|c| c.as_str()) != Some("l2_data") {
        return false;
    }
    let Some(events) = json.get("events").and_then(|e| e.as_array()) else {
        return false;
    };

    let mut changed = false;
    for event in events {
        let Some(updates) = event.get("updates").and_then(|u| u.as_array()) else {
            continue;
        };
        for update in updates {
            let side = update.get("side").and_then(|s| s.as_str()).unwrap_or("");
            let (Some(price), Some(volume)) = (
                update
                    .get("price_level")
                    .and_then(|p| p.as_str())
                    .and_then(parse_decimal),
                update
                    .get("new_quantity")
                    .and_then(|q| q.as_str())
                    .and_then(parse_decimal),
            ) else {
                continue;
            };
            if side == "bid" {
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
    // Resolve the dash-separated native id once; an unknown symbol ends the
    // stream (the consumer observes channel closure).
    let native = loop {
        match inner.trading_pairs().await {
            Ok(pairs) => match pairs.get(&symbol) {
                Some(native) => break native.clone(),
                None => {
                    warn!(%symbol, "symbol unknown on Coinbase; book stream ends");
                    return;
                }
            },
            Err(e) => {
                warn!(%symbol, error = %e, "Coinbase pair fetch failed; retrying");
                sleep(RECONNECT_DELAY).await;
            }
        }
    };

    let mut book = LocalBook::new();

    loop {
        // A fresh token per connect; the old one may have expired.
        let token = match inner.mint_jwt() {
            Ok(token) => token,
            Err(e) => {
                warn!(%symbol, error = %e, "Coinbase JWT mint failed; retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let subscribe = serde_json::json!({
            "type": "subscribe",
            "channel": "level2",
            "product_ids": [native],
            "token": token,
        });

        let (ws, _) = match connect_async(COINBASE_WS_URL).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%symbol, error = %e, "Coinbase WS connect failed; retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!(%symbol, "📶 Connected to Coinbase WebSocket");
        let (mut write, mut read) = ws.split();

        if write
            .send(Message::Text(subscribe.to_string()))
            .await
            .is_err()
        {
            sleep(RECONNECT_DELAY).await;
            continue;
        }

        // The first l2_data event is a snapshot; start clean.
        book.clear();
        let mut last_emit: Option<Instant> = None;

        loop {
            let msg = match timeout(WS_IDLE_TIMEOUT, read.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    warn!(%symbol, "Coinbase WS stream ended; reconnecting");
                    break;
                }
                Err(_) => {
                    warn!(%symbol, "Coinbase WS idle too long; reconnecting");
                    break;
                }
            };
            match msg {
                Ok(Message::Text(text)) => {
                    if !apply_l2_msg(&mut book, &text) {
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
                    debug!(%symbol, ?frame, "Coinbase WS close");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%symbol, error = %e, "Coinbase WS error; reconnecting");
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
    fn test_granularity_mapping() {
        assert_eq!(ExchangeCoinbase::granularity(Interval::M1), Some(60));
        assert_eq!(ExchangeCoinbase::granularity(Interval::D1), Some(86400));
        assert_eq!(ExchangeCoinbase::granularity(Interval::M3), None);
        assert_eq!(ExchangeCoinbase::granularity(Interval::Mo1), None);
    }

    #[test]
    fn test_parse_candle_row_reorders_ohlc() {
        // Venue order is [time, low, high, open, close, volume].
        let row = serde_json::json!([1738368000i64, 100279.51, 102783.71, 102429.56, 100635.65, 12290.95747]);
        let candle = parse_candle_row(&row).unwrap();
        assert_eq!(candle.open, dec!(102429.56));
        assert_eq!(candle.high, dec!(102783.71));
        assert_eq!(candle.low, dec!(100279.51));
        assert_eq!(candle.close, dec!(100635.65));
    }

    #[test]
    fn test_apply_l2_msg() {
        let mut book = LocalBook::new();
        let msg = r#"{
            "channel": "l2_data",
            "events": [{
                "type": "snapshot",
                "product_id": "BTC-USD",
                "updates": [
                    {"side": "bid", "price_level": "96999.5", "new_quantity": "0.5"},
                    {"side": "offer", "price_level": "97000.0", "new_quantity": "1.2"}
                ]
            }]
        }"#;
        assert!(apply_l2_msg(&mut book, msg));
        let snap = book.top10();
        assert_eq!(snap.bids[0].price, dec!(96999.5));
        assert_eq!(snap.asks[0].volume, dec!(1.2));

        // Zero quantity removes.
        let removal = r#"{
            "channel": "l2_data",
            "events": [{
                "type": "update",
                "updates": [{"side": "offer", "price_level": "97000.0", "new_quantity": "0"}]
            }]
        }"#;
        assert!(apply_l2_msg(&mut book, removal));
        assert!(book.top10().asks.is_empty());
    }

    #[test]
    fn test_heartbeat_frames_ignored() {
        let mut book = LocalBook::new();
        assert!(!apply_l2_msg(&mut book, r#"{"channel":"subscriptions","events":[]}"#));
        assert!(!apply_l2_msg(&mut book, r#"{"channel":"heartbeats"}"#));
    }
}
