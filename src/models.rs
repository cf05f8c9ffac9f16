//! Shared Data Model
//! Mission: One common vocabulary for venues, books, candles and wire frames

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("invalid side: {other}")),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One price level of a single venue's book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Top-10 view of one venue's book. Asks ascend, bids descend; levels with
/// zero volume are removed before a snapshot is emitted.
#[derive(Debug, Clone, Default)]
pub struct BookSnapshot {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl BookSnapshot {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// One price level of the consolidated book, tagged with the venue that
/// contributed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsolidatedLevel {
    pub price: Decimal,
    pub volume: Decimal,
    pub exchange: &'static str,
}

/// Top-10 book fused from several venues. Volume at a shared price is not
/// summed across venues: each level keeps the single deepest contributor.
#[derive(Debug, Clone, Default)]
pub struct ConsolidatedSnapshot {
    pub bids: Vec<ConsolidatedLevel>,
    pub asks: Vec<ConsolidatedLevel>,
}

impl ConsolidatedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// OHLCV bar with its open time as a UTC instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Timeframe label. Each adapter declares which subset it supports and owns
/// the translation into its native encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H3,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H3,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
        Interval::D3,
        Interval::W1,
        Interval::Mo1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H3 => "3h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    /// Minute offset used to advance pagination one interval past the last
    /// returned candle. A month counts as 43800 minutes, matching the venue
    /// REST APIs.
    pub fn minutes(&self) -> i64 {
        match self {
            Interval::M1 => 1,
            Interval::M3 => 3,
            Interval::M5 => 5,
            Interval::M15 => 15,
            Interval::M30 => 30,
            Interval::H1 => 60,
            Interval::H2 => 120,
            Interval::H3 => 180,
            Interval::H4 => 240,
            Interval::H6 => 360,
            Interval::H8 => 480,
            Interval::H12 => 720,
            Interval::D1 => 1440,
            Interval::D3 => 4320,
            Interval::W1 => 10080,
            Interval::Mo1 => 43800,
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .find(|i| i.as_str() == s)
            .copied()
            .ok_or_else(|| format!("invalid interval: {s}"))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound WebSocket control frame.
#[derive(Debug, Clone, Deserialize)]
pub struct WsClientFrame {
    pub action: WsAction,
    pub symbol: String,
    #[serde(default)]
    pub exchanges: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsAction {
    Subscribe,
    Unsubscribe,
}

/// Outbound WebSocket frames, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerFrame {
    Welcome {
        message: String,
    },
    SubscribeSuccess {
        symbol: String,
        exchanges: Vec<String>,
    },
    SubscribeFailure {
        symbol: String,
        reason: String,
    },
    UnsubscribeSuccess {
        symbol: String,
    },
    UnsubscribeFailure {
        symbol: String,
        reason: String,
    },
    OrderBookUpdate {
        symbol: String,
        exchanges: Vec<String>,
        order_book: OrderBookPayload,
        timestamp: String,
    },
}

impl WsServerFrame {
    pub fn welcome() -> Self {
        WsServerFrame::Welcome {
            message: "Welcome to Twap-Trading-API WebSocket".to_string(),
        }
    }
}

/// Malformed-input reply. Shaped as a bare `{"error": ...}` object rather
/// than a typed frame, matching what clients already expect.
#[derive(Debug, Clone, Serialize)]
pub struct WsErrorFrame {
    pub error: String,
}

/// JSON rendition of a consolidated book: each side maps the price (as its
/// decimal string) to `[volume, venue]`, best levels first.
#[derive(Debug, Clone, Serialize, Default)]
pub struct OrderBookPayload {
    pub bids: serde_json::Map<String, serde_json::Value>,
    pub asks: serde_json::Map<String, serde_json::Value>,
}

impl OrderBookPayload {
    pub fn from_snapshot(snapshot: &ConsolidatedSnapshot) -> Self {
        let render = |levels: &[ConsolidatedLevel]| {
            let mut map = serde_json::Map::new();
            for level in levels {
                map.insert(
                    level.price.normalize().to_string(),
                    serde_json::json!([level.volume.to_f64().unwrap_or(0.0), level.exchange]),
                );
            }
            map
        };
        Self {
            bids: render(&snapshot.bids),
            asks: render(&snapshot.asks),
        }
    }
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub db_path: String,
    pub jwt_secret: String,
    pub coinbase_api_key: String,
    pub coinbase_api_secret: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("API_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "twap_api.db".to_string()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| {
                "dev-secret-change-in-production-minimum-32-characters".to_string()
            }),
            coinbase_api_key: env::var("COINBASE_API_KEY").unwrap_or_default(),
            coinbase_api_secret: env::var("COINBASE_API_SECRET").unwrap_or_default(),
        }
    }
}
