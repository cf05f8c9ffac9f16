//! Multi-venue book aggregation.
//!
//! One round: take the next snapshot from every participating venue, merge
//! per side by price, emit a consolidated top-10. At a shared price the
//! single deepest venue wins; volumes are never summed across venues, so a
//! fill walk over the result never double-counts overlapping liquidity.
//!
//! Cadence comes from the adapters themselves (each is rate-limited to
//! 1 Hz); the aggregator adds no timer of its own. A venue that stops
//! producing is parked and polled non-blockingly so the remaining venues
//! keep the pace, and it rejoins the moment its next snapshot arrives.

use crate::exchanges::{BookStream, Exchange};
use crate::models::{BookSnapshot, ConsolidatedLevel, ConsolidatedSnapshot};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

/// How long a round waits for a venue before parking it.
const ROUND_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the consolidated snapshot channel.
const CONSOLIDATED_CHANNEL_CAPACITY: usize = 8;

/// A set of venues fused into one consolidated book source.
pub struct MultiBook {
    exchanges: Vec<Arc<dyn Exchange>>,
}

impl MultiBook {
    /// Venue order is significant: it breaks equal-volume ties in the merge.
    pub fn new(exchanges: Vec<Arc<dyn Exchange>>) -> Self {
        Self { exchanges }
    }

    /// Start aggregating `symbol` across the venue set.
    pub fn open(&self, symbol: &str) -> ConsolidatedStream {
        let feeds: Vec<VenueFeed> = self
            .exchanges
            .iter()
            .map(|exchange| VenueFeed {
                name: exchange.name(),
                stream: exchange.stream_book(symbol),
                degraded: false,
                closed: false,
            })
            .collect();

        let (tx, rx) = mpsc::channel(CONSOLIDATED_CHANNEL_CAPACITY);
        let symbol = symbol.to_string();
        let task = tokio::spawn(async move {
            run_rounds(symbol, feeds, tx).await;
        });
        ConsolidatedStream { rx, task }
    }
}

/// Consumer handle for a consolidated snapshot stream. Dropping it cancels
/// the aggregation task, which in turn drops every per-venue stream.
pub struct ConsolidatedStream {
    rx: mpsc::Receiver<ConsolidatedSnapshot>,
    task: JoinHandle<()>,
}

impl ConsolidatedStream {
    pub async fn next(&mut self) -> Option<ConsolidatedSnapshot> {
        self.rx.recv().await
    }
}

impl Drop for ConsolidatedStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct VenueFeed {
    name: &'static str,
    stream: BookStream,
    degraded: bool,
    closed: bool,
}

async fn run_rounds(
    symbol: String,
    mut feeds: Vec<VenueFeed>,
    tx: mpsc::Sender<ConsolidatedSnapshot>,
) {
    info!(
        symbol,
        venues = feeds.len(),
        "starting consolidated book aggregation"
    );

    loop {
        let mut contributions: Vec<(usize, BookSnapshot)> = Vec::with_capacity(feeds.len());

        // Healthy venues are awaited concurrently, capped per round.
        let results = {
            let futures: Vec<_> = feeds
                .iter_mut()
                .enumerate()
                .filter(|(_, feed)| !feed.degraded && !feed.closed)
                .map(|(i, feed)| {
                    let stream = &mut feed.stream;
                    async move { (i, timeout(ROUND_TIMEOUT, stream.next()).await) }
                })
                .collect();
            join_all(futures).await
        };

        for (i, result) in results {
            match result {
                Ok(Some(snapshot)) => contributions.push((i, snapshot)),
                Ok(None) => {
                    debug!(%symbol, venue = feeds[i].name, "venue stream closed");
                    feeds[i].closed = true;
                }
                Err(_) => {
                    debug!(%symbol, venue = feeds[i].name, "venue timed out; parked");
                    feeds[i].degraded = true;
                }
            }
        }

        // Parked venues rejoin as soon as they have something ready.
        for (i, feed) in feeds.iter_mut().enumerate() {
            if feed.degraded && !feed.closed {
                if let Some(snapshot) = feed.stream.try_next() {
                    debug!(%symbol, venue = feed.name, "venue rejoined");
                    feed.degraded = false;
                    contributions.push((i, snapshot));
                }
            }
        }

        if feeds.iter().all(|f| f.closed) {
            info!(%symbol, "all venue streams closed; aggregation ends");
            return;
        }

        if contributions.is_empty() {
            // Nothing but parked venues this round; avoid a hot loop.
            tokio::time::sleep(crate::exchanges::EMIT_INTERVAL).await;
            continue;
        }

        // Restore venue priority order for deterministic tie-breaks.
        contributions.sort_by_key(|(i, _)| *i);
        let inputs: Vec<(&'static str, BookSnapshot)> = contributions
            .into_iter()
            .map(|(i, snapshot)| (feeds[i].name, snapshot))
            .collect();

        if tx.send(merge_books(&inputs)).await.is_err() {
            return;
        }
    }
}

/// Merge per-venue snapshots into one consolidated top-10.
///
/// Input order is the tie-break priority: at equal volume the earlier venue
/// keeps the level. Bid levels that cross the best consolidated ask are
/// discarded so the emitted book is never crossed.
pub fn merge_books(inputs: &[(&'static str, BookSnapshot)]) -> ConsolidatedSnapshot {
    let mut bids: HashMap<Decimal, (Decimal, &'static str)> = HashMap::new();
    let mut asks: HashMap<Decimal, (Decimal, &'static str)> = HashMap::new();

    for (venue, snapshot) in inputs {
        for level in &snapshot.bids {
            match bids.get(&level.price) {
                Some((volume, _)) if *volume >= level.volume => {}
                _ => {
                    bids.insert(level.price, (level.volume, venue));
                }
            }
        }
        for level in &snapshot.asks {
            match asks.get(&level.price) {
                Some((volume, _)) if *volume >= level.volume => {}
                _ => {
                    asks.insert(level.price, (level.volume, venue));
                }
            }
        }
    }

    let mut asks: Vec<ConsolidatedLevel> = asks
        .into_iter()
        .map(|(price, (volume, exchange))| ConsolidatedLevel {
            price,
            volume,
            exchange,
        })
        .collect();
    asks.sort_by(|a, b| a.price.cmp(&b.price));
    asks.truncate(10);

    let best_ask = asks.first().map(|l| l.price);
    let mut bids: Vec<ConsolidatedLevel> = bids
        .into_iter()
        .filter(|(price, _)| best_ask.map_or(true, |ask| *price < ask))
        .map(|(price, (volume, exchange))| ConsolidatedLevel {
            price,
            volume,
            exchange,
        })
        .collect();
    bids.sort_by(|a, b| b.price.cmp(&a.price));
    bids.truncate(10);

    ConsolidatedSnapshot { bids, asks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExchangeError;
    use crate::exchanges::PairMap;
    use crate::models::{BookLevel, Candle, Interval};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn level(price: Decimal, volume: Decimal) -> BookLevel {
        BookLevel { price, volume }
    }

    #[test]
    fn test_merge_keeps_largest_volume_per_price() {
        let inputs = vec![
            (
                "Binance",
                BookSnapshot {
                    bids: vec![level(dec!(100), dec!(1))],
                    asks: vec![level(dec!(101), dec!(2))],
                },
            ),
            (
                "Coinbase",
                BookSnapshot {
                    bids: vec![level(dec!(100), dec!(3))],
                    asks: vec![level(dec!(101), dec!(1))],
                },
            ),
        ];

        let merged = merge_books(&inputs);
        assert_eq!(merged.bids[0].volume, dec!(3));
        assert_eq!(merged.bids[0].exchange, "Coinbase");
        assert_eq!(merged.asks[0].volume, dec!(2));
        assert_eq!(merged.asks[0].exchange, "Binance");
    }

    #[test]
    fn test_merge_tie_goes_to_first_venue() {
        let inputs = vec![
            (
                "Bybit",
                BookSnapshot {
                    bids: vec![level(dec!(100), dec!(2))],
                    asks: vec![],
                },
            ),
            (
                "Kucoin",
                BookSnapshot {
                    bids: vec![level(dec!(100), dec!(2))],
                    asks: vec![],
                },
            ),
        ];

        let merged = merge_books(&inputs);
        assert_eq!(merged.bids[0].exchange, "Bybit");
    }

    #[test]
    fn test_merge_orders_and_truncates_to_ten() {
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for i in 1..=12i64 {
            bids.push(level(Decimal::from(i), dec!(1)));
            asks.push(level(Decimal::from(100 + i), dec!(1)));
        }
        let inputs = vec![("Binance", BookSnapshot { bids, asks })];

        let merged = merge_books(&inputs);
        assert_eq!(merged.bids.len(), 10);
        assert_eq!(merged.asks.len(), 10);
        assert_eq!(merged.bids[0].price, dec!(12));
        assert!(merged
            .bids
            .windows(2)
            .all(|w| w[0].price > w[1].price));
        assert!(merged
            .asks
            .windows(2)
            .all(|w| w[0].price < w[1].price));
        // Uncrossed when both sides present.
        assert!(merged.bids[0].price < merged.asks[0].price);
    }

    #[test]
    fn test_merge_drops_crossed_bids() {
        let inputs = vec![
            (
                "Binance",
                BookSnapshot {
                    bids: vec![],
                    asks: vec![level(dec!(100), dec!(1))],
                },
            ),
            (
                "Kucoin",
                BookSnapshot {
                    bids: vec![level(dec!(100.5), dec!(1)), level(dec!(99), dec!(1))],
                    asks: vec![],
                },
            ),
        ];

        let merged = merge_books(&inputs);
        assert_eq!(merged.bids.len(), 1);
        assert_eq!(merged.bids[0].price, dec!(99));
    }

    #[test]
    fn test_merge_one_sided_inputs_are_valid() {
        let inputs = vec![(
            "Binance",
            BookSnapshot {
                bids: vec![level(dec!(100), dec!(1))],
                asks: vec![],
            },
        )];
        let merged = merge_books(&inputs);
        assert_eq!(merged.bids.len(), 1);
        assert!(merged.asks.is_empty());
    }

    /// Replays a fixed snapshot sequence, then hangs like a quiet venue.
    struct MockExchange {
        name: &'static str,
        snapshots: Vec<BookSnapshot>,
    }

    #[async_trait]
    impl Exchange for MockExchange {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn trading_pairs(&self) -> Result<PairMap, ExchangeError> {
            Err(ExchangeError::UpstreamUnavailable("mock".to_string()))
        }

        async fn candles(
            &self,
            _symbol: &str,
            _interval: Interval,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Err(ExchangeError::UpstreamUnavailable("mock".to_string()))
        }

        fn stream_book(&self, _symbol: &str) -> BookStream {
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            let snapshots = self.snapshots.clone();
            let task = tokio::spawn(async move {
                for snapshot in snapshots {
                    if tx.send(snapshot).await.is_err() {
                        return;
                    }
                }
                std::future::pending::<()>().await;
            });
            BookStream::new(rx, task)
        }
    }

    fn one_bid(price: Decimal, volume: Decimal) -> BookSnapshot {
        BookSnapshot {
            bids: vec![level(price, volume)],
            asks: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregation_merges_both_venues() {
        let multi = MultiBook::new(vec![
            Arc::new(MockExchange {
                name: "Binance",
                snapshots: vec![one_bid(dec!(100), dec!(1))],
            }),
            Arc::new(MockExchange {
                name: "Coinbase",
                snapshots: vec![one_bid(dec!(100), dec!(4))],
            }),
        ]);

        let mut stream = multi.open("BTCUSDT");
        let snapshot = stream.next().await.unwrap();
        assert_eq!(snapshot.bids[0].volume, dec!(4));
        assert_eq!(snapshot.bids[0].exchange, "Coinbase");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_venue_is_dropped_from_round() {
        // Binance produces two snapshots; Coinbase produces one then goes
        // quiet. The second round must still emit from Binance alone.
        let multi = MultiBook::new(vec![
            Arc::new(MockExchange {
                name: "Binance",
                snapshots: vec![one_bid(dec!(100), dec!(1)), one_bid(dec!(101), dec!(2))],
            }),
            Arc::new(MockExchange {
                name: "Coinbase",
                snapshots: vec![one_bid(dec!(99), dec!(5))],
            }),
        ]);

        let mut stream = multi.open("BTCUSDT");

        let first = stream.next().await.unwrap();
        assert_eq!(first.bids.len(), 2);

        let second = stream.next().await.unwrap();
        assert_eq!(second.bids.len(), 1);
        assert_eq!(second.bids[0].price, dec!(101));
        assert_eq!(second.bids[0].exchange, "Binance");
    }
}
