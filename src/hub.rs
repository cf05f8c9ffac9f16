//! Subscription Hub
//! Mission: One broadcast task per live symbol, fanned out to every session
//!
//! The hub reference-counts symbol interest: the first subscriber fixes the
//! venue set and spawns an aggregation task; later subscribers join it; the
//! last unsubscribe (or session close) tears it down. Session outboxes are
//! bounded and written with `try_send`, so a slow client can never stall a
//! broadcast to the others.

use crate::exchanges::{ExchangeRegistry, MultiBook};
use crate::models::{
    OrderBookPayload, WsAction, WsClientFrame, WsErrorFrame, WsServerFrame,
};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound frames queued per session before the socket writer drains them.
const SESSION_OUTBOX_CAPACITY: usize = 64;

pub struct Hub {
    registry: Arc<ExchangeRegistry>,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<Uuid, SessionEntry>,
    broadcasters: HashMap<String, Broadcaster>,
}

struct SessionEntry {
    outbox: mpsc::Sender<WsServerFrame>,
    symbols: HashSet<String>,
}

struct Broadcaster {
    task: JoinHandle<()>,
    /// Venue set fixed by the first subscriber; later requests are ignored.
    exchanges: Vec<String>,
}

impl Hub {
    pub fn new(registry: Arc<ExchangeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            state: Mutex::new(HubState::default()),
        })
    }

    /// Register a session and queue its welcome frame.
    pub fn attach(&self, outbox: mpsc::Sender<WsServerFrame>) -> Uuid {
        let session_id = Uuid::new_v4();
        let _ = outbox.try_send(WsServerFrame::welcome());
        self.state.lock().sessions.insert(
            session_id,
            SessionEntry {
                outbox,
                symbols: HashSet::new(),
            },
        );
        debug!(%session_id, "session attached");
        session_id
    }

    /// Drop a session and tear down any broadcast it was the last member of.
    pub fn detach(&self, session_id: Uuid) {
        let mut state = self.state.lock();
        let Some(entry) = state.sessions.remove(&session_id) else {
            return;
        };
        for symbol in entry.symbols {
            state.stop_if_unwatched(&symbol);
        }
        debug!(%session_id, "session detached");
    }

    pub fn subscribe(
        self: &Arc<Self>,
        session_id: Uuid,
        symbol: &str,
        exchanges: &[String],
    ) -> WsServerFrame {
        let mut state = self.state.lock();

        {
            let Some(entry) = state.sessions.get_mut(&session_id) else {
                return WsServerFrame::SubscribeFailure {
                    symbol: symbol.to_string(),
                    reason: "session not attached".to_string(),
                };
            };
            if !entry.symbols.insert(symbol.to_string()) {
                return WsServerFrame::SubscribeFailure {
                    symbol: symbol.to_string(),
                    reason: "already subscribed".to_string(),
                };
            }
        }

        // Joining an existing broadcast keeps its venue set.
        if let Some(broadcaster) = state.broadcasters.get(symbol) {
            return WsServerFrame::SubscribeSuccess {
                symbol: symbol.to_string(),
                exchanges: broadcaster.exchanges.clone(),
            };
        }

        let resolved = self.registry.resolve(exchanges);
        if resolved.is_empty() {
            if let Some(entry) = state.sessions.get_mut(&session_id) {
                entry.symbols.remove(symbol);
            }
            return WsServerFrame::SubscribeFailure {
                symbol: symbol.to_string(),
                reason: "no known exchanges requested".to_string(),
            };
        }
        let names: Vec<String> = resolved.iter().map(|e| e.name().to_string()).collect();

        let hub = self.clone();
        let task_symbol = symbol.to_string();
        let task_names = names.clone();
        let task = tokio::spawn(async move {
            run_broadcaster(hub, task_symbol, resolved, task_names).await;
        });
        state.broadcasters.insert(
            symbol.to_string(),
            Broadcaster {
                task,
                exchanges: names.clone(),
            },
        );
        info!(symbol, exchanges = ?names, "broadcast task started");

        WsServerFrame::SubscribeSuccess {
            symbol: symbol.to_string(),
            exchanges: names,
        }
    }

    pub fn unsubscribe(&self, session_id: Uuid, symbol: &str) -> WsServerFrame {
        let mut state = self.state.lock();

        {
            let Some(entry) = state.sessions.get_mut(&session_id) else {
                return WsServerFrame::UnsubscribeFailure {
                    symbol: symbol.to_string(),
                    reason: "session not attached".to_string(),
                };
            };
            if !entry.symbols.remove(symbol) {
                return WsServerFrame::UnsubscribeFailure {
                    symbol: symbol.to_string(),
                    reason: "not subscribed".to_string(),
                };
            }
        }

        state.stop_if_unwatched(symbol);
        WsServerFrame::UnsubscribeSuccess {
            symbol: symbol.to_string(),
        }
    }

    /// Outboxes of every session currently watching `symbol`.
    fn watchers(&self, symbol: &str) -> Vec<mpsc::Sender<WsServerFrame>> {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|entry| entry.symbols.contains(symbol))
            .map(|entry| entry.outbox.clone())
            .collect()
    }

    #[cfg(test)]
    fn broadcaster_exists(&self, symbol: &str) -> bool {
        self.state.lock().broadcasters.contains_key(symbol)
    }
}

impl HubState {
    /// Abort the symbol's broadcast task once no session watches it.
    fn stop_if_unwatched(&mut self, symbol: &str) {
        let watched = self
            .sessions
            .values()
            .any(|entry| entry.symbols.contains(symbol));
        if watched {
            return;
        }
        if let Some(broadcaster) = self.broadcasters.remove(symbol) {
            broadcaster.task.abort();
            info!(symbol, "broadcast task stopped (no subscribers left)");
        }
    }
}

async fn run_broadcaster(
    hub: Arc<Hub>,
    symbol: String,
    exchanges: Vec<Arc<dyn crate::exchanges::Exchange>>,
    names: Vec<String>,
) {
    let multi = MultiBook::new(exchanges);
    let mut stream = multi.open(&symbol);

    while let Some(snapshot) = stream.next().await {
        let frame = WsServerFrame::OrderBookUpdate {
            symbol: symbol.clone(),
            exchanges: names.clone(),
            order_book: OrderBookPayload::from_snapshot(&snapshot),
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        };
        // A full or closed outbox is the session's problem, not the
        // broadcast's; its own transport error will detach it.
        for outbox in hub.watchers(&symbol) {
            let _ = outbox.try_send(frame.clone());
        }
    }
}

/// Drive one WebSocket session against the hub until the transport closes.
pub async fn handle_socket(mut socket: WebSocket, hub: Arc<Hub>) {
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<WsServerFrame>(SESSION_OUTBOX_CAPACITY);
    let session_id = hub.attach(outbox_tx);

    loop {
        tokio::select! {
            // Drain queued frames first so the welcome and subscription
            // replies always precede later book updates.
            biased;

            frame = outbox_rx.recv() => {
                let Some(frame) = frame else { break };
                let msg = match serde_json::to_string(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(%session_id, error = %e, "failed to serialize ws frame");
                        continue;
                    }
                };
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_control_frame(&hub, session_id, &text);
                        if socket.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%session_id, error = %e, "ws transport error");
                        break;
                    }
                }
            }
        }
    }

    hub.detach(session_id);
}

/// Decode one inbound control frame and produce the JSON reply. Malformed
/// input yields an `{"error": ...}` reply and leaves the session open.
fn handle_control_frame(hub: &Arc<Hub>, session_id: Uuid, text: &str) -> String {
    let frame: WsClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return serde_json::to_string(&WsErrorFrame {
                error: format!("invalid message: {e}"),
            })
            .unwrap_or_else(|_| "{}".to_string());
        }
    };

    let reply = match frame.action {
        WsAction::Subscribe => {
            if frame.exchanges.is_empty() {
                return serde_json::to_string(&WsErrorFrame {
                    error: "exchanges is required and must be non-empty".to_string(),
                })
                .unwrap_or_else(|_| "{}".to_string());
            }
            hub.subscribe(session_id, &frame.symbol, &frame.exchanges)
        }
        WsAction::Unsubscribe => hub.unsubscribe(session_id, &frame.symbol),
    };

    serde_json::to_string(&reply).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExchangeError;
    use crate::exchanges::{BookStream, Exchange, PairMap};
    use crate::models::{BookLevel, BookSnapshot, Candle, Interval};
    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal_macros::dec;

    /// Emits one fixed snapshot per second, forever.
    struct TickingExchange {
        name: &'static str,
    }

    #[async_trait]
    impl Exchange for TickingExchange {
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
            let (tx, rx) = mpsc::channel(8);
            let task = tokio::spawn(async move {
                loop {
                    let snapshot = BookSnapshot {
                        bids: vec![BookLevel {
                            price: dec!(100),
                            volume: dec!(1),
                        }],
                        asks: vec![BookLevel {
                            price: dec!(101),
                            volume: dec!(1),
                        }],
                    };
                    if tx.send(snapshot).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            });
            BookStream::new(rx, task)
        }
    }

    fn test_hub() -> Arc<Hub> {
        let registry = Arc::new(ExchangeRegistry::with_entries(vec![
            ("Binance", Arc::new(TickingExchange { name: "Binance" })),
            ("Coinbase", Arc::new(TickingExchange { name: "Coinbase" })),
        ]));
        Hub::new(registry)
    }

    #[tokio::test]
    async fn test_attach_queues_welcome() {
        let hub = test_hub();
        let (tx, mut rx) = mpsc::channel(8);
        hub.attach(tx);

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, WsServerFrame::Welcome { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_starts_broadcast_and_delivers_updates() {
        let hub = test_hub();
        let (tx, mut rx) = mpsc::channel(8);
        let session = hub.attach(tx);
        let _welcome = rx.recv().await.unwrap();

        let reply = hub.subscribe(session, "BTCUSDT", &["Binance".to_string()]);
        assert!(matches!(reply, WsServerFrame::SubscribeSuccess { .. }));
        assert!(hub.broadcaster_exists("BTCUSDT"));

        let update = rx.recv().await.unwrap();
        match update {
            WsServerFrame::OrderBookUpdate { symbol, exchanges, .. } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(exchanges, vec!["Binance"]);
            }
            other => panic!("expected order_book_update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_double_subscribe_fails() {
        let hub = test_hub();
        let (tx, _rx) = mpsc::channel(8);
        let session = hub.attach(tx);

        let first = hub.subscribe(session, "BTCUSDT", &["Binance".to_string()]);
        assert!(matches!(first, WsServerFrame::SubscribeSuccess { .. }));

        let second = hub.subscribe(session, "BTCUSDT", &["Binance".to_string()]);
        assert!(matches!(second, WsServerFrame::SubscribeFailure { .. }));
    }

    #[tokio::test]
    async fn test_first_subscriber_fixes_venue_set() {
        let hub = test_hub();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let session_a = hub.attach(tx_a);
        let session_b = hub.attach(tx_b);

        hub.subscribe(session_a, "BTCUSDT", &["Binance".to_string()]);

        // The second subscriber's venue request is ignored for this symbol.
        let reply = hub.subscribe(session_b, "BTCUSDT", &["Coinbase".to_string()]);
        match reply {
            WsServerFrame::SubscribeSuccess { exchanges, .. } => {
                assert_eq!(exchanges, vec!["Binance"]);
            }
            other => panic!("expected subscribe_success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_exchanges_fail_subscription() {
        let hub = test_hub();
        let (tx, _rx) = mpsc::channel(8);
        let session = hub.attach(tx);

        let reply = hub.subscribe(session, "BTCUSDT", &["Kraken".to_string()]);
        assert!(matches!(reply, WsServerFrame::SubscribeFailure { .. }));
        assert!(!hub.broadcaster_exists("BTCUSDT"));

        // A failed subscribe leaves no membership behind.
        let reply = hub.unsubscribe(session, "BTCUSDT");
        assert!(matches!(reply, WsServerFrame::UnsubscribeFailure { .. }));
    }

    #[tokio::test]
    async fn test_refcount_teardown_on_last_unsubscribe() {
        let hub = test_hub();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let session_a = hub.attach(tx_a);
        let session_b = hub.attach(tx_b);

        hub.subscribe(session_a, "BTCUSDT", &["Binance".to_string()]);
        hub.subscribe(session_b, "BTCUSDT", &["Binance".to_string()]);
        assert!(hub.broadcaster_exists("BTCUSDT"));

        hub.unsubscribe(session_a, "BTCUSDT");
        assert!(hub.broadcaster_exists("BTCUSDT"));

        hub.unsubscribe(session_b, "BTCUSDT");
        assert!(!hub.broadcaster_exists("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_detach_releases_subscriptions() {
        let hub = test_hub();
        let (tx, _rx) = mpsc::channel(8);
        let session = hub.attach(tx);

        hub.subscribe(session, "BTCUSDT", &["Binance".to_string()]);
        assert!(hub.broadcaster_exists("BTCUSDT"));

        hub.detach(session);
        assert!(!hub.broadcaster_exists("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_malformed_control_frames() {
        let hub = test_hub();
        let (tx, _rx) = mpsc::channel(8);
        let session = hub.attach(tx);

        let reply = handle_control_frame(&hub, session, "not json");
        assert!(reply.contains("error"));

        // Subscribe without exchanges is rejected with an error frame.
        let reply = handle_control_frame(
            &hub,
            session,
            r#"{"action":"subscribe","symbol":"BTCUSDT","exchanges":[]}"#,
        );
        assert!(reply.contains("exchanges is required"));
        assert!(!hub.broadcaster_exists("BTCUSDT"));
    }
}
