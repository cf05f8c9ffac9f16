//! TWAP Execution Engine
//! Mission: Slice a parent order over time and fill it against the live book
//!
//! Each accepted order runs as its own task with its own aggregator
//! subscription. One slice per second: sleep, take one consolidated
//! snapshot (capped at a second; a stall means an empty book), walk the
//! levels under the limit price, persist every fill, refresh the running
//! aggregates. Book trouble never fails the parent order; missing fills
//! are the signal.

use crate::db::{Database, OrderRecord, OrderStateUpdate};
use crate::errors::ApiError;
use crate::exchanges::{ConsolidatedStream, ExchangeRegistry, MultiBook};
use crate::models::{ConsolidatedSnapshot, Side};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use uuid::Uuid;

/// A slice waits at most this long for its snapshot before giving up.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);

/// Validated TWAP submission.
#[derive(Debug, Clone)]
pub struct TwapRequest {
    pub symbol: String,
    pub side: Side,
    pub total_quantity: Decimal,
    pub limit_price: Decimal,
    pub duration_seconds: u64,
    pub exchanges: Vec<String>,
}

/// Aggregate snapshot handed to the progress callback after each slice.
#[derive(Debug, Clone)]
pub struct TwapProgress {
    pub order_id: String,
    pub status: String,
    pub total_executed: Decimal,
    pub avg_execution_price: Decimal,
    pub percent_executed: Decimal,
    pub lots_count: i64,
}

pub type ProgressCallback = Arc<dyn Fn(TwapProgress) + Send + Sync>;

/// One planned fill within a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub price: Decimal,
    pub quantity: Decimal,
    pub exchange: &'static str,
}

pub struct TwapEngine {
    db: Arc<Database>,
    registry: Arc<ExchangeRegistry>,
}

impl TwapEngine {
    pub fn new(db: Arc<Database>, registry: Arc<ExchangeRegistry>) -> Arc<Self> {
        Arc::new(Self { db, registry })
    }

    /// Validate, persist the pending parent, and spawn its execution task.
    /// Returns the order's token id.
    pub fn submit(&self, user_id: &str, request: TwapRequest) -> Result<String, ApiError> {
        self.spawn_order(user_id, request, None)
    }

    /// Same as `submit`, but with a per-slice progress callback. Used by
    /// tests and embedders that want push-style updates.
    pub fn submit_with_progress(
        &self,
        user_id: &str,
        request: TwapRequest,
        progress: ProgressCallback,
    ) -> Result<String, ApiError> {
        self.spawn_order(user_id, request, Some(progress))
    }

    fn spawn_order(
        &self,
        user_id: &str,
        request: TwapRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<String, ApiError> {
        if request.total_quantity <= Decimal::ZERO {
            return Err(ApiError::BadRequest(
                "total_quantity must be positive".to_string(),
            ));
        }
        if request.limit_price <= Decimal::ZERO {
            return Err(ApiError::BadRequest(
                "limit_price must be positive".to_string(),
            ));
        }
        if request.duration_seconds < 1 {
            return Err(ApiError::BadRequest(
                "duration_seconds must be at least 1".to_string(),
            ));
        }
        let exchanges = self.registry.resolve(&request.exchanges);
        if exchanges.is_empty() {
            return Err(ApiError::BadRequest(
                "no known exchanges requested".to_string(),
            ));
        }

        let order_id = Uuid::new_v4().to_string();
        let record = OrderRecord {
            order_id: order_id.clone(),
            user_id: user_id.to_string(),
            symbol: request.symbol.clone(),
            exchanges: exchanges.iter().map(|e| e.name().to_string()).collect(),
            side: request.side,
            limit_price: request.limit_price,
            quantity: request.total_quantity,
            duration: request.duration_seconds as i64,
            status: "pending".to_string(),
            created_at: Utc::now().to_rfc3339(),
            percent_exec: Decimal::ZERO,
            avg_exec_price: Decimal::ZERO,
            lots_count: 0,
            total_exec: Decimal::ZERO,
        };
        self.db.add_parent_order(&record)?;

        info!(
            order_id = %order_id,
            symbol = %request.symbol,
            side = %request.side,
            quantity = %request.total_quantity,
            duration = request.duration_seconds,
            "TWAP order accepted"
        );

        // Each order is its own aggregator consumer; it never shares the
        // hub's broadcast task.
        let db = self.db.clone();
        let stream = MultiBook::new(exchanges).open(&request.symbol);
        let task_order_id = order_id.clone();
        tokio::spawn(async move {
            run_order(db, stream, task_order_id, request, progress).await;
        });

        Ok(order_id)
    }
}

/// Walk the book under the limit price and plan this slice's fills.
///
/// Buys consume asks at or below the limit, cheapest first; sells consume
/// bids at or above the limit, dearest first. Whatever cannot be filled at
/// this snapshot is simply not filled; the residue is never carried into
/// the next slice.
pub fn plan_fills(
    snapshot: &ConsolidatedSnapshot,
    side: Side,
    limit_price: Decimal,
    slice_quantity: Decimal,
) -> Vec<Fill> {
    let levels: Vec<_> = match side {
        Side::Buy => snapshot
            .asks
            .iter()
            .filter(|l| l.price <= limit_price)
            .collect(),
        Side::Sell => snapshot
            .bids
            .iter()
            .filter(|l| l.price >= limit_price)
            .collect(),
    };

    let mut fills = Vec::new();
    let mut remaining = slice_quantity;
    for level in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        if level.volume <= Decimal::ZERO {
            continue;
        }
        let quantity = remaining.min(level.volume);
        fills.push(Fill {
            price: level.price,
            quantity,
            exchange: level.exchange,
        });
        remaining -= quantity;
    }
    fills
}

async fn run_order(
    db: Arc<Database>,
    mut stream: ConsolidatedStream,
    order_id: String,
    request: TwapRequest,
    progress: Option<ProgressCallback>,
) {
    let slices = request.duration_seconds;
    let slice_quantity = request.total_quantity / Decimal::from(slices);

    let mut total_executed = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    let mut lots_count: i64 = 0;
    let mut status = "executing";

    for slice in 1..=slices {
        sleep(Duration::from_secs(1)).await;

        // A stalled fetch yields an empty book; the slice is skipped and
        // the schedule keeps its pace.
        let snapshot = match timeout(SNAPSHOT_TIMEOUT, stream.next()).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) | Err(_) => ConsolidatedSnapshot::default(),
        };

        // The last slice absorbs the division residue.
        let quantity = if slice == slices {
            request.total_quantity - slice_quantity * Decimal::from(slices - 1)
        } else {
            slice_quantity
        };

        let fills = plan_fills(&snapshot, request.side, request.limit_price, quantity);
        for fill in &fills {
            let timestamp = Utc::now().to_rfc3339();
            if let Err(e) = db.append_execution(
                &order_id,
                &request.symbol,
                request.side,
                fill.quantity,
                fill.price,
                fill.exchange,
                &timestamp,
            ) {
                warn!(order_id = %order_id, error = %e, "failed to persist execution");
            }
            total_executed += fill.quantity;
            total_cost += fill.price * fill.quantity;
            lots_count += 1;
        }

        if slice == slices {
            status = "completed";
        }

        let avg_execution_price = if total_executed > Decimal::ZERO {
            total_cost / total_executed
        } else {
            Decimal::ZERO
        };
        let percent_executed = total_executed / request.total_quantity * Decimal::from(100);

        let state = OrderStateUpdate {
            status: status.to_string(),
            percent_exec: percent_executed,
            avg_exec_price: avg_execution_price,
            lots_count,
            total_exec: total_executed,
        };
        if let Err(e) = db.update_parent_state(&order_id, &state) {
            warn!(order_id = %order_id, error = %e, "failed to persist order state");
        }

        if let Some(callback) = &progress {
            callback(TwapProgress {
                order_id: order_id.clone(),
                status: status.to_string(),
                total_executed,
                avg_execution_price,
                percent_executed,
                lots_count,
            });
        }
    }

    info!(
        order_id = %order_id,
        executed = %total_executed,
        lots = lots_count,
        "TWAP order completed"
    );
}
