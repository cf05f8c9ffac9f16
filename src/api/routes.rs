//! API route handlers.
//!
//! Everything here is boundary work: decode, authenticate, delegate to the
//! core subsystems, encode. Decimals become floats only at this layer.

use crate::auth::models::{Claims, LoginRequest, RegisterRequest, TokenResponse};
use crate::auth::{auth_middleware, JwtHandler};
use crate::db::{Database, ExecutionRecord, OrderRecord, Role, UserRecord};
use crate::errors::ApiError;
use crate::exchanges::ExchangeRegistry;
use crate::hub::Hub;
use crate::models::{Candle, Interval, Side};
use crate::twap::{TwapEngine, TwapRequest};
use axum::{
    extract::ws::WebSocketUpgrade,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware as axum_mw,
    response::Response,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use chrono::{NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub registry: Arc<ExchangeRegistry>,
    pub hub: Arc<Hub>,
    pub twap: Arc<TwapEngine>,
    pub jwt: Arc<JwtHandler>,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/secure", get(secure))
        .route("/unregister", delete(unregister))
        .route("/users", get(list_users))
        .route("/orders/twap", post(submit_twap))
        .route("/orders", get(get_orders))
        .route("/orders/:order_id", get(get_order_executions))
        .route_layer(axum_mw::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    let public = Router::new()
        .route("/", get(root))
        .route("/ping", get(ping))
        .route("/exchanges", get(get_exchanges))
        .route("/:exchange/symbols", get(get_symbols))
        .route("/klines/:exchange/:symbol", get(get_klines))
        .route("/login", post(login))
        .route("/register", post(register))
        .route("/ws", get(ws_handler))
        .with_state(state);

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(crate::middleware::request_logging))
}

// ---- general ------------------------------------------------------------

async fn root() -> Json<Value> {
    Json(json!({ "message": "Welcome to the Twap-Trading-API" }))
}

async fn ping() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Twap-Trading-API is running",
        "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    }))
}

// ---- market data --------------------------------------------------------

async fn get_exchanges(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "exchanges": state.registry.names() }))
}

async fn get_symbols(
    State(state): State<AppState>,
    Path(exchange): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(venue) = state.registry.get(&exchange) else {
        return Err(ApiError::NotFound("Exchange not available".to_string()));
    };
    let pairs = venue.trading_pairs().await?;
    let mut symbols: Vec<&String> = pairs.keys().collect();
    symbols.sort();
    Ok(Json(json!({ "symbols": symbols })))
}

#[derive(Debug, Deserialize)]
struct KlinesQuery {
    interval: String,
    start_time: String,
    end_time: String,
}

async fn get_klines(
    State(state): State<AppState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<KlinesQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(venue) = state.registry.get(&exchange) else {
        return Err(ApiError::NotFound("Exchange not available".to_string()));
    };

    let interval: Interval = query
        .interval
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let start = parse_naive_utc(&query.start_time)
        .ok_or_else(|| ApiError::BadRequest("invalid start_time".to_string()))?;
    let end = parse_naive_utc(&query.end_time)
        .ok_or_else(|| ApiError::BadRequest("invalid end_time".to_string()))?;
    if start >= end {
        return Err(ApiError::BadRequest(
            "start_time must be before end_time".to_string(),
        ));
    }

    let candles = venue.candles(&symbol, interval, start, end).await?;
    Ok(Json(json!({ "klines": klines_json(&candles) })))
}

fn parse_naive_utc(raw: &str) -> Option<chrono::DateTime<Utc>> {
    raw.parse::<NaiveDateTime>().ok().map(|dt| dt.and_utc())
}

/// Candles keyed by their naive-ISO open time, OHLCV as floats.
fn klines_json(candles: &[Candle]) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for candle in candles {
        map.insert(
            candle.open_time.format("%Y-%m-%dT%H:%M:%S").to_string(),
            json!({
                "Open": dec_f64(candle.open),
                "High": dec_f64(candle.high),
                "Low": dec_f64(candle.low),
                "Close": dec_f64(candle.close),
                "Volume": dec_f64(candle.volume),
            }),
        );
    }
    map
}

// ---- websocket ----------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| crate::hub::handle_socket(socket, state.hub.clone()))
}

// ---- authentication -----------------------------------------------------

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Some(user) = state.db.get_user_by_username(&request.username)? else {
        return Err(ApiError::Unauthenticated("Invalid username".to_string()));
    };
    if state
        .db
        .verify_password(&user.username, &request.password)?
        .is_none()
    {
        return Err(ApiError::Unauthenticated("Invalid password".to_string()));
    }

    let token = state
        .jwt
        .generate_token(&user.username)
        .map_err(ApiError::Internal)?;
    Ok(Json(TokenResponse::bearer(token)))
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.username.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".to_string(),
        ));
    }

    state
        .db
        .create_user(&request.username, &request.password, Role::User)
        .map_err(|e| match e {
            crate::errors::StoreError::Duplicate => {
                ApiError::Duplicate("Username already exists".to_string())
            }
            other => other.into(),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "User correctly registered" })),
    ))
}

async fn secure(Extension(claims): Extension<Claims>) -> Json<Value> {
    Json(json!({
        "message": format!("Hello {}! This is secure data", claims.username),
        "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    }))
}

async fn unregister(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    let user = current_user(&state, &claims)?;
    if user.role == Role::Admin {
        return Err(ApiError::Forbidden(
            "Admin account cannot be unregistered".to_string(),
        ));
    }

    state.db.delete_user(&user.username)?;
    Ok(Json(json!({ "message": "User correctly unregistered" })))
}

async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    let user = current_user(&state, &claims)?;
    if user.role != Role::Admin {
        return Err(ApiError::Forbidden("Admin access required".to_string()));
    }

    let users: Vec<Value> = state
        .db
        .list_users()?
        .into_iter()
        .map(|u| {
            json!({
                "id": u.id,
                "username": u.username,
                "role": u.role.as_str(),
                "created_at": u.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "users": users })))
}

fn current_user(state: &AppState, claims: &Claims) -> Result<UserRecord, ApiError> {
    state
        .db
        .get_user_by_username(&claims.username)?
        .ok_or_else(|| ApiError::Unauthenticated("User no longer exists".to_string()))
}

// ---- orders -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TwapOrderBody {
    symbol: String,
    side: String,
    total_quantity: Decimal,
    limit_price: Decimal,
    duration_seconds: u64,
    exchanges: Vec<String>,
}

async fn submit_twap(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<TwapOrderBody>,
) -> Result<Json<Value>, ApiError> {
    let user = current_user(&state, &claims)?;
    let side: Side = body
        .side
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    let token_id = state.twap.submit(
        &user.id,
        TwapRequest {
            symbol: body.symbol,
            side,
            total_quantity: body.total_quantity,
            limit_price: body.limit_price,
            duration_seconds: body.duration_seconds,
            exchanges: body.exchanges,
        },
    )?;

    Ok(Json(json!({ "token_id": token_id })))
}

#[derive(Debug, Deserialize)]
struct OrdersQuery {
    order_id: Option<String>,
}

async fn get_orders(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let user = current_user(&state, &claims)?;
    let orders = state.db.get_orders(&user.id, query.order_id.as_deref())?;
    Ok(Json(orders.iter().map(order_json).collect()))
}

#[derive(Debug, Deserialize)]
struct ExecutionsQuery {
    symbol: Option<String>,
    side: Option<String>,
}

async fn get_order_executions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(order_id): Path<String>,
    Query(query): Query<ExecutionsQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let user = current_user(&state, &claims)?;
    let side = match query.side.as_deref() {
        Some(raw) => Some(
            raw.parse::<Side>()
                .map_err(|e: String| ApiError::BadRequest(e))?,
        ),
        None => None,
    };

    let executions =
        state
            .db
            .get_executions(&user.id, &order_id, query.symbol.as_deref(), side)?;
    Ok(Json(executions.iter().map(execution_json).collect()))
}

fn dec_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn order_json(order: &OrderRecord) -> Value {
    json!({
        "order_id": order.order_id,
        "user_id": order.user_id,
        "symbol": order.symbol,
        "exchanges": order.exchanges,
        "side": order.side.as_str(),
        "limit_price": dec_f64(order.limit_price),
        "quantity": dec_f64(order.quantity),
        "duration": order.duration,
        "status": order.status,
        "created_at": order.created_at,
        "percent_exec": dec_f64(order.percent_exec),
        "avg_exec_price": dec_f64(order.avg_exec_price),
        "lots_count": order.lots_count,
        "total_exec": dec_f64(order.total_exec),
    })
}

fn execution_json(execution: &ExecutionRecord) -> Value {
    json!({
        "id": execution.id,
        "order_id": execution.order_id,
        "symbol": execution.symbol,
        "side": execution.side.as_str(),
        "quantity": dec_f64(execution.quantity),
        "price": dec_f64(execution.price),
        "exchange": execution.exchange,
        "timestamp": execution.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_naive_utc() {
        let parsed = parse_naive_utc("2025-02-01T00:00:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
        assert!(parse_naive_utc("yesterday").is_none());
    }

    #[test]
    fn test_klines_json_shape() {
        let candles = vec![Candle {
            open_time: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            open: dec!(102429.56),
            high: dec!(102783.71),
            low: dec!(100279.51),
            close: dec!(100635.65),
            volume: dec!(12290.95747),
        }];

        let map = klines_json(&candles);
        let entry = map.get("2025-02-01T00:00:00").unwrap();
        assert_eq!(entry["Open"], 102429.56);
        assert_eq!(entry["High"], 102783.71);
        assert_eq!(entry["Low"], 100279.51);
        assert_eq!(entry["Close"], 100635.65);
        assert_eq!(entry["Volume"], 12290.95747);
    }

    #[test]
    fn test_order_json_uses_floats() {
        let order = OrderRecord {
            order_id: "id-1".to_string(),
            user_id: "u-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            exchanges: vec!["Binance".to_string()],
            side: Side::Buy,
            limit_price: dec!(100000),
            quantity: dec!(0.5),
            duration: 5,
            status: "completed".to_string(),
            created_at: "2025-02-01T00:00:00+00:00".to_string(),
            percent_exec: dec!(100),
            avg_exec_price: dec!(99123.45),
            lots_count: 5,
            total_exec: dec!(0.5),
        };

        let json = order_json(&order);
        assert_eq!(json["side"], "buy");
        assert_eq!(json["quantity"], 0.5);
        assert_eq!(json["percent_exec"], 100.0);
        assert_eq!(json["lots_count"], 5);
    }
}
