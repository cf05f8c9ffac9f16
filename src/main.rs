//! Twap-Trading-API server binary.
//!
//! Wires the venue registry, subscription hub, TWAP engine and repository
//! together and serves the HTTP/WebSocket surface.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use twap_trading_api::{
    api::{self, AppState},
    auth::JwtHandler,
    db::Database,
    exchanges::ExchangeRegistry,
    hub::Hub,
    models::Config,
    twap::TwapEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let config = Config::from_env();
    info!("🚀 Twap-Trading-API starting");

    let db = Arc::new(Database::new(&config.db_path).context("Failed to open database")?);
    info!("📊 Database initialized at: {}", config.db_path);

    let registry = Arc::new(ExchangeRegistry::from_config(&config));
    info!(exchanges = ?registry.names(), "🏛️  Exchange registry ready");

    let hub = Hub::new(registry.clone());
    let twap = TwapEngine::new(db.clone(), registry.clone());
    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));

    let state = AppState {
        db,
        registry,
        hub,
        twap,
        jwt,
    };
    let app = api::router(state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("🎯 API server listening on {}", config.listen_addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twap_trading_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
