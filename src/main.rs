//! Round-time wagering engine — service entrypoint.
//!
//! Wires the collaborators (storage, ledger, distributed locks, risk,
//! settlement, snapshots, the simulated market feed) into a `RoundEngine`
//! and exposes it over the HTTP/WS boundary in `api::routes`.

mod api;
mod config;
mod db;
mod errors;
mod events;
mod house_pool;
mod ledger;
mod lock_manager;
mod market_feed;
mod middleware;
mod models;
mod multiplier;
mod rate_limiter;
mod risk_manager;
mod round_engine;
mod settlement;
mod snapshot_buffer;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Db;
use crate::events::EVENT_CHANNEL_CAPACITY;
use crate::house_pool::{HousePool, SqliteHousePool};
use crate::ledger::{Ledger, SqliteLedger};
use crate::lock_manager::{LockManager, RedisLockManager};
use crate::market_feed::{DeterministicFeed, MarketFeed};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::risk_manager::{RedisRiskManager, RiskManager};
use crate::round_engine::RoundEngineHandle;
use crate::settlement::SettlementService;
use crate::snapshot_buffer::InMemorySnapshotBuffer;

#[derive(Clone)]
pub struct AppState {
    pub round_engine: RoundEngineHandle,
    pub ledger: Arc<dyn Ledger>,
    pub events: events::EventSender,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rowtime_engine=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env());
    info!(asset = %config.asset, port = config.port, "starting round engine");

    let db = Db::open(&config.database_path).context("failed to open database")?;

    let house_pool = SqliteHousePool::new(db.clone());
    house_pool
        .bootstrap(&config.asset, config.house_pool_balance_cents)
        .await
        .context("failed to bootstrap house pool")?;

    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::new(db.clone()));

    let lock_manager: Arc<dyn LockManager> = Arc::new(
        RedisLockManager::connect(&config.redis_url)
            .await
            .context("failed to connect lock manager to redis")?,
    );

    let risk_manager: Arc<dyn RiskManager> = Arc::new(
        RedisRiskManager::connect(&config.redis_url)
            .await
            .context("failed to connect risk manager to redis")?,
    );

    let rate_limiter_redis = if config.rate_limit_redis_enabled {
        match redis::Client::open(config.redis_url.as_str()) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!(error = %e, "rate limiter redis connect failed, falling back to in-memory");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "rate limiter redis url invalid, falling back to in-memory");
                None
            }
        }
    } else {
        None
    };

    let rate_limiter = Arc::new(RateLimiter::new(
        RateLimiterConfig {
            window_ms: 1_000,
            max_requests: config.max_bets_per_second,
            redis_enabled: config.rate_limit_redis_enabled,
            redis_key_prefix: config.rate_limit_redis_prefix.clone(),
        },
        rate_limiter_redis,
    ));

    let snapshot_buffer = Arc::new(InMemorySnapshotBuffer::new(
        db.clone(),
        config.max_snapshot_queue,
        config.snapshot_flush_batch_size,
        config.snapshot_flush_retry_base_ms,
        config.snapshot_flush_retry_max_ms,
    ));

    let (events_tx, _) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let settlement = SettlementService::spawn(db.clone(), events_tx.clone());

    let market_feed = DeterministicFeed::new(0.0);
    spawn_simulated_feed(market_feed.clone(), config.redis_sample_ms);

    let handle = round_engine::spawn(
        config.clone(),
        db.clone(),
        ledger.clone(),
        lock_manager.clone(),
        risk_manager.clone(),
        rate_limiter.clone(),
        snapshot_buffer.clone(),
        settlement.clone(),
        market_feed.clone() as Arc<dyn MarketFeed>,
        events_tx.clone(),
    );

    handle.start_auto_round(config.betting_duration_ms + config.max_duration_ms);

    let state = AppState {
        round_engine: handle.clone(),
        ledger: ledger.clone(),
        events: events_tx.clone(),
    };

    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/ws", get(api::ws_handler))
        .route("/webhooks/recharge", post(api::recharge_webhook))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            crate::middleware::request_logging_simple,
        ))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.context("failed to bind listener")?;
    info!(%addr, "round engine listening");

    let shutdown_handle = handle.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_handle.stop();
        })
        .await
        .context("server error")?;

    Ok(())
}

/// Stands in for the real upstream market feed (out of scope): a random
/// walk around an arbitrary starting price, sampled at `REDIS_SAMPLE_MS`.
/// The round engine only ever sees the `MarketFeed` trait, so swapping this
/// for a real exchange feed is a one-line change at the call site above.
fn spawn_simulated_feed(feed: Arc<DeterministicFeed>, sample_ms: u64) {
    tokio::spawn(async move {
        let mut price: f64 = 60_000.0;
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(sample_ms.max(1)));
        loop {
            interval.tick().await;
            let drift: f64 = rand::random::<f64>() - 0.5;
            price += drift * 4.0;
            if price < 1.0 {
                price = 1.0;
            }
            let now_ms = chrono::Utc::now().timestamp_millis();
            feed.push_tick(price, now_ms);
        }
    });
}
