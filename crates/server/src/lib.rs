//! Amora realtime core.
//!
//! WebSocket chat and notification delivery: durable history in PostgreSQL,
//! a Redis fan-out cache with pub/sub wake-ups, and per-connection protocol
//! sessions that reconcile the two.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod reconcile;
pub mod session;
pub mod store;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use auth::{mw_require_auth, RedisSessionValidator, SessionValidator};
use cache::{FanoutCache, RedisCache};
use config::{AppState, ServerConfig};
use handlers::{chat_ws, create_chat, delete_chat, get_chats, notifications_ws};
use store::{postgres, PgChatStore, PgNotificationStore};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!("=== Amora Realtime Server ===");

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    postgres::migrate(&pool)
        .await
        .context("failed to apply schema")?;
    info!("Postgres pool ready");

    let redis = RedisCache::connect(&config.redis_url)
        .await
        .context("failed to connect to redis")?;
    let sessions: Arc<dyn SessionValidator> =
        Arc::new(RedisSessionValidator::new(redis.shared_connection()));
    let cache: Arc<dyn FanoutCache> = Arc::new(redis);
    info!("Redis cache ready");

    let chats = Arc::new(PgChatStore::new(
        pool.clone(),
        cache.clone(),
        config.message_cache_len,
        config.message_cache_ttl,
    ));
    let notifications = Arc::new(PgNotificationStore::new(
        pool,
        cache.clone(),
        config.notification_cache_len,
        config.notification_cache_ttl,
    ));

    let state = AppState {
        chats,
        notifications,
        cache,
        sessions,
        config: Arc::new(config.clone()),
    };

    let app = router(state);

    info!("Listening on http://{}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the full router over injected state. Separate from [`run`] so tests
/// can mount it over fakes.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/chats", get(get_chats))
        .route("/chat", post(create_chat).delete(delete_chat))
        .route("/chat/{chat_id}", get(chat_ws))
        .route("/notifications", get(notifications_ws))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            mw_require_auth,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK"
}
