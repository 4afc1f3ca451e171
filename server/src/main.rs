//! relayd — chat message relay server.

use std::sync::Arc;

use relayd::config::Config;
use relayd::routes::build_router;
use relayd::state::AppState;
use relayd::store::memory::MemoryStore;
use relayd::store::pg::PgStore;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = Config::from_env();

    // Tracing.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("relayd starting");
    info!(listen = %config.listen_addr, handshake_timeout = ?config.handshake_timeout);

    let secret = config
        .jwt_secret
        .clone()
        .expect("JWT_SECRET must be set");

    // ── Storage ─────────────────────────────────────────────
    let state = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(url)
                .await
                .expect("failed to connect to Postgres");
            let store = PgStore::new(pool);

            info!("running migrations");
            store.migrate().await.expect("migration failed");
            info!("database ready");

            AppState::new(config.clone(), secret.as_bytes(), Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store (messages are not durable)");
            AppState::new(config.clone(), secret.as_bytes(), Arc::new(MemoryStore::new()))
        }
    };

    // ── Routes ──────────────────────────────────────────────
    let app = build_router(state);

    // ── Bind & serve ────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "relayd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    info!("relayd stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
