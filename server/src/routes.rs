//! HTTP surface: WebSocket endpoint, liveness, presence lookup.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, Request};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{warn, Span};

use crate::auth::UserId;
use crate::state::AppState;
use crate::ws;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/presence/{user_id}", get(presence))
        .layer(cors_layer(&state.config.cors_origin))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Request span without the query string: `/ws?token=` carries a credential.
fn request_span(req: &Request<Body>) -> Span {
    tracing::debug_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        version = ?req.version(),
    )
}

fn cors_layer(origin: &str) -> CorsLayer {
    match origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET]),
        Err(_) => {
            warn!(origin, "invalid CORS_ORIGIN, cross-origin requests disabled");
            CorsLayer::new()
        }
    }
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    user_id: UserId,
    online: bool,
    connections: usize,
}

async fn presence(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> Json<PresenceResponse> {
    let connections = state.relay.registry().connections_for(user_id).len();
    Json(PresenceResponse {
        user_id,
        online: connections > 0,
        connections,
    })
}
