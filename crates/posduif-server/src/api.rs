//! HTTP surface: router assembly and shared request state.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use posduif_store::Store;
use posduif_sync::SyncManager;

use crate::auth::AuthKeys;
use crate::config::{Config, CorsConfig};
use crate::events::Publisher;
use crate::handlers;
use crate::sse;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub manager: Arc<SyncManager>,
    pub publisher: Publisher,
    pub auth: AuthKeys,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/enrollment/create", post(handlers::enrollment::create))
        .route(
            "/api/enrollment/complete",
            post(handlers::enrollment::complete),
        )
        .route("/api/enrollment/{token}", get(handlers::enrollment::details))
        .route(
            "/api/messages",
            get(handlers::messages::list).post(handlers::messages::create),
        )
        .route(
            "/api/messages/unread-count",
            get(handlers::messages::unread_count),
        )
        .route("/api/messages/{id}", get(handlers::messages::get))
        .route("/api/messages/{id}/read", put(handlers::messages::mark_read))
        .route("/api/users", get(handlers::users::list))
        .route("/api/users/{id}", get(handlers::users::get))
        .route("/api/sync/incoming", get(handlers::sync::incoming))
        .route("/api/sync/outgoing", post(handlers::sync::outgoing))
        .route("/api/sync/status", get(handlers::sync::status))
        .layer(TimeoutLayer::new(state.config.sse.request_timeout()))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    // SSE streams live outside the request timeout.
    let streams = Router::new()
        .route("/sse/mobile/{device_id}", get(sse::mobile))
        .route("/sse/web/{user_id}", get(sse::web));

    let mut router = api.merge(streams);
    if state.config.cors.enabled {
        router = router.layer(cors_layer(&state.config.cors));
    }
    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let mut layer = CorsLayer::new().max_age(std::time::Duration::from_secs(config.max_age));

    let methods: Vec<Method> = config
        .allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    layer = layer.allow_methods(methods);

    let headers: Vec<HeaderName> = config
        .allowed_headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();
    layer = layer.allow_headers(headers);

    if config.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = match state.store.health_check().await {
        Ok(()) => "ok",
        Err(_) => "unreachable",
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        store,
    })
}
