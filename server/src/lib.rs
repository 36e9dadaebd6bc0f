pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod streaming;
pub mod validation;

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::state::AppState;

/// All routes, served both at the root and under `/api`.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    let api = Router::new()
        .route("/health", get(routes::health_check))
        .route("/healthz", get(routes::health_check))
        .route("/books", get(routes::list_books))
        .route("/books/{book}/chapters", get(routes::list_chapters))
        .route("/books/{book}/chapters/{chapter}", get(routes::chapter_status))
        .route("/books/{book}/chapters/{chapter}/synthesize", post(routes::synthesize))
        .route("/books/{book}/chapters/{chapter}/abort", post(routes::abort))
        .route("/books/{book}/chapters/{chapter}/audio", get(streaming::chapter_audio))
        .route("/books/{book}/chapters/{chapter}/stream", get(streaming::stream_chapter))
        .route("/books/{book}/chapters/{chapter}/chunks/{index}", get(streaming::chunk))
        .route("/books/{book}/chapters/{chapter}/live", get(streaming::live))
        .route(
            "/books/{book}/playback",
            get(routes::get_playback).delete(routes::clear_playback),
        )
        .route("/books/{book}/cache", delete(routes::purge_cache))
        .route("/metrics", get(routes::metrics_endpoint))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_metrics));

    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(middleware::from_fn(add_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// Request ID middleware for tracing
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = value.clone() {
        request.headers_mut().insert("x-request-id", value);
    }
    let mut response = next.run(request).await;
    if let Some(value) = value {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = Instant::now();
    let response = next.run(request).await;
    state.metrics.record(
        &route,
        started.elapsed().as_millis() as u64,
        response.status().is_server_error(),
    );
    response
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [
        axum::http::Method::GET,
        axum::http::Method::POST,
        axum::http::Method::DELETE,
        axum::http::Method::OPTIONS,
    ];
    let base = CorsLayer::new()
        .allow_methods(methods)
        .allow_headers(tower_http::cors::Any)
        .expose_headers(tower_http::cors::Any)
        .allow_credentials(false);

    match &config.cors_allowed_origins {
        Some(allowed) => {
            let origins: Vec<HeaderValue> = allowed
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect();
            if origins.is_empty() {
                warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
                base.allow_origin(tower_http::cors::Any)
            } else {
                info!("CORS configured for {} origin(s)", origins.len());
                base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
            }
        }
        None => {
            warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
            base.allow_origin(tower_http::cors::Any)
        }
    }
}
