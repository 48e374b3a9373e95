//! API route definitions.

use axum::{Router, routing::get};
use log::{info, warn};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Tracing layer with request timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let mut router = Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/assets/{name}", get(handlers::asset))
        // Editor (host) stream
        .route("/create", get(handlers::create_session))
        // Human-facing pages
        .route("/connect/{id}", get(handlers::connect_page))
        .route("/join/{id}", get(handlers::join_page))
        // Viewer (listener) stream
        .route("/ws/{id}", get(handlers::listen));

    match state.config.server.public_dir_path() {
        Ok(Some(dir)) if dir.is_dir() => {
            info!("Serving static files from {}", dir.display());
            router = router.nest_service("/public", ServeDir::new(dir));
        }
        Ok(Some(dir)) => warn!("Public directory {} does not exist, skipping", dir.display()),
        Ok(None) => {}
        Err(e) => warn!("Ignoring public_dir: {:#}", e),
    }

    router
        .fallback(handlers::not_found)
        .layer(CorsLayer::permissive())
        .layer(trace_layer)
        .with_state(state)
}
