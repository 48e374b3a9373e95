//! Request handlers.

use axum::{
    Json,
    extract::{OriginalUri, Path, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
};
use log::{debug, info, warn};
use serde::Serialize;

use crate::hub::split_websocket;
use crate::pages::{Asset, Page};
use crate::urls;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.hub.session_count(),
    })
}

/// GET /
pub async fn index() -> Html<String> {
    Html(Page::Index.render(""))
}

/// Host connection.
///
/// GET /create (WebSocket)
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let host = request_host(&headers)?;
    let request_uri = path_and_query(&uri);
    let scheme = state.config.public.http_scheme.clone();
    let hub = state.hub.clone();

    Ok(ws
        .max_message_size(state.config.server.max_message_size)
        .on_failed_upgrade(|e| warn!("Host upgrade failed: {}", e))
        .on_upgrade(move |socket| async move {
            let (sink, source) = split_websocket(socket);
            let join_url =
                |id: &String| urls::create_to_connect(&scheme, &host, &request_uri, id);
            match hub.create_session(sink, source, join_url).await {
                Ok(id) => debug!("[{}] Host connected", id),
                Err(e) => warn!("Failed to start session: {}", e),
            }
        }))
}

/// Listener connection. Registers before upgrading, so an unknown session is
/// answered with 404 instead of an upgraded socket.
///
/// GET /ws/{id} (WebSocket)
pub async fn listen(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let subscription = state.hub.join_session(&id).await?;

    Ok(ws
        .on_failed_upgrade(|e| warn!("Listener upgrade failed: {}", e))
        .on_upgrade(move |socket| async move {
            // Listeners never send; only the write half is used.
            let (sink, _source) = split_websocket(socket);
            let listener_id = subscription.id();
            let outcome = subscription.deliver(sink).await;
            info!("[{}] {} finished: {:?}", id, listener_id, outcome);
        }))
}

/// Page shown to the host with the shareable join link.
///
/// GET /connect/{id}
pub async fn connect_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
) -> Response {
    if !state.hub.is_alive(&id) {
        return session_not_found(&id);
    }
    let host = match request_host(&headers) {
        Ok(host) => host,
        Err(e) => return e.into_response(),
    };

    let join_url = urls::connect_to_join(
        &state.config.public.http_scheme,
        &host,
        &path_and_query(&uri),
    );
    Html(Page::Connect.render(&join_url)).into_response()
}

/// Page shown to viewers; opens the listener stream.
///
/// GET /join/{id}
pub async fn join_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
) -> Response {
    if !state.hub.is_alive(&id) {
        return session_not_found(&id);
    }
    let host = match request_host(&headers) {
        Ok(host) => host,
        Err(e) => return e.into_response(),
    };

    let stream_url = urls::join_to_ws(
        &state.config.public.ws_scheme,
        &host,
        &path_and_query(&uri),
        &id,
    );
    Html(Page::Join.render(&stream_url)).into_response()
}

/// Viewer client scripts and stylesheet.
///
/// GET /assets/{name}
pub async fn asset(Path(name): Path<String>) -> Response {
    match Asset::from_name(&name) {
        Some(asset) => (
            [
                (header::CONTENT_TYPE, asset.content_type()),
                (header::CACHE_CONTROL, "public, max-age=3600"),
            ],
            asset.body(),
        )
            .into_response(),
        None => ApiError::not_found(format!("No asset named {name}")).into_response(),
    }
}

pub async fn not_found(OriginalUri(uri): OriginalUri) -> ApiError {
    debug!("[404] {}", uri.path());
    ApiError::not_found(format!("No page at {}", uri.path()))
}

fn session_not_found(id: &str) -> Response {
    info!("No session found for {}", id);
    (StatusCode::NOT_FOUND, format!("No session found for {id}")).into_response()
}

fn request_host(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("missing Host header"))
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}
