//! Test utilities and common setup.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures::StreamExt;
use mirror::api::{self, AppState};
use mirror::config::AppConfig;
use mirror::Envelope;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Config suitable for tests: plain `ws` links, everything else default.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.public.ws_scheme = "ws".to_string();
    config
}

/// Create a router without binding a socket.
pub fn test_app() -> (Router, AppState) {
    let state = AppState::new(test_config());
    (api::create_router(state.clone()), state)
}

/// Serve `state` on an ephemeral local port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Read the next text frame as an envelope, skipping control frames.
pub async fn next_envelope(client: &mut Client) -> Envelope {
    loop {
        let msg = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return Envelope::from_json(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Wait until the server closes `client`.
pub async fn expect_closed(client: &mut Client) {
    loop {
        let msg = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
    }
}
