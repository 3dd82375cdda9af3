//! WebSocket endpoint. `GET /stream` upgrades the connection and runs a
//! subscriber over it until either side closes or the bridge shuts down.

use std::future::ready;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tracing::info;

use super::subscriber::ClientFrame;
use super::NotificationBridge;
use crate::error::Result;

pub fn router(bridge: Arc<NotificationBridge>) -> Router {
    Router::new()
        .route("/stream", get(stream_handler))
        .with_state(bridge)
}

async fn stream_handler(ws: WebSocketUpgrade, State(bridge): State<Arc<NotificationBridge>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

fn client_frame(message: std::result::Result<Message, axum::Error>) -> ClientFrame {
    match message {
        Ok(Message::Text(text)) => ClientFrame::Text(text),
        Ok(Message::Close(_)) | Err(_) => ClientFrame::Close,
        Ok(_) => ClientFrame::Other,
    }
}

async fn handle_socket(socket: WebSocket, bridge: Arc<NotificationBridge>) {
    let subscriber = bridge.subscribe().await;
    subscriber.handshake_complete();

    let (sink, stream) = socket.split();
    let sink = sink.with(|text: String| ready(Ok::<_, axum::Error>(Message::Text(text))));
    let inbound = stream.map(client_frame);

    subscriber.run(sink, inbound, bridge.shutdown_signal()).await;
}

/// Serve `GET /stream` until the bridge shuts down.
pub async fn serve(bridge: Arc<NotificationBridge>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "bridge listening on ws://{addr}/stream");

    let mut shutdown = bridge.shutdown_signal();
    let shutdown_signal = async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    };
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    info!("bridge listener stopped");
    Ok(())
}
