//! Axum routes: `/health` and the `/ws` scan socket.

use crate::core::config::EngineConfig;
use crate::core::errors::Result;
use crate::models::event::{ScanEvent, ScanRequest};
use crate::services::scan::session::ScanEngine;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct AppState {
    pub config: EngineConfig,
}

pub fn build_router(config: EngineConfig) -> Router {
    let state = Arc::new(AppState { config });
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "dirsize",
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, config))
}

async fn handle_socket(socket: WebSocket, config: EngineConfig) {
    let (sender, receiver) = socket.split();
    run_session(receiver, sender, config).await;
}

/// Drives one client: frames from `incoming` become engine requests and
/// every engine event goes to `outgoing` as a JSON text frame. One engine
/// per connection; the end of `incoming` cancels whatever it was scanning.
pub async fn run_session<R, W, E>(mut incoming: R, mut outgoing: W, config: EngineConfig)
where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    W: Sink<Message> + Unpin + Send + 'static,
    E: std::fmt::Display,
{
    let (engine, mut events) = match ScanEngine::new(config) {
        Ok(pair) => pair,
        Err(err) => {
            warn!(error = %err, "cannot create scan engine");
            return;
        }
    };
    info!("client connected");

    let mut forward = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match encode_event(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "cannot encode event");
                    continue;
                }
            };
            if outgoing.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = incoming.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "socket read failed");
                break;
            }
        };
        match serde_json::from_str::<ScanRequest>(&text) {
            Ok(request) => {
                debug!(?request, "request");
                if let Err(err) = engine.handle(request) {
                    engine.report(err.to_string());
                }
            }
            Err(err) => engine.report(format!("invalid request: {err}")),
        }
    }

    engine.cancel_scan();
    drop(engine);
    // Flush what was already queued; cancelled scans stop emitting.
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut forward).await.is_err() {
        forward.abort();
    }
    info!("client disconnected");
}

/// Encodes an event exactly as it goes out on the socket.
pub fn encode_event(event: &ScanEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

pub async fn serve(addr: SocketAddr, config: EngineConfig) -> Result<()> {
    config.validate()?;
    let router = build_router(config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    eprintln!("dirsize server listening on ws://{addr}/ws");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    eprintln!("\nShutting down gracefully...");
}
