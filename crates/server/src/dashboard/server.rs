//! axum web server for the operator dashboard.
//!
//! `GET /metrics` returns one JSON snapshot. `GET /status` lists online
//! players and spawn zones. `/ws` upgrades to a WebSocket that pushes a
//! metrics snapshot every 500 ms.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use tokio::net::TcpListener;

use crate::services::Services;

const PUSH_INTERVAL: Duration = Duration::from_millis(500);

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/ws", get(ws_upgrade))
        .with_state(services)
}

/// Start the dashboard web server. Runs until the task is dropped.
pub async fn start(services: Arc<Services>, port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Dashboard failed to bind to {}: {}", addr, e);
            return;
        }
    };
    tracing::info!("Dashboard listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, router(services)).await {
        tracing::error!("Dashboard server error: {}", e);
    }
}

async fn metrics(State(services): State<Arc<Services>>) -> impl IntoResponse {
    Json(super::snapshot(&services))
}

async fn status(State(services): State<Arc<Services>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "sessions": services.sessions.count(),
        "players": services.registry.snapshot(),
        "shutting_down": services.sessions.is_shutting_down(),
        "streamer": {
            "loaded": services.streamer.stats().loaded,
            "viewers": services.streamer.stats().viewers,
        },
        "event_subscribers": services.events.subscriber_count(),
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(services): State<Arc<Services>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, services))
}

/// Push metrics to a connected browser until it goes away.
async fn handle_socket(mut socket: WebSocket, services: Arc<Services>) {
    let mut ticker = tokio::time::interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let msg = serde_json::json!({
                    "type": "metrics",
                    "data": super::snapshot(&services),
                });
                if send_json(&mut socket, &msg).await.is_err() {
                    break;
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    let text = value.to_string();
    socket.send(Message::Text(text.into())).await
}
