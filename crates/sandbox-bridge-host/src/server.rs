//! Axum WebSocket endpoint for interactions mounted out of process.

use std::future::Future;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use sandbox_bridge_core::protocol::Envelope;

use crate::bridge::HostBridge;

/// Build the router: `/health` and `/bridge/{interaction_id}`.
pub fn router(bridge: HostBridge) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/bridge/{interaction_id}", get(bridge_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(bridge)
}

/// Start the bridge server and run until Ctrl-C.
pub async fn start_server(bridge: HostBridge, port: u16) -> anyhow::Result<()> {
    serve_with_shutdown(bridge, port, shutdown_signal()).await
}

/// Start the bridge server and run until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(bridge: HostBridge, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind_addr = bridge.state().config.host_bind();
    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Bridge listening on {addr}");

    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn bridge_ws_handler(
    ws: WebSocketUpgrade,
    Path(interaction_id): Path<String>,
    headers: HeaderMap,
    State(bridge): State<HostBridge>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::FORBIDDEN,
                "WebSocket Origin header required".to_string(),
            )
        })?
        .to_string();

    if !bridge.state().origins.allows(&origin) {
        warn!(%origin, %interaction_id, "Rejected bridge upgrade from untrusted origin");
        return Err((StatusCode::FORBIDDEN, "Origin not allowed".to_string()));
    }

    Ok(ws.on_upgrade(move |socket| handle_bridge_socket(bridge, interaction_id, origin, socket)))
}

/// Pump JSON envelopes between the socket and a freshly mounted port.
async fn handle_bridge_socket(bridge: HostBridge, interaction_id: String, origin: String, ws: WebSocket) {
    let (channel_id, port) = match bridge.mount(&interaction_id, &origin).await {
        Ok(mounted) => mounted,
        Err(e) => {
            warn!(%e, "Failed to mount interaction channel");
            return;
        }
    };
    let (client_tx, mut client_rx) = port.split();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = client_rx.recv().await {
            let text = match serde_json::to_string(&frame.envelope) {
                Ok(t) => t,
                Err(e) => {
                    error!(%e, "Failed to serialize envelope");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(text.as_str()) {
                Ok(envelope) => {
                    if client_tx.post(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(%e, "Invalid envelope received"),
            },
            Ok(Message::Close(_)) => {
                debug!(channel_id = %channel_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(channel_id = %channel_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    bridge.unmount(&channel_id).await;
}

async fn health_handler(State(bridge): State<HostBridge>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "channels": bridge.channel_count().await,
        "active": bridge.context().is_active(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(%e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
