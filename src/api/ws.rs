// =============================================================================
// WebSocket Handler — typed push feed
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive every feed message as JSON:
// reality_update, market_update, trade_event, final_update, audit_event.
// Delivery is best effort with no replay: a subscriber that falls behind the
// channel or fails a send is disconnected and may reconnect.
//
// The handler also responds to Ping frames with Pong frames and cleans up on
// disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket subscriber connecting");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single subscriber's lifecycle: forward feed messages, answer
/// pings, drop the connection on any send failure or lag.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut feed = state.broadcaster.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // ── Push loop: forward every feed message ───────────────────
            msg = feed.recv() => {
                match msg {
                    Ok(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialise feed message");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(error = %e, "WebSocket send failed; disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // No replay guarantee: a subscriber that cannot keep
                        // up is dropped rather than blocking the feed.
                        warn!(skipped, "WebSocket subscriber lagged; disconnecting");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        info!("feed channel closed; disconnecting subscriber");
                        break;
                    }
                }
            }

            // ── Recv loop: client frames ────────────────────────────────
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket subscriber disconnected");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/binary/pong from clients carry no meaning here.
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error; disconnecting");
                        break;
                    }
                }
            }
        }
    }

    debug!(
        subscribers = state.broadcaster.subscriber_count().saturating_sub(1),
        "WebSocket cleanup complete"
    );
}
