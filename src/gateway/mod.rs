//! Client ingress: terminates WebSockets and bridges each socket onto the
//! bus. One connection maps to two subjects: binary frames fan out on
//! `audio.raw.{session_id}`, and everything published on
//! `ui.commands.{session_id}` is forwarded back verbatim.

use crate::audit::{self, AuditEvent};
use crate::bus::MessageBus;
use crate::config::GatewayConfig;
use crate::error::AppResult;
use crate::events::{subjects, CallEnded, ControlMessage};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Active WebSocket sessions across the process.
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// WebSocket close code for a failed or missing handshake.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

pub fn active_connections() -> usize {
    ACTIVE_CONNECTIONS.load(Ordering::Relaxed)
}

#[derive(Clone)]
pub struct GatewayState {
    pub bus: Arc<dyn MessageBus>,
    pub cfg: GatewayConfig,
}

pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/stream", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until shutdown is signalled.
pub async fn serve(
    state: GatewayState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> AppResult<()> {
    let addr = format!("{}:{}", state.cfg.host, state.cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr, "Gateway listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| crate::error::AppError::Internal(e.to_string()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "active_connections": active_connections(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Session ids derive from the handshake; opaque to everything downstream.
fn assign_session_id(client_version: &str) -> String {
    format!("session_{client_version}")
}

async fn close_policy_violation(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "handshake failed".into(),
        })))
        .await;
}

/// Await and validate the handshake frame within the configured deadline.
async fn perform_handshake(socket: &mut WebSocket, cfg: &GatewayConfig) -> Option<String> {
    let deadline = Duration::from_secs(cfg.handshake_timeout_secs);
    let first = match tokio::time::timeout(deadline, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            warn!("Handshake failed: first frame was not text");
            close_policy_violation(socket).await;
            return None;
        }
        Err(_) => {
            warn!(timeout_secs = cfg.handshake_timeout_secs, "Handshake timed out");
            close_policy_violation(socket).await;
            return None;
        }
    };

    let handshake: ControlMessage = match serde_json::from_str(first.as_str()) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Handshake failed: unparseable frame");
            close_policy_violation(socket).await;
            return None;
        }
    };

    let ControlMessage::Handshake {
        token,
        client_version,
        audio_config,
    } = handshake
    else {
        warn!("Handshake failed: wrong message type");
        close_policy_violation(socket).await;
        return None;
    };

    // Token validation is opaque here; empty means unauthenticated.
    if token.trim().is_empty() {
        warn!("Handshake rejected: empty token");
        close_policy_violation(socket).await;
        return None;
    }

    let session_id = assign_session_id(&client_version);
    debug!(session_id, sample_rate = audio_config.sample_rate, "Audio config negotiated");

    let ack = ControlMessage::HandshakeAck {
        session_id: session_id.clone(),
        reconnect_token: None,
    };
    let ack_json = match serde_json::to_string(&ack) {
        Ok(json) => json,
        Err(_) => return None,
    };
    if socket.send(Message::Text(ack_json.into())).await.is_err() {
        return None;
    }
    Some(session_id)
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);

    let result = async {
        let session_id = perform_handshake(&mut socket, &state.cfg).await?;
        info!(session_id, "Session established");
        audit::emit(
            &state.bus,
            AuditEvent::new("gateway", "SESSION_START").with_resource(&session_id),
        )
        .await;
        Some(session_id)
    }
    .await;

    let Some(session_id) = result else {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        return;
    };

    // Backend -> client channel. Private subscription, bounded buffer;
    // overflow drops the oldest queued UI command.
    let ui_subject = subjects::ui_commands(&session_id);
    let mut ui_sub = match state
        .bus
        .subscribe(&ui_subject, None, state.cfg.ui_buffer)
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            warn!(session_id, error = %e, "UI command subscription failed, closing client");
            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    let audio_subject = subjects::audio_raw(&session_id);
    let mut ended = false;

    loop {
        tokio::select! {
            outbound = ui_sub.recv() => {
                match outbound {
                    Some(msg) => {
                        let text = String::from_utf8_lossy(&msg.payload).into_owned();
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                let Some(Ok(frame)) = inbound else { break };
                match frame {
                    Message::Binary(audio) => {
                        // Fire-and-forget; a stale audio frame is not
                        // worth a retry.
                        if let Err(e) = state.bus.publish(&audio_subject, audio).await {
                            warn!(session_id, error = %e, "Audio publish failed, frame dropped");
                        }
                    }
                    Message::Text(text) => {
                        match serde_json::from_str::<ControlMessage>(text.as_str()) {
                            Ok(ControlMessage::Heartbeat) => {}
                            Ok(ControlMessage::Mute) => {
                                debug!(session_id, "Client muted");
                            }
                            Ok(ControlMessage::End { reason }) => {
                                publish_call_ended(
                                    &state.bus,
                                    &session_id,
                                    reason.as_deref().unwrap_or("user_end"),
                                )
                                .await;
                                ended = true;
                                break;
                            }
                            Ok(other) => {
                                debug!(session_id, ?other, "Ignoring unexpected control frame");
                            }
                            Err(_) => {
                                debug!(session_id, "Ignoring unparseable control frame");
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // Cleanup: the subscription drops with this scope; announce the call end
    // exactly once.
    if !ended {
        publish_call_ended(&state.bus, &session_id, "client_disconnect").await;
    }
    audit::emit(
        &state.bus,
        AuditEvent::new("gateway", "SESSION_END").with_resource(&session_id),
    )
    .await;
    ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    info!(session_id, "Session closed");
}

async fn publish_call_ended(bus: &Arc<dyn MessageBus>, session_id: &str, reason: &str) {
    let payload = CallEnded::now(session_id, reason);
    match serde_json::to_vec(&payload) {
        Ok(bytes) => {
            if let Err(e) = bus.publish(subjects::CALL_ENDED, Bytes::from(bytes)).await {
                warn!(session_id, error = %e, "call.ended publish failed");
            }
        }
        Err(e) => warn!(session_id, error = %e, "call.ended serialization failed"),
    }
}
