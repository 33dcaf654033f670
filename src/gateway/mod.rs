//! Gateway worker: device socket plus the HTTP surface.
//!
//! Terminates the device's bidirectional socket at `/ws`, routes inbound
//! audio into the pipeline, and serves liveness, health and metrics
//! endpoints. Socket pings stay disabled so the connection survives long
//! synthesis playback.

pub mod routing;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::StreamBus;
use crate::config::GatewaySettings;
use crate::error::{PipelineError, Result};
use crate::metrics::metrics;

use routing::AudioRouter;
use session::ConnectionManager;

/// Single device of the alpha deployment; overridable per connection with
/// the `device_id` query parameter.
const DEFAULT_DEVICE_ID: &str = "companion-001";

/// Maximum socket frame: 10 MiB covers the longest utterance comfortably.
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Shared state behind the HTTP handlers.
pub struct GatewayState {
    bus: StreamBus,
    connections: Arc<ConnectionManager>,
    router: Arc<AudioRouter>,
}

/// Run the gateway until shutdown.
///
/// # Errors
///
/// Returns an error if the bus is unreachable or the listener cannot bind.
pub async fn run(settings: &GatewaySettings, shutdown: CancellationToken) -> Result<()> {
    info!(host = %settings.host, port = settings.port, "gateway_starting");

    let bus = StreamBus::connect(&settings.base.redis_url).await?;
    metrics().set_component_health("redis", true);

    let connections = Arc::new(ConnectionManager::new());
    let router = Arc::new(AudioRouter::new(bus.clone()));

    // Response listener drains audio.outbound for the device.
    let listener_task = tokio::spawn(Arc::clone(&router).listen_for_responses(
        Arc::clone(&connections),
        shutdown.clone(),
    ));

    let state = Arc::new(GatewayState {
        bus,
        connections,
        router,
    });

    let app = axum::Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let listener = TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .map_err(|e| PipelineError::Gateway(format!("bind failed: {e}")))?;

    info!("gateway_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| PipelineError::Gateway(format!("serve failed: {e}")))?;

    info!("gateway_stopping");
    match listener_task.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "response_listener_panicked"),
    }
    info!("gateway_stopped");
    Ok(())
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "hearth-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<Arc<GatewayState>>) -> Response {
    let redis_ok = state.bus.health_check().await;
    let body = Json(serde_json::json!({
        "status": if redis_ok { "healthy" } else { "unhealthy" },
        "service": "gateway",
        "redis": redis_ok,
        "device_connected": state.connections.is_connected(),
    }));

    if redis_ok {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

async fn metrics_text() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics().render(),
    )
        .into_response()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let device_id = params
        .get("device_id")
        .cloned()
        .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_owned());

    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, device_id))
}

/// Streaming-path text frame from the device.
#[derive(Debug, Deserialize)]
struct AudioStreamFrame {
    #[serde(rename = "type")]
    kind: String,
    audio: String,
    #[serde(default = "default_streaming")]
    is_streaming: bool,
}

fn default_streaming() -> bool {
    true
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, device_id: String) {
    let (session, mut outbound_rx, closer) = state.connections.connect(&device_id);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            // Replaced by a newer connection for this device.
            () = closer.cancelled() => {
                let _ = sink.close().await;
                break;
            }

            outbound = outbound_rx.recv() => match outbound {
                Some(frame) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(pcm))) => {
                    // Whole-utterance path: the client did its own VAD.
                    if let Err(e) = state
                        .router
                        .route_audio(&device_id, &session.session_id, pcm.to_vec(), false)
                        .await
                    {
                        error!(error = %e, "audio_route_failed");
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    handle_text_frame(&state, &device_id, &session.session_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong, nothing to do
                Some(Err(e)) => {
                    warn!(error = %e, "socket_receive_error");
                    break;
                }
            },
        }
    }

    state.router.forget_session(&session.session_id);
    state.connections.disconnect(&session.session_id);
}

async fn handle_text_frame(
    state: &Arc<GatewayState>,
    device_id: &str,
    session_id: &str,
    text: &str,
) {
    let frame: AudioStreamFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "unrecognized_text_frame");
            return;
        }
    };

    if frame.kind != "audio_stream" {
        debug!(kind = %frame.kind, "unsupported_frame_type");
        return;
    }

    let pcm = match STANDARD.decode(frame.audio.as_bytes()) {
        Ok(pcm) => pcm,
        Err(e) => {
            warn!(error = %e, "audio_frame_decode_error");
            return;
        }
    };

    if let Err(e) = state
        .router
        .route_audio(device_id, session_id, pcm, frame.is_streaming)
        .await
    {
        error!(error = %e, "audio_route_failed");
    }
}
