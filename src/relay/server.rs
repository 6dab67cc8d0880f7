//! HTTP server and routing for the relay: health and version probes, the
//! extension and client WebSocket upgrade points, the recording API, and the
//! loopback shutdown endpoint used for port takeover.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::time::Duration;
use uuid::Uuid;

use crate::protocol::types::CLOSE_SERVER_STALL;

use super::hub::{HubHandle, HubMsg};
use super::recording::{RecorderHandle, StartRequest};
use super::session::{SocketOut, SocketRoute};

/// How long a single client socket write may stall before the client is
/// closed with 1011.
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay server settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required from non-loopback clients (remote mode).
    pub token: Option<String>,
    /// Origin prefix accepted on `/extension` upgrades.
    pub extension_origin: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: super::ownership::DEFAULT_RELAY_PORT,
            token: None,
            extension_origin: "chrome-extension://".into(),
        }
    }
}

/// Shared state for all routes.
#[derive(Clone)]
pub struct RelayState {
    pub hub: HubHandle,
    pub recorder: RecorderHandle,
    config: Arc<RelayConfig>,
    shutdown: Arc<Notify>,
}

impl RelayState {
    #[must_use]
    pub fn new(hub: HubHandle, recorder: RecorderHandle, config: RelayConfig) -> Self {
        Self {
            hub,
            recorder,
            config: Arc::new(config),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

/// Create the axum router for the relay.
#[must_use]
pub fn create_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/version", get(version))
        .route("/extension", get(extension_upgrade))
        .route("/cdp", get(client_root_upgrade))
        .route("/cdp/{session_id}", get(client_session_upgrade))
        .route("/recording/start", post(recording_start))
        .route("/recording/stop", post(recording_stop))
        .route("/recording/status", get(recording_status))
        .route("/recording/cancel", post(recording_cancel))
        .route("/mcp-log", post(mcp_log))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Serve the relay until shutdown (signal or `/shutdown`).
///
/// # Errors
///
/// Returns an I/O error if the listener cannot be driven.
pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    let hub = state.hub.clone();
    let shutdown = state.shutdown.clone();
    let app = create_router(state);
    tracing::info!(addr = %listener.local_addr()?, "relay listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            () = shutdown.notified() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        hub.shutdown().await;
    })
    .await
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Gate for client endpoints: loopback peers always pass; remote peers need
/// the bearer token.
fn client_authorized(state: &RelayState, addr: SocketAddr, headers: &HeaderMap) -> bool {
    if addr.ip().is_loopback() {
        return true;
    }
    let Some(token) = &state.config.token else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {token}"))
}

/// Gate for the extension endpoint: a browser extension always sends an
/// Origin header, which must match the configured origin. Native peers
/// without an Origin are accepted from loopback only.
fn extension_authorized(state: &RelayState, addr: SocketAddr, headers: &HeaderMap) -> bool {
    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => origin_matches(origin, &state.config.extension_origin),
        None => addr.ip().is_loopback(),
    }
}

/// Whether an Origin header value matches the configured extension origin.
///
/// The configured value may be a bare scheme prefix
/// (`chrome-extension://`, accepting any extension id) or a full origin.
/// Either way the header has to parse as a URL.
fn origin_matches(origin: &str, expected: &str) -> bool {
    if url::Url::parse(origin).is_err() {
        return false;
    }
    origin.starts_with(expected)
}

// ---------------------------------------------------------------------------
// Plain HTTP routes
// ---------------------------------------------------------------------------

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn version() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn recording_start(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<StartRequest>,
) -> Response {
    if !client_authorized(&state, addr, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    axum::Json(state.recorder.start(request).await).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionSelector {
    session_id: Option<String>,
}

async fn recording_stop(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Json(selector): axum::Json<SessionSelector>,
) -> Response {
    if !client_authorized(&state, addr, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    axum::Json(state.recorder.stop(selector.session_id).await).into_response()
}

async fn recording_status(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(selector): Query<SessionSelector>,
) -> Response {
    if !client_authorized(&state, addr, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    axum::Json(state.recorder.status(selector.session_id).await).into_response()
}

async fn recording_cancel(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Json(selector): axum::Json<SessionSelector>,
) -> Response {
    if !client_authorized(&state, addr, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    axum::Json(state.recorder.cancel(selector.session_id).await).into_response()
}

#[derive(Debug, Deserialize)]
struct LogSinkEntry {
    level: Option<String>,
    message: Option<serde_json::Value>,
}

/// Log sink for sibling processes; lines land in the relay's own log.
async fn mcp_log(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Json(entry): axum::Json<LogSinkEntry>,
) -> StatusCode {
    if !client_authorized(&state, addr, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let message = entry.message.unwrap_or(serde_json::Value::Null);
    match entry.level.as_deref() {
        Some("error") => tracing::error!(target: "sibling", %message),
        Some("warn") => tracing::warn!(target: "sibling", %message),
        Some("debug") => tracing::debug!(target: "sibling", %message),
        _ => tracing::info!(target: "sibling", %message),
    }
    StatusCode::NO_CONTENT
}

/// Loopback-only eviction: a newer relay asks this one to leave the port.
async fn shutdown(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> StatusCode {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN;
    }
    tracing::info!(peer = %addr, "shutdown requested, releasing port");
    state.shutdown.notify_waiters();
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// WebSocket routes
// ---------------------------------------------------------------------------

async fn extension_upgrade(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !extension_authorized(&state, addr, &headers) {
        tracing::warn!(peer = %addr, "extension upgrade rejected");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| run_extension_socket(socket, state.hub))
}

async fn client_root_upgrade(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !client_authorized(&state, addr, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| run_client_root_socket(socket, state.hub))
}

async fn client_session_upgrade(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if !client_authorized(&state, addr, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| run_client_session_socket(socket, state.hub, session_id))
}

/// Pump the single extension socket: writer drains the hub's outbound queue,
/// reader feeds frames back tagged with this socket's generation.
async fn run_extension_socket(socket: WebSocket, hub: HubHandle) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SocketOut>();
    let generation = hub.extension_open(out_tx).await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                SocketOut::Frame(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SocketOut::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                hub.send(HubMsg::ExtensionFrame {
                    generation,
                    text: text.to_string(),
                })
                .await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.send(HubMsg::ExtensionClosed { generation }).await;
    writer.abort();
}

async fn run_client_root_socket(socket: WebSocket, hub: HubHandle) {
    let client_id = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<SocketOut>();
    hub.send(HubMsg::ClientOpen {
        client_id,
        tx: out_tx,
    })
    .await;

    let (sink, mut stream) = socket.split();
    let writer = spawn_client_writer(sink, out_rx, hub.clone(), client_id);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                hub.send(HubMsg::ClientFrame {
                    client_id,
                    route: SocketRoute::Root,
                    text: text.to_string(),
                })
                .await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.send(HubMsg::ClientClosed { client_id }).await;
    writer.abort();
}

async fn run_client_session_socket(socket: WebSocket, hub: HubHandle, session_id: String) {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<SocketOut>();
    let (sink, mut stream) = socket.split();

    // The URL carries only the session id; the hub picks the client session
    // to bind to and closes the queue when the session is unknown.
    let Some(client_id) = hub.session_open(session_id.clone(), out_tx).await else {
        let mut sink = sink;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: crate::protocol::types::CLOSE_NORMAL,
                reason: "unknown session".into(),
            })))
            .await;
        return;
    };
    let writer = spawn_client_writer(sink, out_rx, hub.clone(), client_id);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                hub.send(HubMsg::ClientFrame {
                    client_id,
                    route: SocketRoute::Session(session_id.clone()),
                    text: text.to_string(),
                })
                .await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.send(HubMsg::SessionClosed {
        client_id,
        session_id,
    })
    .await;
    writer.abort();
}

/// Writer task shared by client sockets: enforces the stall deadline and
/// reports a stalled client to the hub.
fn spawn_client_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<SocketOut>,
    hub: HubHandle,
    client_id: Uuid,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                SocketOut::Frame(text) => {
                    let result = tokio::time::timeout(
                        CLIENT_WRITE_TIMEOUT,
                        sink.send(Message::Text(text.into())),
                    )
                    .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break,
                        Err(_) => {
                            let close = sink.send(Message::Close(Some(CloseFrame {
                                code: CLOSE_SERVER_STALL,
                                reason: "write stalled".into(),
                            })));
                            let _ = tokio::time::timeout(Duration::from_secs(1), close).await;
                            hub.send(HubMsg::ClientStalled { client_id }).await;
                            break;
                        }
                    }
                }
                SocketOut::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_prefix_accepts_any_extension_id() {
        assert!(origin_matches(
            "chrome-extension://abcdefghijklmnop",
            "chrome-extension://"
        ));
        assert!(!origin_matches("https://evil.example", "chrome-extension://"));
    }

    #[test]
    fn full_origin_must_match_exactly() {
        let expected = "chrome-extension://abcdefghijklmnop";
        assert!(origin_matches("chrome-extension://abcdefghijklmnop", expected));
        assert!(!origin_matches("chrome-extension://qrstuvwxyz", expected));
    }

    #[test]
    fn unparseable_origin_is_rejected() {
        assert!(!origin_matches("chrome-extension", "chrome-extension"));
        assert!(!origin_matches("", ""));
    }
}
