//! The extension-side bridge: one WebSocket to the relay, one debugger
//! connection per consented tab, the target-lifecycle protocol, and the
//! native capture backend for recording controls.

use std::collections::{HashMap, HashSet};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use crate::chrome::{self, TargetInfo};
use crate::error::AppError;
use crate::protocol::envelope::{self, ControlMethod, RelayCommand, parse_relay_command};
use crate::protocol::types::{self, CLOSE_EXTENSION_REPLACED};
use crate::relay::ownership;

use super::debugger::{self, DebuggerHandle, DebuggerNotice};
use super::error::BridgeError;
use super::registry::{TabRecord, TabRegistry};

/// WebSocket handshake timeout for both the relay and tab connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between relay health probes while unreachable.
const HEALTH_POLL: Duration = Duration::from_secs(1);

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub relay_host: String,
    pub relay_port: u16,
    pub chrome_host: String,
    pub chrome_port: u16,
    /// Substring that consented tab URLs must contain. `None` consents to
    /// every ordinary page tab.
    pub url_filter: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay_host: "127.0.0.1".into(),
            relay_port: ownership::DEFAULT_RELAY_PORT,
            chrome_host: "127.0.0.1".into(),
            chrome_port: 9222,
            url_filter: None,
        }
    }
}

/// Why a bridge session over one relay socket ended.
enum SessionEnd {
    /// Closed with 4001: a newer extension took the slot. Do not reconnect.
    Replaced,
    /// Any other loss; reconnect with fresh session ids.
    Lost,
}

/// Run the bridge until it is replaced by another extension.
///
/// Polls the relay's health endpoint, connects, attaches the consented tabs,
/// and services the envelope protocol. On connection loss everything is
/// detached and the cycle restarts; replays allocate fresh session ids.
///
/// # Errors
///
/// Returns `AppError` only for unrecoverable setup failures; connection
/// losses are retried internally.
pub async fn run_bridge(config: BridgeConfig) -> Result<(), AppError> {
    match chrome::probe(&config.chrome_host, config.chrome_port).await {
        Ok(version) => {
            tracing::info!(browser = %version.browser, protocol = %version.protocol_version, "discovered Chrome");
        }
        Err(e) => tracing::warn!(error = %e, "Chrome not reachable yet"),
    }

    let mut registry = TabRegistry::new();
    loop {
        wait_for_relay(&config).await;
        let url = format!(
            "ws://{}:{}/extension",
            config.relay_host, config.relay_port
        );
        let ws = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(&url),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "relay connect failed, retrying");
                tokio::time::sleep(HEALTH_POLL).await;
                continue;
            }
            Err(_) => {
                tracing::warn!("relay connect timed out, retrying");
                continue;
            }
        };
        tracing::info!(%url, "connected to relay");

        let (mut session, out_rx) = BridgeSession::new(&config, &mut registry);
        match session.run(ws, out_rx).await {
            SessionEnd::Replaced => {
                tracing::warn!("replaced by another extension, not reconnecting");
                return Ok(());
            }
            SessionEnd::Lost => {
                tracing::info!("relay connection lost, reconnecting");
            }
        }
    }
}

async fn wait_for_relay(config: &BridgeConfig) {
    loop {
        if ownership::probe(&config.relay_host, config.relay_port).await {
            return;
        }
        tokio::time::sleep(HEALTH_POLL).await;
    }
}

/// Is this target one the operator consented to?
fn is_consented(target: &TargetInfo, filter: Option<&str>) -> bool {
    if target.target_type != "page" {
        return false;
    }
    if target.url.starts_with("chrome://") || target.url.starts_with("devtools://") {
        return false;
    }
    match filter {
        Some(pattern) => target.url.contains(pattern),
        None => true,
    }
}

type RelayWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct BridgeSession<'a> {
    config: &'a BridgeConfig,
    registry: &'a mut TabRegistry,
    relay_out: mpsc::UnboundedSender<String>,
    notice_tx: mpsc::UnboundedSender<(u64, DebuggerNotice)>,
    notice_rx: mpsc::UnboundedReceiver<(u64, DebuggerNotice)>,
    debuggers: HashMap<u64, DebuggerHandle>,
    /// Tabs currently streaming capture frames.
    recording: HashSet<u64>,
}

impl<'a> BridgeSession<'a> {
    fn new(
        config: &'a BridgeConfig,
        registry: &'a mut TabRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (relay_out, relay_out_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            registry,
            relay_out,
            notice_tx,
            notice_rx,
            debuggers: HashMap::new(),
            recording: HashSet::new(),
        };
        (session, relay_out_rx)
    }

    async fn run(
        &mut self,
        ws: RelayWs,
        mut out_rx: mpsc::UnboundedReceiver<String>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        self.attach_consented_tabs().await;

        let end = loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_relay_frame(text.as_str()).await;
                        }
                        Some(Ok(Message::Close(close))) => {
                            let replaced = close
                                .as_ref()
                                .is_some_and(|f| u16::from(f.code) == CLOSE_EXTENSION_REPLACED);
                            break if replaced { SessionEnd::Replaced } else { SessionEnd::Lost };
                        }
                        Some(Err(_)) | None => break SessionEnd::Lost,
                        Some(Ok(_)) => {}
                    }
                }
                notice = self.notice_rx.recv() => {
                    if let Some((tab_id, notice)) = notice {
                        self.handle_notice(tab_id, notice).await;
                    }
                }
            }
        };

        // Detach everything; a later reconnect replays with fresh ids.
        for (_, handle) in self.debuggers.drain() {
            handle.detach().await;
        }
        self.recording.clear();
        self.registry.clear();
        writer.abort();
        end
    }

    async fn attach_consented_tabs(&mut self) {
        let targets = match chrome::query_targets(
            &self.config.chrome_host,
            self.config.chrome_port,
        )
        .await
        {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(error = %e, "target discovery failed");
                return;
            }
        };
        for target in targets {
            if !is_consented(&target, self.config.url_filter.as_deref()) {
                continue;
            }
            match self.attach_tab(&target).await {
                Ok(session_id) => {
                    tracing::info!(target = %target.id, session = %session_id, "tab attached");
                }
                Err(e) => {
                    tracing::warn!(target = %target.id, error = %e, "tab attach failed");
                    // Attach failures during the consent scan never surface
                    // as a command error; forward them so they land in the
                    // relay's log as well.
                    let _ = self.relay_out.send(envelope::log_message(
                        "warn",
                        &serde_json::json!(["tab attach failed", target.id, e.to_string()]),
                    ));
                }
            }
        }
    }

    /// Attach the debugger to a tab, register it, and announce it upward.
    async fn attach_tab(&mut self, target: &TargetInfo) -> Result<String, BridgeError> {
        if self.registry.get_by_target(&target.id).is_some() {
            return Err(BridgeError::Internal(format!(
                "target already attached: {}",
                target.id
            )));
        }
        let ws_url = target
            .ws_debugger_url
            .as_deref()
            .ok_or_else(|| BridgeError::NotAttached("target has no debugger URL".into()))?;

        let tab_id = self.registry.allocate_tab_id();
        let handle =
            debugger::attach(tab_id, ws_url, self.notice_tx.clone(), CONNECT_TIMEOUT).await?;

        let target_info = match handle.send_command("Target.getTargetInfo", None).await {
            Ok(result) => result
                .get("targetInfo")
                .cloned()
                .unwrap_or_else(|| fallback_target_info(target)),
            Err(_) => fallback_target_info(target),
        };

        let session_id = self.registry.allocate_session_id();
        self.registry.insert(TabRecord::new(
            tab_id,
            session_id.clone(),
            target.id.clone(),
            target_info.clone(),
        ));
        self.debuggers.insert(tab_id, handle);

        let _ = self.relay_out.send(envelope::forward_event(
            &session_id,
            "Target.attachedToTarget",
            &serde_json::json!({
                "sessionId": session_id,
                "tabId": tab_id,
                "targetInfo": target_info,
                "waitingForDebugger": false,
            }),
        ));
        Ok(session_id)
    }

    /// Detach a tab locally and announce the detachment upward.
    async fn detach_tab(&mut self, tab_id: u64) {
        let Some(record) = self.registry.remove(tab_id) else {
            return;
        };
        if self.recording.remove(&tab_id) {
            let _ = self.relay_out.send(envelope::recording_cancelled(tab_id));
        }
        if let Some(handle) = self.debuggers.remove(&tab_id) {
            handle.detach().await;
        }
        let _ = self.relay_out.send(envelope::forward_event(
            &record.session_id,
            "Target.detachedFromTarget",
            &serde_json::json!({ "sessionId": record.session_id }),
        ));
    }

    // ------------------------------------------------------------------
    // Relay → bridge
    // ------------------------------------------------------------------

    async fn handle_relay_frame(&mut self, text: &str) {
        let command = match parse_relay_command(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "bad frame from relay");
                return;
            }
        };
        match command {
            RelayCommand::ForwardCdp {
                id,
                session_id,
                method,
                params,
            } => {
                self.handle_forward_cdp(id, session_id.as_deref(), &method, params)
                    .await;
            }
            RelayCommand::Control { id, method, params } => {
                self.handle_control(id, method, &params).await;
            }
        }
    }

    async fn handle_forward_cdp(
        &mut self,
        id: u64,
        session_id: Option<&str>,
        method: &str,
        params: Option<Value>,
    ) {
        match session_id {
            Some(sid) => {
                let Some(record) = self.registry.get_by_session(sid) else {
                    let err = BridgeError::NotAttached(sid.to_owned());
                    let _ = self.relay_out.send(types::error_frame(
                        id,
                        err.code(),
                        &err.to_string(),
                        None,
                    ));
                    return;
                };
                let tab_id = record.tab_id;
                let Some(handle) = self.debuggers.get(&tab_id).cloned() else {
                    let err = BridgeError::NotAttached(sid.to_owned());
                    let _ = self.relay_out.send(types::error_frame(
                        id,
                        err.code(),
                        &err.to_string(),
                        None,
                    ));
                    return;
                };

                // Chrome does not re-announce live contexts on a repeated
                // Runtime.enable; replay the cache so reconnecting clients
                // still see every context before the response lands.
                let replay = if method == "Runtime.enable" {
                    self.registry.contexts(tab_id)
                } else {
                    Vec::new()
                };

                let out = self.relay_out.clone();
                let sid = sid.to_owned();
                let method = method.to_owned();
                tokio::spawn(async move {
                    match handle.send_command(&method, params).await {
                        Ok(result) => {
                            for context in replay {
                                let _ = out.send(envelope::forward_event(
                                    &sid,
                                    "Runtime.executionContextCreated",
                                    &context,
                                ));
                            }
                            let _ = out.send(types::response_frame(id, &result, None));
                        }
                        Err(e) => {
                            let _ = out.send(types::error_frame(
                                id,
                                e.code(),
                                &e.to_string(),
                                None,
                            ));
                        }
                    }
                });
            }
            None => self.handle_browser_command(id, method, params).await,
        }
    }

    /// Browser-level commands: target creation/closing is translated into
    /// tab operations; everything else routes through any attached tab.
    async fn handle_browser_command(&mut self, id: u64, method: &str, params: Option<Value>) {
        match method {
            "Target.createTarget" => {
                let url = params
                    .as_ref()
                    .and_then(|p| p.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or("about:blank")
                    .to_owned();
                match chrome::create_tab(&self.config.chrome_host, self.config.chrome_port, &url)
                    .await
                {
                    Ok(target) => match self.attach_tab(&target).await {
                        Ok(_session_id) => {
                            let _ = self.relay_out.send(types::response_frame(
                                id,
                                &serde_json::json!({ "targetId": target.id }),
                                None,
                            ));
                        }
                        Err(e) => {
                            let _ = self.relay_out.send(types::error_frame(
                                id,
                                e.code(),
                                &e.to_string(),
                                None,
                            ));
                        }
                    },
                    Err(e) => {
                        let _ = self.relay_out.send(types::error_frame(
                            id,
                            types::SERVER_ERROR,
                            &e.to_string(),
                            None,
                        ));
                    }
                }
            }
            "Target.closeTarget" => {
                let target_id = params
                    .as_ref()
                    .and_then(|p| p.get("targetId"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let tab_id = self.registry.get_by_target(&target_id).map(|r| r.tab_id);
                match chrome::close_tab(
                    &self.config.chrome_host,
                    self.config.chrome_port,
                    &target_id,
                )
                .await
                {
                    Ok(()) => {
                        if let Some(tab_id) = tab_id {
                            self.detach_tab(tab_id).await;
                        }
                        let _ = self.relay_out.send(types::response_frame(
                            id,
                            &serde_json::json!({ "success": true }),
                            None,
                        ));
                    }
                    Err(e) => {
                        let _ = self.relay_out.send(types::error_frame(
                            id,
                            types::SERVER_ERROR,
                            &e.to_string(),
                            None,
                        ));
                    }
                }
            }
            _ => {
                // Browser.getVersion, Target.getTargets, and other global
                // queries work against any attached tab.
                let Some(handle) = self
                    .registry
                    .any()
                    .and_then(|record| self.debuggers.get(&record.tab_id))
                    .cloned()
                else {
                    let err = BridgeError::NotAttached("no attached tabs".into());
                    let _ = self.relay_out.send(types::error_frame(
                        id,
                        err.code(),
                        &err.to_string(),
                        None,
                    ));
                    return;
                };
                let out = self.relay_out.clone();
                let method = method.to_owned();
                tokio::spawn(async move {
                    match handle.send_command(&method, params).await {
                        Ok(result) => {
                            let _ = out.send(types::response_frame(id, &result, None));
                        }
                        Err(e) => {
                            let _ =
                                out.send(types::error_frame(id, e.code(), &e.to_string(), None));
                        }
                    }
                });
            }
        }
    }

    async fn handle_control(&mut self, id: u64, method: ControlMethod, params: &Value) {
        match method {
            ControlMethod::AttachToTab => {
                let target_id = params
                    .get("targetId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let result = self.attach_by_target_id(&target_id).await;
                match result {
                    Ok((tab_id, session_id)) => {
                        let _ = self.relay_out.send(types::response_frame(
                            id,
                            &serde_json::json!({ "sessionId": session_id, "tabId": tab_id }),
                            None,
                        ));
                    }
                    Err(e) => {
                        let _ = self.relay_out.send(types::error_frame(
                            id,
                            e.code(),
                            &e.to_string(),
                            None,
                        ));
                    }
                }
            }
            ControlMethod::StartRecording => self.handle_start_recording(id, params).await,
            ControlMethod::StopRecording => {
                let tab_id = params.get("tabId").and_then(Value::as_u64).unwrap_or(0);
                if self.recording.remove(&tab_id) {
                    if let Some(handle) = self.debuggers.get(&tab_id) {
                        let _ = handle.send_command("Page.stopScreencast", None).await;
                    }
                    // The final chunk closes the file on the relay side.
                    let _ = self
                        .relay_out
                        .send(envelope::recording_chunk(tab_id, None, true));
                    let _ = self.relay_out.send(types::response_frame(
                        id,
                        &serde_json::json!({ "success": true }),
                        None,
                    ));
                } else {
                    let _ = self.relay_out.send(types::error_frame(
                        id,
                        types::SERVER_ERROR,
                        &format!("no active recording for tab {tab_id}"),
                        None,
                    ));
                }
            }
            ControlMethod::IsRecording => {
                let tab_id = params.get("tabId").and_then(Value::as_u64).unwrap_or(0);
                let _ = self.relay_out.send(types::response_frame(
                    id,
                    &serde_json::json!({ "isRecording": self.recording.contains(&tab_id) }),
                    None,
                ));
            }
            ControlMethod::CancelRecording => {
                let tab_id = params.get("tabId").and_then(Value::as_u64).unwrap_or(0);
                if self.recording.remove(&tab_id) {
                    if let Some(handle) = self.debuggers.get(&tab_id) {
                        let _ = handle.send_command("Page.stopScreencast", None).await;
                    }
                }
                // Cancel is idempotent.
                let _ = self.relay_out.send(types::response_frame(
                    id,
                    &serde_json::json!({ "success": true }),
                    None,
                ));
            }
        }
    }

    async fn attach_by_target_id(&mut self, target_id: &str) -> Result<(u64, String), BridgeError> {
        if let Some(record) = self.registry.get_by_target(target_id) {
            return Ok((record.tab_id, record.session_id.clone()));
        }
        let targets = chrome::query_targets(&self.config.chrome_host, self.config.chrome_port)
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        let target = targets
            .into_iter()
            .find(|t| t.id == target_id)
            .ok_or_else(|| BridgeError::NotAttached(format!("no such target: {target_id}")))?;
        let session_id = self.attach_tab(&target).await?;
        let tab_id = self
            .registry
            .get_by_session(&session_id)
            .map(|r| r.tab_id)
            .ok_or_else(|| BridgeError::Internal("registry lost fresh attachment".into()))?;
        Ok((tab_id, session_id))
    }

    /// Native capture backend: drive the tab's screencast interface and
    /// stream the frames up as recording chunks. The browser-extension
    /// deployment produces MP4 through its media recorder; the envelope
    /// contract is the same.
    async fn handle_start_recording(&mut self, id: u64, params: &Value) {
        let tab_id = params.get("tabId").and_then(Value::as_u64).unwrap_or(0);
        if self.recording.contains(&tab_id) {
            let _ = self.relay_out.send(types::error_frame(
                id,
                types::SERVER_ERROR,
                &format!("recording already active for tab {tab_id}"),
                None,
            ));
            return;
        }
        let Some(handle) = self.debuggers.get(&tab_id) else {
            let err = BridgeError::NotAttached(format!("tab {tab_id}"));
            let _ = self
                .relay_out
                .send(types::error_frame(id, err.code(), &err.to_string(), None));
            return;
        };

        let mut screencast = serde_json::json!({
            "format": "jpeg",
            "quality": 80,
            "everyNthFrame": 1,
        });
        if let Some(rate) = params.get("frameRate").and_then(Value::as_u64) {
            // Screencast has no frame-rate knob; thin the stream instead.
            let nth = (60 / rate.clamp(1, 60)).max(1);
            screencast["everyNthFrame"] = Value::from(nth);
        }

        match handle
            .send_command("Page.startScreencast", Some(screencast))
            .await
        {
            Ok(_) => {
                self.recording.insert(tab_id);
                let _ = self.relay_out.send(types::response_frame(
                    id,
                    &serde_json::json!({ "success": true }),
                    None,
                ));
            }
            Err(e) => {
                let _ = self
                    .relay_out
                    .send(types::error_frame(id, e.code(), &e.to_string(), None));
            }
        }
    }

    // ------------------------------------------------------------------
    // Chrome → bridge
    // ------------------------------------------------------------------

    async fn handle_notice(&mut self, tab_id: u64, notice: DebuggerNotice) {
        match notice {
            DebuggerNotice::Event { method, params } => {
                self.registry.observe_context_event(tab_id, &method, &params);

                if method == "Page.screencastFrame" && self.recording.contains(&tab_id) {
                    self.handle_capture_frame(tab_id, &params);
                    return;
                }
                if method == "Target.targetInfoChanged" {
                    if let Some(info) = params.get("targetInfo") {
                        self.registry.update_target_info(tab_id, info.clone());
                    }
                }

                if let Some(record) = self.registry.get(tab_id) {
                    let _ = self.relay_out.send(envelope::forward_event(
                        &record.session_id,
                        &method,
                        &params,
                    ));
                }
            }
            DebuggerNotice::Detached => {
                tracing::info!(tab = tab_id, "debugger detached");
                self.detach_tab(tab_id).await;
            }
        }
    }

    fn handle_capture_frame(&mut self, tab_id: u64, params: &Value) {
        if let Some(data) = params.get("data").and_then(Value::as_str) {
            match BASE64.decode(data) {
                Ok(bytes) => {
                    let _ = self
                        .relay_out
                        .send(envelope::recording_chunk(tab_id, Some(&bytes), false));
                }
                Err(e) => {
                    tracing::warn!(tab = tab_id, error = %e, "undecodable capture frame dropped");
                }
            }
        }
        // Chrome stops sending frames until the previous one is acked.
        if let (Some(handle), Some(frame_session)) = (
            self.debuggers.get(&tab_id).cloned(),
            params.get("sessionId").cloned(),
        ) {
            tokio::spawn(async move {
                let _ = handle
                    .send_command(
                        "Page.screencastFrameAck",
                        Some(serde_json::json!({ "sessionId": frame_session })),
                    )
                    .await;
            });
        }
    }
}

fn fallback_target_info(target: &TargetInfo) -> Value {
    serde_json::json!({
        "targetId": target.id,
        "type": target.target_type,
        "title": target.title,
        "url": target.url,
        "attached": true,
        "canAccessOpener": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(target_type: &str, url: &str) -> TargetInfo {
        serde_json::from_value(serde_json::json!({
            "id": "T1",
            "type": target_type,
            "title": "t",
            "url": url,
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/T1",
        }))
        .unwrap()
    }

    #[test]
    fn consent_requires_page_type() {
        assert!(is_consented(&target("page", "https://example.com/"), None));
        assert!(!is_consented(
            &target("service_worker", "https://example.com/sw.js"),
            None
        ));
        assert!(!is_consented(
            &target("background_page", "https://example.com/"),
            None
        ));
    }

    #[test]
    fn consent_skips_internal_pages() {
        assert!(!is_consented(&target("page", "chrome://settings/"), None));
        assert!(!is_consented(
            &target("page", "devtools://devtools/bundled/inspector.html"),
            None
        ));
    }

    #[test]
    fn consent_filter_matches_substring() {
        let t = target("page", "https://app.example.com/dashboard");
        assert!(is_consented(&t, Some("example.com")));
        assert!(!is_consented(&t, Some("other.org")));
    }

    #[test]
    fn fallback_target_info_shape() {
        let info = fallback_target_info(&target("page", "https://example.com/"));
        assert_eq!(info["targetId"], "T1");
        assert_eq!(info["type"], "page");
        assert_eq!(info["attached"], true);
    }
}
