use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::protocol::envelope::{
    self, ControlMethod, ExtensionMessage, parse_extension_message,
};
use crate::protocol::types::{
    self, CLOSE_EXTENSION_REPLACED, CLOSE_NORMAL, CLOSE_SERVER_STALL, EXTENSION_REPLACED_REASON,
    MessageKind, RawCdpMessage, SERVER_ERROR,
};
use crate::protocol::RelayError;

use super::recording::RecorderEvent;
use super::session::{ClientSession, SocketOut, SocketRoute};

/// Capacity of the hub's inbound message channel.
const HUB_CHANNEL_CAPACITY: usize = 256;

/// Identifier for one connected client process.
pub type ClientId = Uuid;

/// Messages accepted by the hub task.
pub enum HubMsg {
    /// A new extension socket finished its handshake.
    ExtensionOpen {
        tx: mpsc::UnboundedSender<SocketOut>,
        generation_reply: oneshot::Sender<u64>,
    },
    /// A text frame from the extension socket.
    ExtensionFrame { generation: u64, text: String },
    /// The extension socket closed.
    ExtensionClosed { generation: u64 },
    /// A client opened its root socket.
    ClientOpen {
        client_id: ClientId,
        tx: mpsc::UnboundedSender<SocketOut>,
    },
    /// A text frame from one of a client's sockets.
    ClientFrame {
        client_id: ClientId,
        route: SocketRoute,
        text: String,
    },
    /// A client's root socket closed; the client is gone.
    ClientClosed { client_id: ClientId },
    /// A client's socket writer stalled past the deadline.
    ClientStalled { client_id: ClientId },
    /// A client opened a per-session socket. The URL carries only the
    /// session id, so the hub chooses the client session to bind to and
    /// reports it back (None when the session is unknown or no client is
    /// connected; the socket then closes).
    SessionOpen {
        session_id: String,
        tx: mpsc::UnboundedSender<SocketOut>,
        bound: oneshot::Sender<Option<ClientId>>,
    },
    /// A client closed a per-session socket.
    SessionClosed {
        client_id: ClientId,
        session_id: String,
    },
    /// Send a control command to the extension and await its reply.
    Control {
        method: ControlMethod,
        params: Value,
        reply: oneshot::Sender<Result<Value, RelayError>>,
    },
    /// Resolve a session id (or the first connected tab) to (session, tab).
    ResolveTab {
        session_id: Option<String>,
        reply: oneshot::Sender<Result<(String, u64), RelayError>>,
    },
    /// Close everything and exit the hub task.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Clonable handle for communicating with the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubMsg>,
}

impl HubHandle {
    /// Send a message to the hub task.
    pub async fn send(&self, msg: HubMsg) {
        let _ = self.tx.send(msg).await;
    }

    /// Register a new extension socket, returning its generation tag.
    pub async fn extension_open(&self, tx: mpsc::UnboundedSender<SocketOut>) -> u64 {
        let (generation_reply, rx) = oneshot::channel();
        self.send(HubMsg::ExtensionOpen {
            tx,
            generation_reply,
        })
        .await;
        rx.await.unwrap_or(0)
    }

    /// Send a control command to the extension and await the result.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NoExtension` when no extension is attached, or
    /// whatever error the extension replied with.
    pub async fn control(
        &self,
        method: ControlMethod,
        params: Value,
    ) -> Result<Value, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubMsg::Control {
            method,
            params,
            reply,
        })
        .await;
        rx.await
            .map_err(|_| RelayError::Internal("hub task exited".into()))?
    }

    /// Resolve a session id (or the first connected tab) to (session, tab).
    ///
    /// # Errors
    ///
    /// Returns `RelayError::UnknownSession` or `RelayError::NoExtension`.
    pub async fn resolve_tab(
        &self,
        session_id: Option<String>,
    ) -> Result<(String, u64), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubMsg::ResolveTab { session_id, reply }).await;
        rx.await
            .map_err(|_| RelayError::Internal("hub task exited".into()))?
    }

    /// Bind a per-session socket, returning the client it was bound to.
    pub async fn session_open(
        &self,
        session_id: String,
        tx: mpsc::UnboundedSender<SocketOut>,
    ) -> Option<ClientId> {
        let (bound, rx) = oneshot::channel();
        self.send(HubMsg::SessionOpen {
            session_id,
            tx,
            bound,
        })
        .await;
        rx.await.ok().flatten()
    }

    /// Gracefully close all peers and stop the hub.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(HubMsg::Shutdown { reply }).await;
        let _ = rx.await;
    }
}

/// Spawn the hub task.
///
/// `recorder_tx` receives recording chunks and tab-lifecycle notifications
/// destined for the recording coordinator.
#[must_use]
pub fn spawn_hub(recorder_tx: mpsc::UnboundedSender<RecorderEvent>) -> HubHandle {
    let (tx, rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut hub = Hub {
            msg_rx: rx,
            extension: None,
            next_generation: 1,
            clients: HashMap::new(),
            client_order: Vec::new(),
            sessions: HashMap::new(),
            session_order: Vec::new(),
            next_cmd_id: 1,
            pending: HashMap::new(),
            recorder_tx,
        };
        hub.run().await;
    });
    HubHandle { tx }
}

/// A live synthesized session: the tab that backs it and its target info.
struct SessionEntry {
    tab_id: u64,
    target_info: Value,
}

/// The connected extension socket plus its generation tag. Frames tagged
/// with an older generation belong to a replaced extension and are ignored.
struct ExtensionSlot {
    tx: mpsc::UnboundedSender<SocketOut>,
    generation: u64,
}

/// Where the reply to an in-flight extension command should go.
enum PendingReply {
    /// Back to the client socket that issued the command.
    Client {
        client_id: ClientId,
        route: SocketRoute,
        cdp_id: u64,
        session_id: Option<String>,
    },
    /// To a coordinator waiting on a control command.
    Control(oneshot::Sender<Result<Value, RelayError>>),
}

struct Hub {
    msg_rx: mpsc::Receiver<HubMsg>,
    extension: Option<ExtensionSlot>,
    next_generation: u64,
    clients: HashMap<ClientId, ClientSession>,
    /// Clients in connect order, newest last.
    client_order: Vec<ClientId>,
    sessions: HashMap<String, SessionEntry>,
    /// Session ids in attach order, for the "first connected" fallback.
    session_order: Vec<String>,
    next_cmd_id: u64,
    pending: HashMap<u64, PendingReply>,
    recorder_tx: mpsc::UnboundedSender<RecorderEvent>,
}

impl Hub {
    async fn run(&mut self) {
        while let Some(msg) = self.msg_rx.recv().await {
            match msg {
                HubMsg::ExtensionOpen {
                    tx,
                    generation_reply,
                } => {
                    let generation = self.handle_extension_open(tx);
                    let _ = generation_reply.send(generation);
                }
                HubMsg::ExtensionFrame { generation, text } => {
                    if self
                        .extension
                        .as_ref()
                        .is_some_and(|slot| slot.generation == generation)
                    {
                        self.handle_extension_frame(&text);
                    } else {
                        tracing::debug!("frame from replaced extension ignored");
                    }
                }
                HubMsg::ExtensionClosed { generation } => {
                    if self
                        .extension
                        .as_ref()
                        .is_some_and(|slot| slot.generation == generation)
                    {
                        tracing::info!("extension disconnected");
                        self.extension = None;
                        self.invalidate_extension_state(&RelayError::ConnectionClosed);
                    }
                }
                HubMsg::ClientOpen { client_id, tx } => {
                    tracing::info!(client = %client_id, "client connected");
                    self.clients.insert(client_id, ClientSession::new(tx));
                    self.client_order.push(client_id);
                }
                HubMsg::ClientFrame {
                    client_id,
                    route,
                    text,
                } => {
                    self.handle_client_frame(client_id, &route, &text);
                }
                HubMsg::ClientClosed { client_id } => {
                    tracing::info!(client = %client_id, "client disconnected");
                    self.remove_client(client_id);
                }
                HubMsg::ClientStalled { client_id } => {
                    tracing::warn!(client = %client_id, "client write stalled, closing");
                    if let Some(client) = self.clients.get(&client_id) {
                        client.close_all(CLOSE_SERVER_STALL, "write stalled");
                    }
                    self.remove_client(client_id);
                }
                HubMsg::SessionOpen {
                    session_id,
                    tx,
                    bound,
                } => {
                    let client_id = self.handle_session_open(&session_id, tx);
                    let _ = bound.send(client_id);
                }
                HubMsg::SessionClosed {
                    client_id,
                    session_id,
                } => {
                    if let Some(client) = self.clients.get_mut(&client_id) {
                        client.unbind_session_socket(&session_id);
                    }
                }
                HubMsg::Control {
                    method,
                    params,
                    reply,
                } => {
                    self.handle_control(method, &params, reply);
                }
                HubMsg::ResolveTab { session_id, reply } => {
                    let _ = reply.send(self.resolve_tab(session_id.as_deref()));
                }
                HubMsg::Shutdown { reply } => {
                    for client in self.clients.values() {
                        client.close_all(CLOSE_NORMAL, "relay shutting down");
                    }
                    if let Some(slot) = &self.extension {
                        let _ = slot.tx.send(SocketOut::Close {
                            code: CLOSE_NORMAL,
                            reason: "relay shutting down".into(),
                        });
                    }
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Extension side
    // ------------------------------------------------------------------

    fn handle_extension_open(&mut self, tx: mpsc::UnboundedSender<SocketOut>) -> u64 {
        if let Some(old) = self.extension.take() {
            tracing::warn!("extension slot taken over, closing previous extension");
            let _ = old.tx.send(SocketOut::Close {
                code: CLOSE_EXTENSION_REPLACED,
                reason: EXTENSION_REPLACED_REASON.into(),
            });
            self.invalidate_extension_state(&RelayError::ExtensionReplaced);
        } else {
            tracing::info!("extension connected");
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.extension = Some(ExtensionSlot { tx, generation });
        generation
    }

    /// Fail all pending commands and tear down every session after the
    /// extension went away (disconnect or replacement).
    fn invalidate_extension_state(&mut self, error: &RelayError) {
        let pending = std::mem::take(&mut self.pending);
        for (_, reply) in pending {
            match reply {
                PendingReply::Client {
                    client_id,
                    route,
                    cdp_id,
                    session_id,
                } => {
                    if let Some(client) = self.clients.get_mut(&client_id) {
                        client.send_on(
                            &route,
                            types::error_frame(
                                cdp_id,
                                SERVER_ERROR,
                                &error.to_string(),
                                session_id.as_deref(),
                            ),
                        );
                    }
                }
                PendingReply::Control(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
            }
        }
        for client in self.clients.values_mut() {
            client.take_pending();
        }

        for sid in std::mem::take(&mut self.session_order) {
            self.sessions.remove(&sid);
            for client in self.clients.values_mut() {
                client.send_root(types::event_frame(
                    "Target.detachedFromTarget",
                    &serde_json::json!({ "sessionId": sid }),
                    None,
                ));
                client.drop_session(&sid, CLOSE_NORMAL);
            }
        }
        let _ = self.recorder_tx.send(RecorderEvent::ExtensionLost);
    }

    fn handle_extension_frame(&mut self, text: &str) {
        let message = match parse_extension_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "bad frame from extension");
                if let Some(slot) = &self.extension {
                    let _ = slot
                        .tx
                        .send(SocketOut::Frame(types::parse_error_frame(&e.to_string())));
                }
                return;
            }
        };

        match message {
            ExtensionMessage::Response { id, result } => self.route_response(id, result),
            ExtensionMessage::Event {
                session_id,
                method,
                params,
            } => self.route_event(session_id.as_deref(), &method, params),
            ExtensionMessage::RecordingChunk { tab_id, data, last } => {
                let _ = self
                    .recorder_tx
                    .send(RecorderEvent::Chunk { tab_id, data, last });
            }
            ExtensionMessage::RecordingCancelled { tab_id } => {
                let _ = self.recorder_tx.send(RecorderEvent::Cancelled { tab_id });
            }
            ExtensionMessage::Log { level, args } => match level.as_str() {
                "error" => tracing::error!(target: "extension", ?args),
                "warn" => tracing::warn!(target: "extension", ?args),
                "debug" => tracing::debug!(target: "extension", ?args),
                _ => tracing::info!(target: "extension", ?args),
            },
        }
    }

    fn route_response(
        &mut self,
        ext_id: u64,
        result: Result<Value, crate::protocol::CdpProtocolError>,
    ) {
        let Some(reply) = self.pending.remove(&ext_id) else {
            tracing::warn!(id = ext_id, "response for unknown command id dropped");
            return;
        };
        match reply {
            PendingReply::Client {
                client_id,
                route,
                cdp_id,
                session_id,
            } => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.complete_pending(ext_id);
                    let frame = match result {
                        Ok(value) => {
                            types::response_frame(cdp_id, &value, session_id.as_deref())
                        }
                        Err(err) => types::error_frame(
                            cdp_id,
                            err.code,
                            &err.message,
                            session_id.as_deref(),
                        ),
                    };
                    client.send_on(&route, frame);
                }
                // Client gone: response is ignored by design.
            }
            PendingReply::Control(tx) => {
                let _ = tx.send(result.map_err(|e| RelayError::Protocol {
                    code: e.code,
                    message: e.message,
                }));
            }
        }
    }

    fn route_event(&mut self, session_id: Option<&str>, method: &str, params: Value) {
        match method {
            "Target.attachedToTarget" => self.handle_tab_attached(&params),
            "Target.detachedFromTarget" => {
                let sid = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                self.handle_tab_detached(&sid);
            }
            _ => {
                // targetInfo changes keep the discovery cache fresh.
                if method == "Target.targetInfoChanged" {
                    if let (Some(sid), Some(info)) = (session_id, params.get("targetInfo")) {
                        if let Some(entry) = self.sessions.get_mut(sid) {
                            entry.target_info = info.clone();
                        }
                    }
                }
                if let Some(sid) = session_id {
                    if !self.sessions.contains_key(sid) {
                        tracing::debug!(session = %sid, method, "event for unknown session dropped");
                        return;
                    }
                    let frame = types::event_frame(method, &params, Some(sid));
                    for client in self.clients.values_mut() {
                        client.deliver_event(sid, frame.clone());
                    }
                } else {
                    // Browser-level event: every root socket sees it.
                    let frame = types::event_frame(method, &params, None);
                    for client in self.clients.values_mut() {
                        client.send_root(frame.clone());
                    }
                }
            }
        }
    }

    fn handle_tab_attached(&mut self, params: &Value) {
        let Some(sid) = params.get("sessionId").and_then(Value::as_str) else {
            tracing::warn!("attachedToTarget without sessionId ignored");
            return;
        };
        let sid = sid.to_owned();
        let tab_id = params.get("tabId").and_then(Value::as_u64).unwrap_or(0);
        let target_info = params.get("targetInfo").cloned().unwrap_or(Value::Null);

        if self.sessions.contains_key(&sid) {
            tracing::warn!(session = %sid, "duplicate attachedToTarget ignored");
            return;
        }
        tracing::info!(session = %sid, tab = tab_id, "tab attached");
        self.sessions.insert(
            sid.clone(),
            SessionEntry {
                tab_id,
                target_info: target_info.clone(),
            },
        );
        self.session_order.push(sid.clone());

        // The tabId is relay-internal routing metadata; clients see the
        // standard CDP event shape.
        let attached_params = serde_json::json!({
            "sessionId": sid,
            "targetInfo": target_info,
            "waitingForDebugger": params
                .get("waitingForDebugger")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });
        for client in self.clients.values_mut() {
            if client.discover() {
                client.send_root(types::event_frame(
                    "Target.targetCreated",
                    &serde_json::json!({ "targetInfo": target_info }),
                    None,
                ));
            }
            client.send_root(types::event_frame(
                "Target.attachedToTarget",
                &attached_params,
                None,
            ));
        }
    }

    fn handle_tab_detached(&mut self, sid: &str) {
        let Some(entry) = self.sessions.remove(sid) else {
            // Detaching an already-detached session is a no-op.
            return;
        };
        self.session_order.retain(|s| s != sid);
        tracing::info!(session = %sid, tab = entry.tab_id, "tab detached");

        let _ = self.recorder_tx.send(RecorderEvent::TabDetached {
            tab_id: entry.tab_id,
        });

        let detached = serde_json::json!({ "sessionId": sid });
        for client in self.clients.values_mut() {
            client.send_root(types::event_frame(
                "Target.detachedFromTarget",
                &detached,
                None,
            ));
            if client.discover() {
                client.send_root(types::event_frame(
                    "Target.targetDestroyed",
                    &serde_json::json!({
                        "targetId": entry.target_info.get("targetId").cloned().unwrap_or(Value::Null),
                    }),
                    None,
                ));
            }
            client.drop_session(sid, CLOSE_NORMAL);
        }
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    /// Bind an incoming per-session socket. The wire carries no client
    /// identity, so the socket attaches to the newest client that has no
    /// socket for this session yet (exact in the common one-client case).
    fn handle_session_open(
        &mut self,
        session_id: &str,
        tx: mpsc::UnboundedSender<SocketOut>,
    ) -> Option<ClientId> {
        if !self.sessions.contains_key(session_id) {
            let _ = tx.send(SocketOut::Close {
                code: CLOSE_NORMAL,
                reason: "unknown session".into(),
            });
            return None;
        }
        let chosen = self
            .client_order
            .iter()
            .rev()
            .find(|id| {
                self.clients
                    .get(*id)
                    .is_some_and(|c| !c.has_session_socket(session_id))
            })
            .or_else(|| self.client_order.last())
            .copied();
        match chosen {
            Some(client_id) => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.bind_session_socket(session_id, tx);
                }
                Some(client_id)
            }
            None => {
                let _ = tx.send(SocketOut::Close {
                    code: CLOSE_NORMAL,
                    reason: "no client connected".into(),
                });
                None
            }
        }
    }

    fn handle_client_frame(&mut self, client_id: ClientId, route: &SocketRoute, text: &str) {
        if !self.clients.contains_key(&client_id) {
            return;
        }

        let request = match serde_json::from_str::<RawCdpMessage>(text)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                raw.classify()
                    .ok_or_else(|| "frame is neither command, response, nor event".to_owned())
            }) {
            Ok(MessageKind::Request(request)) => request,
            Ok(_) => {
                tracing::debug!(client = %client_id, "non-command frame from client ignored");
                return;
            }
            Err(detail) => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.send_on(route, types::parse_error_frame(&detail));
                }
                return;
            }
        };

        match route {
            SocketRoute::Root => self.handle_root_command(client_id, request),
            SocketRoute::Session(sid) => {
                let sid = sid.clone();
                self.forward_session_command(client_id, route.clone(), request, &sid);
            }
        }
    }

    fn handle_root_command(
        &mut self,
        client_id: ClientId,
        request: crate::protocol::CdpRequest,
    ) {
        // Legacy non-flat mode: the session rides in the message.
        if let Some(sid) = request.session_id.clone() {
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.mark_legacy(&sid);
            }
            self.forward_session_command(client_id, SocketRoute::Root, request, &sid);
            return;
        }

        match request.method.as_str() {
            "Target.setDiscoverTargets" => {
                let discover = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("discover"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let created: Vec<String> = if discover {
                    self.session_order
                        .iter()
                        .filter_map(|sid| self.sessions.get(sid))
                        .map(|entry| {
                            types::event_frame(
                                "Target.targetCreated",
                                &serde_json::json!({ "targetInfo": entry.target_info }),
                                None,
                            )
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.set_discover(discover);
                    client.send_root(types::response_frame(
                        request.id,
                        &serde_json::json!({}),
                        None,
                    ));
                    for frame in created {
                        client.send_root(frame);
                    }
                }
            }
            "Target.getTargets" => {
                let infos: Vec<Value> = self
                    .session_order
                    .iter()
                    .filter_map(|sid| self.sessions.get(sid))
                    .map(|entry| entry.target_info.clone())
                    .collect();
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.send_root(types::response_frame(
                        request.id,
                        &serde_json::json!({ "targetInfos": infos }),
                        None,
                    ));
                }
            }
            "Target.attachToTarget" => self.handle_attach_to_target(client_id, &request),
            "Target.detachFromTarget" => {
                // The extension owns real detachment; acknowledge without
                // side effects.
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.send_root(types::response_frame(
                        request.id,
                        &serde_json::json!({}),
                        None,
                    ));
                }
            }
            _ => {
                // Browser-level command: forward with no session. The bridge
                // routes global queries through any attached tab.
                self.forward_to_extension(client_id, SocketRoute::Root, request, None);
            }
        }
    }

    fn handle_attach_to_target(
        &mut self,
        client_id: ClientId,
        request: &crate::protocol::CdpRequest,
    ) {
        let target_id = request
            .params
            .as_ref()
            .and_then(|p| p.get("targetId"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let found = self.session_order.iter().find_map(|sid| {
            self.sessions.get(sid).and_then(|entry| {
                (entry.target_info.get("targetId").and_then(Value::as_str) == Some(target_id))
                    .then(|| (sid.clone(), entry.target_info.clone()))
            })
        });

        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        match found {
            Some((sid, target_info)) => {
                client.send_root(types::response_frame(
                    request.id,
                    &serde_json::json!({ "sessionId": sid }),
                    None,
                ));
                client.send_root(types::event_frame(
                    "Target.attachedToTarget",
                    &serde_json::json!({
                        "sessionId": sid,
                        "targetInfo": target_info,
                        "waitingForDebugger": false,
                    }),
                    None,
                ));
            }
            None => {
                let message = if self.extension.is_none() {
                    RelayError::NoExtension.to_string()
                } else {
                    format!("No target with given id found: {target_id}")
                };
                client.send_root(types::error_frame(request.id, SERVER_ERROR, &message, None));
            }
        }
    }

    fn forward_session_command(
        &mut self,
        client_id: ClientId,
        route: SocketRoute,
        request: crate::protocol::CdpRequest,
        session_id: &str,
    ) {
        if !self.sessions.contains_key(session_id) {
            let err = RelayError::UnknownSession(session_id.to_owned());
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.send_on(
                    &route,
                    types::error_frame(
                        request.id,
                        err.code(),
                        &err.to_string(),
                        Some(session_id),
                    ),
                );
            }
            return;
        }
        self.forward_to_extension(client_id, route, request, Some(session_id.to_owned()));
    }

    fn forward_to_extension(
        &mut self,
        client_id: ClientId,
        route: SocketRoute,
        request: crate::protocol::CdpRequest,
        session_id: Option<String>,
    ) {
        let reply_session = session_id.clone().or_else(|| {
            // Legacy commands get their sessionId echoed on the reply.
            matches!(route, SocketRoute::Root)
                .then(|| request.session_id.clone())
                .flatten()
        });

        let Some(slot) = &self.extension else {
            let err = RelayError::NoExtension;
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.send_on(
                    &route,
                    types::error_frame(
                        request.id,
                        err.code(),
                        &err.to_string(),
                        reply_session.as_deref(),
                    ),
                );
            }
            return;
        };

        let ext_id = self.next_cmd_id;
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        if !client.track_pending(ext_id) {
            let err = RelayError::BacklogExceeded;
            client.send_on(
                &route,
                types::error_frame(
                    request.id,
                    err.code(),
                    &err.to_string(),
                    reply_session.as_deref(),
                ),
            );
            return;
        }
        self.next_cmd_id += 1;

        let frame = envelope::forward_command(
            ext_id,
            session_id.as_deref(),
            &request.method,
            request.params.as_ref(),
        );
        self.pending.insert(
            ext_id,
            PendingReply::Client {
                client_id,
                route,
                cdp_id: request.id,
                session_id: reply_session,
            },
        );
        let _ = slot.tx.send(SocketOut::Frame(frame));
    }

    fn handle_control(
        &mut self,
        method: ControlMethod,
        params: &Value,
        reply: oneshot::Sender<Result<Value, RelayError>>,
    ) {
        let Some(slot) = &self.extension else {
            let _ = reply.send(Err(RelayError::NoExtension));
            return;
        };
        let ext_id = self.next_cmd_id;
        self.next_cmd_id += 1;
        let frame = envelope::control_command(ext_id, method, params);
        self.pending.insert(ext_id, PendingReply::Control(reply));
        let _ = slot.tx.send(SocketOut::Frame(frame));
    }

    fn resolve_tab(&self, session_id: Option<&str>) -> Result<(String, u64), RelayError> {
        if self.extension.is_none() {
            return Err(RelayError::NoExtension);
        }
        match session_id {
            Some(sid) => self
                .sessions
                .get(sid)
                .map(|entry| (sid.to_owned(), entry.tab_id))
                .ok_or_else(|| RelayError::UnknownSession(sid.to_owned())),
            None => self
                .session_order
                .first()
                .and_then(|sid| {
                    self.sessions
                        .get(sid)
                        .map(|entry| (sid.clone(), entry.tab_id))
                })
                .ok_or_else(|| RelayError::UnknownSession("no connected tab".into())),
        }
    }

    fn remove_client(&mut self, client_id: ClientId) {
        self.client_order.retain(|id| *id != client_id);
        if let Some(mut client) = self.clients.remove(&client_id) {
            // Pending commands die with the client; late responses from the
            // extension will find no entry and be dropped.
            for ext_id in client.take_pending() {
                self.pending.remove(&ext_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{Duration, timeout};

    async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<SocketOut>) -> Value {
        match timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
        {
            SocketOut::Frame(text) => serde_json::from_str(&text).unwrap(),
            SocketOut::Close { code, .. } => panic!("unexpected close ({code})"),
        }
    }

    async fn recv_close(rx: &mut mpsc::UnboundedReceiver<SocketOut>) -> u16 {
        loop {
            match timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for close")
                .expect("channel closed")
            {
                SocketOut::Close { code, .. } => return code,
                SocketOut::Frame(_) => {}
            }
        }
    }

    struct Fixture {
        hub: HubHandle,
        _recorder_rx: mpsc::UnboundedReceiver<RecorderEvent>,
    }

    fn fixture() -> Fixture {
        let (recorder_tx, recorder_rx) = mpsc::unbounded_channel();
        Fixture {
            hub: spawn_hub(recorder_tx),
            _recorder_rx: recorder_rx,
        }
    }

    async fn connect_extension(hub: &HubHandle) -> (mpsc::UnboundedReceiver<SocketOut>, u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = hub.extension_open(tx).await;
        (rx, generation)
    }

    async fn connect_client(hub: &HubHandle) -> (ClientId, mpsc::UnboundedReceiver<SocketOut>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.send(HubMsg::ClientOpen { client_id, tx }).await;
        (client_id, rx)
    }

    async fn announce_tab(hub: &HubHandle, generation: u64, sid: &str, tab: u64, target: &str) {
        let text = envelope::forward_event(
            sid,
            "Target.attachedToTarget",
            &json!({
                "sessionId": sid,
                "tabId": tab,
                "targetInfo": {
                    "targetId": target,
                    "type": "page",
                    "title": "Example",
                    "url": "https://example.com/",
                },
                "waitingForDebugger": false,
            }),
        );
        hub.send(HubMsg::ExtensionFrame { generation, text }).await;
    }

    #[tokio::test]
    async fn discover_targets_reports_attached_tabs() {
        let f = fixture();
        let (_ext_rx, generation) = connect_extension(&f.hub).await;
        announce_tab(&f.hub, generation, "pw-tab-1", 42, "T42").await;

        let (client_id, mut client_rx) = connect_client(&f.hub).await;
        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Root,
                text: json!({"id": 1, "method": "Target.setDiscoverTargets", "params": {"discover": true}})
                    .to_string(),
            })
            .await;

        let reply = recv_frame(&mut client_rx).await;
        assert_eq!(reply["id"], 1);
        let created = recv_frame(&mut client_rx).await;
        assert_eq!(created["method"], "Target.targetCreated");
        assert_eq!(created["params"]["targetInfo"]["targetId"], "T42");
    }

    #[tokio::test]
    async fn attach_to_target_returns_session_and_event() {
        let f = fixture();
        let (_ext_rx, generation) = connect_extension(&f.hub).await;
        announce_tab(&f.hub, generation, "pw-tab-1", 42, "T42").await;

        let (client_id, mut client_rx) = connect_client(&f.hub).await;
        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Root,
                text: json!({"id": 2, "method": "Target.attachToTarget", "params": {"targetId": "T42", "flatten": true}})
                    .to_string(),
            })
            .await;

        let reply = recv_frame(&mut client_rx).await;
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"]["sessionId"], "pw-tab-1");
        let attached = recv_frame(&mut client_rx).await;
        assert_eq!(attached["method"], "Target.attachedToTarget");
        assert_eq!(attached["params"]["sessionId"], "pw-tab-1");
    }

    #[tokio::test]
    async fn command_ids_are_remapped_both_ways() {
        let f = fixture();
        let (mut ext_rx, generation) = connect_extension(&f.hub).await;
        announce_tab(&f.hub, generation, "pw-tab-1", 42, "T42").await;

        let (client_id, _client_rx) = connect_client(&f.hub).await;
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let bound = f.hub.session_open("pw-tab-1".into(), session_tx).await;
        assert_eq!(bound, Some(client_id));

        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Session("pw-tab-1".into()),
                text: json!({"id": 7, "method": "Page.navigate", "params": {"url": "https://example.com/"}})
                    .to_string(),
            })
            .await;

        // The extension sees the hub's id, not the client's.
        let forwarded = recv_frame(&mut ext_rx).await;
        assert_eq!(forwarded["method"], "forwardCDPCommand");
        assert_eq!(forwarded["params"]["sessionId"], "pw-tab-1");
        assert_eq!(forwarded["params"]["method"], "Page.navigate");
        let ext_id = forwarded["id"].as_u64().unwrap();
        assert_ne!(ext_id, 7);

        // Respond with the hub id; the client gets its own id back.
        f.hub
            .send(HubMsg::ExtensionFrame {
                generation,
                text: json!({"id": ext_id, "result": {"frameId": "F1"}}).to_string(),
            })
            .await;
        let reply = recv_frame(&mut session_rx).await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"]["frameId"], "F1");
    }

    #[tokio::test]
    async fn session_command_params_survive_bit_for_bit() {
        let f = fixture();
        let (mut ext_rx, generation) = connect_extension(&f.hub).await;
        announce_tab(&f.hub, generation, "pw-tab-1", 42, "T42").await;

        let (client_id, _client_rx) = connect_client(&f.hub).await;
        let (session_tx, _session_rx) = mpsc::unbounded_channel();
        let bound = f.hub.session_open("pw-tab-1".into(), session_tx).await;
        assert_eq!(bound, Some(client_id));

        let params = json!({
            "nested": {"deep": [1, 2, {"x": null}]},
            "unicode": "héllo ☂",
            "float": 1.5,
        });
        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Session("pw-tab-1".into()),
                text: json!({"id": 1, "method": "Custom.method", "params": params}).to_string(),
            })
            .await;

        let forwarded = recv_frame(&mut ext_rx).await;
        assert_eq!(forwarded["params"]["params"], params);
    }

    #[tokio::test]
    async fn unknown_session_command_is_answered_not_forwarded() {
        let f = fixture();
        let (mut ext_rx, _generation) = connect_extension(&f.hub).await;
        let (client_id, mut client_rx) = connect_client(&f.hub).await;

        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Root,
                text: json!({"id": 5, "method": "Runtime.enable", "sessionId": "pw-tab-404"})
                    .to_string(),
            })
            .await;

        let reply = recv_frame(&mut client_rx).await;
        assert_eq!(reply["id"], 5);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("unknown session")
        );
        // Nothing was forwarded.
        assert!(ext_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_gets_parse_error_and_socket_survives() {
        let f = fixture();
        let (client_id, mut client_rx) = connect_client(&f.hub).await;

        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Root,
                text: "not-json".into(),
            })
            .await;

        let reply = recv_frame(&mut client_rx).await;
        assert_eq!(reply["error"]["code"], types::PARSE_ERROR);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("Error parsing message: ")
        );

        // A well-formed command still works.
        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Root,
                text: json!({"id": 1, "method": "Target.setDiscoverTargets", "params": {"discover": false}})
                    .to_string(),
            })
            .await;
        let reply = recv_frame(&mut client_rx).await;
        assert_eq!(reply["id"], 1);
        assert!(reply.get("error").is_none());
    }

    #[tokio::test]
    async fn no_extension_commands_fail_but_discovery_succeeds() {
        let f = fixture();
        let (client_id, mut client_rx) = connect_client(&f.hub).await;

        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Root,
                text: json!({"id": 1, "method": "Target.setDiscoverTargets", "params": {"discover": true}})
                    .to_string(),
            })
            .await;
        let reply = recv_frame(&mut client_rx).await;
        assert_eq!(reply["id"], 1);
        assert!(reply.get("error").is_none());

        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Root,
                text: json!({"id": 2, "method": "Browser.getVersion"}).to_string(),
            })
            .await;
        let reply = recv_frame(&mut client_rx).await;
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("no extension attached")
        );
    }

    #[tokio::test]
    async fn extension_replacement_closes_old_socket_and_detaches_sessions() {
        let f = fixture();
        let (mut ext_a_rx, generation_a) = connect_extension(&f.hub).await;
        announce_tab(&f.hub, generation_a, "pw-tab-1", 42, "T42").await;

        let (client_id, mut client_rx) = connect_client(&f.hub).await;
        // Drain the attachedToTarget broadcast.
        let attached = recv_frame(&mut client_rx).await;
        assert_eq!(attached["method"], "Target.attachedToTarget");

        // Extension B takes the slot.
        let (_ext_b_rx, _generation_b) = connect_extension(&f.hub).await;

        assert_eq!(recv_close(&mut ext_a_rx).await, CLOSE_EXTENSION_REPLACED);
        let detached = recv_frame(&mut client_rx).await;
        assert_eq!(detached["method"], "Target.detachedFromTarget");
        assert_eq!(detached["params"]["sessionId"], "pw-tab-1");
    }

    #[tokio::test]
    async fn pending_commands_fail_on_replacement() {
        let f = fixture();
        let (mut ext_rx, generation) = connect_extension(&f.hub).await;
        announce_tab(&f.hub, generation, "pw-tab-1", 42, "T42").await;

        let (client_id, _client_rx) = connect_client(&f.hub).await;
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let bound = f.hub.session_open("pw-tab-1".into(), session_tx).await;
        assert_eq!(bound, Some(client_id));
        f.hub
            .send(HubMsg::ClientFrame {
                client_id,
                route: SocketRoute::Session("pw-tab-1".into()),
                text: json!({"id": 3, "method": "Runtime.evaluate", "params": {"expression": "1"}})
                    .to_string(),
            })
            .await;
        let _ = recv_frame(&mut ext_rx).await;

        let (_ext_b_rx, _generation_b) = connect_extension(&f.hub).await;

        let reply = recv_frame(&mut session_rx).await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["message"], "extension replaced");
    }

    #[tokio::test]
    async fn stale_extension_frames_are_ignored() {
        let f = fixture();
        let (_ext_a_rx, generation_a) = connect_extension(&f.hub).await;
        let (_ext_b_rx, generation_b) = connect_extension(&f.hub).await;

        // A frame tagged with the replaced generation must not register.
        announce_tab(&f.hub, generation_a, "pw-tab-9", 9, "T9").await;
        let err = f.hub.resolve_tab(Some("pw-tab-9".into())).await;
        assert!(matches!(err, Err(RelayError::UnknownSession(_))));

        // The live generation works.
        announce_tab(&f.hub, generation_b, "pw-tab-10", 10, "T10").await;
        let ok = f.hub.resolve_tab(Some("pw-tab-10".into())).await;
        assert_eq!(ok.unwrap(), ("pw-tab-10".into(), 10));
    }

    #[tokio::test]
    async fn tab_detach_closes_session_socket_gracefully() {
        let f = fixture();
        let (_ext_rx, generation) = connect_extension(&f.hub).await;
        announce_tab(&f.hub, generation, "pw-tab-1", 42, "T42").await;

        let (client_id, mut client_rx) = connect_client(&f.hub).await;
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let bound = f.hub.session_open("pw-tab-1".into(), session_tx).await;
        assert_eq!(bound, Some(client_id));

        f.hub
            .send(HubMsg::ExtensionFrame {
                generation,
                text: envelope::forward_event(
                    "pw-tab-1",
                    "Target.detachedFromTarget",
                    &json!({"sessionId": "pw-tab-1"}),
                ),
            })
            .await;

        let detached = recv_frame(&mut client_rx).await;
        assert_eq!(detached["method"], "Target.detachedFromTarget");
        assert_eq!(recv_close(&mut session_rx).await, CLOSE_NORMAL);
    }

    #[tokio::test]
    async fn resolve_tab_first_connected_fallback() {
        let f = fixture();
        let (_ext_rx, generation) = connect_extension(&f.hub).await;
        announce_tab(&f.hub, generation, "pw-tab-1", 42, "T42").await;
        announce_tab(&f.hub, generation, "pw-tab-2", 43, "T43").await;

        let resolved = f.hub.resolve_tab(None).await.unwrap();
        assert_eq!(resolved, ("pw-tab-1".into(), 42));

        let explicit = f.hub.resolve_tab(Some("pw-tab-2".into())).await.unwrap();
        assert_eq!(explicit, ("pw-tab-2".into(), 43));
    }

    #[tokio::test]
    async fn control_without_extension_fails() {
        let f = fixture();
        let result = f
            .hub
            .control(ControlMethod::IsRecording, json!({"tabId": 1}))
            .await;
        assert!(matches!(result, Err(RelayError::NoExtension)));
    }

    #[tokio::test]
    async fn control_roundtrip() {
        let f = fixture();
        let (mut ext_rx, generation) = connect_extension(&f.hub).await;

        let hub = f.hub.clone();
        let control = tokio::spawn(async move {
            hub.control(ControlMethod::StartRecording, json!({"tabId": 42}))
                .await
        });

        let cmd = recv_frame(&mut ext_rx).await;
        assert_eq!(cmd["method"], "startRecording");
        assert_eq!(cmd["params"]["tabId"], 42);
        let ext_id = cmd["id"].as_u64().unwrap();

        f.hub
            .send(HubMsg::ExtensionFrame {
                generation,
                text: json!({"id": ext_id, "result": {"success": true}}).to_string(),
            })
            .await;

        let result = control.await.unwrap().unwrap();
        assert_eq!(result["success"], true);
    }
}
