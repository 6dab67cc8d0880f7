//! Per-tab debugger transport: one WebSocket to a tab's DevTools endpoint,
//! owned by a background task. Commands are correlated through a pending
//! map; every event is pushed to the bridge loop tagged with the tab id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::types::{CdpCommand, MessageKind, RawCdpMessage};

use super::error::BridgeError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the debugger task reports to the bridge loop for a tab.
#[derive(Debug)]
pub enum DebuggerNotice {
    /// A CDP event from the tab.
    Event { method: String, params: Value },
    /// The tab's debugger connection closed (tab closed, DevTools detached,
    /// or the user dismissed the automation banner).
    Detached,
}

/// Command sent from the handle to the debugger task.
enum DebuggerCommand {
    Send {
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<Value, BridgeError>>,
    },
    Detach,
}

/// Clonable handle for one tab's debugger connection.
#[derive(Clone)]
pub struct DebuggerHandle {
    command_tx: mpsc::Sender<DebuggerCommand>,
    next_id: Arc<AtomicU64>,
}

impl DebuggerHandle {
    /// Send a CDP command to the tab and await the response.
    ///
    /// There is no relay-side timeout on in-flight commands; the client on
    /// the other side of the relay is the authority on what is too slow.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Protocol` for CDP errors,
    /// `BridgeError::ConnectionClosed` if the tab went away first, or
    /// `BridgeError::Internal` if the task is gone.
    pub async fn send_command(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, BridgeError> {
        let command = CdpCommand {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_owned(),
            params,
            session_id: None,
        };
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(DebuggerCommand::Send {
                command,
                response_tx,
            })
            .await
            .map_err(|_| BridgeError::Internal("debugger task is not running".into()))?;
        response_rx
            .await
            .map_err(|_| BridgeError::ConnectionClosed)?
    }

    /// Close the debugger connection gracefully.
    pub async fn detach(&self) {
        let _ = self.command_tx.send(DebuggerCommand::Detach).await;
    }
}

/// Attach to a tab's DevTools WebSocket and spawn its transport task.
///
/// Events and the eventual detach notice arrive on `notice_tx`, tagged with
/// `tab_id`.
///
/// # Errors
///
/// Returns `BridgeError::Connection` if the handshake fails or
/// `BridgeError::ConnectionTimeout` if it exceeds `connect_timeout`.
pub async fn attach(
    tab_id: u64,
    ws_url: &str,
    notice_tx: mpsc::UnboundedSender<(u64, DebuggerNotice)>,
    connect_timeout: Duration,
) -> Result<DebuggerHandle, BridgeError> {
    let ws_stream =
        match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(ws_url))
            .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(BridgeError::Connection(e.to_string())),
            Err(_) => return Err(BridgeError::ConnectionTimeout),
        };

    let (command_tx, command_rx) = mpsc::channel(64);
    let handle = DebuggerHandle {
        command_tx,
        next_id: Arc::new(AtomicU64::new(1)),
    };

    tokio::spawn(async move {
        let mut task = DebuggerTask {
            tab_id,
            ws_stream,
            command_rx,
            pending: HashMap::new(),
            notice_tx,
        };
        task.run().await;
    });

    Ok(handle)
}

/// The background task that owns one tab's WebSocket.
struct DebuggerTask {
    tab_id: u64,
    ws_stream: WsStream,
    command_rx: mpsc::Receiver<DebuggerCommand>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, BridgeError>>>,
    notice_tx: mpsc::UnboundedSender<(u64, DebuggerNotice)>,
}

impl DebuggerTask {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                ws_msg = self.ws_stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_message(text.as_str()).await;
                        }
                        Some(Ok(Message::Close(_)) | Err(_)) | None => {
                            self.drain_pending();
                            let _ = self
                                .notice_tx
                                .send((self.tab_id, DebuggerNotice::Detached));
                            return;
                        }
                        Some(Ok(_)) => {
                            // Binary, Ping, Pong, Frame — ignore
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(DebuggerCommand::Send { command, response_tx }) => {
                            self.handle_send(command, response_tx).await;
                        }
                        Some(DebuggerCommand::Detach) | None => {
                            self.drain_pending();
                            let _ = self.ws_stream.close(None).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_text_message(&mut self, text: &str) {
        let raw: RawCdpMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(_) => {
                // Malformed JSON from Chrome — ignore and continue
                return;
            }
        };
        match raw.classify() {
            Some(MessageKind::Response(response)) => {
                if let Some(response_tx) = self.pending.remove(&response.id) {
                    let result = response.result.map_err(|e| BridgeError::Protocol {
                        code: e.code,
                        message: e.message,
                    });
                    let _ = response_tx.send(result);
                }
            }
            Some(MessageKind::Event(event)) => {
                let _ = self.notice_tx.send((
                    self.tab_id,
                    DebuggerNotice::Event {
                        method: event.method,
                        params: event.params,
                    },
                ));
            }
            Some(MessageKind::Request(_)) | None => {
                // Chrome does not send commands to its debugger peer.
            }
        }
    }

    async fn handle_send(
        &mut self,
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<Value, BridgeError>>,
    ) {
        let id = command.id;
        let json = match serde_json::to_string(&command) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(BridgeError::Internal(format!(
                    "serialization error: {e}"
                ))));
                return;
            }
        };
        if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
            let _ = response_tx.send(Err(BridgeError::Connection(format!(
                "WebSocket write error: {e}"
            ))));
            return;
        }
        self.pending.insert(id, response_tx);
    }

    fn drain_pending(&mut self) {
        for (_, response_tx) in std::mem::take(&mut self.pending) {
            let _ = response_tx.send(Err(BridgeError::ConnectionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Mock tab endpoint that echoes `{"id": N, "result": {...}}` and can
    /// push events.
    async fn start_mock_tab() -> (String, mpsc::Sender<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (event_tx, mut event_rx) = mpsc::channel::<Value>(32);
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut source) = ws.split();
                loop {
                    tokio::select! {
                        msg = source.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let cmd: Value = serde_json::from_str(text.as_str()).unwrap();
                                    let response = json!({
                                        "id": cmd["id"],
                                        "result": {"echo": cmd["method"]},
                                    });
                                    let _ = sink
                                        .send(Message::Text(response.to_string().into()))
                                        .await;
                                }
                                None | Some(Err(_)) => break,
                                _ => {}
                            }
                        }
                        event = event_rx.recv() => {
                            match event {
                                Some(event) => {
                                    let _ = sink
                                        .send(Message::Text(event.to_string().into()))
                                        .await;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
        });
        (format!("ws://{addr}"), event_tx)
    }

    #[tokio::test]
    async fn command_roundtrip() {
        let (url, _events) = start_mock_tab().await;
        let (notice_tx, _notice_rx) = mpsc::unbounded_channel();
        let handle = attach(1, &url, notice_tx, Duration::from_secs(5))
            .await
            .unwrap();

        let result = handle.send_command("Page.enable", None).await.unwrap();
        assert_eq!(result["echo"], "Page.enable");
    }

    #[tokio::test]
    async fn events_arrive_tagged_with_tab_id() {
        let (url, events) = start_mock_tab().await;
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let _handle = attach(7, &url, notice_tx, Duration::from_secs(5))
            .await
            .unwrap();

        events
            .send(json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.0}}))
            .await
            .unwrap();

        let (tab_id, notice) = timeout(Duration::from_secs(2), notice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tab_id, 7);
        match notice {
            DebuggerNotice::Event { method, .. } => {
                assert_eq!(method, "Page.loadEventFired");
            }
            DebuggerNotice::Detached => panic!("expected event"),
        }
    }

    #[tokio::test]
    async fn close_produces_detached_notice_and_drains_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept, never respond, close after the first command.
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (_sink, mut source) = ws.split();
                let _ = source.next().await;
                // ws dropped: connection closes
            }
        });

        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let handle = attach(3, &format!("ws://{addr}"), notice_tx, Duration::from_secs(5))
            .await
            .unwrap();

        let result = handle.send_command("Page.enable", None).await;
        assert!(matches!(result, Err(BridgeError::ConnectionClosed)));

        let (tab_id, notice) = timeout(Duration::from_secs(2), notice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tab_id, 3);
        assert!(matches!(notice, DebuggerNotice::Detached));
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let (notice_tx, _notice_rx) = mpsc::unbounded_channel();
        let result = attach(
            1,
            "ws://127.0.0.1:1/devtools/page/X",
            notice_tx,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(
            result,
            Err(BridgeError::Connection(_) | BridgeError::ConnectionTimeout)
        ));
    }
}
