use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::protocol::envelope::ControlMethod;

use super::hub::HubHandle;

/// How long to wait for the first media chunk after a start is accepted.
const FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

/// Notifications the hub pushes into the coordinator.
#[derive(Debug)]
pub enum RecorderEvent {
    /// A segment of media bytes for a tab's active recording.
    Chunk {
        tab_id: u64,
        data: Option<Vec<u8>>,
        last: bool,
    },
    /// The extension aborted the recording on its own.
    Cancelled { tab_id: u64 },
    /// The tab detached while recording.
    TabDetached { tab_id: u64 },
    /// The extension connection is gone entirely.
    ExtensionLost,
}

/// Body of `POST /recording/start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub session_id: Option<String>,
    pub frame_rate: Option<u32>,
    pub video_bits_per_second: Option<u64>,
    pub audio_bits_per_second: Option<u64>,
    pub audio: Option<bool>,
    pub output_path: PathBuf,
}

/// Reply to `POST /recording/start`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartReply {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tab_id: None,
            started_at: None,
            error: Some(error.into()),
        }
    }
}

/// Reply to `POST /recording/stop`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Milliseconds of recording, measured from the accepted start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StopReply {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            path: None,
            duration: None,
            size: None,
            error: Some(error.into()),
        }
    }
}

/// Reply to `GET /recording/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub is_recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

/// Reply to `POST /recording/cancel`.
#[derive(Debug, Clone, Serialize)]
pub struct CancelReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Requests from the HTTP layer.
pub enum RecorderMsg {
    Start {
        request: StartRequest,
        reply: oneshot::Sender<StartReply>,
    },
    Stop {
        session_id: Option<String>,
        reply: oneshot::Sender<StopReply>,
    },
    Status {
        session_id: Option<String>,
        reply: oneshot::Sender<StatusReply>,
    },
    Cancel {
        session_id: Option<String>,
        reply: oneshot::Sender<CancelReply>,
    },
    /// Internal: a spawned start task gave up; tear the record down.
    Abort { tab_id: u64, reason: String },
    /// Internal: close out a recording with whatever reached the disk.
    Finalize { tab_id: u64 },
}

/// Clonable handle to the recording coordinator.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderMsg>,
}

impl RecorderHandle {
    pub async fn start(&self, request: StartRequest) -> StartReply {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderMsg::Start { request, reply }).await;
        rx.await
            .unwrap_or_else(|_| StartReply::failure("recording coordinator exited"))
    }

    pub async fn stop(&self, session_id: Option<String>) -> StopReply {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderMsg::Stop { session_id, reply }).await;
        rx.await
            .unwrap_or_else(|_| StopReply::failure("recording coordinator exited"))
    }

    pub async fn status(&self, session_id: Option<String>) -> StatusReply {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderMsg::Status { session_id, reply }).await;
        rx.await.unwrap_or(StatusReply {
            is_recording: false,
            tab_id: None,
            started_at: None,
        })
    }

    pub async fn cancel(&self, session_id: Option<String>) -> CancelReply {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderMsg::Cancel { session_id, reply }).await;
        rx.await.unwrap_or(CancelReply {
            success: false,
            error: Some("recording coordinator exited".into()),
        })
    }
}

/// Spawn the recording coordinator.
///
/// `events` is the hub-fed side (chunks, lifecycle); the returned handle is
/// the HTTP-facing side.
#[must_use]
pub fn spawn_recorder(
    hub: HubHandle,
    events: mpsc::UnboundedReceiver<RecorderEvent>,
) -> RecorderHandle {
    let (tx, rx) = mpsc::channel(64);
    let handle = RecorderHandle { tx };
    let task_handle = handle.clone();
    tokio::spawn(async move {
        let mut coordinator = Recorder {
            hub,
            msg_rx: rx,
            event_rx: events,
            self_tx: task_handle,
            records: HashMap::new(),
        };
        coordinator.run().await;
    });
    handle
}

/// One active (or starting) recording.
struct Recording {
    session_id: String,
    path: PathBuf,
    file: Option<File>,
    started_at: u64,
    started_instant: Instant,
    bytes_written: u64,
    /// Fired when the first chunk lands; the start task waits on it.
    first_chunk_tx: Option<oneshot::Sender<()>>,
    /// A stop request waiting for the final chunk.
    stop_reply: Option<oneshot::Sender<StopReply>>,
}

impl Recording {
    fn stats(&self) -> StopReply {
        StopReply {
            success: true,
            path: Some(self.path.clone()),
            duration: Some(u64::try_from(self.started_instant.elapsed().as_millis()).unwrap_or(u64::MAX)),
            size: Some(self.bytes_written),
            error: None,
        }
    }
}

struct Recorder {
    hub: HubHandle,
    msg_rx: mpsc::Receiver<RecorderMsg>,
    event_rx: mpsc::UnboundedReceiver<RecorderEvent>,
    self_tx: RecorderHandle,
    records: HashMap<u64, Recording>,
}

impl Recorder {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => {
                    match msg {
                        Some(RecorderMsg::Start { request, reply }) => {
                            self.handle_start(request, reply).await;
                        }
                        Some(RecorderMsg::Stop { session_id, reply }) => {
                            self.handle_stop(session_id.as_deref(), reply).await;
                        }
                        Some(RecorderMsg::Status { session_id, reply }) => {
                            let _ = reply.send(self.handle_status(session_id.as_deref()));
                        }
                        Some(RecorderMsg::Cancel { session_id, reply }) => {
                            let _ = reply.send(self.handle_cancel(session_id.as_deref()).await);
                        }
                        Some(RecorderMsg::Abort { tab_id, reason }) => {
                            tracing::warn!(tab = tab_id, %reason, "recording aborted");
                            self.discard(tab_id).await;
                        }
                        Some(RecorderMsg::Finalize { tab_id }) => {
                            self.finalize(tab_id).await;
                        }
                        None => return,
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(RecorderEvent::Chunk { tab_id, data, last }) => {
                            self.handle_chunk(tab_id, data, last).await;
                        }
                        Some(RecorderEvent::Cancelled { tab_id } | RecorderEvent::TabDetached { tab_id }) => {
                            self.finalize(tab_id).await;
                        }
                        Some(RecorderEvent::ExtensionLost) => {
                            let tabs: Vec<u64> = self.records.keys().copied().collect();
                            for tab_id in tabs {
                                self.finalize(tab_id).await;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_start(&mut self, request: StartRequest, reply: oneshot::Sender<StartReply>) {
        if !request.output_path.is_absolute() {
            let _ = reply.send(StartReply::failure("outputPath must be an absolute path"));
            return;
        }

        let (session_id, tab_id) = match self.hub.resolve_tab(request.session_id.clone()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let _ = reply.send(StartReply::failure(e.to_string()));
                return;
            }
        };

        if self.records.contains_key(&tab_id) {
            let _ = reply.send(StartReply::failure(format!(
                "recording already active for tab {tab_id}"
            )));
            return;
        }

        let file = match File::create(&request.output_path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = reply.send(StartReply::failure(format!(
                    "cannot open {}: {e}",
                    request.output_path.display()
                )));
                return;
            }
        };

        let started_at = epoch_millis();
        let (first_chunk_tx, first_chunk_rx) = oneshot::channel();
        self.records.insert(
            tab_id,
            Recording {
                session_id,
                path: request.output_path.clone(),
                file: Some(file),
                started_at,
                started_instant: Instant::now(),
                bytes_written: 0,
                first_chunk_tx: Some(first_chunk_tx),
                stop_reply: None,
            },
        );

        // The control round-trip and the first-chunk wait happen off the
        // coordinator loop so chunks can be appended meanwhile.
        let hub = self.hub.clone();
        let recorder = self.self_tx.clone();
        tokio::spawn(async move {
            let mut params = serde_json::json!({ "tabId": tab_id });
            if let Some(rate) = request.frame_rate {
                params["frameRate"] = Value::from(rate);
            }
            if let Some(bits) = request.video_bits_per_second {
                params["videoBitsPerSecond"] = Value::from(bits);
            }
            if let Some(bits) = request.audio_bits_per_second {
                params["audioBitsPerSecond"] = Value::from(bits);
            }
            if let Some(audio) = request.audio {
                params["audio"] = Value::from(audio);
            }

            match hub.control(ControlMethod::StartRecording, params).await {
                Ok(_) => {}
                Err(e) => {
                    let _ = reply.send(StartReply::failure(with_permission_hint(&e.to_string())));
                    let _ = recorder
                        .tx
                        .send(RecorderMsg::Abort {
                            tab_id,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            }

            match tokio::time::timeout(FIRST_CHUNK_TIMEOUT, first_chunk_rx).await {
                Ok(Ok(())) => {
                    let _ = reply.send(StartReply {
                        success: true,
                        tab_id: Some(tab_id),
                        started_at: Some(started_at),
                        error: None,
                    });
                }
                _ => {
                    let _ = hub
                        .control(
                            ControlMethod::CancelRecording,
                            serde_json::json!({ "tabId": tab_id }),
                        )
                        .await;
                    let _ = recorder
                        .tx
                        .send(RecorderMsg::Abort {
                            tab_id,
                            reason: "first chunk timeout".into(),
                        })
                        .await;
                    let _ = reply.send(StartReply::failure(
                        "no media data received within 5s of recording start",
                    ));
                }
            }
        });
    }

    async fn handle_chunk(&mut self, tab_id: u64, data: Option<Vec<u8>>, last: bool) {
        let Some(record) = self.records.get_mut(&tab_id) else {
            tracing::debug!(tab = tab_id, "chunk for unknown recording dropped");
            return;
        };

        if let Some(tx) = record.first_chunk_tx.take() {
            let _ = tx.send(());
        }

        if let Some(bytes) = data {
            let write_result = match record.file.as_mut() {
                Some(file) => file.write_all(&bytes).await,
                None => Ok(()),
            };
            match write_result {
                Ok(()) => {
                    record.bytes_written += bytes.len() as u64;
                }
                Err(e) => {
                    tracing::error!(tab = tab_id, error = %e, "disk write failed, cancelling recording");
                    let stop_reply = self.records.get_mut(&tab_id).and_then(|r| r.stop_reply.take());
                    if let Some(reply) = stop_reply {
                        let _ = reply.send(StopReply::failure(format!("disk write error: {e}")));
                    }
                    let hub = self.hub.clone();
                    tokio::spawn(async move {
                        let _ = hub
                            .control(
                                ControlMethod::CancelRecording,
                                serde_json::json!({ "tabId": tab_id }),
                            )
                            .await;
                    });
                    self.discard(tab_id).await;
                    return;
                }
            }
        }

        if last {
            self.finalize(tab_id).await;
        }
    }

    async fn handle_stop(&mut self, session_id: Option<&str>, reply: oneshot::Sender<StopReply>) {
        let Some(tab_id) = self.find_tab(session_id) else {
            let _ = reply.send(StopReply::failure("no active recording"));
            return;
        };
        let Some(record) = self.records.get_mut(&tab_id) else {
            let _ = reply.send(StopReply::failure("no active recording"));
            return;
        };

        if record.stop_reply.is_some() {
            let _ = reply.send(StopReply::failure("stop already in progress"));
            return;
        }
        record.stop_reply = Some(reply);

        let hub = self.hub.clone();
        let recorder = self.self_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = hub
                .control(
                    ControlMethod::StopRecording,
                    serde_json::json!({ "tabId": tab_id }),
                )
                .await
            {
                // The extension cannot deliver a final chunk; close out with
                // what reached the disk.
                tracing::warn!(tab = tab_id, error = %e, "stop command failed, finalizing locally");
                let _ = recorder.tx.send(RecorderMsg::Finalize { tab_id }).await;
            }
        });
    }

    fn handle_status(&self, session_id: Option<&str>) -> StatusReply {
        match self.find_tab(session_id).and_then(|tab| self.records.get(&tab).map(|r| (tab, r))) {
            Some((tab_id, record)) => StatusReply {
                is_recording: true,
                tab_id: Some(tab_id),
                started_at: Some(record.started_at),
            },
            None => StatusReply {
                is_recording: false,
                tab_id: None,
                started_at: None,
            },
        }
    }

    async fn handle_cancel(&mut self, session_id: Option<&str>) -> CancelReply {
        let Some(tab_id) = self.find_tab(session_id) else {
            return CancelReply {
                success: false,
                error: Some("no active recording".into()),
            };
        };

        let hub = self.hub.clone();
        tokio::spawn(async move {
            let _ = hub
                .control(
                    ControlMethod::CancelRecording,
                    serde_json::json!({ "tabId": tab_id }),
                )
                .await;
        });

        if let Some(record) = self.records.get_mut(&tab_id) {
            if let Some(reply) = record.stop_reply.take() {
                let _ = reply.send(StopReply::failure("recording cancelled"));
            }
        }
        self.discard(tab_id).await;
        CancelReply {
            success: true,
            error: None,
        }
    }

    /// Flush and close the file, answer any waiting stop, and drop the
    /// record. The file is kept.
    async fn finalize(&mut self, tab_id: u64) {
        let Some(mut record) = self.records.remove(&tab_id) else {
            return;
        };
        if let Some(mut file) = record.file.take() {
            let _ = file.flush().await;
            let _ = file.sync_all().await;
        }
        tracing::info!(
            tab = tab_id,
            path = %record.path.display(),
            bytes = record.bytes_written,
            "recording finalized"
        );
        if let Some(reply) = record.stop_reply.take() {
            let _ = reply.send(record.stats());
        }
    }

    /// Close and delete the partial file, then drop the record.
    async fn discard(&mut self, tab_id: u64) {
        let Some(mut record) = self.records.remove(&tab_id) else {
            return;
        };
        if let Some(reply) = record.stop_reply.take() {
            let _ = reply.send(StopReply::failure("recording cancelled"));
        }
        drop(record.file.take());
        if let Err(e) = tokio::fs::remove_file(&record.path).await {
            tracing::debug!(path = %record.path.display(), error = %e, "partial file cleanup failed");
        }
    }

    fn find_tab(&self, session_id: Option<&str>) -> Option<u64> {
        match session_id {
            Some(sid) => self
                .records
                .iter()
                .find(|(_, record)| record.session_id == sid)
                .map(|(tab, _)| *tab),
            None => self.records.keys().next().copied(),
        }
    }
}

/// Append the activeTab guidance when the extension reports a capture
/// permission failure; other errors pass through verbatim.
fn with_permission_hint(error: &str) -> String {
    let lower = error.to_ascii_lowercase();
    if lower.contains("activetab") || lower.contains("permission") {
        format!(
            "{error} (click the extension icon on the target tab to grant the \
             activeTab permission, or relaunch the browser)"
        )
    } else {
        error.to_owned()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
