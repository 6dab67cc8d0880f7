//! The relay↔extension wrapping envelope.
//!
//! The extension is a single WebSocket peer that multiplexes many tabs, so
//! CDP traffic crossing that socket rides inside an envelope that carries
//! routing metadata next to an opaque CDP payload. Control methods (tab
//! attachment, recording) share the same framing.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use super::types::CdpProtocolError;

/// Envelope method carrying a CDP command toward the extension.
pub const FORWARD_CDP_COMMAND: &str = "forwardCDPCommand";

/// Envelope method carrying a CDP event toward the relay.
pub const FORWARD_CDP_EVENT: &str = "forwardCDPEvent";

/// Control methods the relay may send to the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMethod {
    AttachToTab,
    StartRecording,
    StopRecording,
    IsRecording,
    CancelRecording,
}

impl ControlMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AttachToTab => "attachToTab",
            Self::StartRecording => "startRecording",
            Self::StopRecording => "stopRecording",
            Self::IsRecording => "isRecording",
            Self::CancelRecording => "cancelRecording",
        }
    }
}

/// Serialize a `forwardCDPCommand` envelope.
#[must_use]
pub fn forward_command(
    id: u64,
    session_id: Option<&str>,
    method: &str,
    params: Option<&Value>,
) -> String {
    let mut inner = serde_json::json!({ "method": method });
    if let Some(sid) = session_id {
        inner["sessionId"] = Value::String(sid.to_owned());
    }
    if let Some(p) = params {
        inner["params"] = p.clone();
    }
    serde_json::json!({
        "id": id,
        "method": FORWARD_CDP_COMMAND,
        "params": inner,
    })
    .to_string()
}

/// Serialize a control command envelope (`startRecording` and friends).
#[must_use]
pub fn control_command(id: u64, method: ControlMethod, params: &Value) -> String {
    serde_json::json!({
        "id": id,
        "method": method.as_str(),
        "params": params,
    })
    .to_string()
}

/// Serialize a `forwardCDPEvent` envelope (extension side).
#[must_use]
pub fn forward_event(session_id: &str, method: &str, params: &Value) -> String {
    serde_json::json!({
        "method": FORWARD_CDP_EVENT,
        "params": {
            "sessionId": session_id,
            "method": method,
            "params": params,
        },
    })
    .to_string()
}

/// Serialize a `recordingChunk` envelope (extension side).
#[must_use]
pub fn recording_chunk(tab_id: u64, data: Option<&[u8]>, last: bool) -> String {
    let mut params = serde_json::json!({ "tabId": tab_id });
    if let Some(bytes) = data {
        params["data"] = Value::String(BASE64.encode(bytes));
    }
    if last {
        params["final"] = Value::Bool(true);
    }
    serde_json::json!({ "method": "recordingChunk", "params": params }).to_string()
}

/// Serialize a `recordingCancelled` envelope (extension side).
#[must_use]
pub fn recording_cancelled(tab_id: u64) -> String {
    serde_json::json!({ "method": "recordingCancelled", "params": { "tabId": tab_id } })
        .to_string()
}

/// Serialize a `log` envelope (extension side).
#[must_use]
pub fn log_message(level: &str, args: &Value) -> String {
    serde_json::json!({ "method": "log", "params": { "level": level, "args": args } })
        .to_string()
}

/// A message received from the extension socket, unwrapped.
#[derive(Debug, Clone)]
pub enum ExtensionMessage {
    /// Response to a command the relay sent.
    Response {
        id: u64,
        result: Result<Value, CdpProtocolError>,
    },
    /// A CDP event forwarded from a tab.
    Event {
        session_id: Option<String>,
        method: String,
        params: Value,
    },
    /// A segment of recorded media bytes.
    RecordingChunk {
        tab_id: u64,
        data: Option<Vec<u8>>,
        last: bool,
    },
    /// The extension aborted a recording on its own.
    RecordingCancelled { tab_id: u64 },
    /// A log line to re-emit through the relay's subscriber.
    Log { level: String, args: Value },
}

/// Error unwrapping an extension envelope.
#[derive(Debug)]
pub enum EnvelopeError {
    /// The frame was not valid JSON.
    Json(String),
    /// The frame parsed but matched no known envelope shape.
    UnknownShape(String),
    /// A `recordingChunk` carried data that was not valid base64.
    BadChunkData(String),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid envelope JSON: {e}"),
            Self::UnknownShape(m) => write!(f, "unknown envelope shape: {m}"),
            Self::BadChunkData(e) => write!(f, "invalid recording chunk data: {e}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Parse a text frame received on the extension socket.
///
/// # Errors
///
/// Returns `EnvelopeError::Json` for malformed JSON and
/// `EnvelopeError::UnknownShape` for frames that match no envelope variant.
pub fn parse_extension_message(text: &str) -> Result<ExtensionMessage, EnvelopeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;

    // Responses have an id and no method.
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if value.get("method").is_none() {
            let result = if let Some(error) = value.get("error") {
                let parsed: CdpProtocolError = serde_json::from_value(error.clone())
                    .unwrap_or_else(|_| CdpProtocolError {
                        code: super::types::SERVER_ERROR,
                        message: error.to_string(),
                    });
                Err(parsed)
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            return Ok(ExtensionMessage::Response { id, result });
        }
    }

    let Some(method) = value.get("method").and_then(Value::as_str) else {
        return Err(EnvelopeError::UnknownShape(text.chars().take(120).collect()));
    };
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    match method {
        FORWARD_CDP_EVENT => Ok(ExtensionMessage::Event {
            session_id: params
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_owned),
            method: params
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            params: params.get("params").cloned().unwrap_or(Value::Null),
        }),
        "recordingChunk" => {
            let tab_id = params.get("tabId").and_then(Value::as_u64).unwrap_or(0);
            let data = match params.get("data").and_then(Value::as_str) {
                Some(b64) => Some(
                    BASE64
                        .decode(b64)
                        .map_err(|e| EnvelopeError::BadChunkData(e.to_string()))?,
                ),
                None => None,
            };
            let last = params
                .get("final")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(ExtensionMessage::RecordingChunk { tab_id, data, last })
        }
        "recordingCancelled" => Ok(ExtensionMessage::RecordingCancelled {
            tab_id: params.get("tabId").and_then(Value::as_u64).unwrap_or(0),
        }),
        "log" => Ok(ExtensionMessage::Log {
            level: params
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or("info")
                .to_owned(),
            args: params.get("args").cloned().unwrap_or(Value::Null),
        }),
        other => Err(EnvelopeError::UnknownShape(other.to_owned())),
    }
}

/// A command received by the extension from the relay, unwrapped.
#[derive(Debug, Clone)]
pub enum RelayCommand {
    /// A CDP command to dispatch to a tab.
    ForwardCdp {
        id: u64,
        session_id: Option<String>,
        method: String,
        params: Option<Value>,
    },
    /// A control command (attach, recording).
    Control {
        id: u64,
        method: ControlMethod,
        params: Value,
    },
}

/// Parse a text frame received on the bridge's relay socket.
///
/// # Errors
///
/// Returns `EnvelopeError::Json` for malformed JSON and
/// `EnvelopeError::UnknownShape` for methods outside the envelope contract.
pub fn parse_relay_command(text: &str) -> Result<RelayCommand, EnvelopeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| EnvelopeError::UnknownShape("missing id".into()))?;
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| EnvelopeError::UnknownShape("missing method".into()))?;
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    if method == FORWARD_CDP_COMMAND {
        return Ok(RelayCommand::ForwardCdp {
            id,
            session_id: params
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_owned),
            method: params
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            params: params.get("params").cloned(),
        });
    }

    let control = match method {
        "attachToTab" => ControlMethod::AttachToTab,
        "startRecording" => ControlMethod::StartRecording,
        "stopRecording" => ControlMethod::StopRecording,
        "isRecording" => ControlMethod::IsRecording,
        "cancelRecording" => ControlMethod::CancelRecording,
        other => return Err(EnvelopeError::UnknownShape(other.to_owned())),
    };
    Ok(RelayCommand::Control {
        id,
        method: control,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forward_command_shape() {
        let text = forward_command(
            12,
            Some("pw-tab-1"),
            "Page.navigate",
            Some(&json!({"url": "https://example.com/"})),
        );
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["id"], 12);
        assert_eq!(value["method"], "forwardCDPCommand");
        assert_eq!(value["params"]["sessionId"], "pw-tab-1");
        assert_eq!(value["params"]["method"], "Page.navigate");
        assert_eq!(value["params"]["params"]["url"], "https://example.com/");
    }

    #[test]
    fn forward_command_without_session() {
        let text = forward_command(1, None, "Browser.getVersion", None);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value["params"].get("sessionId").is_none());
        assert!(value["params"].get("params").is_none());
    }

    #[test]
    fn parse_forward_command_roundtrip() {
        let text = forward_command(5, Some("pw-tab-2"), "Runtime.enable", None);
        match parse_relay_command(&text).unwrap() {
            RelayCommand::ForwardCdp {
                id,
                session_id,
                method,
                params,
            } => {
                assert_eq!(id, 5);
                assert_eq!(session_id.as_deref(), Some("pw-tab-2"));
                assert_eq!(method, "Runtime.enable");
                assert!(params.is_none());
            }
            other => panic!("expected ForwardCdp, got {other:?}"),
        }
    }

    #[test]
    fn parse_control_command() {
        let text = control_command(
            9,
            ControlMethod::StartRecording,
            &json!({"tabId": 42, "frameRate": 30}),
        );
        match parse_relay_command(&text).unwrap() {
            RelayCommand::Control { id, method, params } => {
                assert_eq!(id, 9);
                assert_eq!(method, ControlMethod::StartRecording);
                assert_eq!(params["tabId"], 42);
            }
            other => panic!("expected Control, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_control_method_fails() {
        let text = json!({"id": 1, "method": "selfDestruct", "params": {}}).to_string();
        assert!(matches!(
            parse_relay_command(&text),
            Err(EnvelopeError::UnknownShape(_))
        ));
    }

    #[test]
    fn parse_event_envelope() {
        let text = forward_event("pw-tab-3", "Page.frameNavigated", &json!({"frame": {}}));
        match parse_extension_message(&text).unwrap() {
            ExtensionMessage::Event {
                session_id,
                method,
                params,
            } => {
                assert_eq!(session_id.as_deref(), Some("pw-tab-3"));
                assert_eq!(method, "Page.frameNavigated");
                assert_eq!(params["frame"], json!({}));
            }
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn parse_response_envelope() {
        let text = json!({"id": 44, "result": {"ok": true}}).to_string();
        match parse_extension_message(&text).unwrap() {
            ExtensionMessage::Response { id, result } => {
                assert_eq!(id, 44);
                assert_eq!(result.unwrap()["ok"], true);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_response_envelope() {
        let text =
            json!({"id": 45, "error": {"code": -32000, "message": "tab not attached"}}).to_string();
        match parse_extension_message(&text).unwrap() {
            ExtensionMessage::Response { id, result } => {
                assert_eq!(id, 45);
                let err = result.unwrap_err();
                assert_eq!(err.code, -32000);
                assert_eq!(err.message, "tab not attached");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn recording_chunk_roundtrip() {
        let payload = vec![0x00, 0x00, 0x00, 0x20, 0x66, 0x74, 0x79, 0x70];
        let text = recording_chunk(42, Some(&payload), false);
        match parse_extension_message(&text).unwrap() {
            ExtensionMessage::RecordingChunk { tab_id, data, last } => {
                assert_eq!(tab_id, 42);
                assert_eq!(data.unwrap(), payload);
                assert!(!last);
            }
            other => panic!("expected RecordingChunk, got {other:?}"),
        }
    }

    #[test]
    fn final_chunk_may_omit_data() {
        let text = recording_chunk(42, None, true);
        match parse_extension_message(&text).unwrap() {
            ExtensionMessage::RecordingChunk { data, last, .. } => {
                assert!(data.is_none());
                assert!(last);
            }
            other => panic!("expected RecordingChunk, got {other:?}"),
        }
    }

    #[test]
    fn chunk_with_bad_base64_fails() {
        let text = json!({
            "method": "recordingChunk",
            "params": {"tabId": 1, "data": "not base64!!"},
        })
        .to_string();
        assert!(matches!(
            parse_extension_message(&text),
            Err(EnvelopeError::BadChunkData(_))
        ));
    }

    #[test]
    fn parse_log_envelope() {
        let text = log_message("warn", &json!(["slow frame", 123]));
        match parse_extension_message(&text).unwrap() {
            ExtensionMessage::Log { level, args } => {
                assert_eq!(level, "warn");
                assert_eq!(args[0], "slow frame");
            }
            other => panic!("expected Log, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            parse_extension_message("not-json"),
            Err(EnvelopeError::Json(_))
        ));
    }
}
