use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC parse error code used for malformed frames.
pub const PARSE_ERROR: i64 = -32700;

/// Generic CDP server error code.
pub const SERVER_ERROR: i64 = -32000;

/// WebSocket close code for a graceful close.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code sent when a client write stalls past the deadline.
pub const CLOSE_SERVER_STALL: u16 = 1011;

/// WebSocket close code sent to an extension displaced by a newer one.
pub const CLOSE_EXTENSION_REPLACED: u16 = 4001;

/// Close reason paired with [`CLOSE_EXTENSION_REPLACED`].
pub const EXTENSION_REPLACED_REASON: &str = "Extension Replaced";

/// Outgoing CDP command frame.
#[derive(Debug, Clone, Serialize)]
pub struct CdpCommand {
    /// Unique message ID for response correlation.
    pub id: u64,
    /// CDP method name (e.g., `Page.navigate`).
    pub method: String,
    /// Optional parameters for the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Optional session ID for session-scoped commands.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Raw incoming CDP message before classification.
///
/// The union of command, response, and event fields. Every incoming
/// WebSocket text frame is deserialized into this type first, then
/// classified via [`classify`](Self::classify).
#[derive(Debug, Clone, Deserialize)]
pub struct RawCdpMessage {
    /// Present for commands and responses; absent for events.
    pub id: Option<u64>,
    /// Present for commands and events.
    pub method: Option<String>,
    /// Command or event parameters.
    pub params: Option<Value>,
    /// Successful response payload.
    pub result: Option<Value>,
    /// Protocol error payload.
    pub error: Option<CdpProtocolError>,
    /// Session ID for session-scoped messages.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// CDP protocol error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpProtocolError {
    /// The CDP error code (e.g., -32000).
    pub code: i64,
    /// Human-readable error description.
    pub message: String,
}

/// Parsed CDP command (has both `id` and `method`).
#[derive(Debug, Clone)]
pub struct CdpRequest {
    pub id: u64,
    pub method: String,
    pub params: Option<Value>,
    pub session_id: Option<String>,
}

/// Parsed CDP response (has an `id`, no `method`).
#[derive(Debug, Clone)]
pub struct CdpResponse {
    /// The message ID that correlates to the sent command.
    pub id: u64,
    /// The result: either a successful value or a protocol error.
    pub result: Result<Value, CdpProtocolError>,
    /// Session ID if this response is session-scoped.
    pub session_id: Option<String>,
}

/// Parsed CDP event (no `id`, has `method`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// The CDP event method name (e.g., `Page.frameNavigated`).
    pub method: String,
    /// Event parameters.
    pub params: Value,
    /// Session ID if this event is session-scoped.
    pub session_id: Option<String>,
}

/// Classification of a raw CDP message.
#[derive(Debug, Clone)]
pub enum MessageKind {
    /// A command from a peer that expects a response.
    Request(CdpRequest),
    /// A response to a previously sent command.
    Response(CdpResponse),
    /// An asynchronous event.
    Event(CdpEvent),
}

impl RawCdpMessage {
    /// Classify this raw message.
    ///
    /// Messages with both `id` and `method` are commands; with `id` only,
    /// responses; with `method` only, events. Returns `None` if neither
    /// field is present.
    #[must_use]
    pub fn classify(self) -> Option<MessageKind> {
        match (self.id, self.method) {
            (Some(id), Some(method)) => Some(MessageKind::Request(CdpRequest {
                id,
                method,
                params: self.params,
                session_id: self.session_id,
            })),
            (Some(id), None) => {
                let result = if let Some(error) = self.error {
                    Err(error)
                } else {
                    Ok(self.result.unwrap_or(Value::Null))
                };
                Some(MessageKind::Response(CdpResponse {
                    id,
                    result,
                    session_id: self.session_id,
                }))
            }
            (None, Some(method)) => Some(MessageKind::Event(CdpEvent {
                method,
                params: self.params.unwrap_or(Value::Null),
                session_id: self.session_id,
            })),
            (None, None) => None,
        }
    }
}

/// Serialize a success response frame `{id, result, sessionId?}`.
#[must_use]
pub fn response_frame(id: u64, result: &Value, session_id: Option<&str>) -> String {
    let mut frame = serde_json::json!({ "id": id, "result": result });
    if let Some(sid) = session_id {
        frame["sessionId"] = Value::String(sid.to_owned());
    }
    frame.to_string()
}

/// Serialize an error response frame `{id, error:{code,message}, sessionId?}`.
#[must_use]
pub fn error_frame(id: u64, code: i64, message: &str, session_id: Option<&str>) -> String {
    let mut frame = serde_json::json!({
        "id": id,
        "error": { "code": code, "message": message },
    });
    if let Some(sid) = session_id {
        frame["sessionId"] = Value::String(sid.to_owned());
    }
    frame.to_string()
}

/// Serialize an error frame for a message whose id could not be parsed.
///
/// Used for JSON parse failures, where no id is recoverable.
#[must_use]
pub fn parse_error_frame(detail: &str) -> String {
    serde_json::json!({
        "error": {
            "code": PARSE_ERROR,
            "message": format!("Error parsing message: {detail}"),
        },
    })
    .to_string()
}

/// Serialize an event frame `{method, params, sessionId?}`.
#[must_use]
pub fn event_frame(method: &str, params: &Value, session_id: Option<&str>) -> String {
    let mut frame = serde_json::json!({ "method": method, "params": params });
    if let Some(sid) = session_id {
        frame["sessionId"] = Value::String(sid.to_owned());
    }
    frame.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- CdpCommand serialization ---

    #[test]
    fn serialize_command_without_params_or_session() {
        let cmd = CdpCommand {
            id: 1,
            method: "Browser.getVersion".into(),
            params: None,
            session_id: None,
        };
        let json: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "Browser.getVersion");
        assert!(json.get("params").is_none());
        assert!(json.get("sessionId").is_none());
    }

    #[test]
    fn serialize_command_with_session_id() {
        let cmd = CdpCommand {
            id: 3,
            method: "Runtime.evaluate".into(),
            params: Some(json!({"expression": "1+1"})),
            session_id: Some("pw-tab-1".into()),
        };
        let json: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["sessionId"], "pw-tab-1");
    }

    // --- classify() ---

    #[test]
    fn classify_request() {
        let raw: RawCdpMessage = serde_json::from_str(
            r#"{"id": 1, "method": "Page.navigate", "params": {"url": "https://example.com/"}}"#,
        )
        .unwrap();
        let kind = raw.classify();
        assert!(matches!(kind, Some(MessageKind::Request(_))));
        if let Some(MessageKind::Request(req)) = kind {
            assert_eq!(req.id, 1);
            assert_eq!(req.method, "Page.navigate");
        }
    }

    #[test]
    fn classify_response() {
        let raw: RawCdpMessage =
            serde_json::from_str(r#"{"id": 1, "result": {"ok": true}}"#).unwrap();
        let kind = raw.classify();
        assert!(matches!(kind, Some(MessageKind::Response(_))));
        if let Some(MessageKind::Response(resp)) = kind {
            assert_eq!(resp.id, 1);
            assert!(resp.result.is_ok());
        }
    }

    #[test]
    fn classify_error_response() {
        let raw: RawCdpMessage = serde_json::from_str(
            r#"{"id": 2, "error": {"code": -32600, "message": "Invalid request"}}"#,
        )
        .unwrap();
        if let Some(MessageKind::Response(resp)) = raw.classify() {
            let err = resp.result.unwrap_err();
            assert_eq!(err.code, -32600);
        } else {
            panic!("expected response");
        }
    }

    #[test]
    fn classify_event() {
        let raw: RawCdpMessage = serde_json::from_str(
            r#"{"method": "Page.frameNavigated", "params": {"frame": {}}, "sessionId": "pw-tab-2"}"#,
        )
        .unwrap();
        let kind = raw.classify();
        assert!(matches!(kind, Some(MessageKind::Event(_))));
        if let Some(MessageKind::Event(event)) = kind {
            assert_eq!(event.method, "Page.frameNavigated");
            assert_eq!(event.session_id.as_deref(), Some("pw-tab-2"));
        }
    }

    #[test]
    fn classify_unclassifiable_returns_none() {
        let raw: RawCdpMessage = serde_json::from_str(r"{}").unwrap();
        assert!(raw.classify().is_none());
    }

    #[test]
    fn classify_response_without_result_yields_null() {
        let raw: RawCdpMessage = serde_json::from_str(r#"{"id": 10}"#).unwrap();
        if let Some(MessageKind::Response(resp)) = raw.classify() {
            assert_eq!(resp.result.unwrap(), Value::Null);
        } else {
            panic!("expected response");
        }
    }

    // --- frame builders ---

    #[test]
    fn response_frame_includes_session_id() {
        let frame = response_frame(7, &json!({"ok": true}), Some("pw-tab-1"));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["result"]["ok"], true);
        assert_eq!(value["sessionId"], "pw-tab-1");
    }

    #[test]
    fn error_frame_shape() {
        let frame = error_frame(3, SERVER_ERROR, "no extension attached", None);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["error"]["code"], SERVER_ERROR);
        assert_eq!(value["error"]["message"], "no extension attached");
        assert!(value.get("sessionId").is_none());
    }

    #[test]
    fn parse_error_frame_has_no_id() {
        let frame = parse_error_frame("expected value at line 1");
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["error"]["code"], PARSE_ERROR);
        assert!(
            value["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("Error parsing message: ")
        );
    }

    #[test]
    fn event_frame_roundtrip() {
        let params = json!({"context": {"id": 3}});
        let frame = event_frame("Runtime.executionContextCreated", &params, Some("pw-tab-4"));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], "Runtime.executionContextCreated");
        assert_eq!(value["params"], params);
        assert_eq!(value["sessionId"], "pw-tab-4");
    }
}
