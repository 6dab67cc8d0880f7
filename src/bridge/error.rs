use std::fmt;

/// Errors from the bridge's debugger connections and relay socket.
#[derive(Debug)]
pub enum BridgeError {
    /// WebSocket connection could not be established.
    Connection(String),

    /// Connection attempt exceeded the configured timeout.
    ConnectionTimeout,

    /// Chrome returned a CDP protocol-level error.
    Protocol {
        /// The CDP error code (e.g., -32000).
        code: i64,
        /// The CDP error message.
        message: String,
    },

    /// The connection was closed before a response arrived.
    ConnectionClosed,

    /// The tab is not attached (or no tab is attached at all).
    NotAttached(String),

    /// Internal error (a task died or a channel closed).
    Internal(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "debugger connection error: {msg}"),
            Self::ConnectionTimeout => write!(f, "debugger connection timed out"),
            Self::Protocol { code, message } => {
                write!(f, "debugger protocol error ({code}): {message}")
            }
            Self::ConnectionClosed => write!(f, "debugger connection closed"),
            Self::NotAttached(detail) => write!(f, "tab not attached: {detail}"),
            Self::Internal(msg) => write!(f, "bridge internal error: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl BridgeError {
    /// The CDP error code to use when this error is framed into an envelope
    /// response.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Protocol { code, .. } => *code,
            _ => crate::protocol::types::SERVER_ERROR,
        }
    }
}

impl From<BridgeError> for crate::error::AppError {
    fn from(e: BridgeError) -> Self {
        use crate::error::ExitCode;
        let code = match &e {
            BridgeError::Connection(_) | BridgeError::ConnectionClosed => {
                ExitCode::ConnectionError
            }
            BridgeError::ConnectionTimeout => ExitCode::TimeoutError,
            BridgeError::Protocol { .. } => ExitCode::ProtocolError,
            BridgeError::NotAttached(_) => ExitCode::TargetError,
            BridgeError::Internal(_) => ExitCode::GeneralError,
        };
        Self {
            message: e.to_string(),
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_connection() {
        let err = BridgeError::Connection("refused".into());
        assert_eq!(err.to_string(), "debugger connection error: refused");
    }

    #[test]
    fn display_protocol() {
        let err = BridgeError::Protocol {
            code: -32000,
            message: "Not found".into(),
        };
        assert_eq!(err.to_string(), "debugger protocol error (-32000): Not found");
    }

    #[test]
    fn protocol_keeps_code_others_default() {
        let err = BridgeError::Protocol {
            code: -32601,
            message: "nope".into(),
        };
        assert_eq!(err.code(), -32601);
        assert_eq!(
            BridgeError::ConnectionClosed.code(),
            crate::protocol::types::SERVER_ERROR
        );
    }
}
