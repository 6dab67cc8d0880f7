use std::fmt;

/// Errors surfaced by the relay's routing layer.
#[derive(Debug, Clone)]
pub enum RelayError {
    /// No extension is connected to the relay.
    NoExtension,

    /// A command referenced a session id that maps to no attached tab.
    UnknownSession(String),

    /// The client's pending-command table is full.
    BacklogExceeded,

    /// The extension slot was taken over by a newer extension.
    ExtensionReplaced,

    /// The extension (or a peer socket) closed before responding.
    ConnectionClosed,

    /// The extension returned a protocol-level error.
    Protocol {
        /// The CDP error code (e.g., -32000).
        code: i64,
        /// The CDP error message.
        message: String,
    },

    /// Internal error (a routing task died or a channel closed).
    Internal(String),
}

impl RelayError {
    /// The CDP error code to use when this error is framed to a client.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Protocol { code, .. } => *code,
            _ => super::types::SERVER_ERROR,
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoExtension => write!(f, "no extension attached to the relay"),
            Self::UnknownSession(sid) => write!(f, "unknown session id: {sid}"),
            Self::BacklogExceeded => write!(f, "client backlog exceeded"),
            Self::ExtensionReplaced => write!(f, "extension replaced"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Protocol { code, message } => {
                write!(f, "protocol error ({code}): {message}")
            }
            Self::Internal(msg) => write!(f, "relay internal error: {msg}"),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::SERVER_ERROR;

    #[test]
    fn display_no_extension() {
        assert_eq!(
            RelayError::NoExtension.to_string(),
            "no extension attached to the relay"
        );
    }

    #[test]
    fn display_unknown_session() {
        let err = RelayError::UnknownSession("pw-tab-9".into());
        assert_eq!(err.to_string(), "unknown session id: pw-tab-9");
    }

    #[test]
    fn display_backlog() {
        assert_eq!(
            RelayError::BacklogExceeded.to_string(),
            "client backlog exceeded"
        );
    }

    #[test]
    fn display_replaced() {
        assert_eq!(
            RelayError::ExtensionReplaced.to_string(),
            "extension replaced"
        );
    }

    #[test]
    fn protocol_error_keeps_its_code() {
        let err = RelayError::Protocol {
            code: -32601,
            message: "method not found".into(),
        };
        assert_eq!(err.code(), -32601);
        assert_eq!(err.to_string(), "protocol error (-32601): method not found");
    }

    #[test]
    fn other_errors_use_server_error_code() {
        assert_eq!(RelayError::NoExtension.code(), SERVER_ERROR);
        assert_eq!(RelayError::BacklogExceeded.code(), SERVER_ERROR);
    }
}
