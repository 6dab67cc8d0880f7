//! Wire-level building blocks shared by the relay and the bridge: CDP frame
//! types and classification, the relay↔extension envelope, and the error
//! taxonomy surfaced on sockets.

pub mod envelope;
mod error;
pub mod types;

pub use error::RelayError;
pub use types::{
    CLOSE_EXTENSION_REPLACED, CLOSE_NORMAL, CLOSE_SERVER_STALL, CdpCommand, CdpEvent,
    CdpProtocolError, CdpRequest, CdpResponse, EXTENSION_REPLACED_REASON, MessageKind,
    PARSE_ERROR, RawCdpMessage, SERVER_ERROR,
};
