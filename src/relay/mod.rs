//! The relay server: hub actor, per-client session state, the HTTP/WebSocket
//! surface, the recording coordinator, and port ownership.

pub mod hub;
pub mod ownership;
pub mod recording;
pub mod server;
pub mod session;

pub use hub::{HubHandle, spawn_hub};
pub use recording::{RecorderHandle, spawn_recorder};
pub use server::{RelayConfig, RelayState, create_router, serve};
