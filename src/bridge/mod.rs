//! The extension-side bridge: relay socket, per-tab debugger attachments,
//! the tab registry with its execution-context cache, and reconnection.

#[allow(clippy::module_inception)]
mod bridge;
pub mod debugger;
mod error;
pub mod registry;

pub use bridge::{BridgeConfig, run_bridge};
pub use error::BridgeError;
