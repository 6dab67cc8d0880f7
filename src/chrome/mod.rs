//! Access to Chrome's DevTools HTTP endpoint: version probing, target
//! listing, and tab creation/closing. The per-tab WebSocket connections live
//! in [`crate::bridge`].

mod devtools;
mod error;

pub use devtools::{
    BrowserVersion, TargetInfo, close_tab, create_tab, probe, query_targets, query_version,
};
pub use error::ChromeError;
