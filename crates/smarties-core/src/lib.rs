//! `smarties-core` — configuration, shared errors and clock helpers used by
//! every other crate of the hub.

pub mod config;
pub mod error;

pub use config::HubConfig;
pub use error::{CoreError, Result};

/// Current wall-clock time as Unix seconds (UTC).
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
