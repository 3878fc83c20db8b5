//! chatline-sdk: chat transport core.
//!
//! A single reconnecting IRC-style session with liveness monitoring, a
//! throttled public channel writer, and a quota-aware whisper delivery
//! queue that survives restarts through a small SQLite store.
//!
//! The host drives everything through [`client::ChatClient::step`]:
//!
//! - at most one throttled channel line goes out
//! - every buffered inbound line is read and classified
//! - liveness and reconnect checks run
//! - whispers are dispatched while the quotas allow

pub mod client;
pub mod error;
pub mod event;
pub mod helix;
pub mod irc;
pub mod liveness;
pub mod rate_limit;
pub mod reconnect;
pub mod reset_timer;
pub mod store;
pub mod throttle;
pub mod token;
pub mod transport;
pub mod whisper;

pub use error::ChatError;
