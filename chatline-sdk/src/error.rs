//! Errors surfaced to the host.
//!
//! Transient failures (I/O, a single 401, 429) are handled inside
//! [`crate::client::ChatClient::step`] and never reach the caller. What does
//! come out of `step` is fatal and needs an operator.

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The remote side rejected the credential again right after a refresh.
    #[error("credential rejected after refresh")]
    Unauthorized,

    /// The token endpoint refused the refresh token itself.
    #[error("token refresh rejected: {0}")]
    RefreshRejected(String),

    /// Reconnection has been failing at the backoff ceiling for too long.
    #[error("reconnect failing since {since}, giving up")]
    ReconnectExhausted { since: DateTime<Utc> },

    /// Unexpected HTTP status from a remote endpoint.
    #[error("remote returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("not connected")]
    NotConnected,

    /// The client task has exited; commands can no longer be delivered.
    #[error("client stopped")]
    ClientStopped,

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

impl ChatError {
    /// Whether the host should stop driving the client.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChatError::Unauthorized
                | ChatError::RefreshRejected(_)
                | ChatError::ReconnectExhausted { .. }
                | ChatError::Storage(_)
        )
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
