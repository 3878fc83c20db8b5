//! Whisper delivery over the platform REST API.
//!
//! Status mapping for `POST /whispers`:
//! - 204: delivered
//! - 401: credential expired, refresh and retry once
//! - 404: unknown recipient, blacklist for the process lifetime
//! - 429: we are rate limited, freeze the queue
//! - other 4xx: the platform refused this particular whisper
//! - 5xx and transport errors: transient, returned as `Err`

use std::future::Future;

use serde::Deserialize;

use crate::error::{ChatError, Result};
use crate::token::SharedCredentials;

pub const DEFAULT_API_BASE: &str = "https://api.twitch.tv/helix";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Unauthorized,
    UnknownRecipient,
    RateLimited,
    Rejected(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(String),
    NotFound,
    Unauthorized,
}

/// The remote whisper endpoint, abstracted for the processing step.
pub trait WhisperApi: Send + Sync {
    fn send_whisper(
        &self,
        to_user_id: &str,
        body: &str,
    ) -> impl Future<Output = Result<SendOutcome>> + Send;

    fn resolve_user_id(&self, login: &str) -> impl Future<Output = Result<Lookup>> + Send;
}

/// Map a whisper POST status onto an outcome. `None` means transient.
pub fn classify_send_status(status: u16) -> Option<SendOutcome> {
    match status {
        200..=299 => Some(SendOutcome::Delivered),
        401 => Some(SendOutcome::Unauthorized),
        404 => Some(SendOutcome::UnknownRecipient),
        429 => Some(SendOutcome::RateLimited),
        400..=499 => Some(SendOutcome::Rejected(status)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    data: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    id: String,
}

pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    credentials: SharedCredentials,
}

impl HelixClient {
    pub fn new(credentials: SharedCredentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_API_BASE.to_string(),
            credentials,
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Authorization headers read at call time, so a refresh is picked up
    /// without rebuilding the client.
    fn auth(&self) -> (String, String, String) {
        let creds = self.credentials.read();
        (
            format!("Bearer {}", creds.access_token()),
            creds.client_id.clone(),
            creds.user_id.clone(),
        )
    }
}

impl WhisperApi for HelixClient {
    async fn send_whisper(&self, to_user_id: &str, body: &str) -> Result<SendOutcome> {
        let (bearer, client_id, from_user_id) = self.auth();
        let resp = self
            .http
            .post(format!("{}/whispers", self.base_url))
            .query(&[("from_user_id", from_user_id.as_str()), ("to_user_id", to_user_id)])
            .header("Authorization", bearer)
            .header("Client-Id", client_id)
            .json(&serde_json::json!({ "message": body }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        match classify_send_status(status) {
            Some(outcome) => {
                if let SendOutcome::Rejected(code) = outcome {
                    let text = resp.text().await.unwrap_or_default();
                    tracing::warn!(status = code, body = %text, to_user_id, "Whisper rejected");
                }
                Ok(outcome)
            }
            None => {
                let body = resp.text().await.unwrap_or_default();
                Err(ChatError::Remote { status, body })
            }
        }
    }

    async fn resolve_user_id(&self, login: &str) -> Result<Lookup> {
        let (bearer, client_id, _) = self.auth();
        let resp = self
            .http
            .get(format!("{}/users", self.base_url))
            .query(&[("login", login)])
            .header("Authorization", bearer)
            .header("Client-Id", client_id)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 {
            return Ok(Lookup::Unauthorized);
        }
        if status.as_u16() == 400 || status.as_u16() == 404 {
            return Ok(Lookup::NotFound);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        let users: UsersResponse = resp.json().await?;
        Ok(match users.data.into_iter().next() {
            Some(user) => Lookup::Found(user.id),
            None => Lookup::NotFound,
        })
    }
}
