//! OAuth credential sharing and refresh.
//!
//! Every consumer (the transport handshake, the whisper REST client) holds
//! the same [`SharedCredentials`] and reads the access token at the moment
//! it needs it, so one refresh updates all of them.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{ChatError, Result};

/// Default token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Durable storage for the current token pair.
pub trait CredentialRepository {
    fn load_tokens(&self, name: &str) -> Result<Option<TokenPair>>;
    fn save_tokens(&self, name: &str, tokens: &TokenPair) -> Result<()>;
}

/// Identity and tokens of the bot account.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Login name; lowercased for `NICK`.
    pub login: String,
    /// Numeric account id, the `from_user_id` of whispers.
    pub user_id: String,
    /// OAuth application client id, sent with REST calls.
    pub client_id: String,
    pub tokens: TokenPair,
}

impl Credentials {
    pub fn access_token(&self) -> &str {
        &self.tokens.access_token
    }
}

pub type SharedCredentials = Arc<RwLock<Credentials>>;

pub fn shared(credentials: Credentials) -> SharedCredentials {
    Arc::new(RwLock::new(credentials))
}

/// Exchanges a refresh token for a new token pair.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, refresh_token: &str) -> impl Future<Output = Result<TokenPair>> + Send;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// `grant_type=refresh_token` against an OAuth token endpoint.
pub struct OAuthRefresher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthRefresher {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id,
            client_secret,
        }
    }

    pub fn with_token_url(mut self, url: &str) -> Self {
        self.token_url = url.to_string();
        self
    }
}

impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let resp = self.http.post(&self.token_url).form(&params).send().await?;

        let status = resp.status();
        if status.as_u16() == 400 || status.as_u16() == 401 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::RefreshRejected(body));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = resp.json().await?;
        Ok(TokenPair {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
        })
    }
}

/// Owns the refresh policy: one refresh per unauthorized streak.
pub struct TokenCoordinator<R> {
    name: String,
    credentials: SharedCredentials,
    refresher: R,
    repo: Arc<dyn CredentialRepository + Send + Sync>,
    refreshed_since_success: bool,
}

impl<R: TokenRefresher> TokenCoordinator<R> {
    /// Build the coordinator, adopting tokens from `repo` if a previous run
    /// rotated them.
    pub fn new(
        name: &str,
        credentials: SharedCredentials,
        refresher: R,
        repo: Arc<dyn CredentialRepository + Send + Sync>,
    ) -> Result<Self> {
        match repo.load_tokens(name)? {
            Some(stored) => {
                tracing::debug!(name, "Using persisted credentials");
                credentials.write().tokens = stored;
            }
            None => {
                let current = credentials.read().tokens.clone();
                repo.save_tokens(name, &current)?;
            }
        }
        Ok(Self {
            name: name.to_string(),
            credentials,
            refresher,
            repo,
            refreshed_since_success: false,
        })
    }

    pub fn credentials(&self) -> &SharedCredentials {
        &self.credentials
    }

    /// Exchange the refresh token, persist the new pair, then publish it.
    pub async fn refresh(&mut self) -> Result<()> {
        let refresh_token = self.credentials.read().tokens.refresh_token.clone();
        let pair = self.refresher.refresh(&refresh_token).await?;
        self.repo.save_tokens(&self.name, &pair)?;
        self.credentials.write().tokens = pair;
        tracing::info!(name = %self.name, "Access token refreshed");
        Ok(())
    }

    /// A dependent got an unauthorized response.
    ///
    /// The first one in a streak refreshes; a second one after a successful
    /// refresh is fatal.
    pub async fn on_unauthorized(&mut self) -> Result<()> {
        if self.refreshed_since_success {
            tracing::error!(name = %self.name, "Credential rejected again after refresh");
            return Err(ChatError::Unauthorized);
        }
        self.refresh().await?;
        self.refreshed_since_success = true;
        Ok(())
    }

    /// A dependent succeeded with the current credential.
    pub fn on_authorized(&mut self) {
        self.refreshed_since_success = false;
    }
}
