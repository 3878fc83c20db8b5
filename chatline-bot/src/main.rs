//! chatline-bot: keeps a chat session alive and relays whispers.
//!
//! Flags override the config file. Tokens and the OAuth client secret come
//! from the environment:
//!
//!   CHATLINE_ACCESS_TOKEN, CHATLINE_REFRESH_TOKEN,
//!   CHATLINE_CLIENT_ID, CHATLINE_CLIENT_SECRET

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatline_sdk::client::{ChatClient, ClientHandle};
use chatline_sdk::event::Event;
use chatline_sdk::helix::HelixClient;
use chatline_sdk::store::Store;
use chatline_sdk::token::{Credentials, OAuthRefresher, TokenPair, shared};
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;

use chatline_bot::config::Config;
use chatline_bot::router::{self, Action};

#[derive(Parser)]
#[command(name = "chatline-bot", about = "Chat bot with throttled channel output and whisper delivery")]
struct Args {
    /// Config file (default: ~/.config/chatline/bot.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chat server host
    #[arg(long)]
    server: Option<String>,

    /// Channel to join
    #[arg(long)]
    channel: Option<String>,

    /// Bot account login
    #[arg(long)]
    login: Option<String>,

    /// Bot account numeric id
    #[arg(long)]
    user_id: Option<String>,

    /// Connect without TLS
    #[arg(long)]
    no_tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    tls_insecure: bool,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Emit JSON logs
    #[arg(long)]
    log_json: bool,

    #[arg(long, env = "CHATLINE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    #[arg(long, env = "CHATLINE_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: String,

    #[arg(long, env = "CHATLINE_CLIENT_ID")]
    client_id: String,

    #[arg(long, env = "CHATLINE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(ref s) = self.server {
            config.server = Some(s.clone());
        }
        if let Some(ref c) = self.channel {
            config.channel = Some(c.clone());
        }
        if let Some(ref l) = self.login {
            config.login = Some(l.clone());
        }
        if let Some(ref id) = self.user_id {
            config.user_id = Some(id.clone());
        }
        if self.no_tls {
            config.tls = Some(false);
        }
        if self.tls_insecure {
            config.tls_insecure = Some(true);
        }
        if let Some(ref db) = self.db {
            config.db_path = Some(db.clone());
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chatline_bot=info,chatline_sdk=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    let client_config = config.client_config()?;
    let login = config.login.clone().context("no login configured")?;
    let user_id = config.user_id.clone().context("no user id configured")?;

    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(Store::open(&db_path)?);

    let credentials = shared(Credentials {
        login: login.clone(),
        user_id,
        client_id: args.client_id.clone(),
        tokens: TokenPair {
            access_token: args.access_token.clone(),
            refresh_token: args.refresh_token.clone(),
        },
    });
    let mut api = HelixClient::new(credentials.clone());
    if let Some(ref base) = config.api_base {
        api = api.with_base_url(base);
    }
    let mut refresher = OAuthRefresher::new(args.client_id.clone(), args.client_secret.clone());
    if let Some(ref url) = config.token_url {
        refresher = refresher.with_token_url(url);
    }

    tracing::info!(
        server = %client_config.connect.host,
        channel = %client_config.connect.channel_name(),
        nick = %login,
        secure = client_config.secure,
        db = %db_path.display(),
        "Starting chatline-bot"
    );

    let client = ChatClient::new(client_config, credentials, api, refresher, store, Utc::now())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, mut events, task) = client.spawn(config.tick(), shutdown_rx);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let prefix = config.prefix().to_string();
    while let Some(event) = events.recv().await {
        log_event(&event);
        if let Some(action) = router::route(&event, &prefix) {
            if let Err(e) = perform(&handle, action).await {
                tracing::warn!(error = %e, "Command not delivered");
            }
        }
    }

    task.await.context("client task panicked")??;
    tracing::info!("Stopped");
    Ok(())
}

async fn perform(handle: &ClientHandle, action: Action) -> chatline_sdk::error::Result<()> {
    match action {
        Action::Say(text) => handle.say(&text).await,
        Action::Whisper { to, user_id, body } => {
            handle.whisper(&to, user_id.as_deref(), &body).await
        }
    }
}

fn log_event(event: &Event) {
    match event {
        Event::Connected { secure } => tracing::info!(secure, "Connected"),
        Event::Joined { channel } => tracing::info!(%channel, "Joined"),
        Event::ChannelMessage {
            from, channel, text, ..
        } => tracing::info!(%from, %channel, %text, "Chat"),
        Event::Whisper { from, text, .. } => tracing::info!(%from, %text, "Whisper"),
        Event::Notice { msg_id, text } => tracing::info!(?msg_id, %text, "Notice"),
        Event::UserNotice {
            channel, msg_id, text, ..
        } => tracing::info!(%channel, ?msg_id, %text, "User notice"),
        Event::AuthFailed { reason } => tracing::warn!(%reason, "Auth failed"),
        Event::Reconnecting { reason } => tracing::warn!(%reason, "Reconnecting"),
        Event::Disconnected { reason } => tracing::warn!(%reason, "Disconnected"),
    }
}
