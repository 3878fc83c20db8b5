//! Bot configuration file.
//!
//! Lives at `~/.config/chatline/bot.toml` unless `--config` points
//! elsewhere. Every field is optional; missing ones fall back to the SDK
//! defaults. Secrets never go in this file, they come from the
//! environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chatline_sdk::client::ClientConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Chat server host.
    pub server: Option<String>,
    pub tls_port: Option<u16>,
    pub plain_port: Option<u16>,
    /// Connect with TLS. Default: true.
    pub tls: Option<bool>,
    /// Skip TLS certificate verification.
    pub tls_insecure: Option<bool>,
    /// Channel to join, with or without `#`.
    pub channel: Option<String>,
    /// Bot account login.
    pub login: Option<String>,
    /// Bot account numeric id.
    pub user_id: Option<String>,
    /// SQLite file for the reset timer and rotated tokens.
    pub db_path: Option<PathBuf>,
    /// Milliseconds between processing steps.
    pub tick_ms: Option<u64>,
    /// Prefix for chat commands.
    pub prefix: Option<String>,
    /// Override for the REST API base URL.
    pub api_base: Option<String>,
    /// Override for the OAuth token endpoint.
    pub token_url: Option<String>,
    pub whisper: WhisperSection,
    pub liveness: LivenessSection,
    pub backoff: BackoffSection,
    pub throttle: ThrottleSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WhisperSection {
    pub per_second: Option<u32>,
    pub per_minute: Option<u32>,
    pub max_unique_recipients: Option<usize>,
    pub starvation_ticks: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LivenessSection {
    pub idle_secs: Option<u64>,
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackoffSection {
    pub initial_secs: Option<u64>,
    pub max_secs: Option<u64>,
    pub max_outage_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ThrottleSection {
    pub lines: Option<u32>,
    pub window_secs: Option<u64>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatline")
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatline")
        .join("chatline.db")
}

impl Config {
    /// Load `path`, or the default file if it exists.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = config_dir().join("bot.toml");
                if !p.exists() {
                    return Ok(Self::default());
                }
                p
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(default_db_path)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.unwrap_or(100).max(1))
    }

    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or("!")
    }

    /// Build the client configuration. The channel is required.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut cfg = ClientConfig::default();
        let connect = &mut cfg.connect;
        connect.channel = self.channel.clone().context("no channel configured")?;
        if let Some(ref host) = self.server {
            connect.host = host.clone();
        }
        if let Some(port) = self.tls_port {
            connect.tls_port = port;
        }
        if let Some(port) = self.plain_port {
            connect.plain_port = port;
        }
        connect.tls_insecure = self.tls_insecure.unwrap_or(false);
        cfg.secure = self.tls.unwrap_or(true);
        if let Some(ref login) = self.login {
            cfg.credential_name = login.to_lowercase();
        }

        let w = &mut cfg.whisper;
        if let Some(n) = self.whisper.per_second {
            w.per_second = n;
        }
        if let Some(n) = self.whisper.per_minute {
            w.per_minute = n;
        }
        if let Some(n) = self.whisper.max_unique_recipients {
            w.max_unique_recipients = n;
        }
        if let Some(n) = self.whisper.starvation_ticks {
            w.starvation_tick_limit = n;
        }

        if let Some(s) = self.liveness.idle_secs {
            cfg.liveness.idle_threshold = Duration::from_secs(s);
        }
        if let Some(s) = self.liveness.grace_secs {
            cfg.liveness.response_grace = Duration::from_secs(s);
        }

        if let Some(s) = self.backoff.initial_secs {
            cfg.backoff.initial = Duration::from_secs(s);
        }
        if let Some(s) = self.backoff.max_secs {
            cfg.backoff.max = Duration::from_secs(s);
        }
        if let Some(s) = self.backoff.max_outage_secs {
            cfg.backoff.max_outage = Duration::from_secs(s);
        }

        if let Some(n) = self.throttle.lines {
            cfg.throttle.max_lines = n;
        }
        if let Some(s) = self.throttle.window_secs {
            cfg.throttle.window = Duration::from_secs(s);
        }
        Ok(cfg)
    }
}
