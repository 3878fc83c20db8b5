//! The processing step and its host loop.
//!
//! [`ChatClient::step`] is the only place state moves. One step:
//!
//! 1. writes at most one throttled channel line
//! 2. reads every inbound line that is already buffered, answering
//!    keepalives and reacting to reconnect and auth notices
//! 3. services liveness and the reconnect backoff
//! 4. dispatches whispers until the queue is empty or out of permits
//!
//! [`ChatClient::spawn`] runs the step on a timer in its own task, with a
//! [`ClientHandle`] for commands and an event receiver, the same shape as
//! a plain chat client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{ChatError, Result};
use crate::event::{Event, Inbound, classify};
use crate::helix::{Lookup, SendOutcome, WhisperApi};
use crate::irc::Message;
use crate::liveness::{Liveness, LivenessConfig, LivenessMonitor};
use crate::reconnect::{Backoff, BackoffConfig};
use crate::store::Store;
use crate::throttle::{ChannelThrottle, ThrottleConfig};
use crate::token::{SharedCredentials, TokenCoordinator, TokenRefresher};
use crate::transport::{ConnectConfig, Phase, ReadLine, Transport};
use crate::whisper::{Admission, WhisperLimits, WhisperQueue};

/// Everything the client needs at construction time.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect: ConnectConfig,
    /// TLS on `connect.tls_port`, plaintext on `connect.plain_port` otherwise.
    pub secure: bool,
    /// Row name of the persisted token pair.
    pub credential_name: String,
    pub whisper: WhisperLimits,
    pub liveness: LivenessConfig,
    pub backoff: BackoffConfig,
    pub throttle: ThrottleConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            secure: true,
            credential_name: "default".to_string(),
            whisper: WhisperLimits::default(),
            liveness: LivenessConfig::default(),
            backoff: BackoffConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

/// Diagnostic snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// `Handshaking` until the server confirms registration.
    pub phase: Phase,
    pub secure: bool,
    pub last_received: DateTime<Utc>,
    pub ping_outstanding: bool,
    pub backoff_interval: TimeDelta,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Commands the consumer can send to a spawned client.
#[derive(Debug)]
pub enum Command {
    Say(String),
    Whisper {
        to: String,
        user_id: Option<String>,
        body: String,
    },
    Quit,
}

/// A handle to a spawned [`ChatClient`].
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    /// Queue a line for the joined channel.
    pub async fn say(&self, text: &str) -> Result<()> {
        self.send(Command::Say(text.to_string())).await
    }

    /// Queue a whisper. Admission is decided by the client task.
    pub async fn whisper(&self, to: &str, user_id: Option<&str>, body: &str) -> Result<()> {
        self.send(Command::Whisper {
            to: to.to_string(),
            user_id: user_id.map(str::to_string),
            body: body.to_string(),
        })
        .await
    }

    pub async fn quit(&self) -> Result<()> {
        self.send(Command::Quit).await
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ChatError::ClientStopped)
    }
}

pub struct ChatClient<A, F> {
    transport: Transport,
    secure: bool,
    channel: String,
    own_nick: String,
    /// Server confirmed registration on the current connection.
    registered: bool,
    liveness: LivenessMonitor,
    backoff: Backoff,
    throttle: ChannelThrottle,
    whispers: WhisperQueue,
    tokens: TokenCoordinator<F>,
    api: A,
    store: Arc<Store>,
}

impl<A: WhisperApi, F: TokenRefresher> ChatClient<A, F> {
    pub fn new(
        config: ClientConfig,
        credentials: SharedCredentials,
        api: A,
        refresher: F,
        store: Arc<Store>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let tokens = TokenCoordinator::new(
            &config.credential_name,
            credentials.clone(),
            refresher,
            store.clone(),
        )?;
        let whispers = WhisperQueue::new(config.whisper, &*store, now)?;
        let own_nick = credentials.read().login.to_lowercase();
        let channel = config.connect.channel_name();

        Ok(Self {
            transport: Transport::new(config.connect, credentials),
            secure: config.secure,
            channel,
            own_nick,
            registered: false,
            liveness: LivenessMonitor::new(&config.liveness, now),
            backoff: Backoff::new(&config.backoff),
            throttle: ChannelThrottle::new(&config.throttle),
            whispers,
            tokens,
            api,
            store,
        })
    }

    /// Open the session. A failed attempt is left to the backoff; only a
    /// fatal error is returned.
    pub async fn start(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        self.connect(now, &mut events).await?;
        Ok(events)
    }

    /// Queue a line for the joined channel.
    pub fn say(&mut self, text: &str) {
        self.throttle.enqueue(text);
    }

    /// Queue a whisper to `username`.
    pub fn whisper(
        &mut self,
        username: &str,
        user_id: Option<String>,
        body: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        self.whispers.enqueue(username, user_id, body, now)
    }

    /// Advance the session by one step. Errors are fatal.
    pub async fn step(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        if self.transport.is_open() {
            self.drain_channel_line(now).await;
            self.read_inbound(now, &mut events).await?;
        }
        self.service_connection(now, &mut events).await?;
        self.dispatch_whispers(now).await?;
        Ok(events)
    }

    /// Step on every `tick` until `shutdown` flips, a `Quit` command
    /// arrives, or a fatal error occurs.
    ///
    /// The shutdown signal is checked once per iteration, so a step that
    /// has started always completes.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<Event>,
        mut shutdown: watch::Receiver<bool>,
        tick: Duration,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            if *shutdown.borrow() {
                tracing::info!("Shutdown requested");
                break Ok(());
            }
            let now = Utc::now();
            if self.apply_commands(&mut commands, now) {
                tracing::info!("Quit requested");
                break Ok(());
            }
            match self.step(now).await {
                Ok(batch) => {
                    let mut consumer_gone = false;
                    for event in batch {
                        if events.send(event).await.is_err() {
                            consumer_gone = true;
                            break;
                        }
                    }
                    if consumer_gone {
                        tracing::debug!("Event receiver dropped, stopping");
                        break Ok(());
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Fatal client error");
                    break Err(e);
                }
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        self.transport.close().await;
        result
    }

    /// Move the client into its own task.
    pub fn spawn(
        mut self,
        tick: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (ClientHandle, mpsc::Receiver<Event>, JoinHandle<Result<()>>)
    where
        A: 'static,
        F: 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(4096);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let task = tokio::spawn(async move { self.run(cmd_rx, event_tx, shutdown, tick).await });
        (ClientHandle { cmd_tx }, event_rx, task)
    }

    pub fn connection_state(&self) -> ConnectionState {
        let phase = match self.transport.phase() {
            Phase::Connected if !self.registered => Phase::Handshaking,
            other => other,
        };
        ConnectionState {
            phase,
            secure: self.secure,
            last_received: self.liveness.last_received(),
            ping_outstanding: self.liveness.probe_outstanding(),
            backoff_interval: self.backoff.current_interval(),
            next_retry_at: self.backoff.next_retry_at(),
        }
    }

    pub fn whispers(&self) -> &WhisperQueue {
        &self.whispers
    }

    /// Channel lines waiting for the throttle.
    pub fn channel_backlog(&self) -> usize {
        self.throttle.len()
    }

    pub fn credentials(&self) -> &SharedCredentials {
        self.tokens.credentials()
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Returns true on `Quit`.
    fn apply_commands(&mut self, commands: &mut mpsc::Receiver<Command>, now: DateTime<Utc>) -> bool {
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                Command::Say(text) => self.say(&text),
                Command::Whisper { to, user_id, body } => {
                    let admission = self.whisper(&to, user_id, &body, now);
                    if admission != Admission::Queued {
                        tracing::debug!(%to, ?admission, "Whisper not queued");
                    }
                }
                Command::Quit => return true,
            }
        }
        false
    }

    async fn drain_channel_line(&mut self, now: DateTime<Utc>) {
        let Some(text) = self.throttle.peek_ready(now).map(str::to_string) else {
            return;
        };
        let line = Message::new("PRIVMSG", vec![self.channel.clone(), text]).to_string();
        match self.write(&line).await {
            Ok(()) => self.throttle.confirm_sent(now),
            Err(e) => tracing::warn!(error = ?e, "Channel line held back"),
        }
    }

    async fn read_inbound(&mut self, now: DateTime<Utc>, events: &mut Vec<Event>) -> Result<()> {
        loop {
            let line = match self.transport.read_line() {
                ReadLine::Empty => return Ok(()),
                ReadLine::Line(line) => line,
                ReadLine::Closed(reason) => {
                    tracing::warn!(%reason, registered = self.registered, "Connection closed");
                    self.transport.close().await;
                    // A server that drops us before registering gets the backoff.
                    if !self.registered {
                        self.backoff.record_failure(now)?;
                    }
                    self.registered = false;
                    events.push(Event::Disconnected { reason });
                    return Ok(());
                }
            };

            self.liveness.on_line_received(now);
            let Some(msg) = Message::parse(&line) else {
                continue;
            };
            match classify(&msg, &self.own_nick) {
                Inbound::ServerPing(token) => {
                    let reply = Message::new("PONG", token.into_iter().collect()).to_string();
                    if let Err(e) = self.write(&reply).await {
                        tracing::warn!(error = ?e, "Keepalive reply failed");
                    }
                }
                Inbound::Pong(token) => self.liveness.on_pong(token.as_deref()),
                Inbound::Registered => {
                    self.registered = true;
                    // Only a registered session ends an outage.
                    self.backoff.record_success();
                    self.tokens.on_authorized();
                    tracing::info!(nick = %self.own_nick, "Registered");
                }
                Inbound::Reconnect => {
                    tracing::info!("Server requested reconnect");
                    self.reconnect(now, "server requested reconnect", events).await?;
                    return Ok(());
                }
                Inbound::AuthRejected(reason) => {
                    tracing::warn!(%reason, "Server rejected credential");
                    events.push(Event::AuthFailed {
                        reason: reason.clone(),
                    });
                    if self.refresh_after_unauthorized().await? {
                        self.reconnect(now, "credential refreshed", events).await?;
                    } else {
                        self.transport.close().await;
                        self.registered = false;
                        self.backoff.record_failure(now)?;
                        events.push(Event::Disconnected { reason });
                    }
                    return Ok(());
                }
                Inbound::Event(event) => events.push(event),
                Inbound::Ignored => {}
            }
        }
    }

    async fn service_connection(&mut self, now: DateTime<Utc>, events: &mut Vec<Event>) -> Result<()> {
        if !self.transport.is_open() {
            if self.backoff.should_retry(now) {
                self.connect(now, events).await?;
            }
            return Ok(());
        }

        match self.liveness.check(now) {
            Liveness::Healthy => {}
            Liveness::SendProbe(token) => {
                tracing::debug!("Idle, sending keepalive probe");
                let probe = Message::new("PING", vec![token.to_string()]).to_string();
                if let Err(e) = self.write(&probe).await {
                    tracing::warn!(error = ?e, "Keepalive probe failed");
                }
            }
            Liveness::Dead => {
                tracing::warn!(
                    last_received = %self.liveness.last_received(),
                    "Keepalive unanswered, connection is dead"
                );
                self.reconnect(now, "keepalive timed out", events).await?;
            }
        }
        Ok(())
    }

    async fn reconnect(&mut self, now: DateTime<Utc>, reason: &str, events: &mut Vec<Event>) -> Result<()> {
        events.push(Event::Reconnecting {
            reason: reason.to_string(),
        });
        self.connect(now, events).await
    }

    /// Replace the session. Failure feeds the backoff; only an exhausted
    /// backoff is returned. An open stream does not clear the backoff,
    /// registration does.
    async fn connect(&mut self, now: DateTime<Utc>, events: &mut Vec<Event>) -> Result<()> {
        self.registered = false;
        let attempt = if self.transport.is_open() {
            self.transport.restart().await
        } else {
            self.transport.connect(self.secure).await
        };
        match attempt {
            Ok(()) => {
                self.liveness.reset(now);
                events.push(Event::Connected {
                    secure: self.secure,
                });
                Ok(())
            }
            Err(e) => {
                events.push(Event::Disconnected {
                    reason: e.to_string(),
                });
                self.backoff.record_failure(now)?;
                tracing::info!(
                    failures = self.backoff.consecutive_failures(),
                    retry_at = ?self.backoff.next_retry_at(),
                    "Reconnect scheduled"
                );
                Ok(())
            }
        }
    }

    async fn dispatch_whispers(&mut self, now: DateTime<Utc>) -> Result<()> {
        while let Some(mut record) = self.whispers.select_next(now) {
            let to_id = match record.recipient_id.clone() {
                Some(id) => id,
                None => match self.api.resolve_user_id(&record.recipient).await {
                    Ok(Lookup::Found(id)) => {
                        self.whispers.remember_id(&record.recipient, &id);
                        record.recipient_id = Some(id.clone());
                        id
                    }
                    Ok(Lookup::NotFound) => {
                        let dropped = self.whispers.blacklist(&record.recipient);
                        tracing::warn!(recipient = %record.recipient, dropped, "Unknown login, blacklisted");
                        continue;
                    }
                    Ok(Lookup::Unauthorized) => {
                        let retry = self.refresh_after_unauthorized().await?;
                        self.whispers.report_failure(record);
                        if retry {
                            continue;
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(recipient = %record.recipient, error = %e, "User lookup failed");
                        self.whispers.report_failure(record);
                        break;
                    }
                },
            };

            match self.api.send_whisper(&to_id, &record.body).await {
                Ok(SendOutcome::Delivered) => {
                    self.tokens.on_authorized();
                    self.whispers.report_success(&record, &*self.store, now)?;
                    tracing::debug!(recipient = %record.recipient, "Whisper delivered");
                }
                Ok(SendOutcome::Unauthorized) => {
                    let retry = self.refresh_after_unauthorized().await?;
                    self.whispers.report_failure(record);
                    if !retry {
                        break;
                    }
                }
                Ok(SendOutcome::UnknownRecipient) => {
                    let dropped = self.whispers.blacklist(&record.recipient);
                    tracing::warn!(recipient = %record.recipient, dropped, "Unknown recipient, blacklisted");
                }
                Ok(SendOutcome::RateLimited) => {
                    self.whispers.freeze(now);
                    self.whispers.disable_new_recipients();
                    self.whispers.report_failure(record);
                    break;
                }
                Ok(SendOutcome::Rejected(status)) => {
                    tracing::warn!(recipient = %record.recipient, status, "Whisper refused, dropped");
                }
                Err(e) => {
                    tracing::warn!(recipient = %record.recipient, error = %e, "Whisper send failed, will retry");
                    self.whispers.report_failure(record);
                    break;
                }
            }
        }
        Ok(())
    }

    /// `Ok(true)`: refreshed, retry now. `Ok(false)`: the refresh itself
    /// hit a transient error, retry later. `Err`: fatal.
    async fn refresh_after_unauthorized(&mut self) -> Result<bool> {
        match self.tokens.on_unauthorized().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed, will retry");
                Ok(false)
            }
        }
    }

    async fn write(&mut self, line: &str) -> anyhow::Result<()> {
        self.transport
            .write_line(line)
            .await
            .with_context(|| format!("sending {}", line.split(' ').next().unwrap_or_default()))
    }
}
