//! End-to-end session tests against a loopback chat server.
//!
//! A `TcpListener` on 127.0.0.1 plays the server side: it checks the
//! handshake, feeds inbound lines and observes what the client writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chatline_sdk::ChatError;
use chatline_sdk::client::{ChatClient, ClientConfig};
use chatline_sdk::error::Result;
use chatline_sdk::event::Event;
use chatline_sdk::helix::{Lookup, SendOutcome, WhisperApi};
use chatline_sdk::liveness::LivenessConfig;
use chatline_sdk::reconnect::BackoffConfig;
use chatline_sdk::store::Store;
use chatline_sdk::token::{Credentials, TokenPair, TokenRefresher, shared};
use chatline_sdk::transport::{ConnectConfig, MAX_LINE_LEN, Phase};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

struct NoWhispers;

impl WhisperApi for NoWhispers {
    async fn send_whisper(&self, _to_user_id: &str, _body: &str) -> Result<SendOutcome> {
        Ok(SendOutcome::Delivered)
    }

    async fn resolve_user_id(&self, _login: &str) -> Result<Lookup> {
        Ok(Lookup::NotFound)
    }
}

#[derive(Clone, Default)]
struct StubRefresher {
    calls: Arc<AtomicUsize>,
}

impl TokenRefresher for StubRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenPair {
            access_token: format!("access-{n}"),
            refresh_token: format!("refresh-{n}"),
        })
    }
}

type TestClient = ChatClient<NoWhispers, StubRefresher>;

fn config(port: u16) -> ClientConfig {
    ClientConfig {
        connect: ConnectConfig {
            host: "127.0.0.1".into(),
            plain_port: port,
            channel: "Quest".into(),
            connect_timeout: Duration::from_secs(2),
            ..ConnectConfig::default()
        },
        secure: false,
        ..ClientConfig::default()
    }
}

fn client(config: ClientConfig, refresher: StubRefresher) -> TestClient {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("chatline_sdk=debug")
        .try_init();
    let creds = shared(Credentials {
        login: "QuestBot".into(),
        user_id: "42".into(),
        client_id: "client".into(),
        tokens: TokenPair {
            access_token: "access-0".into(),
            refresh_token: "refresh-0".into(),
        },
    });
    let store = Arc::new(Store::open_memory().unwrap());
    ChatClient::new(config, creds, NoWhispers, refresher, store, Utc::now()).unwrap()
}

async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

struct ServerConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ServerConn {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    async fn line(&mut self) -> String {
        let mut buf = String::new();
        tokio::time::timeout(Duration::from_secs(2), self.reader.read_line(&mut buf))
            .await
            .expect("no line from client")
            .unwrap();
        buf.trim_end().to_string()
    }

    async fn handshake(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..4 {
            lines.push(self.line().await);
        }
        lines
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }
}

/// Step with the wall clock until `done` matches an event.
async fn step_until(client: &mut TestClient, done: impl Fn(&Event) -> bool) -> Vec<Event> {
    let mut seen = Vec::new();
    for _ in 0..200 {
        let events = client.step(Utc::now()).await.unwrap();
        let hit = events.iter().any(&done);
        seen.extend(events);
        if hit {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached, saw {seen:?}");
}

/// Step at a frozen `now` until the server hangs up on us.
async fn step_until_dropped(client: &mut TestClient, now: DateTime<Utc>) -> Result<()> {
    for _ in 0..200 {
        let events = client.step(now).await?;
        if events.iter().any(|e| matches!(e, Event::Disconnected { .. })) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server hang-up never observed");
}

#[tokio::test]
async fn handshake_is_sent_in_order() {
    let (listener, port) = listen().await;
    let mut c = client(config(port), StubRefresher::default());

    let events = c.start(Utc::now()).await.unwrap();
    assert_eq!(events, vec![Event::Connected { secure: false }]);

    let mut server = ServerConn::accept(&listener).await;
    assert_eq!(
        server.handshake().await,
        vec![
            "CAP REQ :twitch.tv/tags twitch.tv/commands",
            "PASS oauth:access-0",
            "NICK questbot",
            "JOIN #quest",
        ]
    );
    assert_eq!(c.connection_state().phase, Phase::Handshaking);
}

#[tokio::test]
async fn step_does_not_wait_for_a_silent_server() {
    let (listener, port) = listen().await;
    let mut c = client(config(port), StubRefresher::default());
    c.start(Utc::now()).await.unwrap();
    let _server = ServerConn::accept(&listener).await;

    let events = tokio::time::timeout(Duration::from_millis(200), c.step(Utc::now()))
        .await
        .expect("step blocked")
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn registration_chat_and_server_ping() {
    let (listener, port) = listen().await;
    let mut c = client(config(port), StubRefresher::default());
    c.start(Utc::now()).await.unwrap();
    let mut server = ServerConn::accept(&listener).await;
    server.handshake().await;

    server.send(":tmi.twitch.tv 001 questbot :Welcome, GLHF!").await;
    server.send("PING :tmi.twitch.tv").await;
    server
        .send("@user-id=77 :alice!alice@alice.tmi.twitch.tv PRIVMSG #quest :hello bot")
        .await;

    let events = step_until(&mut c, |e| matches!(e, Event::ChannelMessage { .. })).await;
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ChannelMessage { from, text, .. } if from == "alice" && text == "hello bot"
    )));
    assert_eq!(server.line().await, "PONG :tmi.twitch.tv");
    assert_eq!(c.connection_state().phase, Phase::Connected);
}

#[tokio::test]
async fn channel_lines_go_out_one_per_step() {
    let (listener, port) = listen().await;
    let mut c = client(config(port), StubRefresher::default());
    c.start(Utc::now()).await.unwrap();
    let mut server = ServerConn::accept(&listener).await;
    server.handshake().await;

    c.say("first");
    c.say("second\r\nQUIT");
    c.step(Utc::now()).await.unwrap();
    assert_eq!(c.channel_backlog(), 1);
    c.step(Utc::now()).await.unwrap();
    assert_eq!(c.channel_backlog(), 0);

    assert_eq!(server.line().await, "PRIVMSG #quest :first");
    assert_eq!(server.line().await, "PRIVMSG #quest :secondQUIT");
}

#[tokio::test]
async fn auth_notice_refreshes_then_reconnects() {
    let (listener, port) = listen().await;
    let refresher = StubRefresher::default();
    let calls = refresher.calls.clone();
    let mut c = client(config(port), refresher);
    c.start(Utc::now()).await.unwrap();

    let mut first = ServerConn::accept(&listener).await;
    assert!(first.handshake().await.contains(&"PASS oauth:access-0".to_string()));
    first
        .send(":tmi.twitch.tv NOTICE * :Login authentication failed")
        .await;

    let events = step_until(&mut c, |e| matches!(e, Event::Connected { .. })).await;
    assert!(events.iter().any(|e| matches!(e, Event::AuthFailed { .. })));
    assert!(events.iter().any(|e| matches!(e, Event::Reconnecting { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut second = ServerConn::accept(&listener).await;
    assert!(second.handshake().await.contains(&"PASS oauth:access-1".to_string()));
}

#[tokio::test]
async fn rejected_again_after_refresh_is_fatal() {
    let (listener, port) = listen().await;
    let mut c = client(config(port), StubRefresher::default());
    c.start(Utc::now()).await.unwrap();

    let mut first = ServerConn::accept(&listener).await;
    first.handshake().await;
    first
        .send(":tmi.twitch.tv NOTICE * :Login authentication failed")
        .await;
    step_until(&mut c, |e| matches!(e, Event::Connected { .. })).await;

    let mut second = ServerConn::accept(&listener).await;
    second.handshake().await;
    second
        .send(":tmi.twitch.tv NOTICE * :Login authentication failed")
        .await;

    let mut fatal = None;
    for _ in 0..200 {
        if let Err(e) = c.step(Utc::now()).await {
            fatal = Some(e);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let err = fatal.expect("second rejection was not fatal");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn server_reconnect_carries_no_backoff() {
    let (listener, port) = listen().await;
    let mut c = client(config(port), StubRefresher::default());
    c.start(Utc::now()).await.unwrap();
    let mut first = ServerConn::accept(&listener).await;
    first.handshake().await;
    first.send(":tmi.twitch.tv RECONNECT").await;

    let events = step_until(&mut c, |e| matches!(e, Event::Connected { .. })).await;
    assert!(events.iter().any(|e| matches!(e, Event::Reconnecting { .. })));
    assert_eq!(c.connection_state().next_retry_at, None);

    let mut second = ServerConn::accept(&listener).await;
    assert_eq!(second.handshake().await.len(), 4);
}

#[tokio::test]
async fn refused_connect_backs_off() {
    let (listener, port) = listen().await;
    drop(listener);
    let mut c = client(config(port), StubRefresher::default());

    let t0 = Utc::now();
    let events = c.start(t0).await.unwrap();
    assert!(matches!(events.as_slice(), [Event::Disconnected { .. }]));
    assert_eq!(c.connection_state().next_retry_at, Some(t0 + TimeDelta::seconds(1)));

    // Not due yet: no attempt, no event.
    assert!(c.step(t0 + TimeDelta::milliseconds(500)).await.unwrap().is_empty());

    let t1 = t0 + TimeDelta::seconds(1);
    let events = c.step(t1).await.unwrap();
    assert!(matches!(events.as_slice(), [Event::Disconnected { .. }]));
    let state = c.connection_state();
    assert_eq!(state.backoff_interval, TimeDelta::seconds(2));
    assert_eq!(state.next_retry_at, Some(t1 + TimeDelta::seconds(2)));
    assert_eq!(state.phase, Phase::Disconnected);
}

#[tokio::test]
async fn unanswered_probe_triggers_one_reconnect() {
    let (listener, port) = listen().await;
    let mut cfg = config(port);
    cfg.liveness = LivenessConfig {
        idle_threshold: Duration::from_secs(60),
        response_grace: Duration::from_secs(10),
    };
    let mut c = client(cfg, StubRefresher::default());

    let t0: DateTime<Utc> = Utc::now();
    c.start(t0).await.unwrap();
    let mut first = ServerConn::accept(&listener).await;
    first.handshake().await;

    assert!(c.step(t0 + TimeDelta::seconds(61)).await.unwrap().is_empty());
    assert_eq!(first.line().await, "PING :chatline-keepalive");
    assert!(c.connection_state().ping_outstanding);

    let events = c.step(t0 + TimeDelta::seconds(65)).await.unwrap();
    assert!(events.is_empty());

    let events = c.step(t0 + TimeDelta::seconds(71)).await.unwrap();
    let reconnects = events
        .iter()
        .filter(|e| matches!(e, Event::Reconnecting { .. }))
        .count();
    assert_eq!(reconnects, 1);
    assert!(events.contains(&Event::Connected { secure: false }));
    assert!(!c.connection_state().ping_outstanding);

    let mut second = ServerConn::accept(&listener).await;
    assert_eq!(second.handshake().await.len(), 4);
}

#[tokio::test]
async fn spawned_client_takes_commands_and_stops_on_signal() {
    let (listener, port) = listen().await;
    let c = client(config(port), StubRefresher::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, mut events, task) = c.spawn(Duration::from_millis(10), shutdown_rx);

    let mut server = ServerConn::accept(&listener).await;
    server.handshake().await;
    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(Event::Connected { secure: false }));

    handle.say("hello").await.unwrap();
    assert_eq!(server.line().await, "PRIVMSG #quest :hello");

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(handle.say("late").await.is_err());
}

#[tokio::test]
async fn rejected_handshakes_double_the_backoff_until_registered() {
    let (listener, port) = listen().await;
    let mut c = client(config(port), StubRefresher::default());
    let mut now = Utc::now();
    c.start(now).await.unwrap();

    let mut intervals = Vec::new();
    for _ in 0..4 {
        let mut server = ServerConn::accept(&listener).await;
        server.handshake().await;
        drop(server);
        step_until_dropped(&mut c, now).await.unwrap();

        let state = c.connection_state();
        intervals.push(state.backoff_interval.num_milliseconds());
        now = state.next_retry_at.expect("retry scheduled");
        let events = c.step(now).await.unwrap();
        assert!(events.contains(&Event::Connected { secure: false }));
    }
    assert_eq!(intervals, vec![1000, 2000, 4000, 8000]);

    // An open stream alone keeps the outage; registration ends it.
    assert!(c.connection_state().next_retry_at.is_some());
    let mut server = ServerConn::accept(&listener).await;
    server.handshake().await;
    server.send(":tmi.twitch.tv 001 questbot :Welcome, GLHF!").await;
    for _ in 0..200 {
        c.step(now).await.unwrap();
        if c.connection_state().phase == Phase::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let state = c.connection_state();
    assert_eq!(state.phase, Phase::Connected);
    assert_eq!(state.next_retry_at, None);
    assert_eq!(state.backoff_interval, TimeDelta::seconds(1));
}

#[tokio::test]
async fn endless_handshake_rejection_is_fatal() {
    let (listener, port) = listen().await;
    let mut cfg = config(port);
    cfg.backoff = BackoffConfig {
        initial: Duration::from_secs(1),
        max: Duration::from_secs(2),
        max_outage: Duration::from_secs(3),
    };
    let mut c = client(cfg, StubRefresher::default());
    let mut now = Utc::now();
    c.start(now).await.unwrap();

    let mut rounds = 0;
    let err = loop {
        rounds += 1;
        assert!(rounds <= 10, "outage never became fatal");
        let mut server = ServerConn::accept(&listener).await;
        server.handshake().await;
        drop(server);
        if let Err(e) = step_until_dropped(&mut c, now).await {
            break e;
        }
        now = c.connection_state().next_retry_at.expect("retry scheduled");
        c.step(now).await.unwrap();
    };
    // 1s, then 2s (ceiling), then two more failures push past 3s there.
    assert_eq!(rounds, 4);
    assert!(matches!(err, ChatError::ReconnectExhausted { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn timed_out_connect_releases_socket() {
    let (listener, port) = listen().await;
    let mut cfg = config(port);
    cfg.secure = true;
    cfg.connect.tls_port = port;
    cfg.connect.connect_timeout = Duration::from_millis(200);
    let mut c = client(cfg, StubRefresher::default());

    // A plain listener never answers the TLS hello.
    let events = c.start(Utc::now()).await.unwrap();
    assert!(matches!(events.as_slice(), [Event::Disconnected { .. }]));
    assert_eq!(c.connection_state().phase, Phase::Disconnected);

    let (mut stream, _) = listener.accept().await.unwrap();
    let mut hello = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut hello))
        .await
        .expect("socket left open after timeout");
    assert!(read.is_ok());
}

#[tokio::test]
async fn overlong_inbound_line_drops_connection() {
    let (listener, port) = listen().await;
    let mut c = client(config(port), StubRefresher::default());
    c.start(Utc::now()).await.unwrap();
    let mut server = ServerConn::accept(&listener).await;
    server.handshake().await;

    server
        .writer
        .write_all("x".repeat(MAX_LINE_LEN + 1).as_bytes())
        .await
        .unwrap();
    let events = step_until(&mut c, |e| matches!(e, Event::Disconnected { .. })).await;
    assert!(events.contains(&Event::Disconnected {
        reason: "line too long".into()
    }));
    assert_eq!(c.connection_state().phase, Phase::Disconnected);
}

#[tokio::test]
async fn spawned_client_stops_when_events_are_dropped() {
    let (listener, port) = listen().await;
    let c = client(config(port), StubRefresher::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_handle, events, task) = c.spawn(Duration::from_millis(10), shutdown_rx);
    drop(events);

    let _server = ServerConn::accept(&listener).await;
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("client kept running without a consumer")
        .unwrap();
    assert!(result.is_ok());
}
