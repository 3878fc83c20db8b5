//! Line-oriented chat transport over TCP or TLS.
//!
//! The session owns the socket exclusively. A spawned reader task splits
//! the inbound byte stream into lines and hands them over an mpsc channel,
//! so [`Transport::read_line`] is a `try_recv`: it returns immediately
//! whether or not a complete line is buffered. Writes go straight to the
//! write half.
//!
//! [`Transport::restart`] tears the whole connection down (reader task
//! aborted, write half shut down and dropped) before a new socket is
//! opened, so a faulted stream is never reused.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::error::{ChatError, Result};
use crate::irc::Message;
use crate::token::SharedCredentials;

/// Longest inbound line accepted, terminator included. A server that
/// exceeds it is treated as a broken stream.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Configuration for the chat server connection.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server host name (also the TLS server name).
    pub host: String,
    /// Port for TLS connections.
    pub tls_port: u16,
    /// Port for plaintext connections.
    pub plain_port: u16,
    /// Channel to join, with or without the leading `#`.
    pub channel: String,
    /// Capabilities requested with `CAP REQ`.
    pub capabilities: Vec<String>,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
    /// Bound on TCP connect, TLS handshake and the handshake writes.
    pub connect_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: "irc.chat.twitch.tv".to_string(),
            tls_port: 6697,
            plain_port: 6667,
            channel: String::new(),
            capabilities: vec![
                "twitch.tv/tags".to_string(),
                "twitch.tv/commands".to_string(),
            ],
            tls_insecure: false,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl ConnectConfig {
    /// `#channel`, lowercased.
    pub fn channel_name(&self) -> String {
        format!("#{}", self.channel.trim_start_matches('#').to_lowercase())
    }

    fn addr(&self, secure: bool) -> String {
        let port = if secure { self.tls_port } else { self.plain_port };
        format!("{}:{port}", self.host)
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLine {
    Line(String),
    /// No complete line buffered right now.
    Empty,
    /// The connection is gone.
    Closed(String),
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Stream for T {}

type BoxStream = Box<dyn Stream>;

/// Reader task output: a line, or the reason the stream ended.
type ReaderItem = std::result::Result<String, String>;

struct Live {
    writer: WriteHalf<BoxStream>,
    lines: mpsc::Receiver<ReaderItem>,
    reader: JoinHandle<()>,
}

pub struct Transport {
    config: ConnectConfig,
    credentials: SharedCredentials,
    secure: bool,
    phase: Phase,
    live: Option<Live>,
}

impl Transport {
    pub fn new(config: ConnectConfig, credentials: SharedCredentials) -> Self {
        Self {
            config,
            credentials,
            secure: true,
            phase: Phase::Disconnected,
            live: None,
        }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Open the stream and send the handshake.
    ///
    /// Any previous connection is released first. The reader task only
    /// starts once the handshake is written, so a failed or timed-out
    /// attempt drops both halves and closes the socket.
    pub async fn connect(&mut self, secure: bool) -> Result<()> {
        self.release().await;
        self.secure = secure;
        self.phase = Phase::Connecting;

        let limit = self.config.connect_timeout;
        let result = match tokio::time::timeout(limit, self.open_and_handshake(secure)).await {
            Ok(r) => r,
            Err(_) => Err(ChatError::ConnectTimeout(limit)),
        };
        match result {
            Ok((read_half, writer)) => {
                let (tx, rx) = mpsc::channel(4096);
                let reader = tokio::spawn(read_lines(BufReader::new(read_half), tx));
                self.live = Some(Live {
                    writer,
                    lines: rx,
                    reader,
                });
                self.phase = Phase::Connected;
                tracing::info!(addr = %self.config.addr(secure), secure, "Connected");
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Disconnected;
                tracing::warn!(addr = %self.config.addr(secure), secure, error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// Release the socket completely and connect again in the same mode.
    pub async fn restart(&mut self) -> Result<()> {
        let secure = self.secure;
        self.connect(secure).await
    }

    /// Drop the connection without reconnecting.
    pub async fn close(&mut self) {
        self.release().await;
    }

    /// Write one line; CRLF is appended.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let live = self.live.as_mut().ok_or(ChatError::NotConnected)?;
        let result = async {
            live.writer.write_all(format!("{line}\r\n").as_bytes()).await?;
            live.writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Write failed");
            self.release().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Next buffered line without waiting.
    pub fn read_line(&mut self) -> ReadLine {
        let Some(live) = self.live.as_mut() else {
            return ReadLine::Closed("not connected".to_string());
        };
        match live.lines.try_recv() {
            Ok(Ok(line)) => ReadLine::Line(line),
            Ok(Err(reason)) => ReadLine::Closed(reason),
            Err(TryRecvError::Empty) => ReadLine::Empty,
            Err(TryRecvError::Disconnected) => ReadLine::Closed("reader stopped".to_string()),
        }
    }

    async fn open_and_handshake(&self, secure: bool) -> Result<(ReadHalf<BoxStream>, WriteHalf<BoxStream>)> {
        let stream = self.open(secure).await?;
        let (read_half, mut writer) = tokio::io::split(stream);

        for line in self.handshake_lines() {
            writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        }
        writer.flush().await?;
        tracing::debug!(channel = %self.config.channel_name(), "Handshake sent");

        Ok((read_half, writer))
    }

    async fn open(&self, secure: bool) -> Result<BoxStream> {
        let addr = self.config.addr(secure);
        tracing::debug!(%addr, secure, "Opening connection");
        let tcp = TcpStream::connect(&addr).await?;
        if !secure {
            return Ok(Box::new(tcp));
        }

        let tls_config = if self.config.tls_insecure {
            tracing::debug!("TLS: insecure mode (skipping cert verification)");
            rustls_insecure_config()
        } else {
            rustls_default_config()
        };
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(self.config.host.clone())
            .map_err(|_| ChatError::InvalidServerName(self.config.host.clone()))?;
        let tls = connector.connect(server_name, tcp).await?;
        Ok(Box::new(tls))
    }

    /// `CAP REQ`, `PASS`, `NICK`, `JOIN`, in that order.
    pub fn handshake_lines(&self) -> Vec<String> {
        let creds = self.credentials.read();
        let mut lines = Vec::with_capacity(4);
        if !self.config.capabilities.is_empty() {
            lines.push(Message::new(
                "CAP",
                vec!["REQ".to_string(), self.config.capabilities.join(" ")],
            ));
        }
        let token = creds.access_token();
        let token = token.strip_prefix("oauth:").unwrap_or(token);
        lines.push(Message::new("PASS", vec![format!("oauth:{token}")]));
        lines.push(Message::new("NICK", vec![creds.login.to_lowercase()]));
        lines.push(Message::new("JOIN", vec![self.config.channel_name()]));
        lines.iter().map(Message::to_string).collect()
    }

    async fn release(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.reader.abort();
            let _ = tokio::time::timeout(Duration::from_secs(2), live.writer.shutdown()).await;
            tracing::debug!("Connection released");
        }
        self.phase = Phase::Disconnected;
    }
}

async fn read_lines(mut reader: BufReader<ReadHalf<BoxStream>>, tx: mpsc::Sender<ReaderItem>) {
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match (&mut reader).take(MAX_LINE_LEN as u64).read_until(b'\n', &mut buf).await {
            Ok(0) => {
                let _ = tx.send(Err("EOF".to_string())).await;
                break;
            }
            Ok(n) if n == MAX_LINE_LEN && buf.last() != Some(&b'\n') => {
                tracing::warn!(limit = MAX_LINE_LEN, "Inbound line too long");
                let _ = tx.send(Err("line too long".to_string())).await;
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                tracing::trace!(line, "<<");
                if tx.send(Ok(line.to_string())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e.to_string())).await;
                break;
            }
        }
    }
}

fn install_crypto_provider() {
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}
