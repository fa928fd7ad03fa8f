//! The persistent upstream connection.
//!
//! A single TCP (optionally TLS) stream to the remote Graylog endpoint.
//! Records travel as NUL-terminated frames; an empty GELF document serves
//! as keep-alive. The connection is a small state machine driven by the
//! control loop's ticks:
//!
//! ```text
//! Unknown --tick--> Connecting --ok--> Connected --write error/EOF--> Error
//!    ^                   |                  |                           |
//!    |                   +------error------>+<-------- tick ------------+
//!    +---- half-close drained (HUP / endpoint change: Shutdown) --------+
//! ```
//!
//! There is no terminal state; the daemon reconnects indefinitely.

use crate::codec;
use crate::tls::{TlsClient, TlsError};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Port used when the configured endpoint omits one.
pub const DEFAULT_PORT: u16 = 12222;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("unparseable upstream endpoint {0:?}")]
    BadHostPort(String),

    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("connect to {target} timed out")]
    ConnectTimeout { target: String },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("upstream is not connected")]
    NotConnected,

    #[error("upstream write failed: {0}")]
    WriteFailed(String),

    #[error("upstream write timed out")]
    WriteTimeout,
}

/// How the configured host string was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Ipv4,
    Ipv6,
    Fqdn,
}

/// A parsed `host[:port]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
    pub kind: HostKind,
}

impl HostPort {
    /// Parse `HOST` or `HOST:PORT`. The host is classified, in order, as
    /// dotted IPv4, bracketed IPv6, or FQDN; anything else is an error
    /// before any connection is attempted.
    pub fn parse(input: &str) -> Result<Self, UpstreamError> {
        let input = input.trim();
        let bad = || UpstreamError::BadHostPort(input.to_string());

        if input.is_empty() {
            return Err(bad());
        }

        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(bad());
            }
            let port = match tail {
                "" => DEFAULT_PORT,
                _ => tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(bad)?,
            };
            return Ok(Self {
                host: host.to_string(),
                port,
                kind: HostKind::Ipv6,
            });
        }

        let (host, port) = match input.rsplit_once(':') {
            Some((host, port)) => {
                // a second colon would mean unbracketed IPv6, which is
                // not accepted
                if host.contains(':') {
                    return Err(bad());
                }
                (host, port.parse().map_err(|_| bad())?)
            }
            None => (input, DEFAULT_PORT),
        };

        let kind = if host.parse::<Ipv4Addr>().is_ok() {
            HostKind::Ipv4
        } else if fqdn_ok(host) {
            HostKind::Fqdn
        } else {
            return Err(bad());
        };

        Ok(Self {
            host: host.to_string(),
            port,
            kind,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            HostKind::Ipv6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

fn fqdn_ok(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Connection state, reported numerically in the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Unknown,
    Connecting,
    Connected,
    Error,
    Shutdown,
}

impl UpstreamState {
    pub fn as_code(self) -> u8 {
        match self {
            UpstreamState::Unknown => 0,
            UpstreamState::Connecting => 1,
            UpstreamState::Connected => 2,
            UpstreamState::Error => 3,
            UpstreamState::Shutdown => 4,
        }
    }
}

/// Plain or TLS-wrapped upstream stream.
enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Event posted to the control loop by a connection's reader task.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamEvent {
    /// The remote closed or the read half errored. Stale generations are
    /// ignored: a reconnect may already have superseded the connection.
    Closed { generation: u64 },
}

/// The upstream connector.
pub struct Upstream {
    target: HostPort,
    tls: Option<TlsClient>,
    state: UpstreamState,
    writer: Option<WriteHalf<UpstreamStream>>,
    reader_task: Option<JoinHandle<()>>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<UpstreamEvent>,
}

impl Upstream {
    pub fn new(
        target: HostPort,
        tls: Option<TlsClient>,
        events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> Self {
        Self {
            target,
            tls,
            state: UpstreamState::Unknown,
            writer: None,
            reader_task: None,
            generation: 0,
            events_tx,
        }
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == UpstreamState::Connected
    }

    pub fn target(&self) -> &HostPort {
        &self.target
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Point the connector at a new endpoint. The caller half-closes the
    /// old connection first; the next tick connects to the new target.
    pub fn set_target(&mut self, target: HostPort, tls: Option<TlsClient>) {
        info!(old = %self.target, new = %target, "upstream endpoint changed");
        self.target = target;
        self.tls = tls;
    }

    /// Reconnect-timer action: recover an errored connection one step per
    /// tick (Error clears to Unknown, Unknown attempts a connect).
    pub async fn tick_connect(&mut self) {
        match self.state {
            UpstreamState::Connected | UpstreamState::Connecting | UpstreamState::Shutdown => {}
            UpstreamState::Error => self.state = UpstreamState::Unknown,
            UpstreamState::Unknown => {
                if let Err(e) = self.connect().await {
                    debug!(target = %self.target, error = %e, "connect attempt failed");
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<(), UpstreamError> {
        self.state = UpstreamState::Connecting;
        info!(target = %self.target, tls = self.tls.is_some(), "connecting upstream");

        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));
        let tcp = match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = UpstreamState::Error;
                return Err(UpstreamError::Connect {
                    target: self.target.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.state = UpstreamState::Error;
                return Err(UpstreamError::ConnectTimeout {
                    target: self.target.to_string(),
                });
            }
        };

        let stream = match &self.tls {
            Some(tls) => match tls.connect(&self.target.host, tcp).await {
                Ok(tls_stream) => UpstreamStream::Tls(Box::new(tls_stream)),
                Err(e) => {
                    self.state = UpstreamState::Error;
                    return Err(e.into());
                }
            },
            None => UpstreamStream::Plain(tcp),
        };

        let (mut reader, writer) = tokio::io::split(stream);
        self.generation += 1;
        let generation = self.generation;
        let events_tx = self.events_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            // the remote sends nothing meaningful; reading to EOF is how
            // a close or reset surfaces
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = events_tx.send(UpstreamEvent::Closed { generation });
        }));

        self.writer = Some(writer);
        self.state = UpstreamState::Connected;
        info!(target = %self.target, "upstream connected");
        Ok(())
    }

    /// Write one record as a NUL-terminated frame. Requires `Connected`.
    pub async fn send(&mut self, record: &[u8]) -> Result<(), UpstreamError> {
        if self.state != UpstreamState::Connected {
            return Err(UpstreamError::NotConnected);
        }
        let frame = codec::encode_frame(record);
        self.write_frame(&frame).await
    }

    /// Keep-alive tick: an empty GELF document, connected state only.
    pub async fn keepalive(&mut self) {
        if self.state != UpstreamState::Connected {
            return;
        }
        if let Err(e) = self.write_frame(codec::KEEPALIVE_FRAME).await {
            debug!(error = %e, "keep-alive failed");
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), UpstreamError> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return Err(UpstreamError::NotConnected),
        };
        match timeout(WRITE_TIMEOUT, writer.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.fail(&e.to_string());
                Err(UpstreamError::WriteFailed(e.to_string()))
            }
            Err(_) => {
                self.fail("write timed out");
                Err(UpstreamError::WriteTimeout)
            }
        }
    }

    /// A reader task reported its connection gone.
    pub fn handle_event(&mut self, event: UpstreamEvent) {
        let UpstreamEvent::Closed { generation } = event;
        if generation != self.generation {
            return;
        }
        match self.state {
            UpstreamState::Connected | UpstreamState::Connecting => {
                self.fail("remote closed the connection")
            }
            _ => {}
        }
    }

    /// Graceful half-close: stop accepting writes, flush pending bytes,
    /// close. Afterwards the state is `Unknown` and the next tick may
    /// reconnect (possibly to a new endpoint).
    pub async fn half_close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            self.state = UpstreamState::Shutdown;
            info!(target = %self.target, "half-closing upstream");
            if let Err(e) = timeout(WRITE_TIMEOUT, writer.shutdown()).await {
                debug!(error = %e, "half-close flush did not complete");
            }
        }
        self.abort_reader();
        self.state = UpstreamState::Unknown;
    }

    fn fail(&mut self, reason: &str) {
        warn!(target = %self.target, reason, "upstream transport error");
        self.writer = None;
        self.abort_reader();
        self.state = UpstreamState::Error;
    }

    fn abort_reader(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parses_dotted_ipv4() {
        let hp = HostPort::parse("192.0.2.10:12201").unwrap();
        assert_eq!(hp.kind, HostKind::Ipv4);
        assert_eq!(hp.host, "192.0.2.10");
        assert_eq!(hp.port, 12201);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let hp = HostPort::parse("[2001:db8::1]:12201").unwrap();
        assert_eq!(hp.kind, HostKind::Ipv6);
        assert_eq!(hp.host, "2001:db8::1");
        assert_eq!(hp.port, 12201);

        let hp = HostPort::parse("[::1]").unwrap();
        assert_eq!(hp.port, DEFAULT_PORT);
        assert_eq!(hp.to_string(), format!("[::1]:{}", DEFAULT_PORT));
    }

    #[test]
    fn parses_fqdn_with_default_port() {
        let hp = HostPort::parse("logs.example.com").unwrap();
        assert_eq!(hp.kind, HostKind::Fqdn);
        assert_eq!(hp.port, DEFAULT_PORT);
    }

    #[test]
    fn rejects_garbage() {
        for bad in [
            "",
            "host:notaport",
            "2001:db8::1", // unbracketed IPv6
            "[not-v6]:1",
            "bad_host!name",
            "-leading.example.com",
        ] {
            assert!(HostPort::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn state_codes_are_stable() {
        assert_eq!(UpstreamState::Unknown.as_code(), 0);
        assert_eq!(UpstreamState::Connecting.as_code(), 1);
        assert_eq!(UpstreamState::Connected.as_code(), 2);
        assert_eq!(UpstreamState::Error.as_code(), 3);
        assert_eq!(UpstreamState::Shutdown.as_code(), 4);
    }

    #[tokio::test]
    async fn connects_sends_and_frames_records() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let target = HostPort::parse(&addr.to_string()).unwrap();
        let mut upstream = Upstream::new(target, None, tx);

        upstream.tick_connect().await;
        assert!(upstream.is_connected());

        let (mut peer, _) = server.accept().await.unwrap();
        upstream.send(b"{\"message\":\"hej\"}").await.unwrap();
        upstream.keepalive().await;

        let mut buf = vec![0u8; 64];
        let mut got = Vec::new();
        while got.iter().filter(|&&b| b == 0).count() < 2 {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got[..], b"{\"message\":\"hej\"}\x00{}\x00");
    }

    #[tokio::test]
    async fn failed_connect_lands_in_error_then_recovers_to_unknown() {
        // a port that refuses connections: bind, grab the port, drop
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        drop(server);

        let (tx, _rx) = mpsc::unbounded_channel();
        let target = HostPort::parse(&addr.to_string()).unwrap();
        let mut upstream = Upstream::new(target, None, tx);

        upstream.tick_connect().await;
        assert_eq!(upstream.state(), UpstreamState::Error);

        upstream.tick_connect().await;
        assert_eq!(upstream.state(), UpstreamState::Unknown);
    }

    #[tokio::test]
    async fn remote_close_surfaces_as_event() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = HostPort::parse(&addr.to_string()).unwrap();
        let mut upstream = Upstream::new(target, None, tx);

        upstream.tick_connect().await;
        let (peer, _) = server.accept().await.unwrap();
        drop(peer);

        let event = rx.recv().await.unwrap();
        upstream.handle_event(event);
        assert_eq!(upstream.state(), UpstreamState::Error);
    }

    #[tokio::test]
    async fn send_requires_connected_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let target = HostPort::parse("127.0.0.1:9").unwrap();
        let mut upstream = Upstream::new(target, None, tx);

        assert!(matches!(
            upstream.send(b"{}").await,
            Err(UpstreamError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn half_close_flushes_and_resets_state() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let target = HostPort::parse(&addr.to_string()).unwrap();
        let mut upstream = Upstream::new(target, None, tx);

        upstream.tick_connect().await;
        let (mut peer, _) = server.accept().await.unwrap();
        upstream.send(b"{\"bye\":1}").await.unwrap();
        upstream.half_close().await;
        assert_eq!(upstream.state(), UpstreamState::Unknown);

        let mut got = Vec::new();
        peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got[..], b"{\"bye\":1}\x00");
    }
}
