//! The broker's event loop and lifecycle.
//!
//! A single task owns every piece of mutable state: the queue, the intake
//! listener, the upstream connection, the spool path, and the config
//! snapshot. The loop multiplexes listener readability, four periodic
//! timers, upstream reader events, and control events (signals, test
//! handles). Handlers run to completion; nothing outside the loop touches
//! broker state.
//!
//! Timers:
//!
//! | timer       | period | action |
//! |-------------|--------|--------|
//! | main        | 10 s   | spool snapshot, drain, listener check, reconnect, keep-alive, throughput report |
//! | drain       | 200 ms | drain the queue |
//! | listener    | 2 s    | listener check / rebind |
//! | reconnect   | 5 s    | reconnect when down |

use crate::broker::signals::{self, ControlEvent};
use crate::config::Config;
use crate::listener::{Listener, ListenerError, MAX_DATAGRAM};
use crate::metrics::Metrics;
use crate::pidfile::PidFile;
use crate::queue::MessageQueue;
use crate::status::{ListenerStatus, StatusSnapshot, UpstreamStatus};
use crate::tls::{TlsClient, TlsSettings};
use crate::upstream::{HostPort, Upstream, UpstreamEvent};
use crate::{codec, selflog, spool, status, BrokerError, Result};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MAIN_TICK: Duration = Duration::from_secs(10);
const DRAIN_TICK: Duration = Duration::from_millis(200);
const LISTENER_TICK: Duration = Duration::from_secs(2);
const RECONNECT_TICK: Duration = Duration::from_secs(5);

/// Handle for poking a running broker from outside the loop. Signals use
/// the same channel; tests and embedders use this.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl BrokerHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlEvent::Shutdown);
    }

    pub fn restart_upstream(&self) {
        let _ = self.tx.send(ControlEvent::RestartUpstream);
    }

    pub fn reload(&self) {
        let _ = self.tx.send(ControlEvent::Reload);
    }

    pub fn write_status(&self) {
        let _ = self.tx.send(ControlEvent::WriteStatus);
    }
}

/// The broker daemon.
pub struct Broker {
    config: Config,
    config_path: Option<PathBuf>,
    fake: bool,
    queue: MessageQueue,
    listener: Option<Listener>,
    upstream: Upstream,
    upstream_events: Option<mpsc::UnboundedReceiver<UpstreamEvent>>,
    control_rx: Option<mpsc::UnboundedReceiver<ControlEvent>>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    metrics: Metrics,
    pidfile: Option<PidFile>,
    started_wall: DateTime<Utc>,
    started_mono: Instant,
}

impl Broker {
    /// Validate the endpoint and assemble a broker. `config_path` enables
    /// SIGUSR1 reloads; `fake` prints records to stdout instead of
    /// forwarding them.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        fake: bool,
    ) -> Result<(Self, BrokerHandle)> {
        let (target, tls) = Self::build_endpoint(&config)?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = BrokerHandle {
            tx: control_tx.clone(),
        };
        let broker = Self {
            queue: MessageQueue::new(config.queue_limit),
            upstream: Upstream::new(target, tls, events_tx),
            config,
            config_path,
            fake,
            listener: None,
            upstream_events: Some(events_rx),
            control_rx: Some(control_rx),
            control_tx,
            metrics: Metrics::new(),
            pidfile: None,
            started_wall: Utc::now(),
            started_mono: Instant::now(),
        };
        Ok((broker, handle))
    }

    fn build_endpoint(config: &Config) -> Result<(HostPort, Option<TlsClient>)> {
        let target = HostPort::parse(&config.graylog)?;
        let tls = match &config.ssl {
            Some(map) => Some(TlsClient::new(&TlsSettings::from_map(map)?)?),
            None => None,
        };
        Ok((target, tls))
    }

    /// Run the startup sequence, then the loop, until a shutdown event.
    pub async fn run(mut self) -> Result<()> {
        let mut control_rx = self
            .control_rx
            .take()
            .ok_or_else(|| BrokerError::Lifecycle("broker is already running".into()))?;
        let mut upstream_events = self
            .upstream_events
            .take()
            .ok_or_else(|| BrokerError::Lifecycle("broker is already running".into()))?;

        self.write_status();
        if let Some(path) = self.config.pidfile.clone() {
            self.pidfile = Some(PidFile::acquire(&path)?);
        }
        if let Some(buffer) = self.config.buffer.clone() {
            match spool::load(&buffer) {
                Ok(records) => {
                    if !records.is_empty() {
                        info!(records = records.len(), "restored spooled records");
                    }
                    for record in records {
                        self.queue.push_back(record);
                    }
                }
                Err(e) => warn!(error = %e, "spool restore failed, starting empty"),
            }
            self.snapshot_spool();
        }
        self.listener = Some(Listener::bind(&self.config.socket, self.config.perms)?);
        selflog::emit(
            &mut self.queue,
            7,
            format!("gelf-broker {} started", env!("CARGO_PKG_VERSION")),
        );

        signals::spawn_listener(self.control_tx.clone())?;

        let mut main_tick = time::interval(MAIN_TICK);
        let mut drain_tick = time::interval(DRAIN_TICK);
        let mut listener_tick = time::interval(LISTENER_TICK);
        let mut reconnect_tick = time::interval(RECONNECT_TICK);
        main_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        listener_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconnect_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!(
            socket = %self.config.socket.display(),
            target = %self.upstream.target(),
            fake = self.fake,
            "broker running"
        );

        loop {
            let intake = self.listener.as_ref().map(Listener::socket);
            tokio::select! {
                Some(event) = control_rx.recv() => {
                    if self.handle_control(event).await? {
                        break;
                    }
                }
                Some(event) = upstream_events.recv() => {
                    self.upstream.handle_event(event);
                }
                result = recv_datagram(intake, &mut buf) => {
                    match result {
                        Ok(n) => self.handle_datagram(&buf[..n]).await,
                        Err(e) => warn!(error = %e, "intake receive failed"),
                    }
                }
                _ = drain_tick.tick() => self.drain().await,
                _ = listener_tick.tick() => self.check_listener()?,
                _ = reconnect_tick.tick() => {
                    if !self.fake {
                        self.upstream.tick_connect().await;
                    }
                }
                _ = main_tick.tick() => self.main_tick().await?,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Returns `Ok(true)` when the loop should stop.
    async fn handle_control(&mut self, event: ControlEvent) -> Result<bool> {
        match event {
            ControlEvent::Shutdown => return Ok(true),
            ControlEvent::RestartUpstream => {
                selflog::emit(&mut self.queue, 6, "upstream restart requested");
                if !self.fake {
                    self.upstream.half_close().await;
                    self.upstream.tick_connect().await;
                }
            }
            ControlEvent::Reload => self.reload().await?,
            ControlEvent::WriteStatus => self.write_status(),
        }
        Ok(false)
    }

    async fn reload(&mut self) -> Result<()> {
        let Some(path) = self.config_path.clone() else {
            warn!("started without a config file, reload ignored");
            return Ok(());
        };
        let new = match Config::load(&path) {
            Ok(new) => new,
            Err(e) => {
                error!(error = %e, "config reload failed, keeping previous configuration");
                return Ok(());
            }
        };

        let endpoint_changed =
            new.graylog != self.config.graylog || new.ssl != self.config.ssl;
        let endpoint = if endpoint_changed {
            match Self::build_endpoint(&new) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    error!(error = %e, "reloaded endpoint rejected, keeping previous configuration");
                    return Ok(());
                }
            }
        } else {
            None
        };
        let socket_changed =
            new.socket != self.config.socket || new.perms != self.config.perms;

        self.queue.set_limit(new.queue_limit);
        self.config = new;

        if let Some((target, tls)) = endpoint {
            if !self.fake {
                self.upstream.half_close().await;
            }
            self.upstream.set_target(target, tls);
        }
        if socket_changed {
            if let Some(old) = self.listener.take() {
                old.unlink();
            }
            self.rebind_listener()?;
        }
        selflog::emit(&mut self.queue, 7, "configuration reloaded");
        self.write_status();
        info!("configuration reloaded");
        Ok(())
    }

    async fn handle_datagram(&mut self, datagram: &[u8]) {
        match codec::decode_datagram(datagram) {
            Ok(Some(record)) => {
                self.metrics.read.record(record.len());
                self.ingest(record).await;
            }
            Ok(None) => {} // liveness probe
            Err(e) => warn!(error = %e, "malformed intake datagram dropped"),
        }
    }

    /// Admit one record: straight to a healthy upstream when nothing is
    /// queued ahead of it, otherwise onto the queue tail.
    async fn ingest(&mut self, record: Bytes) {
        if self.fake {
            self.print_record(&record);
            self.metrics.sent.record(record.len());
            return;
        }
        if self.upstream.is_connected() && self.queue.is_empty() {
            match self.upstream.send(&record).await {
                Ok(()) => {
                    self.metrics.sent.record(record.len());
                    return;
                }
                Err(e) => debug!(error = %e, "direct send failed, queueing record"),
            }
            self.queue.push_front(record);
            return;
        }
        self.queue.push_back(record);
    }

    /// Pop-send until the queue empties or a send fails; a failed record
    /// goes back to the head so FIFO order survives partial drains.
    async fn drain(&mut self) {
        if self.fake {
            while let Some(record) = self.queue.pop_front() {
                self.print_record(&record);
                self.metrics.sent.record(record.len());
            }
            return;
        }
        while self.upstream.is_connected() {
            let Some(record) = self.queue.pop_front() else {
                break;
            };
            match self.upstream.send(&record).await {
                Ok(()) => self.metrics.sent.record(record.len()),
                Err(e) => {
                    debug!(error = %e, "drain interrupted, record restored to queue head");
                    self.queue.push_front(record);
                    break;
                }
            }
        }
    }

    fn check_listener(&mut self) -> Result<()> {
        match &self.listener {
            Some(listener) if listener.check() => Ok(()),
            _ => {
                if self.listener.take().is_some() {
                    warn!("intake socket failed its check, rebinding");
                }
                self.rebind_listener()
            }
        }
    }

    fn rebind_listener(&mut self) -> Result<()> {
        match Listener::bind(&self.config.socket, self.config.perms) {
            Ok(listener) => {
                self.listener = Some(listener);
                Ok(())
            }
            Err(e @ ListenerError::Conflict { .. }) => {
                error!(error = %e, "another live broker owns the intake socket");
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, "rebind failed, retrying next tick");
                self.listener = None;
                Ok(())
            }
        }
    }

    async fn main_tick(&mut self) -> Result<()> {
        self.snapshot_spool();
        self.drain().await;
        self.check_listener()?;
        if !self.fake {
            self.upstream.tick_connect().await;
            self.upstream.keepalive().await;
        }
        self.report_throughput();
        Ok(())
    }

    fn report_throughput(&mut self) {
        let read = self.metrics.read.take_report();
        let sent = self.metrics.sent.take_report();
        info!(
            read_count = read.count,
            read_bytes = read.bytes,
            sent_count = sent.count,
            sent_bytes = sent.bytes,
            queued = self.queue.len(),
            dropped = self.queue.dropped(),
            interval_secs = format!("{:.1}", read.elapsed_secs),
            "throughput"
        );
    }

    fn snapshot_spool(&self) {
        let Some(buffer) = &self.config.buffer else {
            return;
        };
        if let Err(e) = spool::save(buffer, self.queue.iter()) {
            warn!(error = %e, "spool snapshot failed, records stay in memory");
        }
    }

    fn write_status(&self) {
        let Some(path) = &self.config.status else {
            return;
        };
        let snapshot = StatusSnapshot {
            pid: std::process::id(),
            queue_len: self.queue.len(),
            started: self.started_wall.to_rfc3339(),
            uptime_secs: self.started_mono.elapsed().as_secs(),
            listener: ListenerStatus {
                socket: self.config.socket.clone(),
                signature: self.listener.as_ref().map(|l| l.signature().hex()),
            },
            socket: self.config.socket.clone(),
            upstream: UpstreamStatus {
                state: self.upstream.state().as_code(),
                hostport: self.upstream.target().to_string(),
            },
        };
        if let Err(e) = status::write(path, &snapshot) {
            warn!(error = %e, "status write skipped");
        }
    }

    fn print_record(&self, record: &[u8]) {
        println!("{}", String::from_utf8_lossy(record));
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        selflog::emit(&mut self.queue, 6, "broker shutting down");
        self.snapshot_spool();
        if let Some(listener) = self.listener.take() {
            listener.unlink();
        }
        if !self.fake {
            self.upstream.half_close().await;
        }
        // dropping the pidfile unlinks it
        self.pidfile = None;
        info!("shutdown complete");
    }
}

async fn recv_datagram(socket: Option<Arc<UnixDatagram>>, buf: &mut [u8]) -> io::Result<usize> {
    match socket {
        Some(socket) => socket.recv(buf).await,
        None => std::future::pending().await,
    }
}
