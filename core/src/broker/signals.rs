//! Signal handling.
//!
//! Signals never touch broker state directly: each delivery becomes a
//! [`ControlEvent`] on the control channel and is handled inside the event
//! loop. SIGPIPE needs no handler: the Rust runtime already ignores it at
//! startup.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Work requested from outside the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// INT, TERM, QUIT: graceful shutdown.
    Shutdown,
    /// HUP: flush and reconnect the upstream.
    RestartUpstream,
    /// USR1: reload the configuration file.
    Reload,
    /// USR2: write a fresh status file.
    WriteStatus,
}

/// Install the signal matrix, forwarding deliveries onto `tx`.
pub fn spawn_listener(tx: UnboundedSender<ControlEvent>) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = sigint.recv() => ControlEvent::Shutdown,
                _ = sigterm.recv() => ControlEvent::Shutdown,
                _ = sigquit.recv() => ControlEvent::Shutdown,
                _ = sighup.recv() => ControlEvent::RestartUpstream,
                _ = sigusr1.recv() => ControlEvent::Reload,
                _ = sigusr2.recv() => ControlEvent::WriteStatus,
            };
            debug!(?event, "signal received");
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    Ok(())
}
