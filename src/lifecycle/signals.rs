//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//! - Trigger appropriate actions (shutdown, reload)
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT forces exit
//! - SIGHUP triggers config reload, not shutdown

use std::io;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::watcher::ReloadTrigger;
use crate::lifecycle::shutdown::Shutdown;

/// Exit status used when a second shutdown signal cuts draining short.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

#[cfg(unix)]
struct Signals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn next(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.terminate.recv() => SignalEvent::Shutdown,
            _ = self.interrupt.recv() => SignalEvent::Shutdown,
            _ = self.hangup.recv() => SignalEvent::Reload,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> SignalEvent {
        let _ = tokio::signal::ctrl_c().await;
        SignalEvent::Shutdown
    }
}

/// Dispatch one signal event.
pub fn handle_event(event: SignalEvent, shutdown: &Shutdown, reload: Option<&ReloadTrigger>) {
    match event {
        SignalEvent::Shutdown => {
            if shutdown.trigger() {
                tracing::info!("Shutdown signal received, draining origin connections");
            } else {
                tracing::warn!("Second shutdown signal received, exiting immediately");
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
        SignalEvent::Reload => match reload {
            Some(trigger) => {
                tracing::info!("SIGHUP received, reloading configuration");
                trigger.reload();
            }
            None => tracing::warn!("SIGHUP received but no config file to reload"),
        },
    }
}

/// Listen for OS signals for the life of the process.
pub fn spawn_signal_handler(
    shutdown: Arc<Shutdown>,
    reload: Option<ReloadTrigger>,
) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::register()?;
    Ok(tokio::spawn(async move {
        loop {
            let event = signals.next().await;
            handle_event(event, &shutdown, reload.as_ref());
        }
    }))
}
