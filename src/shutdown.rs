//! Process-wide shutdown: SIGINT/SIGTERM cancel one token that every
//! component watches.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long in-flight forwards may run after shutdown is requested.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: &str) {
        if self.token.is_cancelled() {
            warn!("Received {reason} while already shutting down; waiting for the drain to finish");
        } else {
            info!("Received {reason}, shutting down");
            self.token.cancel();
        }
    }

    /// Install signal handlers. The first signal starts the drain; later
    /// ones are logged and do not shorten it.
    pub fn listen_for_signals(&self) -> std::io::Result<JoinHandle<()>> {
        let mut signals = Signals::install()?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(name) = signals.next().await {
                this.trigger(name);
            }
        }))
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::select! {
            s = self.interrupt.recv() => s.map(|()| "SIGINT"),
            s = self.terminate.recv() => s.map(|()| "SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|()| "Ctrl-C")
    }
}
