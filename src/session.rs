//! SessionManager: keeps one Gateway session alive until shutdown.
//!
//! ```text
//! Init ──> Connecting ──ok──> Connected ──shutdown──> Draining ──> Closed
//!              │   ▲              │
//!   auth/subs  │   │ timer        │ session lost
//!   rejected   │   │              ▼
//!              │   └──────────  Backoff <── network failure
//!              ▼
//!           Failed
//! ```
//!
//! Every attempt re-announces the same subscription set and offers the
//! previous session id for resumption. Backoff grows exponentially with
//! jitter and resets once a session stays up long enough.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::config::ListenConfig;
use crate::dispatcher::{Dispatcher, Limits, SessionEnd};
use crate::error::{exit, ListenError};
use crate::forwarder::Forward;
use crate::protocol::Hello;
use crate::shutdown::DRAIN_DEADLINE;
use crate::subscription::SubscriptionSet;
use crate::transport::{SessionStats, Transport, TransportOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Connecting,
    Connected,
    Backoff,
    Draining,
    Closed,
    Failed,
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Clean,
    /// In-flight forwards were still running at the drain deadline.
    DrainTimedOut,
}

impl Shutdown {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Clean => exit::OK,
            Self::DrainTimedOut => exit::DRAIN_TIMEOUT,
        }
    }
}

pub struct SessionManager<F: Forward> {
    ws_url: String,
    api_key: String,
    subscriptions: Arc<SubscriptionSet>,
    forwarder: Arc<F>,
    options: TransportOptions,
    limits: Limits,
    backoff: Backoff,
    drain_deadline: Duration,
    shutdown: CancellationToken,
    stats: Arc<SessionStats>,
    state: watch::Sender<State>,
}

impl<F: Forward> SessionManager<F> {
    pub fn new(
        ws_url: &str,
        api_key: &str,
        subscriptions: Arc<SubscriptionSet>,
        forwarder: Arc<F>,
        config: &ListenConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
            Duration::from_secs(config.stable_threshold_secs),
        );
        let (state, _) = watch::channel(State::Init);
        Self {
            ws_url: ws_url.to_string(),
            api_key: api_key.to_string(),
            subscriptions,
            forwarder,
            options: TransportOptions::from(config),
            limits: Limits::from(config),
            backoff,
            drain_deadline: DRAIN_DEADLINE,
            shutdown,
            stats: Arc::new(SessionStats::default()),
            state,
        }
    }

    #[must_use]
    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    /// Follow state transitions.
    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    fn set_state(&self, state: State) {
        self.state.send_replace(state);
    }

    fn hello(&self, resume_session_id: Option<String>) -> Hello {
        Hello {
            cli_version: env!("CARGO_PKG_VERSION").to_string(),
            api_key: self.api_key.clone(),
            subscriptions: self.subscriptions.hints(),
            resume_session_id,
        }
    }

    /// Connect, serve and reconnect until shutdown or a fatal error.
    pub async fn run(mut self) -> Result<Shutdown, ListenError> {
        let mut previous_session: Option<String> = None;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(self.closed());
            }

            self.set_state(State::Connecting);
            info!("Gateway: connecting to {}", self.ws_url);
            let hello = self.hello(previous_session.clone());
            let opened = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Ok(self.closed()),
                opened = Transport::open(&self.ws_url, &hello, &self.options, self.stats()) => opened,
            };

            match opened {
                Ok(mut transport) => {
                    self.set_state(State::Connected);
                    let session_id = transport.session_id().to_string();
                    info!(
                        session = %session_id,
                        sources = self.subscriptions.len(),
                        "Gateway: connected, ready for events"
                    );
                    previous_session = Some(session_id);
                    let connected_at = Instant::now();

                    match self.serve(&mut transport).await {
                        SessionEnd::Drained { deadline_exceeded } => {
                            transport.close("shutdown").await;
                            self.set_state(State::Closed);
                            info!("Gateway: session closed");
                            return Ok(if deadline_exceeded {
                                Shutdown::DrainTimedOut
                            } else {
                                Shutdown::Clean
                            });
                        }
                        SessionEnd::Lost => {
                            transport.close("session lost").await;
                            let uptime = connected_at.elapsed();
                            self.backoff.session_ended(uptime);
                            warn!("Gateway: session lost after {:.1}s", uptime.as_secs_f64());
                        }
                    }
                }
                Err(e) if !e.is_retriable() => {
                    self.set_state(State::Failed);
                    error!("Gateway: {e}");
                    return Err(e.into());
                }
                Err(e) => warn!("Gateway: {e}"),
            }

            if self.shutdown.is_cancelled() {
                return Ok(self.closed());
            }
            self.set_state(State::Backoff);
            let delay = self.backoff.next_delay();
            info!("Gateway: reconnecting in {:.1}s", delay.as_secs_f64());
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Ok(self.closed()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run one session's dispatcher, flagging `Draining` when shutdown lands.
    async fn serve(&self, transport: &mut Transport) -> SessionEnd {
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.forwarder),
            Arc::clone(&self.subscriptions),
            self.limits,
        );
        let run = dispatcher.run(transport, &self.shutdown, self.drain_deadline);
        tokio::pin!(run);
        tokio::select! {
            end = &mut run => end,
            () = self.shutdown.cancelled() => {
                self.set_state(State::Draining);
                run.await
            }
        }
    }

    fn closed(&self) -> Shutdown {
        self.set_state(State::Closed);
        info!("Gateway: stopped");
        Shutdown::Clean
    }
}
