//! Dispatcher: admission control between the Transport and the Forwarder.
//!
//! One dispatcher runs per session and is the only writer of the in-flight
//! map and the queues. Forward tasks report back over a channel; the
//! dispatcher removes the work item and sends its Outcome in the same step,
//! so an envelope is either in flight or answered, never both.
//!
//! Admission, for an envelope of source `S`:
//!
//! 1. unknown `S`: answer `local_error{no_subscription}` immediately
//! 2. global and per-source caps free and `S` has nothing queued: start it
//! 3. room in `S`'s queue and in the global queue budget: enqueue it
//! 4. otherwise hold it and stop reading the Transport until room frees up
//!
//! The hold in step 4 blocks intake for every source, not just `S`: while
//! one source's queue is full, deliveries for other sources wait in the
//! Transport buffer even if those sources have free slots.
//!
//! Freed slots go to queued sources in round-robin order; each source's
//! queue is strictly FIFO.
//!
//! On shutdown the dispatcher stops reading the Transport altogether. Queued
//! envelopes are answered `cancelled`; deliveries still unread are left for
//! the Gateway to redeliver.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ListenConfig;
use crate::error::TransportError;
use crate::forwarder::Forward;
use crate::protocol::{ClientFrame, DeliveryResult, Envelope, Outcome};
use crate::subscription::SubscriptionSet;
use crate::transport::{Control, Inbound, Transport, TransportSender};

/// Concurrency and queueing caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_inflight: usize,
    pub per_source_inflight: usize,
    pub per_source_queue: usize,
    pub max_queued: usize,
}

impl From<&ListenConfig> for Limits {
    fn from(cfg: &ListenConfig) -> Self {
        Self {
            max_inflight: cfg.max_inflight,
            per_source_inflight: cfg.per_source_inflight,
            per_source_queue: cfg.per_source_queue,
            max_queued: cfg.max_queued,
        }
    }
}

/// How a dispatcher run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The Transport ended; in-flight forwards were abandoned.
    Lost,
    /// Shutdown was requested and the drain finished.
    Drained { deadline_exceeded: bool },
}

struct WorkItem {
    envelope: Arc<Envelope>,
    started_at: Instant,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SourceState {
    running: usize,
    queue: VecDeque<Envelope>,
}

pub struct Dispatcher<F: Forward> {
    forwarder: Arc<F>,
    subscriptions: Arc<SubscriptionSet>,
    limits: Limits,
    inflight: HashMap<String, WorkItem>,
    sources: HashMap<String, SourceState>,
    /// Sources with queued work, in round-robin order.
    ready: VecDeque<String>,
    queued: usize,
    held: Option<Envelope>,
    seen: HashSet<String>,
    done_tx: mpsc::UnboundedSender<Outcome>,
    done_rx: mpsc::UnboundedReceiver<Outcome>,
    session_cancel: CancellationToken,
}

impl<F: Forward> Dispatcher<F> {
    pub fn new(forwarder: Arc<F>, subscriptions: Arc<SubscriptionSet>, limits: Limits) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            forwarder,
            subscriptions,
            limits,
            inflight: HashMap::new(),
            sources: HashMap::new(),
            ready: VecDeque::new(),
            queued: 0,
            held: None,
            seen: HashSet::new(),
            done_tx,
            done_rx,
            session_cancel: CancellationToken::new(),
        }
    }

    /// Run until the Transport ends or `shutdown` fires and the drain
    /// completes (or `drain_deadline` passes).
    pub async fn run(
        mut self,
        transport: &mut Transport,
        shutdown: &CancellationToken,
        drain_deadline: Duration,
    ) -> SessionEnd {
        let _abandon_on_exit = self.session_cancel.clone().drop_guard();
        let sender = transport.sender();

        loop {
            let accepting = self.held.is_none();
            let step = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    return self.drain(&sender, drain_deadline).await;
                }
                Some(outcome) = self.done_rx.recv() => self.complete(outcome, &sender).await,
                inbound = transport.recv(), if accepting => match inbound {
                    Inbound::Deliver(env) => self.on_deliver(*env, &sender).await,
                    Inbound::Control(Control::Cancel { envelope_id }) => {
                        self.cancel(&envelope_id, &sender).await
                    }
                    Inbound::Malformed { envelope_id, error } => {
                        self.on_malformed(&envelope_id, &error, &sender).await
                    }
                    Inbound::Eof => Err(TransportError::SessionLost),
                },
            };
            if step.is_err() {
                return self.abandon();
            }
        }
    }

    async fn on_malformed(
        &mut self,
        envelope_id: &str,
        error: &str,
        sender: &TransportSender,
    ) -> Result<(), TransportError> {
        if !self.seen.insert(envelope_id.to_string()) {
            return Ok(());
        }
        let summary = format!("undecodable delivery: {error}");
        sender
            .send(ClientFrame::Outcome(Outcome::local_error(envelope_id, summary, Duration::ZERO)))
            .await
    }

    async fn on_deliver(&mut self, env: Envelope, sender: &TransportSender) -> Result<(), TransportError> {
        if !self.seen.insert(env.envelope_id.clone()) {
            warn!(envelope = %env.envelope_id, "Dispatcher: duplicate envelope in session, ignored");
            return Ok(());
        }
        debug!(
            envelope = %env.envelope_id,
            event = %env.event_id,
            source = %env.source_id,
            "Dispatcher: received {} {}",
            env.method,
            env.path_suffix
        );
        if self.subscriptions.get(&env.source_id).is_none() {
            warn!(
                envelope = %env.envelope_id,
                source = %env.source_id,
                "Dispatcher: delivery for a source that is not subscribed"
            );
            return sender
                .send(ClientFrame::Outcome(Outcome::no_subscription(&env.envelope_id)))
                .await;
        }
        self.admit(env);
        Ok(())
    }

    /// Start, enqueue or hold `env`.
    fn admit(&mut self, env: Envelope) {
        let source = self.sources.entry(env.source_id.clone()).or_default();
        let can_start = self.inflight.len() < self.limits.max_inflight
            && source.running < self.limits.per_source_inflight
            && source.queue.is_empty();
        if can_start {
            self.start(env);
        } else if source.queue.len() < self.limits.per_source_queue && self.queued < self.limits.max_queued {
            debug!(envelope = %env.envelope_id, "Dispatcher: queued");
            let first = source.queue.is_empty();
            let source_id = env.source_id.clone();
            source.queue.push_back(env);
            self.queued += 1;
            if first && !self.ready.contains(&source_id) {
                self.ready.push_back(source_id);
            }
        } else {
            debug!(envelope = %env.envelope_id, "Dispatcher: queues full, pausing intake");
            self.held = Some(env);
        }
    }

    fn start(&mut self, env: Envelope) {
        let Some(subscription) = self.subscriptions.get(&env.source_id).cloned() else {
            return;
        };
        self.sources.entry(env.source_id.clone()).or_default().running += 1;

        let envelope = Arc::new(env);
        let cancel = self.session_cancel.child_token();
        debug!(
            envelope = %envelope.envelope_id,
            "Dispatcher: forwarding to {}",
            subscription.local_endpoint.url_for(&envelope.path_suffix, &envelope.query_string)
        );
        self.inflight.insert(
            envelope.envelope_id.clone(),
            WorkItem {
                envelope: Arc::clone(&envelope),
                started_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );

        let forwarder = Arc::clone(&self.forwarder);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let outcome = forwarder
                .forward(&subscription.local_endpoint, &envelope, cancel)
                .await;
            let _ = done.send(outcome);
        });
    }

    /// Hand freed capacity to queued sources, then retry the held envelope.
    fn pump(&mut self) {
        let mut skipped = 0;
        while self.inflight.len() < self.limits.max_inflight && skipped < self.ready.len() {
            let Some(source_id) = self.ready.pop_front() else {
                break;
            };
            let Some(source) = self.sources.get_mut(&source_id) else {
                continue;
            };
            if source.running >= self.limits.per_source_inflight {
                self.ready.push_back(source_id);
                skipped += 1;
                continue;
            }
            let next = source.queue.pop_front();
            if !source.queue.is_empty() {
                self.ready.push_back(source_id);
            }
            if let Some(env) = next {
                self.queued -= 1;
                self.start(env);
                skipped = 0;
            }
        }

        if let Some(env) = self.held.take() {
            self.admit(env);
        }
    }

    async fn complete(&mut self, outcome: Outcome, sender: &TransportSender) -> Result<(), TransportError> {
        // Already answered (cancelled at the drain deadline).
        let Some(item) = self.inflight.remove(&outcome.envelope_id) else {
            return Ok(());
        };
        if let Some(source) = self.sources.get_mut(&item.envelope.source_id) {
            source.running = source.running.saturating_sub(1);
        }
        self.log_outcome(&item, &outcome);
        let sent = sender.send(ClientFrame::Outcome(outcome)).await;
        self.pump();
        sent
    }

    fn log_outcome(&self, item: &WorkItem, outcome: &Outcome) {
        let env = &item.envelope;
        let target = self
            .subscriptions
            .get(&env.source_id)
            .map(|s| s.local_endpoint.url_for(&env.path_suffix, &env.query_string))
            .unwrap_or_default();
        match (outcome.result, outcome.http_status) {
            (DeliveryResult::Delivered, Some(status)) => debug!(
                event = %env.event_id,
                "{} {target} -> {status} ({} ms)",
                env.method,
                outcome.latency_ms
            ),
            (result, _) => debug!(
                event = %env.event_id,
                "{} {target} -> {} ({})",
                env.method,
                result.as_str(),
                outcome.error_summary.as_deref().unwrap_or("no detail")
            ),
        }
    }

    async fn cancel(&mut self, envelope_id: &str, sender: &TransportSender) -> Result<(), TransportError> {
        if let Some(item) = self.inflight.get(envelope_id) {
            debug!(envelope = %envelope_id, "Dispatcher: cancelling in-flight forward");
            item.cancel.cancel();
            return Ok(());
        }
        if self.held.as_ref().is_some_and(|e| e.envelope_id == envelope_id) {
            self.held = None;
            return sender
                .send(ClientFrame::Outcome(Outcome::cancelled(envelope_id, Duration::ZERO)))
                .await;
        }
        for source in self.sources.values_mut() {
            if let Some(pos) = source.queue.iter().position(|e| e.envelope_id == envelope_id) {
                source.queue.remove(pos);
                self.queued -= 1;
                debug!(envelope = %envelope_id, "Dispatcher: cancelled before start");
                sender
                    .send(ClientFrame::Outcome(Outcome::cancelled(envelope_id, Duration::ZERO)))
                    .await?;
                self.pump();
                return Ok(());
            }
        }
        debug!(envelope = %envelope_id, "Dispatcher: cancel for unknown envelope ignored");
        Ok(())
    }

    /// Stop intake, let in-flight forwards finish until `deadline`, then
    /// cancel whatever is left. The Transport is not read again.
    async fn drain(&mut self, sender: &TransportSender, deadline: Duration) -> SessionEnd {
        let pending: Vec<Envelope> = self
            .held
            .take()
            .into_iter()
            .chain(self.sources.values_mut().flat_map(|s| s.queue.drain(..)))
            .collect();
        self.ready.clear();
        self.queued = 0;
        info!(
            inflight = self.inflight.len(),
            queued = pending.len(),
            "Draining: waiting up to {}s for in-flight forwards",
            deadline.as_secs()
        );
        for env in pending {
            if sender
                .send(ClientFrame::Outcome(Outcome::cancelled(&env.envelope_id, Duration::ZERO)))
                .await
                .is_err()
            {
                return self.abandon();
            }
        }

        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);
        while !self.inflight.is_empty() {
            let step = tokio::select! {
                biased;
                Some(outcome) = self.done_rx.recv() => self.complete(outcome, sender).await,
                () = &mut timer => break,
                () = sender.closed() => Err(TransportError::SessionLost),
            };
            if step.is_err() {
                return self.abandon();
            }
        }

        if self.inflight.is_empty() {
            return SessionEnd::Drained {
                deadline_exceeded: false,
            };
        }

        warn!(
            inflight = self.inflight.len(),
            "Draining: deadline reached, cancelling remaining forwards"
        );
        for (id, item) in self.inflight.drain() {
            item.cancel.cancel();
            let outcome = Outcome::cancelled(&id, item.started_at.elapsed());
            let _ = sender.send(ClientFrame::Outcome(outcome)).await;
        }
        SessionEnd::Drained {
            deadline_exceeded: true,
        }
    }

    fn abandon(&mut self) -> SessionEnd {
        if !self.inflight.is_empty() {
            info!(
                abandoned = self.inflight.len(),
                "Session lost, in-flight forwards abandoned for redelivery"
            );
        }
        self.session_cancel.cancel();
        self.inflight.clear();
        self.sources.clear();
        self.ready.clear();
        self.queued = 0;
        self.held = None;
        SessionEnd::Lost
    }
}
