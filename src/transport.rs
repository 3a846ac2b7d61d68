//! Transport: one authenticated control-channel session with the Gateway.
//!
//! [`Transport::open`] connects the WebSocket, sends `HELLO` and waits for
//! `ATTACHED`. After that two tasks own the socket:
//!
//! - the **read task** decodes inbound frames and hands deliveries and
//!   control frames to [`Transport::recv`] through a bounded channel. When
//!   the channel is full the task stops reading, which pushes back on the
//!   Gateway through TCP flow control.
//! - the **write task** drains outbound frames in order and emits a
//!   `HEARTBEAT` every `heartbeat_interval`.
//!
//! No inbound traffic for `idle_timeout`, a socket error or a close frame
//! ends the session: `recv` yields [`Inbound::Eof`] and `send` fails with
//! [`TransportError::SessionLost`]. The transport never reconnects; that is
//! the session manager's job.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ListenConfig;
use crate::error::TransportError;
use crate::protocol::{self, ClientFrame, Envelope, Hello, ServerFrame, REJECT_AUTH, REJECT_SUBSCRIPTION};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Outbound frames queued ahead of the write task.
const OUTBOUND_BUFFER: usize = 256;
/// How long `close` waits for `BYE` to reach the socket.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// What [`Transport::recv`] yields, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Deliver(Box<Envelope>),
    Control(Control),
    /// A `DELIVER` frame that could not be decoded; only its id survived.
    Malformed { envelope_id: String, error: String },
    /// The session ended. Every later call yields `Eof` again.
    Eof,
}

/// Out-of-band instructions from the Gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Cancel { envelope_id: String },
}

/// Timing and buffering knobs of a session.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inbound_buffer: usize,
}

impl From<&ListenConfig> for TransportOptions {
    fn from(cfg: &ListenConfig) -> Self {
        Self {
            heartbeat_interval: cfg.heartbeat_interval(),
            idle_timeout: cfg.idle_timeout(),
            handshake_timeout: cfg.handshake_timeout(),
            inbound_buffer: cfg.inbound_buffer.max(1),
        }
    }
}

/// Connection statistics shared across sessions, lock-free.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub connected: AtomicBool,
    pub sessions: AtomicU64,
    /// Unix milliseconds of the last inbound frame.
    pub last_inbound_ms: AtomicU64,
}

impl SessionStats {
    fn touch(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self.last_inbound_ms.store(now, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sessions successfully attached so far.
    pub fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }
}

/// Cloneable handle for sending frames on a session.
#[derive(Debug, Clone)]
pub struct TransportSender {
    outbound: mpsc::Sender<ClientFrame>,
    lost: CancellationToken,
}

impl TransportSender {
    pub async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if self.lost.is_cancelled() {
            return Err(TransportError::SessionLost);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::SessionLost)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once the session has ended, without touching the inbound queue.
    pub async fn closed(&self) {
        self.lost.cancelled().await;
    }
}

/// An attached session.
#[derive(Debug)]
pub struct Transport {
    session_id: String,
    inbound: mpsc::Receiver<Inbound>,
    sender: TransportSender,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Transport {
    /// Connect, announce `hello` and wait for the Gateway to attach a session.
    pub async fn open(
        url: &str,
        hello: &Hello,
        options: &TransportOptions,
        stats: Arc<SessionStats>,
    ) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Unreachable(format!("invalid gateway URL {url}: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", hello.api_key))
            .map_err(|_| TransportError::AuthFailed("API key contains invalid characters".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _response) = tokio::time::timeout(
            options.handshake_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| TransportError::Unreachable(format!("timed out connecting to {url}")))?
        .map_err(classify_connect_error)?;

        let (mut sink, mut source) = ws.split();
        let hello_text = protocol::encode_client(&ClientFrame::Hello(hello.clone()))
            .map_err(|e| TransportError::Unreachable(format!("encode HELLO: {e}")))?;
        sink.send(Message::Text(hello_text.into()))
            .await
            .map_err(|e| TransportError::Unreachable(format!("send HELLO: {e}")))?;

        let session_id = tokio::time::timeout(options.handshake_timeout, await_attached(&mut source))
            .await
            .map_err(|_| TransportError::Unreachable("timed out waiting for the gateway to attach".into()))??;

        stats.connected.store(true, Ordering::Relaxed);
        stats.sessions.fetch_add(1, Ordering::Relaxed);
        stats.touch();

        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let lost = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            source,
            inbound_tx,
            lost.clone(),
            options.idle_timeout,
            Arc::clone(&stats),
        ));
        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            lost.clone(),
            options.heartbeat_interval,
            stats,
        ));

        Ok(Self {
            session_id,
            inbound: inbound_rx,
            sender: TransportSender {
                outbound: outbound_tx,
                lost,
            },
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next inbound item. Cancel-safe.
    pub async fn recv(&mut self) -> Inbound {
        self.inbound.recv().await.unwrap_or(Inbound::Eof)
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.sender.send(frame).await
    }

    /// Send `BYE` and a close frame, then stop both tasks.
    pub async fn close(mut self, reason: &str) {
        let bye = ClientFrame::Bye {
            reason: reason.to_string(),
        };
        if self.sender.send(bye).await.is_ok() {
            if let Some(writer) = self.writer.take() {
                if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                    debug!("Gateway: BYE not flushed before close");
                }
            }
        }
        self.sender.lost.cancel();
        self.inbound.close();
    }

    /// Transport over plain channels, for exercising consumers without a socket.
    #[cfg(test)]
    pub(crate) fn in_memory(session_id: &str, inbound_buffer: usize) -> (Self, Peer) {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let transport = Self {
            session_id: session_id.to_string(),
            inbound: inbound_rx,
            sender: TransportSender {
                outbound: outbound_tx,
                lost: CancellationToken::new(),
            },
            reader: None,
            writer: None,
        };
        (
            transport,
            Peer {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.sender.lost.cancel();
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// Gateway side of [`Transport::in_memory`].
#[cfg(test)]
pub(crate) struct Peer {
    pub inbound: mpsc::Sender<Inbound>,
    pub outbound: mpsc::Receiver<ClientFrame>,
}

fn classify_connect_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
            TransportError::AuthFailed(format!("gateway refused the connection with HTTP {}", resp.status()))
        }
        other => TransportError::Unreachable(other.to_string()),
    }
}

/// Read frames until `ATTACHED` or `REJECTED`.
async fn await_attached(source: &mut WsSource) -> Result<String, TransportError> {
    while let Some(msg) = source.next().await {
        let msg = msg.map_err(|e| TransportError::Unreachable(format!("handshake: {e}")))?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match protocol::decode_server(text.as_str()) {
            Ok(ServerFrame::Attached { session_id }) => return Ok(session_id),
            Ok(ServerFrame::Rejected { code, message }) => {
                return Err(match code.as_str() {
                    REJECT_AUTH => TransportError::AuthFailed(message),
                    REJECT_SUBSCRIPTION => TransportError::SubscriptionRejected(message),
                    _ => TransportError::Unreachable(format!("gateway rejected session ({code}): {message}")),
                });
            }
            Ok(ServerFrame::Deliver(env)) => {
                return Err(TransportError::Unreachable(format!(
                    "gateway delivered {} before attaching",
                    env.envelope_id
                )));
            }
            Ok(_) => {}
            Err(e) => warn!("Gateway: undecodable frame during handshake: {e}"),
        }
    }
    Err(TransportError::Unreachable("gateway closed the connection during handshake".into()))
}

async fn read_loop(
    mut source: WsSource,
    inbound: mpsc::Sender<Inbound>,
    lost: CancellationToken,
    idle_timeout: Duration,
    stats: Arc<SessionStats>,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = lost.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, source.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                warn!("Gateway: no traffic for {}s, dropping session", idle_timeout.as_secs_f64());
                break;
            }
            Ok(None) => {
                info!("Gateway: connection closed");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!("Gateway: read error: {e}");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        stats.touch();

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(frame) => {
                info!("Gateway: close frame received ({frame:?})");
                break;
            }
            _ => continue,
        };
        let item = match protocol::decode_server(text.as_str()) {
            Ok(ServerFrame::Deliver(env)) => Inbound::Deliver(Box::new(env)),
            Ok(ServerFrame::Cancel { envelope_id }) => Inbound::Control(Control::Cancel { envelope_id }),
            Ok(ServerFrame::Rejected { code, message }) => {
                warn!("Gateway: session rejected ({code}): {message}");
                break;
            }
            Ok(frame) => {
                debug!("Gateway: ignoring {frame:?}");
                continue;
            }
            Err(e) => match protocol::undecodable_envelope_id(text.as_str()) {
                Some(envelope_id) => {
                    warn!(envelope = %envelope_id, "Gateway: undecodable delivery: {e}");
                    Inbound::Malformed {
                        envelope_id,
                        error: e.to_string(),
                    }
                }
                None => {
                    warn!("Gateway: undecodable frame: {e}");
                    continue;
                }
            },
        };

        tokio::select! {
            biased;
            () = lost.cancelled() => break,
            sent = inbound.send(item) => if sent.is_err() { break },
        }
    }
    stats.connected.store(false, Ordering::Relaxed);
    lost.cancel();
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<ClientFrame>,
    lost: CancellationToken,
    heartbeat_interval: Duration,
    stats: Arc<SessionStats>,
) {
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            () = lost.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = heartbeat.tick() => ClientFrame::Heartbeat,
        };
        let closing = matches!(frame, ClientFrame::Bye { .. });

        let text = match protocol::encode_client(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Gateway: failed to encode {frame:?}: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            warn!("Gateway: write error: {e}");
            break;
        }
        if closing {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            break;
        }
    }
    stats.connected.store(false, Ordering::Relaxed);
    lost.cancel();
}
