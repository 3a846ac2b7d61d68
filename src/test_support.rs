//! Test fixtures: an in-process fake Gateway and HTTP helpers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;

use crate::protocol::{ClientFrame, Envelope, Hello, Outcome, ServerFrame};

/// Serve `app` on an ephemeral port and return its base URL.
pub async fn serve(app: Router) -> String {
    format!("http://{}", serve_addr(app).await)
}

pub async fn serve_addr(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Bare POST envelope with no headers or body.
pub fn envelope(id: &str, source_id: &str) -> Envelope {
    Envelope {
        envelope_id: id.to_string(),
        attempt_id: format!("atm_{id}"),
        event_id: format!("evt_{id}"),
        source_id: source_id.to_string(),
        method: "POST".to_string(),
        path_suffix: String::new(),
        headers: Vec::new(),
        query_string: String::new(),
        body: Vec::new(),
        deadline_ms: None,
    }
}

/// How the fake Gateway answers a connection.
#[derive(Debug, Clone, Default)]
pub struct GatewayBehavior {
    /// Refuse the WebSocket upgrade with this status.
    pub upgrade_status: Option<StatusCode>,
    /// Answer `HELLO` with `REJECTED { code, message }`.
    pub reject: Option<(String, String)>,
    /// Send `HEARTBEAT` at this interval.
    pub heartbeat: Option<Duration>,
    /// Never answer `HELLO`.
    pub mute: bool,
}

enum Command {
    Frame(ServerFrame),
    Raw(String),
    Disconnect,
}

struct GatewayState {
    behavior: GatewayBehavior,
    connections: AtomicUsize,
    hellos: mpsc::UnboundedSender<Hello>,
    frames: mpsc::UnboundedSender<ClientFrame>,
    current: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

/// A WebSocket Gateway speaking the control protocol, driven by the test.
pub struct FakeGateway {
    pub url: String,
    state: Arc<GatewayState>,
    hellos: mpsc::UnboundedReceiver<Hello>,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
}

impl FakeGateway {
    pub async fn start(behavior: GatewayBehavior) -> Self {
        let (hello_tx, hellos) = mpsc::unbounded_channel();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let state = Arc::new(GatewayState {
            behavior,
            connections: AtomicUsize::new(0),
            hellos: hello_tx,
            frames: frame_tx,
            current: Mutex::new(None),
        });
        let app = Router::new()
            .route("/cli/v1", get(upgrade))
            .with_state(Arc::clone(&state));
        let addr = serve_addr(app).await;
        Self {
            url: format!("ws://{addr}/cli/v1"),
            state,
            hellos,
            frames,
        }
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Send a frame on the current connection.
    pub fn send(&self, frame: ServerFrame) {
        self.command(Command::Frame(frame));
    }

    /// Send `text` as-is, valid frame or not.
    pub fn send_raw(&self, text: &str) {
        self.command(Command::Raw(text.to_string()));
    }

    fn command(&self, cmd: Command) {
        let current = self.state.current.lock().unwrap();
        current.as_ref().expect("no client connected").send(cmd).ok();
    }

    pub fn deliver(&self, envelope: Envelope) {
        self.send(ServerFrame::Deliver(envelope));
    }

    /// Drop the current connection without a close frame.
    pub fn disconnect(&self) {
        if let Some(tx) = self.state.current.lock().unwrap().take() {
            tx.send(Command::Disconnect).ok();
        }
    }

    pub async fn next_hello(&mut self) -> Hello {
        tokio::time::timeout(Duration::from_secs(5), self.hellos.recv())
            .await
            .expect("timed out waiting for HELLO")
            .expect("gateway stopped")
    }

    /// Next non-heartbeat frame from the client.
    pub async fn next_frame(&mut self) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("gateway stopped")
    }

    pub async fn next_outcome(&mut self) -> Outcome {
        loop {
            if let ClientFrame::Outcome(outcome) = self.next_frame().await {
                return outcome;
            }
        }
    }

    /// Assert nothing but heartbeats arrives for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(wait, self.frames.recv()).await {
            panic!("unexpected frame {frame:?}");
        }
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    if let Some(status) = state.behavior.upgrade_status {
        return status.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    let text = serde_json::to_string(frame).unwrap();
    socket.send(Message::Text(text.into())).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<GatewayState>) {
    let n = state.connections.fetch_add(1, Ordering::SeqCst) + 1;

    let hello = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Hello(hello)) => break hello,
                _ => return,
            },
            Some(Ok(_)) => {}
            _ => return,
        }
    };

    if state.behavior.mute {
        state.hellos.send(hello).ok();
        tokio::time::sleep(Duration::from_secs(60)).await;
        return;
    }
    if let Some((code, message)) = state.behavior.reject.clone() {
        send_frame(&mut socket, &ServerFrame::Rejected { code, message }).await;
        state.hellos.send(hello).ok();
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    *state.current.lock().unwrap() = Some(tx);
    send_frame(&mut socket, &ServerFrame::ServerHello {}).await;
    send_frame(
        &mut socket,
        &ServerFrame::Attached {
            session_id: format!("ses_{n}"),
        },
    )
    .await;
    state.hellos.send(hello).ok();

    let heartbeat = state.behavior.heartbeat.unwrap_or(Duration::from_secs(3600));
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Frame(frame)) => {
                    if !send_frame(&mut socket, &frame).await {
                        return;
                    }
                }
                Some(Command::Raw(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Some(Command::Disconnect) | None => return,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<ClientFrame>(text.as_str()) {
                        if frame != ClientFrame::Heartbeat {
                            state.frames.send(frame).ok();
                        }
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            _ = ticker.tick(), if state.behavior.heartbeat.is_some() => {
                if !send_frame(&mut socket, &ServerFrame::Heartbeat {}).await {
                    return;
                }
            }
        }
    }
}
