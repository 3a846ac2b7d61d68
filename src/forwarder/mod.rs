//! Forwarder: turn one envelope into one HTTP request against a local endpoint
//! and classify what happened.
//!
//! | What happened                          | Outcome                |
//! |----------------------------------------|------------------------|
//! | Any HTTP status came back              | `delivered`            |
//! | Connection refused, DNS or TLS failure | `refused`              |
//! | Deadline passed                        | `timed_out`            |
//! | Cancelled by the dispatcher            | `local_error{cancelled}` |
//! | Anything else                          | `local_error`          |
//!
//! The effective deadline is the earlier of the envelope deadline and the
//! configured maximum. An envelope whose deadline already passed is reported
//! `timed_out` without opening a connection.

mod http1;

use std::future::Future;
use std::time::{Duration, Instant, SystemTime};

use tokio::net::TcpStream;
use tokio_native_tls::native_tls;
use tokio_util::sync::CancellationToken;

use crate::error::{ForwardError, ListenError};
use crate::protocol::{Envelope, Outcome};
use crate::subscription::{LocalEndpoint, Scheme};

pub use http1::Response;

/// Something that can deliver an envelope and report an [`Outcome`].
///
/// Implementations must return exactly one outcome and must honor `cancel`
/// by returning [`Outcome::cancelled`] promptly.
pub trait Forward: Send + Sync + 'static {
    fn forward(
        &self,
        endpoint: &LocalEndpoint,
        envelope: &Envelope,
        cancel: CancellationToken,
    ) -> impl Future<Output = Outcome> + Send;
}

/// HTTP/1.1 forwarder over plain TCP or TLS.
pub struct HttpForwarder {
    max_timeout: Duration,
    body_prefix_limit: usize,
    tls: tokio_native_tls::TlsConnector,
}

impl HttpForwarder {
    /// `insecure` accepts invalid certificates and host names on `https`
    /// endpoints (self-signed development servers).
    pub fn new(max_timeout: Duration, body_prefix_limit: usize, insecure: bool) -> Result<Self, ListenError> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(insecure)
            .danger_accept_invalid_hostnames(insecure)
            .build()
            .map_err(|e| ListenError::Runtime(format!("TLS setup failed: {e}")))?;
        Ok(Self {
            max_timeout,
            body_prefix_limit,
            tls: tls.into(),
        })
    }

    /// Time left for this envelope, or `None` if its deadline already passed.
    fn budget(&self, envelope: &Envelope) -> Option<Duration> {
        let Some(deadline) = envelope.deadline() else {
            return Some(self.max_timeout);
        };
        match deadline.duration_since(SystemTime::now()) {
            Ok(left) if !left.is_zero() => Some(left.min(self.max_timeout)),
            _ => None,
        }
    }

    async fn exchange(
        &self,
        endpoint: &LocalEndpoint,
        request: &[u8],
        head_request: bool,
    ) -> Result<Response, ForwardError> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ForwardError::Refused(format!("connect to {}: {e}", endpoint.authority())))?;
        let _ = tcp.set_nodelay(true);

        match endpoint.scheme {
            Scheme::Http => http1::exchange(tcp, request, head_request, self.body_prefix_limit).await,
            Scheme::Https => {
                let tls = self
                    .tls
                    .connect(&endpoint.host, tcp)
                    .await
                    .map_err(|e| ForwardError::Refused(format!("TLS handshake with {}: {e}", endpoint.authority())))?;
                http1::exchange(tls, request, head_request, self.body_prefix_limit).await
            }
        }
    }
}

impl Forward for HttpForwarder {
    async fn forward(
        &self,
        endpoint: &LocalEndpoint,
        envelope: &Envelope,
        cancel: CancellationToken,
    ) -> Outcome {
        let id = envelope.envelope_id.as_str();
        let started = Instant::now();

        let Some(budget) = self.budget(envelope) else {
            return Outcome::timed_out(id, Duration::ZERO);
        };
        let request = match http1::encode_request(endpoint, envelope) {
            Ok(r) => r,
            Err(e) => return Outcome::local_error(id, e.to_string(), started.elapsed()),
        };
        let head_request = envelope.method.eq_ignore_ascii_case("HEAD");

        tokio::select! {
            biased;
            () = cancel.cancelled() => Outcome::cancelled(id, started.elapsed()),
            res = tokio::time::timeout(budget, self.exchange(endpoint, &request, head_request)) => {
                let latency = started.elapsed();
                match res {
                    Err(_) => Outcome::timed_out(id, latency),
                    Ok(Ok(resp)) => Outcome::delivered(id, resp.status, resp.headers, resp.body_prefix, latency),
                    Ok(Err(ForwardError::Refused(msg))) => Outcome::refused(id, msg, latency),
                    Ok(Err(ForwardError::Local(msg))) => Outcome::local_error(id, msg, latency),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeliveryResult;
    use crate::test_support::{envelope, serve};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn forwarder(max_timeout: Duration) -> HttpForwarder {
        HttpForwarder::new(max_timeout, 64 * 1024, false).unwrap()
    }

    fn endpoint_for(addr: std::net::SocketAddr) -> LocalEndpoint {
        LocalEndpoint::parse(&format!("http://{addr}")).unwrap()
    }

    /// Accept one connection, capture the raw request, answer with `reply`.
    /// With `reply == None` the connection is held open without answering.
    async fn raw_endpoint(reply: Option<&'static [u8]>) -> (std::net::SocketAddr, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&raw) {
                    break;
                }
            }
            let _ = tx.send(raw);
            match reply {
                Some(bytes) => {
                    sock.write_all(bytes).await.unwrap();
                    sock.shutdown().await.ok();
                }
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
        });
        (addr, rx)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&raw[..end]);
        let len = head
            .lines()
            .find_map(|l| {
                let (n, v) = l.split_once(':')?;
                n.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        raw.len() >= end + 4 + len
    }

    #[tokio::test]
    async fn delivers_and_reports_status_headers_and_body() {
        let app = Router::new().route(
            "/hooks/stripe",
            post(|headers: HeaderMap, body: String| async move {
                assert_eq!(headers["x-signature"], "abc");
                assert_eq!(body, r#"{"id":1}"#);
                (StatusCode::CREATED, [("x-handled-by", "local")], "thanks")
            }),
        );
        let base = serve(app).await;
        let endpoint = LocalEndpoint::parse(&format!("{base}/hooks")).unwrap();
        let mut env = envelope("E1", "src_a");
        env.path_suffix = "/stripe".into();
        env.headers = vec![("X-Signature".into(), "abc".into())];
        env.body = br#"{"id":1}"#.to_vec();

        let outcome = forwarder(Duration::from_secs(5))
            .forward(&endpoint, &env, CancellationToken::new())
            .await;
        assert_eq!(outcome.result, DeliveryResult::Delivered);
        assert_eq!(outcome.http_status, Some(201));
        assert_eq!(outcome.response_body_prefix.as_deref(), Some(&b"thanks"[..]));
        let headers = outcome.response_headers.unwrap();
        assert!(headers.iter().any(|(n, v)| n == "x-handled-by" && v == "local"));
    }

    #[tokio::test]
    async fn error_statuses_are_still_delivered() {
        let (addr, _rx) = raw_endpoint(Some(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy")).await;
        let outcome = forwarder(Duration::from_secs(5))
            .forward(&endpoint_for(addr), &envelope("E1", "src_a"), CancellationToken::new())
            .await;
        assert_eq!(outcome.result, DeliveryResult::Delivered);
        assert_eq!(outcome.http_status, Some(503));
    }

    #[tokio::test]
    async fn wire_request_preserves_headers_and_rewrites_host() {
        let (addr, rx) = raw_endpoint(Some(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")).await;
        let mut env = envelope("E1", "src_a");
        env.path_suffix = "/x".into();
        env.query_string = "a=1&b=2".into();
        env.headers = vec![
            ("X-A".into(), "1".into()),
            ("x-a".into(), "2".into()),
            ("Host".into(), "hooks.example".into()),
            ("Transfer-Encoding".into(), "chunked".into()),
            ("Content-Type".into(), "application/json".into()),
        ];
        env.body = b"{}".to_vec();

        let outcome = forwarder(Duration::from_secs(5))
            .forward(&endpoint_for(addr), &env, CancellationToken::new())
            .await;
        assert_eq!(outcome.result, DeliveryResult::Delivered);

        let raw = String::from_utf8(rx.await.unwrap()).unwrap();
        assert_eq!(
            raw,
            format!(
                "POST /x?a=1&b=2 HTTP/1.1\r\nHost: {addr}\r\nX-A: 1\r\nx-a: 2\r\n\
                 Content-Type: application/json\r\nContent-Length: 2\r\n\r\n{{}}"
            )
        );
    }

    #[tokio::test]
    async fn empty_body_is_sent_with_zero_length() {
        let (addr, rx) = raw_endpoint(Some(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")).await;
        let outcome = forwarder(Duration::from_secs(5))
            .forward(&endpoint_for(addr), &envelope("E1", "src_a"), CancellationToken::new())
            .await;
        assert_eq!(outcome.result, DeliveryResult::Delivered);
        let raw = String::from_utf8(rx.await.unwrap()).unwrap();
        assert!(raw.ends_with("Content-Length: 0\r\n\r\n"), "{raw}");
    }

    #[tokio::test]
    async fn closed_port_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = forwarder(Duration::from_secs(5))
            .forward(&endpoint_for(addr), &envelope("E1", "src_a"), CancellationToken::new())
            .await;
        assert_eq!(outcome.result, DeliveryResult::Refused);
        assert!(outcome.error_summary.is_some());
        assert!(outcome.http_status.is_none());
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        let (addr, _rx) = raw_endpoint(None).await;
        let started = Instant::now();
        let outcome = forwarder(Duration::from_millis(200))
            .forward(&endpoint_for(addr), &envelope("E1", "src_a"), CancellationToken::new())
            .await;
        assert_eq!(outcome.result, DeliveryResult::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn past_deadline_times_out_without_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut env = envelope("E1", "src_a");
        env.deadline_ms = Some(1);

        let outcome = forwarder(Duration::from_secs(5))
            .forward(&endpoint_for(addr), &env, CancellationToken::new())
            .await;
        assert_eq!(outcome.result, DeliveryResult::TimedOut);
        assert_eq!(outcome.latency_ms, 0);
        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "forwarder must not connect");
    }

    #[tokio::test]
    async fn content_length_mismatch_is_a_local_error() {
        let mut env = envelope("E1", "src_a");
        env.headers = vec![("Content-Length".into(), "10".into())];
        env.body = b"abc".to_vec();
        let endpoint = LocalEndpoint::parse("9").unwrap();
        let outcome = forwarder(Duration::from_secs(5))
            .forward(&endpoint, &env, CancellationToken::new())
            .await;
        assert_eq!(outcome.result, DeliveryResult::LocalError);
    }

    #[tokio::test]
    async fn cancellation_reports_cancelled() {
        let (addr, _rx) = raw_endpoint(None).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome = forwarder(Duration::from_secs(10))
            .forward(&endpoint_for(addr), &envelope("E1", "src_a"), cancel)
            .await;
        assert!(outcome.is_cancelled());
    }
}
