//! Control-channel wire protocol.
//!
//! Every message is one JSON text frame over the WebSocket with a `"type"`
//! tag. Opaque byte fields (`body`, `response_body_prefix`) are base64.
//!
//! ## Client → Gateway
//!
//! | Type        | Fields                                                                 |
//! |-------------|------------------------------------------------------------------------|
//! | `HELLO`     | `cli_version`, `api_key`, `subscriptions[]`, `resume_session_id?`      |
//! | `OUTCOME`   | `envelope_id`, `result`, `http_status?`, `response_headers?`, `response_body_prefix?`, `latency_ms`, `error_summary?` |
//! | `HEARTBEAT` | none                                                                    |
//! | `BYE`       | `reason`                                                               |
//!
//! ## Gateway → Client
//!
//! | Type           | Fields                                   |
//! |----------------|------------------------------------------|
//! | `SERVER_HELLO` | (ignored)                                |
//! | `ATTACHED`     | `session_id`                             |
//! | `REJECTED`     | `code`, `message`                        |
//! | `DELIVER`      | envelope fields, `body`, `deadline_ms?`  |
//! | `CANCEL`       | `envelope_id`                            |
//! | `HEARTBEAT`    | none                                      |
//! | `REKEY_HINT`   | (ignored)                                |
//!
//! Unknown types decode to [`ServerFrame::Unknown`] and are skipped.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// `REJECTED.code` for a bad API key.
pub const REJECT_AUTH: &str = "auth_failed";
/// `REJECTED.code` for a refused subscription set.
pub const REJECT_SUBSCRIPTION: &str = "subscription_rejected";

/// `error_summary` of an envelope whose source is not subscribed.
pub const NO_SUBSCRIPTION: &str = "no_subscription";
/// `error_summary` of an envelope cancelled before its forward completed.
pub const CANCELLED: &str = "cancelled";

/// One Attempt in flight, as delivered by the Gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_id: String,
    pub attempt_id: String,
    pub event_id: String,
    pub source_id: String,
    pub method: String,
    #[serde(default)]
    pub path_suffix: String,
    /// Ordered `(name, value)` pairs; duplicates and case are significant.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub query_string: String,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
    /// Absolute deadline, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl Envelope {
    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline_ms
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
    }
}

/// Result class of a forwarded delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered,
    Refused,
    TimedOut,
    LocalError,
}

impl DeliveryResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Refused => "refused",
            Self::TimedOut => "timed_out",
            Self::LocalError => "local_error",
        }
    }
}

/// Report of a single forwarded delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub envelope_id: String,
    pub result: DeliveryResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub response_body_prefix: Option<Vec<u8>>,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

impl Outcome {
    fn bare(envelope_id: &str, result: DeliveryResult, latency: Duration) -> Self {
        Self {
            envelope_id: envelope_id.to_string(),
            result,
            http_status: None,
            response_headers: None,
            response_body_prefix: None,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            error_summary: None,
        }
    }

    pub fn delivered(
        envelope_id: &str,
        status: u16,
        headers: Vec<(String, String)>,
        body_prefix: Vec<u8>,
        latency: Duration,
    ) -> Self {
        Self {
            http_status: Some(status),
            response_headers: Some(headers),
            response_body_prefix: Some(body_prefix),
            ..Self::bare(envelope_id, DeliveryResult::Delivered, latency)
        }
    }

    pub fn refused(envelope_id: &str, summary: impl Into<String>, latency: Duration) -> Self {
        Self {
            error_summary: Some(summary.into()),
            ..Self::bare(envelope_id, DeliveryResult::Refused, latency)
        }
    }

    pub fn timed_out(envelope_id: &str, latency: Duration) -> Self {
        Self::bare(envelope_id, DeliveryResult::TimedOut, latency)
    }

    pub fn local_error(envelope_id: &str, summary: impl Into<String>, latency: Duration) -> Self {
        Self {
            error_summary: Some(summary.into()),
            ..Self::bare(envelope_id, DeliveryResult::LocalError, latency)
        }
    }

    pub fn no_subscription(envelope_id: &str) -> Self {
        Self::local_error(envelope_id, NO_SUBSCRIPTION, Duration::ZERO)
    }

    pub fn cancelled(envelope_id: &str, latency: Duration) -> Self {
        Self::local_error(envelope_id, CANCELLED, latency)
    }

    pub fn is_cancelled(&self) -> bool {
        self.result == DeliveryResult::LocalError
            && self.error_summary.as_deref() == Some(CANCELLED)
    }
}

/// One announced subscription inside `HELLO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionHint {
    pub source_id: String,
    pub local_endpoint_hint: String,
}

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub cli_version: String,
    pub api_key: String,
    pub subscriptions: Vec<SubscriptionHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
}

/// Frames sent by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Hello(Hello),
    Outcome(Outcome),
    Heartbeat,
    Bye { reason: String },
}

/// Frames sent by the Gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    ServerHello {},
    Attached { session_id: String },
    Rejected { code: String, message: String },
    Deliver(Envelope),
    Cancel { envelope_id: String },
    Heartbeat {},
    RekeyHint {},
    #[serde(other)]
    Unknown,
}

pub fn encode_client(frame: &ClientFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

pub fn decode_server(text: &str) -> Result<ServerFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// `envelope_id` of a `DELIVER` frame that [`decode_server`] rejected, so the
/// envelope can still be answered.
pub fn undecodable_envelope_id(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "DELIVER" {
        return None;
    }
    value.get("envelope_id")?.as_str().map(str::to_string)
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(D::Error::custom)
    }
}

mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|text| STANDARD.decode(text).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn decodes_deliver_with_ordered_headers_and_binary_body() {
        let text = json!({
            "type": "DELIVER",
            "envelope_id": "E1",
            "attempt_id": "atm_1",
            "event_id": "evt_1",
            "source_id": "src_a",
            "method": "POST",
            "path_suffix": "/hooks",
            "headers": [["X-A", "1"], ["x-a", "2"], ["Content-Type", "application/json"]],
            "query_string": "a=1&b=2",
            "body": "AP8=",
            "deadline_ms": 1_700_000_000_000u64,
        })
        .to_string();

        let ServerFrame::Deliver(env) = decode_server(&text).unwrap() else {
            panic!("expected DELIVER");
        };
        assert_eq!(env.envelope_id, "E1");
        assert_eq!(
            env.headers,
            vec![
                ("X-A".to_string(), "1".to_string()),
                ("x-a".to_string(), "2".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ]
        );
        assert_eq!(env.body, vec![0x00, 0xff]);
        assert_eq!(
            env.deadline(),
            Some(UNIX_EPOCH + Duration::from_millis(1_700_000_000_000))
        );
    }

    #[test]
    fn deliver_defaults_optional_fields() {
        let text = r#"{"type":"DELIVER","envelope_id":"E2","attempt_id":"a","event_id":"e","source_id":"s","method":"GET"}"#;
        let ServerFrame::Deliver(env) = decode_server(text).unwrap() else {
            panic!("expected DELIVER");
        };
        assert!(env.body.is_empty());
        assert!(env.headers.is_empty());
        assert_eq!(env.deadline(), None);
    }

    #[test]
    fn tolerates_out_of_band_and_unknown_frames() {
        assert_eq!(
            decode_server(r#"{"type":"SERVER_HELLO","server_version":"9.9","features":["x"]}"#)
                .unwrap(),
            ServerFrame::ServerHello {}
        );
        assert_eq!(
            decode_server(r#"{"type":"REKEY_HINT","after_ms":1000}"#).unwrap(),
            ServerFrame::RekeyHint {}
        );
        assert_eq!(
            decode_server(r#"{"type":"SOMETHING_NEW","x":1}"#).unwrap(),
            ServerFrame::Unknown
        );
        assert_eq!(
            decode_server(r#"{"type":"HEARTBEAT"}"#).unwrap(),
            ServerFrame::Heartbeat {}
        );
    }

    #[test]
    fn broken_deliver_keeps_its_envelope_id() {
        let bad_body = r#"{"type":"DELIVER","envelope_id":"E9","attempt_id":"a","event_id":"e","source_id":"s","method":"POST","body":"%%%"}"#;
        assert!(decode_server(bad_body).is_err());
        assert_eq!(undecodable_envelope_id(bad_body).as_deref(), Some("E9"));

        let missing_field = r#"{"type":"DELIVER","envelope_id":"E10"}"#;
        assert!(decode_server(missing_field).is_err());
        assert_eq!(undecodable_envelope_id(missing_field).as_deref(), Some("E10"));

        assert_eq!(undecodable_envelope_id(r#"{"type":"CANCEL","envelope_id":7}"#), None);
        assert_eq!(undecodable_envelope_id(r#"{"type":"DELIVER"}"#), None);
        assert_eq!(undecodable_envelope_id("not json"), None);
    }

    #[test]
    fn heartbeat_is_an_empty_tagged_frame() {
        let v: Value = serde_json::from_str(&encode_client(&ClientFrame::Heartbeat).unwrap()).unwrap();
        assert_eq!(v, json!({"type": "HEARTBEAT"}));
    }

    #[test]
    fn outcome_wire_shape() {
        let outcome = Outcome::delivered(
            "E1",
            200,
            vec![("Content-Type".into(), "text/plain".into())],
            b"ok".to_vec(),
            Duration::from_millis(12),
        );
        let v: Value =
            serde_json::from_str(&encode_client(&ClientFrame::Outcome(outcome)).unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "OUTCOME",
                "envelope_id": "E1",
                "result": "delivered",
                "http_status": 200,
                "response_headers": [["Content-Type", "text/plain"]],
                "response_body_prefix": "b2s=",
                "latency_ms": 12,
            })
        );
    }

    #[test]
    fn error_outcomes_carry_summary_only() {
        let v = serde_json::to_value(Outcome::no_subscription("E3")).unwrap();
        assert_eq!(
            v,
            json!({
                "envelope_id": "E3",
                "result": "local_error",
                "latency_ms": 0,
                "error_summary": "no_subscription",
            })
        );
        assert!(Outcome::cancelled("E4", Duration::ZERO).is_cancelled());
        assert!(!Outcome::timed_out("E5", Duration::ZERO).is_cancelled());
    }

    #[test]
    fn hello_lists_subscriptions() {
        let hello = ClientFrame::Hello(Hello {
            cli_version: "0.1.0".into(),
            api_key: "k".into(),
            subscriptions: vec![SubscriptionHint {
                source_id: "src_1".into(),
                local_endpoint_hint: "http://localhost:8080/".into(),
            }],
            resume_session_id: None,
        });
        let v: Value = serde_json::from_str(&encode_client(&hello).unwrap()).unwrap();
        assert_eq!(v["type"], "HELLO");
        assert_eq!(v["subscriptions"][0]["source_id"], "src_1");
        assert!(v.get("resume_session_id").is_none());
    }
}
