//! Error taxonomy for the listen subsystem.
//!
//! Only [`ListenError::Config`] and [`ListenError::Auth`] are meant to reach
//! process exit. Transport faults are absorbed by the session manager and
//! per-envelope failures travel to the Gateway as outcomes.

use thiserror::Error;

/// Process exit codes.
pub mod exit {
    pub const OK: u8 = 0;
    pub const RUNTIME: u8 = 1;
    pub const DRAIN_TIMEOUT: u8 = 2;
    pub const AUTH: u8 = 3;
    pub const CONFIG: u8 = 4;
}

/// Errors that end the `listen` command.
#[derive(Debug, Error)]
pub enum ListenError {
    /// Invalid flags, unresolvable sources, unreadable config.
    #[error("configuration error: {0}")]
    Config(String),

    /// Credentials rejected by the Gateway or the REST API.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Anything else that prevented the subsystem from running.
    #[error("{0}")]
    Runtime(String),
}

impl ListenError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Exit code for this error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => exit::CONFIG,
            Self::Auth(_) => exit::AUTH,
            Self::Runtime(_) => exit::RUNTIME,
        }
    }
}

/// Control-channel failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The Gateway rejected the API key.
    #[error("gateway rejected credentials: {0}")]
    AuthFailed(String),

    /// The Gateway refused the announced subscription set.
    #[error("gateway rejected subscriptions: {0}")]
    SubscriptionRejected(String),

    /// The Gateway could not be reached or the handshake did not complete.
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The session ended; nothing more can be sent on it.
    #[error("session lost")]
    SessionLost,
}

impl TransportError {
    /// Whether the session manager should back off and try again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::SessionLost)
    }
}

impl From<TransportError> for ListenError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::AuthFailed(msg) => Self::Auth(msg),
            TransportError::SubscriptionRejected(msg) => Self::Config(msg),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Why a forward did not produce an HTTP response.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Connection refused, name resolution or TLS failure.
    #[error("{0}")]
    Refused(String),

    /// Any other local failure: malformed request or response, I/O error.
    #[error("{0}")]
    Local(String),
}

/// REST API failures.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure talking to the REST API.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// 401/403 from the REST API.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Any other non-2xx response. `hints` are local suggestions appended to
    /// the server's message.
    #[error("{}", render_api_error(.status, .message, .hints))]
    Status {
        status: u16,
        message: String,
        hints: Vec<String>,
    },
}

fn render_api_error(status: &u16, message: &str, hints: &[String]) -> String {
    let mut out = format!("HTTP {status}: {message}");
    for hint in hints {
        out.push_str("\n  hint: ");
        out.push_str(hint);
    }
    out
}

impl From<ApiError> for ListenError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized { message } => Self::Auth(message),
            other => Self::Config(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(ListenError::config("x").exit_code(), exit::CONFIG);
        assert_eq!(ListenError::Auth("x".into()).exit_code(), exit::AUTH);
        assert_eq!(ListenError::Runtime("x".into()).exit_code(), exit::RUNTIME);
    }

    #[test]
    fn transport_errors_map_to_listen_errors() {
        let auth: ListenError = TransportError::AuthFailed("bad key".into()).into();
        assert_eq!(auth.exit_code(), exit::AUTH);
        let subs: ListenError = TransportError::SubscriptionRejected("nope".into()).into();
        assert_eq!(subs.exit_code(), exit::CONFIG);
        assert!(TransportError::Unreachable("dns".into()).is_retriable());
        assert!(!TransportError::AuthFailed("x".into()).is_retriable());
    }

    #[test]
    fn api_status_error_lists_hints() {
        let e = ApiError::Status {
            status: 422,
            message: "source not found".into(),
            hints: vec!["--source-id flag expects an identifier with prefix `src_`".into()],
        };
        let text = e.to_string();
        assert!(text.starts_with("HTTP 422: source not found"));
        assert!(text.contains("hint: --source-id"));
    }
}
