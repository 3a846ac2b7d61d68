//! Configuration loading and defaults.
//!
//! The config file is located in this order (first hit wins):
//!
//! 1. **Explicit path** via `--config <path>`
//! 2. **Project-local** `.hookdeck/config.toml` in the current directory
//!    (`--local` makes this the only candidate)
//! 3. **User config** `<config dir>/hookdeck/config.toml`
//! 4. **Compiled defaults** when no file exists
//!
//! Environment variables then override individual values:
//! `HOOKDECK_API_KEY`, `HOOKDECK_API_BASE`, `HOOKDECK_WS_URL`.
//!
//! ```toml
//! profile = "default"
//! api_base = "https://api.hookdeck.com/2024-03-01"
//! ws_url = "wss://ws.hookdeck.com/cli/v1"
//! log_level = "info"
//!
//! [default]
//! api_key = "your-api-key"
//!
//! [listen]
//! max_inflight = 64            # concurrent forwards across all sources
//! per_source_inflight = 8      # concurrent forwards per source
//! per_source_queue = 32        # queued envelopes per source
//! max_queued = 256             # queued envelopes across all sources
//! forward_timeout_ms = 30000   # upper bound on a single forward
//! heartbeat_interval_secs = 20
//! idle_timeout_secs = 60       # no inbound traffic for this long = fault
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::error::ListenError;

/// Name of the project-local config directory.
pub const LOCAL_CONFIG_DIR: &str = ".hookdeck";
/// File name used in both the local and the user config directories.
pub const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Active profile name (default `default`).
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Base URL of the REST API.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// WebSocket URL of the control channel.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub listen: ListenConfig,
    /// Every other table is a profile.
    #[serde(flatten)]
    pub profiles: HashMap<String, ProfileConfig>,
}

/// Credentials stored under a profile table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileConfig {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
}

/// Tuning for the listen subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Global cap on concurrent forwards (default 64).
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Per-source cap on concurrent forwards (default 8).
    #[serde(default = "default_per_source_inflight")]
    pub per_source_inflight: usize,
    /// Per-source FIFO depth (default 32).
    #[serde(default = "default_per_source_queue")]
    pub per_source_queue: usize,
    /// Total queued envelopes across sources (default 256).
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    /// Upper bound on a single forward in milliseconds (default 30 000).
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    /// Bytes of the local response body reported back (default 64 KiB).
    #[serde(default = "default_body_prefix_limit")]
    pub body_prefix_limit: usize,
    /// Seconds between outbound heartbeats (default 20).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds without inbound traffic before the session is faulted (default 60).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds allowed for connect + handshake (default 10).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Inbound envelopes buffered between the read task and the dispatcher (default 16).
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
    /// First reconnect delay in milliseconds (default 500).
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap in milliseconds (default 30 000).
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Seconds a session must stay up before the backoff resets (default 60).
    #[serde(default = "default_stable_threshold")]
    pub stable_threshold_secs: u64,
}

fn default_profile() -> String {
    "default".to_string()
}
fn default_api_base() -> String {
    "https://api.hookdeck.com/2024-03-01".to_string()
}
fn default_ws_url() -> String {
    "wss://ws.hookdeck.com/cli/v1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_inflight() -> usize {
    64
}
fn default_per_source_inflight() -> usize {
    8
}
fn default_per_source_queue() -> usize {
    32
}
fn default_max_queued() -> usize {
    256
}
fn default_forward_timeout_ms() -> u64 {
    30_000
}
fn default_body_prefix_limit() -> usize {
    64 * 1024
}
fn default_heartbeat_interval() -> u64 {
    20
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_inbound_buffer() -> usize {
    16
}
fn default_reconnect_base_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_stable_threshold() -> u64 {
    60
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            per_source_inflight: default_per_source_inflight(),
            per_source_queue: default_per_source_queue(),
            max_queued: default_max_queued(),
            forward_timeout_ms: default_forward_timeout_ms(),
            body_prefix_limit: default_body_prefix_limit(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            idle_timeout_secs: default_idle_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            inbound_buffer: default_inbound_buffer(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            stable_threshold_secs: default_stable_threshold(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_base: default_api_base(),
            ws_url: default_ws_url(),
            log_level: default_log_level(),
            listen: ListenConfig::default(),
            profiles: HashMap::new(),
        }
    }
}

impl ListenConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Reject settings that would deadlock admission or spin the heartbeat.
    pub fn validate(&self) -> Result<(), ListenError> {
        if self.max_inflight == 0 || self.per_source_inflight == 0 {
            return Err(ListenError::config(
                "listen.max_inflight and listen.per_source_inflight must be at least 1",
            ));
        }
        if self.per_source_queue == 0 || self.max_queued == 0 {
            return Err(ListenError::config(
                "listen.per_source_queue and listen.max_queued must be at least 1",
            ));
        }
        if self.forward_timeout_ms == 0 {
            return Err(ListenError::config("listen.forward_timeout_ms must be at least 1"));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ListenError::config(
                "listen.reconnect_base_ms must be at least 1 and no larger than listen.reconnect_max_ms",
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ListenError::config("listen.heartbeat_interval_secs must be at least 1"));
        }
        if self.idle_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ListenError::config(
                "listen.idle_timeout_secs must be longer than listen.heartbeat_interval_secs",
            ));
        }
        Ok(())
    }
}

fn check_url(key: &str, value: &str, schemes: &[&str]) -> Result<(), ListenError> {
    let url = Url::parse(value).map_err(|e| ListenError::config(format!("{key} '{value}' is not a URL: {e}")))?;
    if !schemes.contains(&url.scheme()) || url.host_str().is_none() {
        return Err(ListenError::config(format!(
            "{key} must be a {}:// URL with a host, got '{value}'",
            schemes.join("|")
        )));
    }
    Ok(())
}

/// Pick the config file to read.
///
/// `cwd` is passed in so lookups are testable; `user_dir` is normally
/// [`dirs::config_dir`].
pub fn locate(
    explicit: Option<&Path>,
    local_only: bool,
    cwd: &Path,
    user_dir: Option<&Path>,
) -> Result<Option<PathBuf>, ListenError> {
    if explicit.is_some() && local_only {
        return Err(ListenError::config("--local and --config cannot be used together"));
    }
    if let Some(p) = explicit {
        return Ok(Some(p.to_path_buf()));
    }

    let local = cwd.join(LOCAL_CONFIG_DIR).join(CONFIG_FILE);
    if local_only {
        if local.is_file() {
            return Ok(Some(local));
        }
        return Err(ListenError::config(format!(
            "--local given but {} does not exist",
            local.display()
        )));
    }
    if local.is_file() {
        return Ok(Some(local));
    }

    Ok(user_dir
        .map(|d| d.join("hookdeck").join(CONFIG_FILE))
        .filter(|p| p.is_file()))
}

impl Config {
    /// Read `path` (or defaults when `None`) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ListenError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ListenError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ListenError::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            ListenError::config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Env var overrides. `var` is injected so tests need not touch the process env.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("HOOKDECK_API_KEY").filter(|k| !k.is_empty()) {
            self.profiles.entry(self.profile.clone()).or_default().api_key = Some(key);
        }
        if let Some(base) = var("HOOKDECK_API_BASE") {
            self.api_base = base;
        }
        if let Some(url) = var("HOOKDECK_WS_URL") {
            self.ws_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ListenError> {
        check_url("ws_url", &self.ws_url, &["ws", "wss"])?;
        check_url("api_base", &self.api_base, &["http", "https"])?;
        self.listen.validate()
    }

    /// Resolve the API key: explicit flag, then the selected profile.
    pub fn api_key(&self, profile: Option<&str>, flag: Option<&str>) -> Result<String, ListenError> {
        if let Some(key) = flag.filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        let name = profile.unwrap_or(&self.profile);
        self.profiles
            .get(name)
            .and_then(|p| p.api_key.clone())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ListenError::config(format!(
                    "no API key for profile '{name}'; set HOOKDECK_API_KEY or add api_key to the config file"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let config = Config::default();
        assert_eq!(config.profile, "default");
        assert_eq!(config.listen.max_inflight, 64);
        assert_eq!(config.listen.per_source_queue, 32);
        assert_eq!(config.listen.max_queued, 256);
        assert_eq!(config.listen.body_prefix_limit, 65_536);
        assert_eq!(config.listen.forward_timeout(), Duration::from_secs(30));
        assert!(config.listen.validate().is_ok());
    }

    #[test]
    fn parses_profiles_and_listen_table() {
        let config: Config = toml::from_str(
            r#"
            profile = "work"
            log_level = "debug"

            [default]
            api_key = "key-default"

            [work]
            api_key = "key-work"
            project_id = "tm_123"

            [listen]
            per_source_inflight = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.listen.per_source_inflight, 1);
        assert_eq!(config.listen.max_inflight, 64);
        assert_eq!(config.api_key(None, None).unwrap(), "key-work");
        assert_eq!(config.api_key(Some("default"), None).unwrap(), "key-default");
        assert_eq!(config.api_key(None, Some("flag-key")).unwrap(), "flag-key");
    }

    #[test]
    fn env_key_overrides_profile() {
        let mut config = Config::default();
        config.apply_env(|name| (name == "HOOKDECK_API_KEY").then(|| "env-key".to_string()));
        assert_eq!(config.api_key(None, None).unwrap(), "env-key");
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let err = Config::default().api_key(None, None).unwrap_err();
        assert!(matches!(err, ListenError::Config(_)));
    }

    #[test]
    fn local_and_explicit_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let err = locate(Some(Path::new("x.toml")), true, dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("--local"));
    }

    #[test]
    fn local_config_wins_over_user_config() {
        let cwd = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(user.path().join("hookdeck")).unwrap();
        std::fs::write(user.path().join("hookdeck").join(CONFIG_FILE), "").unwrap();

        let found = locate(None, false, cwd.path(), Some(user.path())).unwrap();
        assert_eq!(found, Some(user.path().join("hookdeck").join(CONFIG_FILE)));

        std::fs::create_dir_all(cwd.path().join(LOCAL_CONFIG_DIR)).unwrap();
        std::fs::write(cwd.path().join(LOCAL_CONFIG_DIR).join(CONFIG_FILE), "").unwrap();
        let found = locate(None, false, cwd.path(), Some(user.path())).unwrap();
        assert_eq!(found, Some(cwd.path().join(LOCAL_CONFIG_DIR).join(CONFIG_FILE)));
    }

    #[test]
    fn local_only_requires_local_file() {
        let cwd = tempfile::tempdir().unwrap();
        assert!(locate(None, true, cwd.path(), None).is_err());
    }

    #[test]
    fn validate_rejects_zero_caps() {
        let listen = ListenConfig {
            max_inflight: 0,
            ..ListenConfig::default()
        };
        assert!(listen.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timers() {
        for listen in [
            ListenConfig {
                forward_timeout_ms: 0,
                ..ListenConfig::default()
            },
            ListenConfig {
                reconnect_base_ms: 0,
                ..ListenConfig::default()
            },
            ListenConfig {
                reconnect_base_ms: 5_000,
                reconnect_max_ms: 1_000,
                ..ListenConfig::default()
            },
        ] {
            assert!(matches!(listen.validate(), Err(ListenError::Config(_))), "{listen:?}");
        }
        assert!(ListenConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_checks_url_schemes() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.ws_url = "WSS://ws.example/cli/v1".into();
        assert!(config.validate().is_ok());

        config.ws_url = "https://ws.example".into();
        assert!(config.validate().is_err());

        config.ws_url = "ws.example/cli/v1".into();
        assert!(config.validate().is_err());

        config = Config::default();
        config.api_base = "http://".into();
        assert!(config.validate().is_err());
    }
}
