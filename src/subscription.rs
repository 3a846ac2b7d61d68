//! Subscriptions: which Source goes to which local endpoint.
//!
//! Built once at startup from CLI routes, with Source names resolved to ids
//! through the REST API, then frozen. The [`SubscriptionSet`] is shared
//! read-only by the session manager (handshake payload) and the dispatcher
//! (routing).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use reqwest::Url;
use tracing::info;

use crate::api::ApiClient;
use crate::error::{ApiError, ListenError};
use crate::protocol::SubscriptionHint;

/// Prefix of Source identifiers.
pub const SOURCE_ID_PREFIX: &str = "src_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Where deliveries for one Source are forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Empty, or starts with `/` and has no trailing `/`.
    pub path_prefix: String,
}

impl LocalEndpoint {
    /// Parse a bare port (`3000`) or a URL (`https://127.0.0.1:8443/api`).
    pub fn parse(target: &str) -> Result<Self, ListenError> {
        if let Ok(port) = target.parse::<u16>() {
            return Self::new(Scheme::Http, "localhost", port, "");
        }

        let invalid = |why: &str| ListenError::config(format!("invalid local target '{target}': {why}"));
        let url = Url::parse(target).map_err(|e| invalid(&e.to_string()))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(invalid("expected a port or an http(s):// URL")),
        };
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("credentials are not allowed"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("query strings and fragments are not allowed"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        // IPv6 literals come back bracketed.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port_or_known_default().ok_or_else(|| invalid("missing port"))?;
        Self::new(scheme, host, port, url.path())
    }

    pub fn new(scheme: Scheme, host: &str, port: u16, path_prefix: &str) -> Result<Self, ListenError> {
        if host.is_empty() {
            return Err(ListenError::config("local endpoint host is empty"));
        }
        if port == 0 {
            return Err(ListenError::config("local endpoint port must be non-zero"));
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path_prefix: normalize_prefix(path_prefix),
        })
    }

    /// Append `extra` to the path prefix (the optional `[path]` argument).
    #[must_use]
    pub fn with_path(mut self, extra: &str) -> Self {
        let joined = format!("{}{}", self.path_prefix, normalize_prefix(extra));
        self.path_prefix = normalize_prefix(&joined);
        self
    }

    /// `host:port`, bracketing IPv6 literals. Used as the `Host` header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Origin-form request target: prefix + suffix, then `?query` if any.
    pub fn request_target(&self, path_suffix: &str, query: &str) -> String {
        let mut target = self.path_prefix.clone();
        if !path_suffix.is_empty() && !path_suffix.starts_with('/') {
            target.push('/');
        }
        target.push_str(path_suffix);
        if target.is_empty() {
            target.push('/');
        }
        let query = query.strip_prefix('?').unwrap_or(query);
        if !query.is_empty() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// Full URL of a forwarded request.
    pub fn url_for(&self, path_suffix: &str, query: &str) -> String {
        format!(
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority(),
            self.request_target(path_suffix, query)
        )
    }
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url_for("", ""))
    }
}

fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// A `(port, source, path?)` triple from the command line, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub endpoint: LocalEndpoint,
    /// Source name or `src_…` identifier.
    pub source: String,
}

impl Route {
    /// Expand the positional form: one endpoint, comma-separated sources.
    pub fn from_positional(
        target: &str,
        sources: &str,
        path: Option<&str>,
    ) -> Result<Vec<Self>, ListenError> {
        let mut endpoint = LocalEndpoint::parse(target)?;
        if let Some(p) = path {
            endpoint = endpoint.with_path(p);
        }
        let routes: Vec<Self> = sources
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|source| Self {
                endpoint: endpoint.clone(),
                source: source.to_string(),
            })
            .collect();
        if routes.is_empty() {
            return Err(ListenError::config("at least one source is required"));
        }
        Ok(routes)
    }

    /// Parse `--route SOURCE=PORT[/PATH]` or `--route SOURCE=URL`.
    pub fn parse(arg: &str) -> Result<Self, ListenError> {
        let (source, target) = arg.split_once('=').ok_or_else(|| {
            ListenError::config(format!(
                "invalid route '{arg}': expected SOURCE=PORT[/PATH] or SOURCE=URL"
            ))
        })?;
        let source = source.trim();
        if source.is_empty() {
            return Err(ListenError::config(format!("invalid route '{arg}': empty source")));
        }
        let endpoint = if target.starts_with(|c: char| c.is_ascii_digit()) {
            let (port, path) = match target.find('/') {
                Some(i) => (&target[..i], &target[i..]),
                None => (target, ""),
            };
            LocalEndpoint::parse(port)?.with_path(path)
        } else {
            LocalEndpoint::parse(target)?
        };
        Ok(Self {
            endpoint,
            source: source.to_string(),
        })
    }
}

/// A resolved Source bound to a local endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub source_id: String,
    pub source_name: String,
    pub local_endpoint: LocalEndpoint,
}

/// Immutable set of subscriptions, unique by `source_id`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    by_id: HashMap<String, Arc<Subscription>>,
    order: Vec<String>,
}

impl SubscriptionSet {
    pub fn new(subscriptions: Vec<Subscription>) -> Result<Self, ListenError> {
        let mut set = Self::default();
        for sub in subscriptions {
            if set.by_id.contains_key(&sub.source_id) {
                return Err(ListenError::config(format!(
                    "source {} ({}) is listed more than once",
                    sub.source_name, sub.source_id
                )));
            }
            set.order.push(sub.source_id.clone());
            set.by_id.insert(sub.source_id.clone(), Arc::new(sub));
        }
        if set.order.is_empty() {
            return Err(ListenError::config("no sources to listen on"));
        }
        Ok(set)
    }

    pub fn get(&self, source_id: &str) -> Option<&Arc<Subscription>> {
        self.by_id.get(source_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Subscriptions in command-line order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscription>> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Handshake payload.
    pub fn hints(&self) -> Vec<SubscriptionHint> {
        self.iter()
            .map(|s| SubscriptionHint {
                source_id: s.source_id.clone(),
                local_endpoint_hint: s.local_endpoint.to_string(),
            })
            .collect()
    }
}

pub fn is_source_id(s: &str) -> bool {
    s.starts_with(SOURCE_ID_PREFIX)
}

fn is_valid_source_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Resolve every route against the REST API and freeze the result.
///
/// Missing names are created only when `create_missing` is set.
pub async fn resolve(
    api: &ApiClient,
    routes: &[Route],
    create_missing: bool,
) -> Result<SubscriptionSet, ListenError> {
    let mut subscriptions = Vec::with_capacity(routes.len());
    for route in routes {
        let source = if is_source_id(&route.source) {
            api.get_source(&route.source).await.map_err(|e| match e {
                ApiError::Status { status: 404, .. } => ListenError::config(format!(
                    "source {} does not exist",
                    route.source
                )),
                other => other.into(),
            })?
        } else {
            if !is_valid_source_name(&route.source) {
                return Err(ListenError::config(format!(
                    "invalid source name '{}': use letters, digits, `-` and `_`, or a `{SOURCE_ID_PREFIX}` identifier",
                    route.source
                )));
            }
            match api.find_source_by_name(&route.source).await? {
                Some(source) => source,
                None if create_missing => {
                    let created = api.create_source(&route.source).await?;
                    info!(source = %created.name, id = %created.id, "Created source");
                    created
                }
                None => {
                    return Err(ListenError::config(format!(
                        "source '{}' not found; pass --create-sources to create it",
                        route.source
                    )))
                }
            }
        };
        subscriptions.push(Subscription {
            source_id: source.id,
            source_name: source.name,
            local_endpoint: route.endpoint.clone(),
        });
    }
    SubscriptionSet::new(subscriptions)
}
