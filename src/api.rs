//! HTTP client for the Gateway REST API.
//!
//! [`ApiClient`] wraps `reqwest::Client` and covers the slice of the API the
//! listen subsystem needs at startup: looking Sources up by id or name and
//! creating missing ones.
//!
//! ## Authentication
//!
//! Every request carries the API key as a Bearer token.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for a `message` (or `error`) field in the
//! JSON body; the raw body is used when parsing fails. Callers attach local
//! hints that are shown under the server's message.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;

/// Safety bound on name lookups walking the paginated list.
const MAX_PAGES: usize = 50;
const PAGE_LIMIT: u32 = 100;

/// A Source as returned by the REST API.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub name: String,
    /// Public ingestion URL of the Source.
    #[serde(default)]
    pub url: Option<String>,
}

/// Cursor pagination block of list responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub prev: Option<String>,
}

/// `{ models: [...], pagination: {...} }`
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub models: Vec<T>,
    #[serde(default)]
    pub pagination: Pagination,
}

/// HTTP client bound to one API base URL and key.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hookdeck-listen/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// `GET /sources/{id}`
    pub async fn get_source(&self, id: &str) -> Result<Source, ApiError> {
        let resp = self
            .http
            .get(format!("{}/sources/{id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::handle_response(
            resp,
            &["--source-id flag expects an identifier with prefix `src_`"],
        )
        .await
    }

    /// `GET /sources?name=…&limit=…&next=…`
    pub async fn list_sources(
        &self,
        name: Option<&str>,
        next: Option<&str>,
    ) -> Result<Page<Source>, ApiError> {
        let mut query: Vec<(&str, String)> = vec![("limit", PAGE_LIMIT.to_string())];
        if let Some(n) = name {
            query.push(("name", n.to_string()));
        }
        if let Some(cursor) = next {
            query.push(("next", cursor.to_string()));
        }
        let resp = self
            .http
            .get(format!("{}/sources", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&query)
            .send()
            .await?;
        Self::handle_response(resp, &[]).await
    }

    /// Walk the list filtered by `name` until an exact match turns up.
    pub async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, ApiError> {
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self.list_sources(Some(name), cursor.as_deref()).await?;
            if let Some(found) = page.models.into_iter().find(|s| s.name == name) {
                return Ok(Some(found));
            }
            match page.pagination.next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    /// `POST /sources`
    pub async fn create_source(&self, name: &str) -> Result<Source, ApiError> {
        let resp = self
            .http
            .post(format!("{}/sources", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "name": name }))
            .send()
            .await?;
        Self::handle_response(
            resp,
            &["source names may only contain letters, digits, `-` and `_`"],
        )
        .await
    }

    async fn handle_response<T: DeserializeOwned>(
        resp: reqwest::Response,
        hints: &[&str],
    ) -> Result<T, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = server_message(&body);
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized { message });
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
            hints: hints.iter().map(ToString::to_string).collect(),
        })
    }
}

/// Pull the human message out of an error body.
fn server_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                "(empty response body)".to_string()
            } else {
                body.to_string()
            }
        })
}
