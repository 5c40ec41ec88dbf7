//! Clients for the upstream directory services
//!
//! Two remote services are consulted:
//! - the app directory, which maps an app id to the domain it is served from
//!   (used by the resolution cache on every cold or stale lookup)
//! - the hostname directory REST API, which owns hostname registrations and
//!   is wrapped by the admin API

use crate::error::{Error, Result};
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Method, StatusCode};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolves an app id to the origin that serves it
#[async_trait]
pub trait AppDirectory: Send + Sync {
    /// `Ok(None)` when the directory does not know the app
    async fn origin_for(&self, app_id: &str) -> Result<Option<String>>;
}

/// App record returned by the app directory
#[derive(Debug, Deserialize)]
struct AppRecord {
    domain: Option<String>,
}

/// [`AppDirectory`] backed by an HTTP API serving `GET <projects_url>/<app_id>`
pub struct HttpAppDirectory {
    client: reqwest::Client,
    projects_url: Url,
    origin_suffix: String,
}

impl HttpAppDirectory {
    pub fn new(projects_url: &str, origin_suffix: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            projects_url: base_url(projects_url)?,
            origin_suffix: origin_suffix.to_string(),
        })
    }
}

#[async_trait]
impl AppDirectory for HttpAppDirectory {
    async fn origin_for(&self, app_id: &str) -> Result<Option<String>> {
        let url = self
            .projects_url
            .join(&urlencoding::encode(app_id))
            .map_err(|e| Error::Validation(format!("invalid app id {}: {}", app_id, e)))?;

        debug!(app_id, %url, "Looking up app origin");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::upstream(
                Some(status.as_u16()),
                format!("app directory returned {} for {}", status, app_id),
            ));
        }

        let body = resp.bytes().await?;
        let record: AppRecord = serde_json::from_slice(&body).map_err(|e| {
            warn!(app_id, error = %e, "App directory returned malformed JSON");
            Error::upstream(None, format!("malformed app record for {}: {}", app_id, e))
        })?;

        Ok(record
            .domain
            .filter(|d| !d.is_empty())
            .map(|domain| format!("{}{}", domain, self.origin_suffix)))
    }
}

/// Request forwarded to the hostname directory
#[derive(Debug, Clone)]
pub struct DirectoryRequest {
    pub method: Method,
    /// Path relative to the directory endpoint, e.g. `hostnames/a.example.com`
    pub path: String,
    /// Caller's `Authorization` header, passed through unchanged
    pub authorization: Option<String>,
    pub body: Option<Bytes>,
}

impl DirectoryRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            authorization: None,
            body: None,
        }
    }

    pub fn with_authorization(mut self, authorization: Option<String>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// Buffered response from the hostname directory
#[derive(Debug, Clone)]
pub struct DirectoryResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl DirectoryResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Hostname directory REST API
#[async_trait]
pub trait HostnameDirectory: Send + Sync {
    /// Forward a request; any HTTP status is a successful forward
    async fn forward(&self, req: DirectoryRequest) -> Result<DirectoryResponse>;
}

/// [`HostnameDirectory`] over HTTP.
///
/// Requests are rebuilt from scratch, so the caller's `host` and
/// `x-forwarded-host` never reach the directory; `content-type` is always JSON.
pub struct HttpHostnameDirectory {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpHostnameDirectory {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: base_url(endpoint)?,
        })
    }

    /// Absolute URL for a directory path
    pub fn url_for(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Validation(format!("invalid directory path {}: {}", path, e)))
    }
}

#[async_trait]
impl HostnameDirectory for HttpHostnameDirectory {
    async fn forward(&self, req: DirectoryRequest) -> Result<DirectoryResponse> {
        let url = self.url_for(&req.path)?;
        let method = reqwest::Method::from_bytes(req.method.as_str().as_bytes())
            .map_err(|e| Error::Validation(format!("unsupported method {}: {}", req.method, e)))?;

        debug!(method = %req.method, %url, "Forwarding to hostname directory");

        let mut builder = self
            .client
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(auth) = &req.authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth.as_str());
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;
        let status = StatusCode::from_u16(resp.status().as_u16())
            .map_err(|e| Error::upstream(None, format!("invalid upstream status: {}", e)))?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = resp.bytes().await?;

        Ok(DirectoryResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Parse a base URL, making sure relative joins append to its path
fn base_url(raw: &str) -> anyhow::Result<Url> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&normalized).map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", raw, e))
}
