//! Admin API for hostname bindings
//!
//! Served under the configured prefix (default `/api/`) on the proxy listener:
//!
//! - `POST   hostnames`                 register a hostname for an app
//! - `GET    hostnames/{hostname}`      fetch a registration, stitched with its app
//! - `DELETE hostnames/{hostname}`      remove a registration owned by the caller's app
//! - `GET    apps/{app_id}/hostnames/`  list an app's hostnames
//!
//! The hostname directory is the source of truth for registrations. Local
//! bindings are written only after it confirms a create (201) or delete (200).

use crate::directory::{DirectoryRequest, DirectoryResponse, HostnameDirectory};
use crate::error::{error_response, full_body, text_response, Error, GatewayBody, Result};
use crate::index::{validate_app_id, HostnameIndex};
use futures::StreamExt;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest admin request body read into memory
pub const MAX_BODY_BYTES: usize = 64 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `{"data": {...}}` envelope used by the hostname directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostnameEnvelope {
    pub data: HostnameData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostnameData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub attributes: HostnameAttributes,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Hostname attributes; fields the gateway does not know pass through untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostnameAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, alias = "glitch_app_id", skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Delete body: either a bare `{"app_id": ...}` or the full envelope
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeletePayload {
    Envelope(HostnameEnvelope),
    Bare {
        #[serde(alias = "glitch_app_id")]
        app_id: Option<String>,
    },
}

impl DeletePayload {
    fn app_id(self) -> Option<String> {
        match self {
            DeletePayload::Envelope(envelope) => envelope.data.attributes.app_id,
            DeletePayload::Bare { app_id } => app_id,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Routes recognised under the admin prefix
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Health,
    Version,
    CreateHostname,
    GetHostname(String),
    DeleteHostname(String),
    ListAppHostnames(String),
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Match a path with the admin prefix already stripped
fn route(method: &Method, rest: &str) -> Option<Route> {
    match (method, rest) {
        (&Method::GET, "health") => return Some(Route::Health),
        (&Method::GET, "version") => return Some(Route::Version),
        (&Method::POST, "hostnames") => return Some(Route::CreateHostname),
        _ => {}
    }

    if let Some(hostname) = rest.strip_prefix("hostnames/") {
        if hostname.is_empty() || hostname.contains('/') {
            return None;
        }
        let hostname = decode_segment(hostname);
        return match *method {
            Method::GET => Some(Route::GetHostname(hostname)),
            Method::DELETE => Some(Route::DeleteHostname(hostname)),
            _ => None,
        };
    }

    if method == Method::GET {
        let app_id = rest
            .strip_prefix("apps/")
            .and_then(|p| p.strip_suffix("/hostnames/").or_else(|| p.strip_suffix("/hostnames")))?;
        if !app_id.is_empty() && !app_id.contains('/') {
            return Some(Route::ListAppHostnames(decode_segment(app_id)));
        }
    }

    None
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Relay a directory response to the caller as is
fn relay(upstream: DirectoryResponse) -> Response<GatewayBody> {
    let mut builder = Response::builder().status(upstream.status);
    if let Some(content_type) = &upstream.content_type {
        builder = builder.header(CONTENT_TYPE, content_type.as_str());
    }
    builder
        .body(full_body(upstream.body))
        .unwrap_or_else(|_| text_response(StatusCode::BAD_GATEWAY, "invalid upstream response"))
}

/// Admin API handler
#[derive(Clone)]
pub struct AdminApi {
    prefix: String,
    index: HostnameIndex,
    directory: Arc<dyn HostnameDirectory>,
}

impl AdminApi {
    pub fn new(prefix: impl Into<String>, index: HostnameIndex, directory: Arc<dyn HostnameDirectory>) -> Self {
        Self {
            prefix: prefix.into(),
            index,
            directory,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether a request path belongs to the admin API
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let rest = path.strip_prefix(&self.prefix).unwrap_or("");

        debug!(%method, %path, "Admin API request");

        let Some(route) = route(&method, rest) else {
            return text_response(StatusCode::NOT_FOUND, format!("not found: /{}", rest));
        };

        let authorization = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let result = match route {
            Route::Health => Ok(text_response(StatusCode::OK, "ok")),
            Route::Version => {
                let version_info = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                Ok(json_response(StatusCode::OK, version_info.to_string()))
            }
            Route::CreateHostname => match read_body(req).await {
                Ok(body) => self.create_hostname(authorization, body).await,
                Err(e) => Err(e),
            },
            Route::GetHostname(hostname) => self.get_hostname(&hostname, authorization).await,
            Route::DeleteHostname(hostname) => match read_body(req).await {
                Ok(body) => self.delete_hostname(&hostname, authorization, body).await,
                Err(e) => Err(e),
            },
            Route::ListAppHostnames(app_id) => self.list_app_hostnames(&app_id, authorization).await,
        };

        result.unwrap_or_else(|e| {
            warn!(%method, %path, error = %e, "Admin API error");
            error_response(&e)
        })
    }

    async fn create_hostname(&self, authorization: Option<String>, body: Bytes) -> Result<Response<GatewayBody>> {
        let payload: HostnameEnvelope = serde_json::from_slice(&body)
            .map_err(|e| Error::Validation(format!("invalid hostname payload: {}", e)))?;

        let attributes = payload.data.attributes;
        let app_id = non_empty(attributes.app_id)
            .ok_or_else(|| Error::Validation("creating a hostname requires an app_id".to_string()))?;
        let hostname = non_empty(attributes.hostname)
            .ok_or_else(|| Error::Validation("creating a hostname requires a hostname".to_string()))?;
        validate_app_id(&app_id)?;

        if let Some(owner) = self.index.get(&hostname).await? {
            if owner != app_id {
                return Err(Error::OwnershipMismatch { hostname });
            }
        }

        let upstream = self
            .directory
            .forward(
                DirectoryRequest::new(Method::POST, "hostnames")
                    .with_authorization(authorization)
                    .with_body(body),
            )
            .await?;

        if upstream.status == StatusCode::CREATED {
            // The directory already holds the registration; a failed local write is not undone there
            match self.index.create(&hostname, &app_id).await {
                Ok(()) => info!(hostname = %hostname, app_id = %app_id, "Hostname registered"),
                Err(e) => error!(
                    hostname = %hostname,
                    app_id = %app_id,
                    error = %e,
                    "Directory registered hostname but the local binding was not stored"
                ),
            }
        } else {
            debug!(hostname = %hostname, status = %upstream.status, "Directory declined hostname");
        }

        Ok(self.stitch(upstream, Some(&hostname)).await)
    }

    async fn get_hostname(&self, hostname: &str, authorization: Option<String>) -> Result<Response<GatewayBody>> {
        let upstream = self
            .directory
            .forward(
                DirectoryRequest::new(Method::GET, hostname_path(hostname))
                    .with_authorization(authorization),
            )
            .await?;

        if upstream.status == StatusCode::OK {
            Ok(self.stitch(upstream, None).await)
        } else {
            Ok(relay(upstream))
        }
    }

    async fn delete_hostname(
        &self,
        hostname: &str,
        authorization: Option<String>,
        body: Bytes,
    ) -> Result<Response<GatewayBody>> {
        let payload: DeletePayload = serde_json::from_slice(&body)
            .map_err(|e| Error::Validation(format!("invalid delete payload: {}", e)))?;
        let app_id = non_empty(payload.app_id())
            .ok_or_else(|| Error::Validation("deleting a hostname requires an app_id".to_string()))?;

        // Nothing is sent upstream for a hostname the caller does not own
        self.index.verify_owner(hostname, &app_id).await?;

        let upstream = self
            .directory
            .forward(
                DirectoryRequest::new(Method::DELETE, hostname_path(hostname))
                    .with_authorization(authorization)
                    .with_body(body),
            )
            .await?;

        if upstream.status == StatusCode::OK {
            self.index.delete(hostname, &app_id).await?;
        }

        Ok(relay(upstream))
    }

    async fn list_app_hostnames(&self, app_id: &str, authorization: Option<String>) -> Result<Response<GatewayBody>> {
        let probe = self
            .directory
            .forward(DirectoryRequest::new(Method::GET, "releases").with_authorization(authorization))
            .await?;
        if !probe.is_success() {
            warn!(app_id, status = %probe.status, "Auth probe rejected hostname listing");
            return Err(Error::upstream(
                Some(probe.status.as_u16()),
                "directory rejected credentials",
            ));
        }

        let hostnames: Vec<String> = self.index.list_hostnames_for_app(app_id).await?.collect().await;
        let data: Vec<Value> = hostnames
            .iter()
            .map(|hostname| {
                serde_json::json!({
                    "id": hostname,
                    "type": "hostnames",
                    "attributes": {
                        "hostname": hostname,
                        "app_id": app_id,
                    }
                })
            })
            .collect();

        let body = serde_json::json!({ "data": data });
        Ok(json_response(StatusCode::OK, body.to_string()))
    }

    /// Add the locally bound app_id to a successful directory response.
    ///
    /// Responses that are not 2xx or do not parse are relayed unchanged.
    async fn stitch(&self, upstream: DirectoryResponse, hostname: Option<&str>) -> Response<GatewayBody> {
        if !upstream.is_success() {
            return relay(upstream);
        }

        let mut envelope: HostnameEnvelope = match serde_json::from_slice(&upstream.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Directory response is not a hostname envelope");
                return relay(upstream);
            }
        };

        let hostname = match hostname
            .map(String::from)
            .or_else(|| envelope.data.attributes.hostname.clone())
        {
            Some(hostname) => hostname,
            None => return relay(upstream),
        };

        match self.index.get(&hostname).await {
            Ok(Some(app_id)) => envelope.data.attributes.app_id = Some(app_id),
            Ok(None) => {}
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "Binding lookup failed while stitching");
                return relay(upstream);
            }
        }

        match serde_json::to_vec_pretty(&envelope) {
            Ok(body) => json_response(upstream.status, body),
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "Failed to encode stitched response");
                relay(upstream)
            }
        }
    }
}

fn hostname_path(hostname: &str) -> String {
    format!("hostnames/{}", urlencoding::encode(hostname))
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(Error::PayloadTooLarge { limit: MAX_BODY_BYTES })
        }
        Err(e) => Err(Error::Validation(format!("failed to read request body: {}", e))),
    }
}
