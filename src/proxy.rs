use crate::admin::AdminApi;
use crate::cache::{Freshness, ResolutionCache};
use crate::error::{json_error_response, text_response, ErrorCode, GatewayBody};
use crate::pool::{ConnectionPool, PoolConfig};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of the 404 returned for hosts that do not resolve
const NOT_FOUND_BODY: &str = "not found";

/// State shared by every connection
struct ProxyContext {
    cache: ResolutionCache,
    admin: Arc<AdminApi>,
    pool: Arc<ConnectionPool>,
    target: String,
    request_timeout: Duration,
}

/// The main gateway server: admin API under its prefix, everything else proxied
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    cache: ResolutionCache,
    admin: Arc<AdminApi>,
    pool: Arc<ConnectionPool>,
    target: String,
    request_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        cache: ResolutionCache,
        admin: Arc<AdminApi>,
        target: impl Into<String>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, cache, admin, target, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        cache: ResolutionCache,
        admin: Arc<AdminApi>,
        target: impl Into<String>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            shutdown_rx,
            cache,
            admin,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            target: target.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Timeout for a request forwarded to the upstream target
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            target = %self.target,
            api_prefix = self.admin.prefix(),
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let ctx = Arc::new(ProxyContext {
            cache: self.cache,
            admin: self.admin,
            pool: self.pool,
            target: self.target,
            request_timeout: self.request_timeout,
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, ctx: Arc<ProxyContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    if ctx.admin.matches(req.uri().path()) {
        return Ok(ctx.admin.handle(req).await);
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = match request_host(&req) {
        Some(host) => host,
        None => {
            debug!(request_id, "Request without a usable Host header");
            return Ok(text_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY));
        }
    };

    let resolution = match ctx.cache.resolve(&host).await {
        Some(resolution) => resolution,
        None => {
            debug!(host, request_id, "Host did not resolve");
            return Ok(text_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY));
        }
    };

    debug!(
        host,
        origin = %resolution.origin,
        cold = resolution.freshness == Freshness::Cold,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Forwarding request"
    );

    if let Err(e) = prepare_forward(req.headers_mut(), &request_id, client_addr, &host, &resolution.origin) {
        error!(host, origin = %resolution.origin, error = %e, "Resolved origin is not a valid header value");
        return Ok(json_error_response(
            ErrorCode::InternalError,
            "Resolved origin is not a valid Host header",
        ));
    }

    let result = tokio::time::timeout(ctx.request_timeout, ctx.pool.send_request(req, &ctx.target)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(host, target = %ctx.target, error = %e, "Failed to forward request via pool");
            Ok(json_error_response(
                ErrorCode::ConnectionFailed,
                "Failed to connect to upstream",
            ))
        }
        Err(_) => {
            warn!(
                host,
                target = %ctx.target,
                timeout_secs = ctx.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", ctx.request_timeout.as_secs()),
            ))
        }
    }
}

/// The Host the client asked for, exactly as sent (including any port).
///
/// HTTP/2 requests carry it in the `:authority` pseudo-header instead.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let host = match req.headers().get(HOST) {
        Some(value) => value.to_str().ok()?.to_string(),
        None => req.uri().authority()?.as_str().to_string(),
    };
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Rewrite headers for the upstream target.
///
/// `X-Forwarded-For` and `X-Forwarded-Host` are overwritten, not appended, so
/// clients cannot spoof them. `Host` becomes the resolved origin.
fn prepare_forward(
    headers: &mut HeaderMap,
    request_id: &str,
    client_addr: SocketAddr,
    original_host: &str,
    origin: &str,
) -> Result<(), hyper::header::InvalidHeaderValue> {
    headers.insert(X_REQUEST_ID, HeaderValue::from_str(request_id)?);
    headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&client_addr.ip().to_string())?);
    headers.insert(X_FORWARDED_HOST, HeaderValue::from_str(original_host)?);
    headers.insert(HOST, HeaderValue::from_str(origin)?);
    Ok(())
}
