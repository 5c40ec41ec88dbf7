//! Integration tests for Hostgate
//!
//! Each test runs the gateway against in-process mock servers standing in for
//! the app directory, the hostname directory and the upstream proxy target.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hostgate::admin::AdminApi;
use hostgate::cache::ResolutionCache;
use hostgate::db::SqliteStore;
use hostgate::directory::{HttpAppDirectory, HttpHostnameDirectory};
use hostgate::index::HostnameIndex;
use hostgate::proxy::ProxyServer;
use hostgate::store::{MemoryCache, MemoryStore, SharedCacheStore, SharedRecordStore};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Mock servers
// ============================================================================

struct MockRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

impl MockRequest {
    fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
    }
}

type MockHandler = Arc<dyn Fn(MockRequest) -> (StatusCode, String) + Send + Sync>;

/// Serve `handler` on 127.0.0.1:port, sleeping `delay` before each response
async fn spawn_mock(port: u16, delay: Duration, handler: MockHandler) -> JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = Arc::clone(&handler);
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await?.to_bytes();
                        tokio::time::sleep(delay).await;
                        let (status, body) = handler(MockRequest {
                            method: parts.method,
                            path: parts.uri.path().to_string(),
                            headers: parts.headers,
                            body,
                        });
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(status)
                                .header("content-type", "application/json")
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    })
}

/// Upstream proxy target: echoes the headers the gateway set
fn echo_target() -> MockHandler {
    Arc::new(|req: MockRequest| {
        let body = format!(
            "host={};xfh={};xff={};rid={};path={}",
            req.header("host"),
            req.header("x-forwarded-host"),
            req.header("x-forwarded-for"),
            req.header("x-request-id"),
            req.path
        );
        (StatusCode::OK, body)
    })
}

/// App directory: `app-1` is served from `bar`, `app-2` from `baz`
fn app_directory() -> MockHandler {
    Arc::new(|req: MockRequest| match req.path.as_str() {
        "/projects/app-1" => (StatusCode::OK, r#"{"domain":"bar","id":"app-1"}"#.to_string()),
        "/projects/app-2" => (StatusCode::OK, r#"{"domain":"baz","id":"app-2"}"#.to_string()),
        _ => (StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string()),
    })
}

/// Hostname directory REST API with its own registration table
fn hostname_directory(registered: Arc<DashMap<String, String>>) -> MockHandler {
    Arc::new(move |req: MockRequest| {
        if req.header("authorization") != "Bearer secret" {
            return (StatusCode::UNAUTHORIZED, r#"{"error":"unauthorized"}"#.to_string());
        }

        let record = |hostname: &str| {
            serde_json::json!({
                "data": {
                    "id": hostname,
                    "type": "hostnames",
                    "attributes": { "hostname": hostname, "dns_configured": false }
                }
            })
            .to_string()
        };

        match (req.method.clone(), req.path.as_str()) {
            (Method::GET, "/v1/releases") => (StatusCode::OK, r#"{"data":[]}"#.to_string()),
            (Method::POST, "/v1/hostnames") => {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let hostname = body["data"]["attributes"]["hostname"].as_str().unwrap().to_string();
                registered.insert(hostname.clone(), record(&hostname));
                (StatusCode::CREATED, record(&hostname))
            }
            (Method::GET, path) => match path.strip_prefix("/v1/hostnames/").and_then(|h| registered.get(h)) {
                Some(record) => (StatusCode::OK, record.clone()),
                None => (StatusCode::NOT_FOUND, r#"{"errors":[{"status":"404"}]}"#.to_string()),
            },
            (Method::DELETE, path) => match path.strip_prefix("/v1/hostnames/").and_then(|h| registered.remove(h)) {
                Some(_) => (StatusCode::OK, "{}".to_string()),
                None => (StatusCode::NOT_FOUND, r#"{"errors":[{"status":"404"}]}"#.to_string()),
            },
            _ => (StatusCode::METHOD_NOT_ALLOWED, "{}".to_string()),
        }
    })
}

// ============================================================================
// Gateway harness
// ============================================================================

struct Ports {
    gateway: u16,
    target: u16,
    apps: u16,
    directory: u16,
}

struct Gateway {
    index: HostnameIndex,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Gateway {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), self.handle).await;
    }
}

async fn start_gateway(
    ports: &Ports,
    records: SharedRecordStore,
    cache_store: SharedCacheStore,
    request_timeout: Duration,
) -> Gateway {
    let index = HostnameIndex::new(records);
    let apps = Arc::new(
        HttpAppDirectory::new(
            &format!("http://127.0.0.1:{}/projects", ports.apps),
            "",
            Duration::from_secs(2),
        )
        .unwrap(),
    );
    let directory = Arc::new(
        HttpHostnameDirectory::new(
            &format!("http://127.0.0.1:{}/v1", ports.directory),
            Duration::from_secs(2),
        )
        .unwrap(),
    );

    let cache = ResolutionCache::new(index.clone(), apps, cache_store);
    let admin = Arc::new(AdminApi::new("/api/", index.clone(), directory));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", ports.gateway).parse().unwrap();
    let server = ProxyServer::new(
        addr,
        cache,
        admin,
        format!("127.0.0.1:{}", ports.target),
        shutdown_rx,
    )
    .with_request_timeout(request_timeout);

    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });
    assert!(wait_for_port(ports.gateway, Duration::from_secs(2)).await);

    Gateway {
        index,
        shutdown_tx,
        handle,
    }
}

fn memory_stores() -> (SharedRecordStore, SharedCacheStore) {
    let records: SharedRecordStore = Arc::new(MemoryStore::new());
    let cache: SharedCacheStore = Arc::new(MemoryCache::new());
    (records, cache)
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send HTTP request with custom Host header (for proxy testing)
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send an admin API request with a bearer token and optional JSON body
async fn admin_request(
    port: u16,
    method: &str,
    path: &str,
    token: &str,
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: gateway.local\r\nAuthorization: Bearer {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        token,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

fn create_body(hostname: &str, app_id: &str) -> String {
    serde_json::json!({"data": {"attributes": {"hostname": hostname, "app_id": app_id}}}).to_string()
}

// ============================================================================
// Proxy Tests
// ============================================================================

#[tokio::test]
async fn test_proxy_rewrites_host_to_origin() {
    let ports = Ports {
        gateway: 31010,
        target: 31011,
        apps: 31012,
        directory: 31013,
    };
    let target = spawn_mock(ports.target, Duration::ZERO, echo_target()).await;
    let apps = spawn_mock(ports.apps, Duration::ZERO, app_directory()).await;

    let (records, cache) = memory_stores();
    let gateway = start_gateway(&ports, records, cache, Duration::from_secs(5)).await;
    gateway.index.create("foo.example.com", "app-1").await.unwrap();

    let response = http_get_with_host(ports.gateway, "/some/path?q=1", "foo.example.com")
        .await
        .unwrap();

    assert!(status_line(&response).contains("200"), "Response: {}", response);
    let body = body_of(&response);
    assert!(body.contains("host=bar;"), "Response: {}", response);
    assert!(body.contains("xfh=foo.example.com;"), "Response: {}", response);
    assert!(body.contains("xff=127.0.0.1;"), "Response: {}", response);
    assert!(body.contains("path=/some/path"), "Response: {}", response);
    assert!(!body.contains("rid=-;"), "Response: {}", response);

    // Second request is served from the cache
    let response = http_get_with_host(ports.gateway, "/", "foo.example.com")
        .await
        .unwrap();
    assert!(body_of(&response).contains("host=bar;"), "Response: {}", response);

    gateway.stop().await;
    target.abort();
    apps.abort();
}

#[tokio::test]
async fn test_unknown_host_returns_plain_404() {
    let ports = Ports {
        gateway: 31020,
        target: 31021,
        apps: 31022,
        directory: 31023,
    };
    let target = spawn_mock(ports.target, Duration::ZERO, echo_target()).await;
    let apps = spawn_mock(ports.apps, Duration::ZERO, app_directory()).await;

    let (records, cache) = memory_stores();
    let gateway = start_gateway(&ports, records, cache, Duration::from_secs(5)).await;

    let response = http_get_with_host(ports.gateway, "/", "unknown.example.com")
        .await
        .unwrap();
    assert!(status_line(&response).contains("404"), "Response: {}", response);
    assert_eq!(body_of(&response), "not found");

    // Bound to an app the app directory has never heard of
    gateway.index.create("orphan.example.com", "app-404").await.unwrap();
    let response = http_get_with_host(ports.gateway, "/", "orphan.example.com")
        .await
        .unwrap();
    assert!(status_line(&response).contains("404"), "Response: {}", response);
    assert_eq!(body_of(&response), "not found");

    gateway.stop().await;
    target.abort();
    apps.abort();
}

#[tokio::test]
async fn test_upstream_unreachable_returns_502() {
    let ports = Ports {
        gateway: 31030,
        target: 31031, // nothing listens here
        apps: 31032,
        directory: 31033,
    };
    let apps = spawn_mock(ports.apps, Duration::ZERO, app_directory()).await;

    let (records, cache) = memory_stores();
    let gateway = start_gateway(&ports, records, cache, Duration::from_secs(5)).await;
    gateway.index.create("foo.example.com", "app-1").await.unwrap();

    let response = http_get_with_host(ports.gateway, "/", "foo.example.com")
        .await
        .unwrap();
    assert!(status_line(&response).contains("502"), "Response: {}", response);
    assert!(response.contains("CONNECTION_FAILED"), "Response: {}", response);

    gateway.stop().await;
    apps.abort();
}

#[tokio::test]
async fn test_slow_upstream_returns_504() {
    let ports = Ports {
        gateway: 31040,
        target: 31041,
        apps: 31042,
        directory: 31043,
    };
    let target = spawn_mock(ports.target, Duration::from_secs(3), echo_target()).await;
    let apps = spawn_mock(ports.apps, Duration::ZERO, app_directory()).await;

    let (records, cache) = memory_stores();
    let gateway = start_gateway(&ports, records, cache, Duration::from_secs(1)).await;
    gateway.index.create("foo.example.com", "app-1").await.unwrap();

    let response = http_get_with_host(ports.gateway, "/", "foo.example.com")
        .await
        .unwrap();
    assert!(status_line(&response).contains("504"), "Response: {}", response);
    assert!(response.contains("REQUEST_TIMEOUT"), "Response: {}", response);

    gateway.stop().await;
    target.abort();
    apps.abort();
}

// ============================================================================
// Admin API Tests
// ============================================================================

#[tokio::test]
async fn test_admin_hostname_lifecycle() {
    let ports = Ports {
        gateway: 31050,
        target: 31051,
        apps: 31052,
        directory: 31053,
    };
    let registered = Arc::new(DashMap::new());
    let target = spawn_mock(ports.target, Duration::ZERO, echo_target()).await;
    let apps = spawn_mock(ports.apps, Duration::ZERO, app_directory()).await;
    let directory = spawn_mock(ports.directory, Duration::ZERO, hostname_directory(Arc::clone(&registered))).await;

    let (records, cache) = memory_stores();
    let gateway = start_gateway(&ports, records, cache, Duration::from_secs(5)).await;

    // Create
    let response = admin_request(
        ports.gateway,
        "POST",
        "/api/hostnames",
        "secret",
        &create_body("a.example.com", "app-1"),
    )
    .await
    .unwrap();
    assert!(status_line(&response).contains("201"), "Response: {}", response);
    let created: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(created["data"]["attributes"]["app_id"], "app-1");
    assert!(registered.contains_key("a.example.com"));

    // Traffic for the new hostname reaches the app's origin
    let response = http_get_with_host(ports.gateway, "/", "a.example.com")
        .await
        .unwrap();
    assert!(body_of(&response).contains("host=bar;"), "Response: {}", response);

    // Get is stitched with the local binding
    let response = admin_request(ports.gateway, "GET", "/api/hostnames/a.example.com", "secret", "")
        .await
        .unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    let fetched: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(fetched["data"]["attributes"]["app_id"], "app-1");
    assert_eq!(fetched["data"]["attributes"]["dns_configured"], false);

    // List
    let response = admin_request(ports.gateway, "GET", "/api/apps/app-1/hostnames/", "secret", "")
        .await
        .unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    let listed: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(listed["data"][0]["attributes"]["hostname"], "a.example.com");
    assert_eq!(listed["data"][0]["type"], "hostnames");

    // Delete by the wrong app is refused and changes nothing
    let response = admin_request(
        ports.gateway,
        "DELETE",
        "/api/hostnames/a.example.com",
        "secret",
        r#"{"app_id":"app-2"}"#,
    )
    .await
    .unwrap();
    assert!(status_line(&response).contains("422"), "Response: {}", response);
    assert!(registered.contains_key("a.example.com"));
    assert_eq!(gateway.index.get("a.example.com").await.unwrap(), Some("app-1".to_string()));

    // Delete by the owner
    let response = admin_request(
        ports.gateway,
        "DELETE",
        "/api/hostnames/a.example.com",
        "secret",
        r#"{"app_id":"app-1"}"#,
    )
    .await
    .unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert!(!registered.contains_key("a.example.com"));
    assert_eq!(gateway.index.get("a.example.com").await.unwrap(), None);

    let response = admin_request(ports.gateway, "GET", "/api/hostnames/a.example.com", "secret", "")
        .await
        .unwrap();
    assert!(status_line(&response).contains("404"), "Response: {}", response);

    gateway.stop().await;
    target.abort();
    apps.abort();
    directory.abort();
}

#[tokio::test]
async fn test_admin_forwards_credentials_and_status() {
    let ports = Ports {
        gateway: 31060,
        target: 31061,
        apps: 31062,
        directory: 31063,
    };
    let registered = Arc::new(DashMap::new());
    let directory = spawn_mock(ports.directory, Duration::ZERO, hostname_directory(Arc::clone(&registered))).await;

    let (records, cache) = memory_stores();
    let gateway = start_gateway(&ports, records, cache, Duration::from_secs(5)).await;

    // Bad credentials: the directory's 401 is relayed and nothing is bound
    let response = admin_request(
        ports.gateway,
        "POST",
        "/api/hostnames",
        "wrong",
        &create_body("a.example.com", "app-1"),
    )
    .await
    .unwrap();
    assert!(status_line(&response).contains("401"), "Response: {}", response);
    assert_eq!(gateway.index.get("a.example.com").await.unwrap(), None);

    // Listing requires the auth probe to pass
    let response = admin_request(ports.gateway, "GET", "/api/apps/app-1/hostnames/", "wrong", "")
        .await
        .unwrap();
    assert!(status_line(&response).contains("401"), "Response: {}", response);

    // Validation happens before the directory is contacted
    let body = serde_json::json!({"data": {"attributes": {"hostname": "b.example.com"}}}).to_string();
    let response = admin_request(ports.gateway, "POST", "/api/hostnames", "secret", &body)
        .await
        .unwrap();
    assert!(status_line(&response).contains("422"), "Response: {}", response);
    assert!(!registered.contains_key("b.example.com"));

    // Unknown admin paths
    let response = admin_request(ports.gateway, "GET", "/api/widgets", "secret", "")
        .await
        .unwrap();
    assert!(status_line(&response).contains("404"), "Response: {}", response);
    assert_eq!(body_of(&response), "not found: /widgets");

    // Health needs no credentials
    let response = admin_request(ports.gateway, "GET", "/api/health", "", "")
        .await
        .unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);

    gateway.stop().await;
    directory.abort();
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[tokio::test]
async fn test_sqlite_bindings_survive_reopen() {
    let ports = Ports {
        gateway: 31070,
        target: 31071,
        apps: 31072,
        directory: 31073,
    };
    let target = spawn_mock(ports.target, Duration::ZERO, echo_target()).await;
    let apps = spawn_mock(ports.apps, Duration::ZERO, app_directory()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hostgate.db");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let index = HostnameIndex::new(store);
        index.create("foo.example.com", "app-2").await.unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let gateway = start_gateway(&ports, store.clone(), store, Duration::from_secs(5)).await;

    let response = http_get_with_host(ports.gateway, "/", "foo.example.com")
        .await
        .unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert!(body_of(&response).contains("host=baz;"), "Response: {}", response);

    gateway.stop().await;
    target.abort();
    apps.abort();
}
