use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and connection pool settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Static upstream proxy that every resolved request is forwarded to
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Hostname directory REST API wrapped by the admin API
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// App directory used to resolve an app id to its origin
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Record and cache storage
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path prefix served by the admin API instead of being proxied (default: /api/)
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Maximum idle connections to the upstream target (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Timeout for a proxied request in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            api_prefix: default_api_prefix(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct UpstreamConfig {
    /// `host:port` of the upstream proxy; it routes on the rewritten Host header
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryConfig {
    /// Base URL of the hostname directory REST API
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout in seconds (default: 10)
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

impl DirectoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_secs: default_client_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    /// Base URL serving `GET <projects_url>/<app_id>`
    #[serde(default)]
    pub projects_url: String,

    /// Appended to the app's domain to form the origin, e.g. ".glitch.me"
    #[serde(default)]
    pub origin_suffix: String,

    /// Seconds a resolution is served before a background refresh (default: 60)
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,

    /// Request timeout in seconds (default: 10)
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

impl ResolverConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            projects_url: String::new(),
            origin_suffix: String::new(),
            freshness_window_secs: default_freshness_window(),
            timeout_secs: default_client_timeout(),
        }
    }
}

/// Storage backend for records and cache entries
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory, lost on restart
    #[default]
    Memory,
    /// SQLite database file
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file for the sqlite backend (default: hostgate.db)
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_api_prefix() -> String {
    "/api/".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_client_timeout() -> u64 {
    10
}

fn default_freshness_window() -> u64 {
    60
}

fn default_store_path() -> String {
    "hostgate.db".to_string()
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.upstream.target.is_empty() {
            errors.push("upstream.target is required".to_string());
        } else if self.upstream.target.contains("://") {
            errors.push(format!(
                "upstream.target must be host:port, got '{}'",
                self.upstream.target
            ));
        }

        if !is_http_url(&self.directory.endpoint) {
            errors.push(format!(
                "directory.endpoint must be an http(s) URL, got '{}'",
                self.directory.endpoint
            ));
        }

        if !is_http_url(&self.resolver.projects_url) {
            errors.push(format!(
                "resolver.projects_url must be an http(s) URL, got '{}'",
                self.resolver.projects_url
            ));
        }

        if !self.server.api_prefix.starts_with('/') || !self.server.api_prefix.ends_with('/') {
            errors.push(format!(
                "server.api_prefix must start and end with '/', got '{}'",
                self.server.api_prefix
            ));
        }

        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_empty() {
            errors.push("store.path is required for the sqlite backend".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
