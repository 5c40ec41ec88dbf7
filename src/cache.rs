//! Stale-while-revalidate hostname resolution
//!
//! [`ResolutionCache::resolve`] maps an inbound hostname to the origin it should
//! be proxied to. Each hostname is in one of three states:
//!
//! - **cold**: nothing cached. The hostname is looked up in the
//!   [`HostnameIndex`] and its app in the [`AppDirectory`] while the request
//!   waits. Success is cached; failure writes nothing.
//! - **fresh**: cached less than the freshness window ago. Served as is.
//! - **stale**: cached longer ago. Served as is, and a detached task repeats the
//!   cold lookup to replace the entry. A failed refresh leaves the old entry.
//!
//! Once a hostname has resolved successfully it never waits on the directory
//! again; the window only decides how eagerly it is refreshed. Concurrent
//! requests may start duplicate refreshes, the last one to finish wins.

use crate::directory::AppDirectory;
use crate::error::Result;
use crate::index::HostnameIndex;
use crate::store::SharedCacheStore;
use chrono::{DateTime, SubsecRound, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default time a resolution is served without triggering a refresh
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(60);

const CACHE_KEY_PREFIX: &str = "domain:";

/// Cache store key for a hostname
pub fn cache_key(hostname: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, hostname)
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Cached resolution, persisted as JSON in the cache store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub origin: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub resolved_at: DateTime<Utc>,
}

/// How a resolution was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Looked up synchronously, nothing was cached
    Cold,
    /// Served from cache inside the freshness window
    Fresh,
    /// Served from cache past the window; a refresh was spawned
    Stale,
}

/// Result of a successful [`ResolutionCache::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub origin: String,
    pub freshness: Freshness,
}

/// Lookup path shared by the request path and background refreshes
#[derive(Clone)]
struct Resolver {
    index: HostnameIndex,
    apps: Arc<dyn AppDirectory>,
    cache: SharedCacheStore,
    clock: Arc<dyn Clock>,
}

impl Resolver {
    /// Resolve from the index and app directory, caching on success
    async fn lookup(&self, hostname: &str) -> Result<Option<CacheEntry>> {
        let app_id = match self.index.get(hostname).await? {
            Some(app_id) => app_id,
            None => {
                debug!(hostname, "Hostname binding not found");
                return Ok(None);
            }
        };

        let origin = match self.apps.origin_for(&app_id).await? {
            Some(origin) => origin,
            None => {
                warn!(hostname, app_id = %app_id, "App not found in directory");
                return Ok(None);
            }
        };

        // Millisecond precision, matching what the cache store persists
        let entry = CacheEntry {
            origin,
            resolved_at: self.clock.now().trunc_subsecs(3),
        };
        self.store(hostname, &entry).await;
        Ok(Some(entry))
    }

    /// Cached entry for a hostname; unreadable entries count as missing
    async fn cached(&self, hostname: &str) -> Option<CacheEntry> {
        let raw = match self.cache.get_string(&cache_key(hostname)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(hostname, error = %e, "Cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(hostname, error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }

    /// Write an entry unless a newer one is already cached
    async fn store(&self, hostname: &str, entry: &CacheEntry) {
        if let Some(existing) = self.cached(hostname).await {
            if existing.resolved_at > entry.resolved_at {
                debug!(hostname, "Newer cache entry already present");
                return;
            }
        }

        let raw = match serde_json::to_string(entry) {
            Ok(raw) => raw,
            Err(e) => {
                error!(hostname, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        // The origin is still served when the cache write fails
        if let Err(e) = self.cache.set(&cache_key(hostname), raw).await {
            warn!(hostname, error = %e, "Cache write failed");
        }
    }
}

/// Stale-while-revalidate cache from hostname to origin
#[derive(Clone)]
pub struct ResolutionCache {
    resolver: Resolver,
    freshness_window: Duration,
}

impl ResolutionCache {
    pub fn new(index: HostnameIndex, apps: Arc<dyn AppDirectory>, cache: SharedCacheStore) -> Self {
        Self {
            resolver: Resolver {
                index,
                apps,
                cache,
                clock: Arc::new(SystemClock),
            },
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
        }
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.resolver.clock = clock;
        self
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Origin for `hostname`, or `None` when it cannot be resolved.
    ///
    /// Errors from the index or the app directory are logged and reported as
    /// `None`; they never leave anything in the cache.
    pub async fn resolve(&self, hostname: &str) -> Option<Resolution> {
        if hostname.is_empty() {
            return None;
        }

        if let Some(entry) = self.resolver.cached(hostname).await {
            if self.is_fresh(&entry) {
                return Some(Resolution {
                    origin: entry.origin,
                    freshness: Freshness::Fresh,
                });
            }

            debug!(hostname, resolved_at = %entry.resolved_at, "Serving stale origin, refreshing");
            self.spawn_refresh(hostname);
            return Some(Resolution {
                origin: entry.origin,
                freshness: Freshness::Stale,
            });
        }

        match self.resolver.lookup(hostname).await {
            Ok(Some(entry)) => {
                info!(hostname, origin = %entry.origin, "Resolved hostname");
                Some(Resolution {
                    origin: entry.origin,
                    freshness: Freshness::Cold,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(hostname, error = %e, "Hostname resolution failed");
                None
            }
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        let age = self
            .resolver
            .clock
            .now()
            .signed_duration_since(entry.resolved_at);
        age.num_milliseconds() < i64::try_from(self.freshness_window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Detached refresh; not tied to the lifetime of the triggering request
    fn spawn_refresh(&self, hostname: &str) {
        let resolver = self.resolver.clone();
        let hostname = hostname.to_string();

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(resolver.lookup(&hostname))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(Some(entry))) => {
                    debug!(hostname, origin = %entry.origin, "Background refresh complete");
                }
                Ok(Ok(None)) => {
                    warn!(hostname, "Background refresh found no origin, keeping stale entry");
                }
                Ok(Err(e)) => {
                    warn!(hostname, error = %e, "Background refresh failed, keeping stale entry");
                }
                Err(_) => {
                    error!(hostname, "Background refresh panicked");
                }
            }
        });
    }
}
