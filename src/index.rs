//! Hostname <-> app index
//!
//! Two collections describe the same relationship: `hostnames` maps a hostname
//! to its owning app, and `apps` holds one entry per `<app_id>:<hostname>` pair so
//! an app's hostnames can be listed with a prefix scan. [`HostnameIndex`] is the
//! only writer of either collection and mirrors every write to both.
//!
//! The store offers no cross-key transactions. Create writes the binding first
//! and the index entry second; delete removes them in the same order. A failure
//! between the two writes leaves the collections out of step until the next
//! successful write for that pair, and is logged rather than hidden.

use crate::error::{Error, Result};
use crate::store::{SharedRecordStore, APPS, HOSTNAMES};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Primary record in the `hostnames` collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameBinding {
    pub hostname: String,
    pub app_id: String,
}

/// Secondary record in the `apps` collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIndexEntry {
    pub hostname: String,
    pub created_at: DateTime<Utc>,
}

/// Separator between app id and hostname in `apps` keys
const KEY_SEPARATOR: char = ':';

/// Key of an [`AppIndexEntry`]
pub fn app_index_key(app_id: &str, hostname: &str) -> String {
    format!("{}{}{}", app_id, KEY_SEPARATOR, hostname)
}

/// Reject app ids that could not be told apart from another app's key prefix
pub fn validate_app_id(app_id: &str) -> Result<()> {
    if app_id.is_empty() {
        return Err(Error::Validation("app_id is required".to_string()));
    }
    if app_id.contains(KEY_SEPARATOR) {
        return Err(Error::Validation(format!(
            "app_id must not contain '{}': {}",
            KEY_SEPARATOR, app_id
        )));
    }
    Ok(())
}

fn app_prefix(app_id: &str) -> String {
    format!("{}{}", app_id, KEY_SEPARATOR)
}

/// Keeps the `hostnames` and `apps` collections in agreement
#[derive(Clone)]
pub struct HostnameIndex {
    store: SharedRecordStore,
}

impl HostnameIndex {
    pub fn new(store: SharedRecordStore) -> Self {
        Self { store }
    }

    /// Bind `hostname` to `app_id`, writing the binding and then the index entry.
    ///
    /// Re-creating an existing binding for the same app is a no-op rewrite.
    pub async fn create(&self, hostname: &str, app_id: &str) -> Result<()> {
        validate_app_id(app_id)?;
        if hostname.is_empty() {
            return Err(Error::Validation("hostname is required".to_string()));
        }

        // Rebinding to another app would orphan that app's index entry
        if let Some(existing) = self.binding(hostname).await? {
            if existing.app_id != app_id {
                warn!(hostname, app_id, owner = %existing.app_id, "Hostname already bound to another app");
                return Err(Error::OwnershipMismatch {
                    hostname: hostname.to_string(),
                });
            }
        }

        let binding = HostnameBinding {
            hostname: hostname.to_string(),
            app_id: app_id.to_string(),
        };
        self.store
            .put(HOSTNAMES, hostname, to_value(&binding)?)
            .await?;

        let entry = AppIndexEntry {
            hostname: hostname.to_string(),
            created_at: Utc::now(),
        };
        let key = app_index_key(app_id, hostname);
        let written = match to_value(&entry) {
            Ok(value) => self.store.put(APPS, &key, value).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // The binding is in place, so resolution works; only listing by app misses it.
            error!(hostname, app_id, error = %e, "App index write failed after binding was stored");
            return Ok(());
        }

        info!(hostname, app_id, "Hostname bound");
        Ok(())
    }

    /// Check that `hostname` is currently bound to `claimed_app_id`
    pub async fn verify_owner(&self, hostname: &str, claimed_app_id: &str) -> Result<HostnameBinding> {
        match self.binding(hostname).await? {
            Some(binding) if binding.app_id == claimed_app_id => Ok(binding),
            Some(binding) => {
                warn!(
                    hostname,
                    claimed_app_id,
                    owner = %binding.app_id,
                    "Ownership check failed"
                );
                Err(Error::OwnershipMismatch {
                    hostname: hostname.to_string(),
                })
            }
            None => {
                debug!(hostname, claimed_app_id, "Ownership check on unbound hostname");
                Err(Error::OwnershipMismatch {
                    hostname: hostname.to_string(),
                })
            }
        }
    }

    /// Remove the binding for `hostname` if `claimed_app_id` owns it
    pub async fn delete(&self, hostname: &str, claimed_app_id: &str) -> Result<()> {
        let binding = self.verify_owner(hostname, claimed_app_id).await?;

        self.store.delete(HOSTNAMES, hostname).await?;

        let key = app_index_key(&binding.app_id, hostname);
        if let Err(e) = self.store.delete(APPS, &key).await {
            error!(hostname, app_id = %binding.app_id, error = %e, "App index delete failed after binding was removed");
            return Ok(());
        }

        info!(hostname, app_id = %binding.app_id, "Hostname unbound");
        Ok(())
    }

    /// App that owns `hostname`, if any
    pub async fn get(&self, hostname: &str) -> Result<Option<String>> {
        Ok(self.binding(hostname).await?.map(|b| b.app_id))
    }

    /// Full binding record for `hostname`, if any
    pub async fn binding(&self, hostname: &str) -> Result<Option<HostnameBinding>> {
        match self.store.get(HOSTNAMES, hostname).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::Store(format!("corrupt hostname binding for {}: {}", hostname, e))),
            None => Ok(None),
        }
    }

    /// Hostnames bound to `app_id`, in store order.
    ///
    /// Entries that fail to decode are skipped with a warning.
    pub async fn list_hostnames_for_app(&self, app_id: &str) -> Result<BoxStream<'static, String>> {
        if app_id.contains(KEY_SEPARATOR) {
            return Ok(futures::stream::empty().boxed());
        }

        let app_id = app_id.to_string();
        let values = self.store.scan_prefix(APPS, &app_prefix(&app_id)).await?;

        Ok(values
            .filter_map(move |item| {
                let decoded = item.and_then(|value| {
                    serde_json::from_value::<AppIndexEntry>(value)
                        .map_err(|e| Error::Store(e.to_string()))
                });
                let hostname = match decoded {
                    Ok(entry) => Some(entry.hostname),
                    Err(e) => {
                        warn!(app_id = %app_id, error = %e, "Skipping unreadable app index entry");
                        None
                    }
                };
                futures::future::ready(hostname)
            })
            .boxed())
    }
}

fn to_value<T: Serialize>(record: &T) -> Result<serde_json::Value> {
    serde_json::to_value(record).map_err(|e| Error::Store(e.to_string()))
}
