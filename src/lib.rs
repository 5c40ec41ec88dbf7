//! Hostgate - a custom-domain gateway in front of an app hosting proxy
//!
//! This library provides a gateway that:
//! - Maps custom hostnames to the app that owns them
//! - Resolves an app to its origin through an app directory, caching the
//!   result with stale-while-revalidate semantics
//! - Forwards traffic to a single upstream proxy with `Host` rewritten to the
//!   origin and the original host kept in `X-Forwarded-Host`
//! - Serves an admin API that wraps a hostname directory and keeps the local
//!   hostname index in sync with it

pub mod admin;
pub mod cache;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod index;
pub mod pool;
pub mod proxy;
pub mod store;
