//! depot is the caching engine of a local-network package-registry
//! accelerator: a content-addressed blob store and a versioned metadata
//! store composed under a [`cache::Cache`] facade, driven by a
//! [`client::CachingClient`] that implements RFC 9111 semantics with
//! stale-on-error and peer-cache fallback. Per-origin protocol handlers and
//! admin surfaces embed this crate.

pub mod cache;
pub mod client;
pub mod httpcaching;
pub mod logging;
pub mod settings;
pub mod units;

pub use cache::{Cache, CacheOptions};
pub use client::{
    Body, CacheStatus, CachingClient, ClientOptions, Request, Response, UpstreamCaches,
};
pub use settings::Settings;
