//! The cache facade: the blob store and the metadata store wired together
//! under a single root, plus the periodic maintenance pass that keeps the
//! two consistent.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use url::Url;

mod blob;
mod entry;
mod ingest;
mod meta;

pub use blob::{BlobError, BlobStore, PruneOutcome};
pub use entry::{CachedResponse, CachedResponses};
pub use ingest::IngestStream;
pub use meta::{MetaError, MetaStore, Version};

use crate::units::ByteSize;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub quota_low: u64,
    pub quota_high: u64,
    pub maintenance_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            quota_low: 8 << 30,
            quota_high: 10 << 30,
            maintenance_interval: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostUsage {
    pub entries: u64,
    pub size: ByteSize,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub metadata_entries: u64,
    pub metadata_size: ByteSize,
    pub blob_entries: u64,
    pub blob_size: ByteSize,
    pub per_hostname: BTreeMap<String, HostUsage>,
}

/// Cheaply cloneable handle on the cache. Dropping the last handle does not
/// stop the maintenance task; call [`Cache::close`] for an orderly shutdown.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    blob: BlobStore,
    meta: MetaStore,
    /// Serializes maintenance passes against each other; request serving
    /// never takes this lock.
    maintenance: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Opens (or creates) a cache under `root`: blobs in `<root>/cache`,
    /// metadata in `<root>/db`. Initialization failures are fatal.
    pub async fn open(root: &Path, options: CacheOptions) -> Result<Self> {
        let blob = BlobStore::open(
            root.join("cache"),
            options.quota_low,
            options.quota_high,
        )
        .await
        .context("unable to initialize the file cache")?;

        let meta = MetaStore::open(&root.join("db"))
            .context("unable to initialize the metadata store")?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(CacheInner {
            blob,
            meta,
            maintenance: tokio::sync::Mutex::new(()),
            shutdown,
            task: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(run_maintenance(
            inner.clone(),
            options.maintenance_interval,
            shutdown_rx,
        ));
        *inner.task.lock() = Some(task);

        Ok(Self { inner })
    }

    /// Stops the maintenance task, draining a pass in flight, and flushes
    /// the metadata store. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let _ = self.inner.shutdown.send(true);
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.meta.flush()?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<(CachedResponses, Version), MetaError> {
        self.inner.meta.get(key)
    }

    pub fn save(
        &self,
        key: &[u8],
        responses: &CachedResponses,
        version: Version,
    ) -> Result<(), MetaError> {
        self.inner.meta.save(key, responses, version)
    }

    pub fn insert_new(&self, key: &[u8], responses: &CachedResponses) -> Result<(), MetaError> {
        self.inner.meta.insert_new(key, responses)
    }

    pub fn delete(&self, key: &[u8], version: Version) -> Result<(), MetaError> {
        self.inner.meta.delete(key, version)
    }

    pub async fn open_blob(&self, hash: &str) -> Result<tokio::fs::File, BlobError> {
        self.inner.blob.open_blob(hash).await
    }

    pub async fn ingest<S>(
        &self,
        source: S,
        on_commit: impl FnOnce(String) + Send + 'static,
        on_abort: impl FnOnce() + Send + 'static,
    ) -> IngestStream<S>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        self.inner.blob.begin_ingest(source, on_commit, on_abort).await
    }

    /// Runs one maintenance pass immediately. The periodic task calls this
    /// on its own schedule; admin surfaces may force it.
    pub async fn maintain(&self) {
        self.inner.maintain().await;
    }

    /// Explicitly invalidates a key, regardless of concurrent writers.
    pub fn remove(&self, key: &[u8]) -> Result<(), MetaError> {
        loop {
            let version = match self.inner.meta.get(key) {
                Ok((_, version)) => version,
                Err(MetaError::NotFound) => return Ok(()),
                Err(err) => return Err(err),
            };
            match self.inner.meta.delete(key, version) {
                Ok(()) => return Ok(()),
                Err(MetaError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Entries whose key URL names `hostname`.
    pub fn list(&self, hostname: &str) -> Result<Vec<(String, CachedResponses)>> {
        let mut entries = Vec::new();
        self.inner.meta.for_each(|key, responses, _| {
            let key = String::from_utf8_lossy(key).into_owned();
            if key_hostname(&key).is_some_and(|host| host == hostname) {
                entries.push((key, responses));
            }
            Ok(())
        })?;
        Ok(entries)
    }

    /// Store-wide statistics plus a per-hostname usage breakdown, computed
    /// by parsing the URL out of every key.
    pub async fn statistics(&self) -> Result<CacheStatistics> {
        let (metadata_entries, metadata_size) = self.inner.meta.statistics()?;
        let (blob_entries, blob_size) = self.inner.blob.statistics().await?;

        let mut per_key: Vec<(String, Vec<String>)> = Vec::new();
        self.inner.meta.for_each(|key, responses, _| {
            let key = String::from_utf8_lossy(key).into_owned();
            let hashes = responses
                .iter()
                .map(|response| response.content_hash.clone())
                .collect();
            per_key.push((key, hashes));
            Ok(())
        })?;

        let mut per_hostname: BTreeMap<String, HostUsage> = BTreeMap::new();
        for (key, hashes) in per_key {
            let Some(hostname) = key_hostname(&key) else {
                debug!(key = %key, "cache key does not contain a parseable URL, skipping");
                continue;
            };
            let usage = per_hostname.entry(hostname).or_default();
            usage.entries += hashes.len() as u64;
            for hash in hashes {
                match self.inner.blob.stat(&hash).await {
                    Ok((size, _)) => usage.size.0 += size,
                    Err(BlobError::NotFound) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(CacheStatistics {
            metadata_entries,
            metadata_size: ByteSize(metadata_size),
            blob_entries,
            blob_size: ByteSize(blob_size),
            per_hostname,
        })
    }
}

impl CacheInner {
    async fn maintain(&self) {
        let _guard = self.maintenance.lock().await;
        info!("running cache maintenance");

        match self.blob.prune().await {
            Ok(PruneOutcome::NotNeeded) => {}
            Ok(PruneOutcome::Removed(files)) => info!(files, "evicted files from the blob store"),
            Err(err) => {
                error!(error = %err, "unable to reclaim space from the blob store");
                return;
            }
        }

        let hashes = match self.blob.hashes().await {
            Ok(hashes) => hashes,
            Err(err) => {
                error!(error = %err, "unable to list blobs during maintenance");
                return;
            }
        };

        if let Err(err) = self.sweep_orphaned_entries(&hashes) {
            error!(error = %err, "unable to sweep orphaned metadata entries");
        }

        match self.meta.garbage_collect() {
            Ok(true) => info!("metadata store reclaimed space"),
            Ok(false) => {}
            Err(err) => error!(error = %err, "unable to garbage collect the metadata store"),
        }
    }

    /// Drops every descriptor whose blob is gone; entries that lose all
    /// their descriptors are deleted. Saves are version-checked: a key that
    /// moved under us is skipped, the next pass gets it.
    fn sweep_orphaned_entries(&self, hashes: &HashSet<String>) -> Result<()> {
        let mut stale = Vec::new();
        self.meta.for_each(|key, responses, version| {
            if responses
                .iter()
                .any(|response| !hashes.contains(&response.content_hash))
            {
                stale.push((key.to_vec(), responses, version));
            }
            Ok(())
        })?;

        for (key, responses, version) in stale {
            let retained: CachedResponses = responses
                .into_iter()
                .filter(|response| hashes.contains(&response.content_hash))
                .collect();

            let result = if retained.is_empty() {
                self.meta.delete(&key, version)
            } else {
                self.meta.save(&key, &retained, version)
            };

            match result {
                Ok(()) => debug!(
                    key = %String::from_utf8_lossy(&key),
                    kept = retained.len(),
                    "dropped descriptors without a blob"
                ),
                Err(MetaError::Conflict) => debug!(
                    key = %String::from_utf8_lossy(&key),
                    "entry changed during maintenance, skipping"
                ),
                Err(err) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %err,
                    "unable to update entry during maintenance"
                ),
            }
        }
        Ok(())
    }
}

async fn run_maintenance(
    inner: Arc<CacheInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; maintenance waits a full interval.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.maintain().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Keys have the shape `METHOD+URL`; everything past the first `+` is the
/// request URL.
fn key_hostname(key: &str) -> Option<String> {
    let (_, url) = key.split_once('+')?;
    let url = Url::parse(url).ok()?;
    url.host_str().map(|host| host.to_string())
}
