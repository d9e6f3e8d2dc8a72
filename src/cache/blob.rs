//! The blob store: response bodies as content-addressed files.
//!
//! Blobs live at `<root>/<hh>/<rest>` where `hh` is the first two hex
//! characters of the body's BLAKE3-256. In-flight ingests write to unique
//! temp files under `<root>/_tmp` and are moved into place with an atomic
//! rename, so concurrent ingests never observe partial blobs. A blob's
//! mtime doubles as its last-used marker: reads refresh it, and pruning
//! evicts oldest-mtime-first.

use std::collections::HashSet;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::fs as async_fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ingest::IngestStream;

const TMP_DIR_NAME: &str = "_tmp";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("no blob stored for this hash")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Total size was within `quota_high`; nothing was evicted.
    NotNeeded,
    /// Files were evicted; carries how many.
    Removed(u64),
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    quota_low: u64,
    quota_high: u64,
}

impl BlobStore {
    /// Creates the store layout (root, `_tmp`, 256 shard directories) and
    /// clears any temp files left behind by a previous run.
    pub async fn open(root: PathBuf, quota_low: u64, quota_high: u64) -> Result<Self> {
        let tmp_dir = root.join(TMP_DIR_NAME);
        async_fs::create_dir_all(&tmp_dir)
            .await
            .with_context(|| format!("unable to create cache tmp dir {}", tmp_dir.display()))?;

        let mut leftovers = async_fs::read_dir(&tmp_dir)
            .await
            .with_context(|| format!("unable to list cache tmp dir {}", tmp_dir.display()))?;
        while let Some(entry) = leftovers
            .next_entry()
            .await
            .context("unable to clear cache tmp dir")?
        {
            let path = entry.path();
            let removal = if entry.file_type().await?.is_dir() {
                async_fs::remove_dir_all(&path).await
            } else {
                async_fs::remove_file(&path).await
            };
            removal.with_context(|| format!("unable to remove stale file {}", path.display()))?;
        }

        for shard in 0..256u32 {
            let dir = root.join(format!("{shard:02x}"));
            match async_fs::create_dir(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("unable to create cache shard {}", dir.display())
                    });
                }
            }
        }

        Ok(Self {
            root,
            tmp_dir,
            quota_low,
            quota_high,
        })
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        let (shard, rest) = hash.split_at(2);
        self.root.join(shard).join(rest)
    }

    fn valid_hash(hash: &str) -> bool {
        hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Wraps `source` so that every byte it yields is also written to a temp
    /// file and hashed. See [`IngestStream`] for the commit/abort contract.
    /// Bodies larger than `quota_high / 2` are never stored. When the temp
    /// file cannot be created, the bytes still flow to the caller and the
    /// ingest aborts at the end.
    pub async fn begin_ingest<S>(
        &self,
        source: S,
        on_commit: impl FnOnce(String) + Send + 'static,
        on_abort: impl FnOnce() + Send + 'static,
    ) -> IngestStream<S>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let temp_path = self.tmp_dir.join(format!("ingest-{}", Uuid::new_v4()));
        let file = match async_fs::File::create(&temp_path).await {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(error = %err, "unable to create a temporary file, skipping ingestion");
                None
            }
        };
        IngestStream::new(
            source,
            file,
            temp_path,
            self.root.clone(),
            self.quota_high / 2,
            Box::new(on_commit),
            Box::new(on_abort),
        )
    }

    /// Opens a blob for reading and refreshes its mtime so pruning sees it
    /// as recently used. The refresh is best effort.
    pub async fn open_blob(&self, hash: &str) -> Result<async_fs::File, BlobError> {
        if !Self::valid_hash(hash) {
            return Err(BlobError::NotFound);
        }

        let path = self.blob_path(hash);
        let file = match async_fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(BlobError::NotFound),
            Err(err) => return Err(err.into()),
        };

        let file = file.into_std().await;
        if let Err(err) = file.set_modified(SystemTime::now()) {
            warn!(error = %err, hash, "unable to update mtime for cached file");
        }
        Ok(async_fs::File::from_std(file))
    }

    /// Size and mtime of a blob.
    pub async fn stat(&self, hash: &str) -> Result<(u64, SystemTime), BlobError> {
        if !Self::valid_hash(hash) {
            return Err(BlobError::NotFound);
        }
        match async_fs::metadata(self.blob_path(hash)).await {
            Ok(metadata) => {
                let mtime = metadata.modified()?;
                Ok((metadata.len(), mtime))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BlobError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// File count and total byte size across all shards.
    pub async fn statistics(&self) -> Result<(u64, u64), BlobError> {
        let mut count = 0u64;
        let mut total = 0u64;
        self.walk(|_, metadata| {
            count += 1;
            total += metadata.len();
            Ok(())
        })
        .await?;
        Ok((count, total))
    }

    /// Every hash currently present in the store.
    pub async fn hashes(&self) -> Result<HashSet<String>, BlobError> {
        let mut hashes = HashSet::new();
        let mut shards = async_fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            let name = shard.file_name();
            let shard_name = name.to_string_lossy();
            if shard_name == TMP_DIR_NAME || !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = async_fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                hashes.insert(format!("{shard_name}{}", file.file_name().to_string_lossy()));
            }
        }
        Ok(hashes)
    }

    /// Evicts least-recently-used blobs when the store exceeds `quota_high`,
    /// until it drops back to `quota_low`. Files whose mtime moved since
    /// enumeration were read in the meantime and are spared.
    pub async fn prune(&self) -> Result<PruneOutcome, BlobError> {
        let mut total = 0u64;
        let mut files = Vec::new();
        self.walk(|path, metadata| {
            let mtime = metadata.modified()?;
            total += metadata.len();
            files.push((mtime_secs(mtime), path.to_path_buf(), metadata.len()));
            Ok(())
        })
        .await?;

        if total <= self.quota_high {
            debug!(
                disk_usage = total,
                quota_high = self.quota_high,
                "no need to evict files, under threshold"
            );
            return Ok(PruneOutcome::NotNeeded);
        }

        info!(
            disk_usage = total,
            quota_high = self.quota_high,
            "disk usage above the configured quota, evicting"
        );

        files.sort();
        let mut removed = 0u64;
        for (recorded_mtime, path, size) in files {
            if total <= self.quota_low {
                break;
            }

            match async_fs::metadata(&path).await {
                Ok(metadata) => {
                    let mtime = metadata.modified()?;
                    if mtime_secs(mtime) != recorded_mtime {
                        debug!(path = %path.display(), "file was used since the check started, sparing it");
                        continue;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "unable to stat file during eviction");
                    continue;
                }
            }

            match async_fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), size, "evicted file from cache");
                    total = total.saturating_sub(size);
                    removed += 1;
                }
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "unable to evict file, skipping");
                }
            }
        }

        info!(files = removed, disk_usage = total, "eviction finished");
        Ok(PruneOutcome::Removed(removed))
    }

    async fn walk(
        &self,
        mut visit: impl FnMut(&Path, &std::fs::Metadata) -> io::Result<()>,
    ) -> Result<(), BlobError> {
        let mut shards = async_fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if shard.file_name() == TMP_DIR_NAME || !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = async_fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let metadata = file.metadata().await?;
                if metadata.is_file() {
                    visit(&file.path(), &metadata)?;
                }
            }
        }
        Ok(())
    }
}

fn mtime_secs(mtime: SystemTime) -> u64 {
    mtime
        .duration_since(UNIX_EPOCH)
        .map(|offset| offset.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use futures::stream;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    use super::*;

    fn byte_stream(chunks: Vec<&'static [u8]>) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        stream::iter(chunks.into_iter().map(|chunk| Ok(Bytes::from_static(chunk))))
    }

    async fn open_store(dir: &TempDir, quota_low: u64, quota_high: u64) -> BlobStore {
        BlobStore::open(dir.path().join("cache"), quota_low, quota_high)
            .await
            .expect("open blob store")
    }

    async fn drain<S: Stream<Item = io::Result<Bytes>> + Unpin>(mut stream: S) -> Vec<u8> {
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("stream chunk"));
        }
        collected
    }

    #[tokio::test]
    async fn creates_layout_and_clears_stale_temp_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        std::fs::create_dir_all(root.join(TMP_DIR_NAME)).unwrap();
        std::fs::write(root.join(TMP_DIR_NAME).join("ingest-old"), b"junk").unwrap();

        let _store = open_store(&dir, 512, 1024).await;

        assert!(root.join("00").is_dir());
        assert!(root.join("ff").is_dir());
        assert_eq!(std::fs::read_dir(root.join(TMP_DIR_NAME)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn ingest_commits_and_names_blob_by_hash() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4096, 8192).await;

        let committed = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let committed_clone = committed.clone();
        let stream = store
            .begin_ingest(
                byte_stream(vec![b"Hello", b", ", b"world!"]),
                move |hash| *committed_clone.lock() = Some(hash),
                || panic!("ingest must not abort"),
            )
            .await;

        let body = drain(stream).await;
        assert_eq!(body, b"Hello, world!");

        let expected = blake3::hash(b"Hello, world!").to_hex().to_string();
        assert_eq!(committed.lock().as_deref(), Some(expected.as_str()));

        let mut reader = store.open_blob(&expected).await.unwrap();
        let mut stored = Vec::new();
        reader.read_to_end(&mut stored).await.unwrap();
        assert_eq!(stored, b"Hello, world!");

        // No temp files remain.
        assert_eq!(
            std::fs::read_dir(dir.path().join("cache").join(TMP_DIR_NAME))
                .unwrap()
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn oversized_ingest_aborts_but_streams_through() {
        let dir = TempDir::new().unwrap();
        // quota_high of 10 means anything above 5 bytes is refused.
        let store = open_store(&dir, 5, 10).await;

        let aborted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let aborted_clone = aborted.clone();
        let stream = store
            .begin_ingest(
                byte_stream(vec![b"1234567"]),
                |_| panic!("oversized ingest must not commit"),
                move || aborted_clone.store(true, std::sync::atomic::Ordering::SeqCst),
            )
            .await;

        let body = drain(stream).await;
        assert_eq!(body, b"1234567");
        assert!(aborted.load(std::sync::atomic::Ordering::SeqCst));

        let (count, _) = store.statistics().await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(
            std::fs::read_dir(dir.path().join("cache").join(TMP_DIR_NAME))
                .unwrap()
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn source_error_aborts_ingest_and_propagates() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4096, 8192).await;

        let aborted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let aborted_clone = aborted.clone();
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("connection reset")),
        ]);
        let mut stream = store
            .begin_ingest(
                source,
                |_| panic!("failed ingest must not commit"),
                move || aborted_clone.store(true, std::sync::atomic::Ordering::SeqCst),
            )
            .await;

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Bytes::from_static(b"partial")
        );
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());

        assert!(aborted.load(std::sync::atomic::Ordering::SeqCst));
        let (count, _) = store.statistics().await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn dropping_an_ingest_cleans_the_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4096, 8192).await;

        let mut stream = store
            .begin_ingest(byte_stream(vec![b"abandoned"]), |_| {}, || {})
            .await;
        let _ = stream.next().await;
        drop(stream);

        // Drop cleanup is spawned on the runtime; give it a beat.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if std::fs::read_dir(dir.path().join("cache").join(TMP_DIR_NAME))
                .unwrap()
                .count()
                == 0
            {
                return;
            }
        }
        panic!("temp file was not cleaned up after drop");
    }

    #[tokio::test]
    async fn concurrent_ingests_of_identical_content_both_complete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4096, 8192).await;

        let first = store
            .begin_ingest(byte_stream(vec![b"same bytes"]), |_| {}, || {})
            .await;
        let second = store
            .begin_ingest(byte_stream(vec![b"same bytes"]), |_| {}, || {})
            .await;

        let (a, b) = tokio::join!(drain(first), drain(second));
        assert_eq!(a, b"same bytes");
        assert_eq!(b, b"same bytes");

        let hash = blake3::hash(b"same bytes").to_hex().to_string();
        let (size, _) = store.stat(&hash).await.unwrap();
        assert_eq!(size, b"same bytes".len() as u64);

        let (count, _) = store.statistics().await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn open_missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4096, 8192).await;
        let absent = blake3::hash(b"never stored").to_hex().to_string();
        assert!(matches!(store.open_blob(&absent).await, Err(BlobError::NotFound)));
        assert!(matches!(store.open_blob("junk").await, Err(BlobError::NotFound)));
    }

    #[tokio::test]
    async fn open_refreshes_mtime() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4096, 8192).await;

        let stream = store
            .begin_ingest(byte_stream(vec![b"touch me"]), |_| {}, || {})
            .await;
        drain(stream).await;

        let hash = blake3::hash(b"touch me").to_hex().to_string();
        let path = store.blob_path(&hash);
        let old = SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let _ = store.open_blob(&hash).await.unwrap();
        let (_, mtime) = store.stat(&hash).await.unwrap();
        assert!(mtime > old + Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn prune_is_a_no_op_under_quota() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 512, 1024).await;

        let stream = store
            .begin_ingest(byte_stream(vec![b"small"]), |_| {}, || {})
            .await;
        drain(stream).await;

        assert_eq!(store.prune().await.unwrap(), PruneOutcome::NotNeeded);
        let (count, _) = store.statistics().await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn prune_evicts_oldest_until_low_quota() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 12, 20).await;

        let bodies: [&'static [u8]; 3] = [b"aaaaaaaa", b"bbbbbbbb", b"cccccccc"];
        for (index, &body) in bodies.iter().enumerate() {
            let stream = store
                .begin_ingest(byte_stream(vec![body]), |_| {}, || {})
                .await;
            drain(stream).await;

            // Space mtimes out so eviction order is deterministic.
            let hash = blake3::hash(body).to_hex().to_string();
            let file = std::fs::File::options()
                .write(true)
                .open(store.blob_path(&hash))
                .unwrap();
            file.set_modified(SystemTime::now() - Duration::from_secs(1000 - index as u64 * 100))
                .unwrap();
        }

        // 24 bytes stored, quota_high is 20: evict until at most 12 remain.
        let outcome = store.prune().await.unwrap();
        assert_eq!(outcome, PruneOutcome::Removed(2));

        let (count, total) = store.statistics().await.unwrap();
        assert_eq!(count, 1);
        assert!(total <= 12);

        // The most recently used body survives.
        let survivor = blake3::hash(b"cccccccc").to_hex().to_string();
        assert!(store.stat(&survivor).await.is_ok());
    }

    #[tokio::test]
    async fn reading_a_blob_protects_it_from_the_next_prune() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 12, 20).await;

        let bodies: [&'static [u8]; 3] = [b"aaaaaaaa", b"bbbbbbbb", b"cccccccc"];
        for (index, &body) in bodies.iter().enumerate() {
            let stream = store
                .begin_ingest(byte_stream(vec![body]), |_| {}, || {})
                .await;
            drain(stream).await;

            let hash = blake3::hash(body).to_hex().to_string();
            let file = std::fs::File::options()
                .write(true)
                .open(store.blob_path(&hash))
                .unwrap();
            file.set_modified(SystemTime::now() - Duration::from_secs(3000 - index as u64 * 1000))
                .unwrap();
        }

        // The oldest blob gets read, which refreshes its mtime and moves it
        // to the young end of the eviction order.
        let read_hash = blake3::hash(b"aaaaaaaa").to_hex().to_string();
        let _ = store.open_blob(&read_hash).await.unwrap();

        // 24 bytes stored, quota_high 20: the two idle blobs go first.
        assert_eq!(store.prune().await.unwrap(), PruneOutcome::Removed(2));
        assert!(store.stat(&read_hash).await.is_ok());
        let (count, total) = store.statistics().await.unwrap();
        assert_eq!(count, 1);
        assert!(total <= 12);
    }

    #[tokio::test]
    async fn lists_all_hashes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4096, 8192).await;

        for body in [&b"one"[..], &b"two"[..]] {
            let stream = store
                .begin_ingest(
                    stream::iter(vec![Ok(Bytes::copy_from_slice(body))]),
                    |_| {},
                    || {},
                )
                .await;
            drain(stream).await;
        }

        let hashes = store.hashes().await.unwrap();
        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains(&blake3::hash(b"one").to_hex().to_string()));
        assert!(hashes.contains(&blake3::hash(b"two").to_hex().to_string()));
    }
}
