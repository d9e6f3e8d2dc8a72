//! The streaming ingest tee.
//!
//! [`IngestStream`] wraps a response-body stream: each chunk is written to a
//! temp file and fed to a BLAKE3 hasher before being yielded to the caller,
//! so the body is never buffered. When the source ends cleanly and the size
//! cap was not exceeded, the temp file is renamed to its content address and
//! the commit hook runs with the hex hash; otherwise the temp file is
//! removed and the abort hook runs. The caller observes the upstream bytes
//! (and the upstream error, if any) either way.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use blake3::Hasher;
use bytes::Bytes;
use futures::Stream;
use tokio::fs as async_fs;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

pub(crate) type CommitHook = Box<dyn FnOnce(String) + Send>;
pub(crate) type AbortHook = Box<dyn FnOnce() + Send>;

pub struct IngestStream<S> {
    source: S,
    /// `None` when the temp file could not be created; the stream then
    /// passes bytes through and aborts at the end.
    file: Option<async_fs::File>,
    temp_path: PathBuf,
    root: PathBuf,
    hasher: Hasher,
    /// Bodies above this many bytes are not stored.
    size_cap: u64,
    total: u64,
    /// A chunk pulled from the source but not yet fully written to disk.
    pending: Option<(Bytes, usize)>,
    source_done: bool,
    failed: bool,
    oversize: bool,
    done: bool,
    on_commit: Option<CommitHook>,
    on_abort: Option<AbortHook>,
}

impl<S> IngestStream<S> {
    pub(crate) fn new(
        source: S,
        file: Option<async_fs::File>,
        temp_path: PathBuf,
        root: PathBuf,
        size_cap: u64,
        on_commit: CommitHook,
        on_abort: AbortHook,
    ) -> Self {
        let failed = file.is_none();
        Self {
            source,
            file,
            temp_path,
            root,
            hasher: Hasher::new(),
            size_cap,
            total: 0,
            pending: None,
            source_done: false,
            failed,
            oversize: false,
            done: false,
            on_commit: Some(on_commit),
            on_abort: Some(on_abort),
        }
    }

    /// Settles the ingest once the source is exhausted: rename-and-commit on
    /// the happy path, cleanup-and-abort otherwise. The rename and unlink
    /// are metadata operations, cheap enough to do inline.
    fn settle(&mut self) {
        self.done = true;

        if self.oversize {
            warn!(size = self.total, "file is too big for the cache, skipping");
        } else if !self.failed {
            let hash = self.hasher.finalize().to_hex().to_string();
            let final_path = self.root.join(&hash[..2]).join(&hash[2..]);
            match std::fs::rename(&self.temp_path, &final_path) {
                Ok(()) => {
                    if let Some(hook) = self.on_commit.take() {
                        hook(hash);
                    }
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "unable to move ingested file into place");
                }
            }
        }

        if let Err(err) = std::fs::remove_file(&self.temp_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(error = %err, "unable to remove temporary ingest file");
            }
        }
        if let Some(hook) = self.on_abort.take() {
            hook();
        }
    }
}

impl<S> Stream for IngestStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.done {
                return Poll::Ready(None);
            }

            // Finish writing the in-flight chunk before handing it out.
            if let Some((chunk, mut written)) = this.pending.take() {
                if let Some(file) = this.file.as_mut() {
                    while written < chunk.len() {
                        match Pin::new(&mut *file).poll_write(cx, &chunk[written..]) {
                            Poll::Ready(Ok(0)) => {
                                warn!("cache file refused further writes, aborting ingestion");
                                this.failed = true;
                                break;
                            }
                            Poll::Ready(Ok(n)) => written += n,
                            Poll::Ready(Err(err)) => {
                                warn!(error = %err, "error writing to the cache, aborting ingestion");
                                this.failed = true;
                                break;
                            }
                            Poll::Pending => {
                                this.pending = Some((chunk, written));
                                return Poll::Pending;
                            }
                        }
                    }
                }
                return Poll::Ready(Some(Ok(chunk)));
            }

            if this.source_done {
                if let Some(file) = this.file.as_mut() {
                    match Pin::new(file).poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(err)) => {
                            warn!(error = %err, "error flushing the cache file, aborting ingestion");
                            this.failed = true;
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                this.settle();
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.source).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.total += chunk.len() as u64;

                    if this.failed || this.oversize || chunk.is_empty() {
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    if this.total > this.size_cap {
                        // Keep streaming to the caller, stop feeding the tee.
                        this.oversize = true;
                        return Poll::Ready(Some(Ok(chunk)));
                    }

                    this.hasher.update(&chunk);
                    this.pending = Some((chunk, 0));
                }
                Poll::Ready(Some(Err(err))) => {
                    debug!(error = %err, "error reading the upstream body");
                    this.failed = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.source_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> Drop for IngestStream<S> {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        // The request was cancelled mid-body: no metadata must be written
        // and the temp file has to go.
        if let Some(hook) = self.on_abort.take() {
            hook();
        }

        let temp_path = std::mem::take(&mut self.temp_path);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_file(temp_path).await;
            });
        } else {
            let _ = std::fs::remove_file(&temp_path);
        }
    }
}
