//! Chunk planning and scheduling
//!
//! Splits a file's byte range into chunks, dispatches chunk transfers
//! onto the connection pool, retries transient failures with backoff,
//! and joins the whole chunk set before declaring the file done.
//! Chunks of one file may complete out of order; completion is a
//! barrier over the full set, not first-chunk-wins.

use crate::error::{EngineError, NetworkErrorKind, Result, StorageErrorKind};
use crate::http::checksum::{digest_mismatch_error, DigestValue, StreamingDigest};
use crate::http::pool::{ConnectionPool, RetryPolicy};
use crate::http::RemoteClient;
use crate::protocol::{Chunk, ChunkState, ProgressCounters, TransferEvent, TransferObserver};

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Partition a file's byte range `[0, size)` into chunks.
///
/// With chunking disabled the whole file is one chunk. Otherwise
/// chunks are fixed-size except the final one, which spans the
/// remainder and is never zero-length. A zero-byte file yields a
/// single zero-length chunk that marks the job trivially complete.
pub fn plan_chunks(size: u64, chunk_size: u64, allow_chunks: bool) -> Vec<Chunk> {
    let new_chunk = |index: usize, offset: u64, length: u64| Chunk {
        index,
        offset,
        length,
        state: ChunkState::Pending,
        attempts: 0,
    };

    if size == 0 {
        return vec![new_chunk(0, 0, 0)];
    }
    if !allow_chunks || chunk_size >= size {
        return vec![new_chunk(0, 0, size)];
    }

    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < size {
        let length = chunk_size.min(size - offset);
        chunks.push(new_chunk(chunks.len(), offset, length));
        offset += length;
    }
    chunks
}

/// Per-file chunk scheduler.
///
/// One scheduler serves every job of a run; all chunk transfers
/// compete for the same connection pool.
pub struct ChunkScheduler {
    remote: Arc<RemoteClient>,
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    observer: Arc<dyn TransferObserver>,
    counters: Arc<ProgressCounters>,
    cancel: CancellationToken,
    chunk_size: u64,
    allow_chunks: bool,
}

impl ChunkScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<RemoteClient>,
        pool: Arc<ConnectionPool>,
        retry: RetryPolicy,
        observer: Arc<dyn TransferObserver>,
        counters: Arc<ProgressCounters>,
        cancel: CancellationToken,
        chunk_size: u64,
        allow_chunks: bool,
    ) -> Self {
        Self {
            remote,
            pool,
            retry,
            observer,
            counters,
            cancel,
            chunk_size,
            allow_chunks,
        }
    }

    /// Upload one file chunk by chunk.
    ///
    /// Returns once every chunk is acked or the retry budget of some
    /// chunk is exhausted. A failed job contributes nothing to the
    /// aggregate byte tally.
    pub async fn upload(&self, dataset: &str, name: &str, path: &Path, size: u64) -> Result<()> {
        let chunks = plan_chunks(size, self.chunk_size, self.allow_chunks);

        if size == 0 {
            // Trivially complete, no network operation.
            self.observer.on_event(&TransferEvent::ChunkTransferred {
                file_complete: true,
                bytes: 0,
            });
            return Ok(());
        }

        let total_chunks = chunks.len();
        let acked = Arc::new(AtomicUsize::new(0));
        let job_bytes = Arc::new(AtomicU64::new(0));
        let job_cancel = self.cancel.child_token();

        let mut handles = Vec::with_capacity(total_chunks);
        for mut chunk in chunks {
            let remote = Arc::clone(&self.remote);
            let pool = Arc::clone(&self.pool);
            let retry = self.retry.clone();
            let observer = Arc::clone(&self.observer);
            let counters = Arc::clone(&self.counters);
            let acked = Arc::clone(&acked);
            let job_bytes = Arc::clone(&job_bytes);
            let job_cancel = job_cancel.clone();
            let dataset = dataset.to_string();
            let name = name.to_string();
            let path = path.to_path_buf();

            handles.push(tokio::spawn(async move {
                loop {
                    if job_cancel.is_cancelled() {
                        return Err(EngineError::Shutdown);
                    }

                    chunk.state = ChunkState::InFlight;
                    chunk.attempts += 1;
                    // The slot is held for one attempt only; backoff
                    // happens without occupying the budget.
                    let slot = pool.acquire().await?;
                    let outcome = async {
                        let body = read_range(&path, chunk.offset, chunk.length).await?;
                        remote
                            .upload_chunk(&dataset, &name, chunk.offset, size, body)
                            .await
                    }
                    .await;
                    drop(slot);

                    match outcome {
                        Ok(()) => break,
                        Err(e) if retry.should_retry(chunk.attempts, &e) => {
                            let delay = retry.delay_for_attempt(chunk.attempts - 1);
                            tracing::debug!(
                                "Chunk {} of '{}' failed (attempt {}), retrying in {:?}: {}",
                                chunk.index,
                                name,
                                chunk.attempts,
                                delay,
                                e
                            );
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) => {
                            chunk.state = ChunkState::Failed;
                            job_cancel.cancel();
                            return Err(e);
                        }
                    }
                }

                chunk.state = ChunkState::Acked;
                job_bytes.fetch_add(chunk.length, Ordering::Relaxed);
                counters.add_bytes(chunk.length);
                let done = acked.fetch_add(1, Ordering::Relaxed) + 1;
                observer.on_event(&TransferEvent::ChunkTransferred {
                    file_complete: done == total_chunks,
                    bytes: chunk.length,
                });
                Ok(chunk)
            }));
        }

        let outcome = join_chunks(handles, total_chunks).await;
        if let Err(e) = outcome {
            self.counters
                .retract_bytes(job_bytes.load(Ordering::Relaxed));
            return Err(e);
        }
        Ok(())
    }

    /// Download one file chunk by chunk.
    ///
    /// Bytes land in a `.part` file at their final offsets; the file is
    /// renamed into place only after every chunk is acked and, when an
    /// expected digest is given, the streamed digest matches it.
    pub async fn download(
        &self,
        dataset: &str,
        name: &str,
        dest: &Path,
        size: u64,
        expected: Option<DigestValue>,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::storage(
                    StorageErrorKind::Io,
                    parent,
                    format!("Create dir failed: {}", e),
                )
            })?;
        }

        if size == 0 {
            File::create(dest).await.map_err(|e| {
                EngineError::storage(StorageErrorKind::Io, dest, format!("Create failed: {}", e))
            })?;
            if let Some(expected) = expected {
                let actual = StreamingDigest::new().finalize();
                if actual != expected {
                    return Err(digest_mismatch_error(name, &expected, &actual));
                }
            }
            self.observer.on_event(&TransferEvent::ChunkTransferred {
                file_complete: true,
                bytes: 0,
            });
            return Ok(());
        }

        let part = part_path(dest);
        let file = File::create(&part).await.map_err(|e| {
            EngineError::storage(StorageErrorKind::Io, &part, format!("Create failed: {}", e))
        })?;
        // Pre-allocate so out-of-order chunk writes land at their
        // final offsets.
        file.set_len(size).await.map_err(|e| {
            EngineError::storage(
                StorageErrorKind::Io,
                &part,
                format!("Pre-allocate failed: {}", e),
            )
        })?;
        let file = Arc::new(Mutex::new(file));

        let digest = expected.is_some().then(|| Arc::new(StreamingDigest::new()));
        let chunks = plan_chunks(size, self.chunk_size, self.allow_chunks);
        let total_chunks = chunks.len();
        let acked = Arc::new(AtomicUsize::new(0));
        let job_bytes = Arc::new(AtomicU64::new(0));
        let job_cancel = self.cancel.child_token();

        let mut handles = Vec::with_capacity(total_chunks);
        for mut chunk in chunks {
            let remote = Arc::clone(&self.remote);
            let pool = Arc::clone(&self.pool);
            let retry = self.retry.clone();
            let observer = Arc::clone(&self.observer);
            let counters = Arc::clone(&self.counters);
            let acked = Arc::clone(&acked);
            let job_bytes = Arc::clone(&job_bytes);
            let job_cancel = job_cancel.clone();
            let file = Arc::clone(&file);
            let part = part.clone();
            let digest = digest.clone();
            let dataset = dataset.to_string();
            let name = name.to_string();

            handles.push(tokio::spawn(async move {
                let body = loop {
                    if job_cancel.is_cancelled() {
                        return Err(EngineError::Shutdown);
                    }

                    chunk.state = ChunkState::InFlight;
                    chunk.attempts += 1;
                    let slot = pool.acquire().await?;
                    let outcome =
                        fetch_chunk(&remote, &dataset, &name, chunk.offset, chunk.length).await;
                    drop(slot);

                    match outcome {
                        Ok(body) => break body,
                        Err(e) if retry.should_retry(chunk.attempts, &e) => {
                            let delay = retry.delay_for_attempt(chunk.attempts - 1);
                            tracing::debug!(
                                "Chunk {} of '{}' failed (attempt {}), retrying in {:?}: {}",
                                chunk.index,
                                name,
                                chunk.attempts,
                                delay,
                                e
                            );
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) => {
                            chunk.state = ChunkState::Failed;
                            job_cancel.cancel();
                            return Err(e);
                        }
                    }
                };

                // Retries re-fetch from scratch, so the write and the
                // digest update happen exactly once per chunk.
                {
                    let mut file = file.lock().await;
                    file.seek(SeekFrom::Start(chunk.offset)).await.map_err(|e| {
                        EngineError::storage(
                            StorageErrorKind::Io,
                            &part,
                            format!("Seek failed: {}", e),
                        )
                    })?;
                    file.write_all(&body).await.map_err(|e| {
                        EngineError::storage(
                            StorageErrorKind::Io,
                            &part,
                            format!("Write failed: {}", e),
                        )
                    })?;
                }
                if let Some(ref digest) = digest {
                    digest.update(chunk.offset, &body);
                }

                chunk.state = ChunkState::Acked;
                job_bytes.fetch_add(chunk.length, Ordering::Relaxed);
                counters.add_bytes(chunk.length);
                let done = acked.fetch_add(1, Ordering::Relaxed) + 1;
                observer.on_event(&TransferEvent::ChunkTransferred {
                    file_complete: done == total_chunks,
                    bytes: chunk.length,
                });
                Ok(chunk)
            }));
        }

        let outcome = join_chunks(handles, total_chunks).await;
        if let Err(e) = outcome {
            self.counters
                .retract_bytes(job_bytes.load(Ordering::Relaxed));
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }

        {
            let mut file = file.lock().await;
            file.flush().await.map_err(|e| {
                EngineError::storage(StorageErrorKind::Io, &part, format!("Flush failed: {}", e))
            })?;
            file.sync_all().await.map_err(|e| {
                EngineError::storage(StorageErrorKind::Io, &part, format!("Sync failed: {}", e))
            })?;
        }

        // Transport success does not imply file-level integrity: the
        // verdict comes from the digest, after every chunk is acked.
        if let (Some(digest), Some(expected)) = (digest, expected) {
            let actual = Arc::try_unwrap(digest)
                .map_err(|_| EngineError::Internal("Digest still shared after join".into()))?
                .finalize();
            if actual != expected {
                self.counters
                    .retract_bytes(job_bytes.load(Ordering::Relaxed));
                let _ = tokio::fs::remove_file(&part).await;
                return Err(digest_mismatch_error(name, &expected, &actual));
            }
        }

        tokio::fs::rename(&part, dest).await.map_err(|e| {
            EngineError::storage(StorageErrorKind::Io, dest, format!("Rename failed: {}", e))
        })?;
        Ok(())
    }
}

/// Wait for every chunk task and enforce the all-acked barrier.
///
/// The most meaningful error wins: a fatal error over a transfer
/// error, a transfer error over the shutdown of a sibling.
async fn join_chunks(
    handles: Vec<tokio::task::JoinHandle<Result<Chunk>>>,
    total_chunks: usize,
) -> Result<()> {
    let mut acked = 0usize;
    let mut errors: Vec<EngineError> = Vec::new();

    for handle in handles {
        match handle.await {
            Ok(Ok(chunk)) => {
                if chunk.state == ChunkState::Acked {
                    acked += 1;
                }
            }
            Ok(Err(e)) => errors.push(e),
            Err(e) => {
                tracing::error!("Chunk task panicked: {:?}", e);
                errors.push(EngineError::Internal(format!("Chunk task panicked: {}", e)));
            }
        }
    }

    if errors.is_empty() {
        if acked != total_chunks {
            return Err(EngineError::Internal(format!(
                "Chunk barrier violated: {} of {} acked",
                acked, total_chunks
            )));
        }
        return Ok(());
    }

    let mut best: Option<EngineError> = None;
    for e in errors {
        let better = match (&best, &e) {
            (None, _) => true,
            (Some(b), _) if b.is_fatal() => false,
            (Some(_), e) if e.is_fatal() => true,
            (Some(EngineError::Shutdown), _) => !matches!(e, EngineError::Shutdown),
            _ => false,
        };
        if better {
            best = Some(e);
        }
    }
    Err(best.unwrap_or(EngineError::Shutdown))
}

/// Read the byte range `[offset, offset+length)` of a local file
async fn read_range(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).await.map_err(|e| {
        EngineError::storage(StorageErrorKind::Io, path, format!("Open failed: {}", e))
    })?;
    file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
        EngineError::storage(StorageErrorKind::Io, path, format!("Seek failed: {}", e))
    })?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await.map_err(|e| {
        EngineError::storage(StorageErrorKind::Io, path, format!("Read failed: {}", e))
    })?;
    Ok(buf)
}

/// Fetch one chunk body, validating its length
async fn fetch_chunk(
    remote: &RemoteClient,
    dataset: &str,
    name: &str,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>> {
    let response = remote.download_chunk(dataset, name, offset, length).await?;
    let mut stream = response.bytes_stream();
    let mut buf = Vec::with_capacity(length as usize);
    while let Some(item) = stream.next().await {
        let bytes = item.map_err(|e| {
            EngineError::network(NetworkErrorKind::ConnectionReset, format!("Stream error: {}", e))
        })?;
        buf.extend_from_slice(&bytes);
    }
    if buf.len() as u64 != length {
        // A truncated body is usually a dropped connection; retryable.
        return Err(EngineError::network(
            NetworkErrorKind::ConnectionReset,
            format!(
                "Chunk at offset {} returned {} bytes, expected {}",
                offset,
                buf.len(),
                length
            ),
        ));
    }
    Ok(buf)
}

/// The `.part` path used while a download is in flight
fn part_path(dest: &Path) -> PathBuf {
    let ext = dest
        .extension()
        .map(|e| format!("{}.part", e.to_string_lossy()))
        .unwrap_or_else(|| "part".to_string());
    dest.with_extension(ext)
}
