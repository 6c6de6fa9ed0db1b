//! Run coordination
//!
//! Drives a full upload or download run: authenticate, enumerate the
//! job set, feed every job's chunks into the shared connection pool,
//! drain, and settle on exactly one terminal outcome.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, StorageErrorKind};
use crate::http::{hash_file, ChunkScheduler, ConnectionPool, DigestValue, RemoteClient, RetryPolicy};
use crate::protocol::{
    Direction, JobState, ProgressCounters, RunReport, RunState, Terminal, TransferEvent,
    TransferJob, TransferObserver,
};

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Coordinates one run at a time against a remote service.
///
/// The coordinator owns the run state machine:
/// `Idle -> Authenticating -> Running -> Draining -> Terminal`.
/// A run that fails authentication never issues a chunk request.
pub struct TransferCoordinator {
    config: EngineConfig,
    observer: Arc<dyn TransferObserver>,
    state: Mutex<RunState>,
    cancel: CancellationToken,
}

impl TransferCoordinator {
    /// Create a coordinator with a validated configuration
    pub fn new(config: EngineConfig, observer: Arc<dyn TransferObserver>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            observer,
            state: Mutex::new(RunState::Idle),
            cancel: CancellationToken::new(),
        })
    }

    /// Current run state
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Request shutdown; in-flight chunks stop at the next attempt
    /// boundary and the run settles on a terminal state.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Upload every file under the configured base directory into the
    /// named dataset.
    pub async fn upload(
        &self,
        service: Url,
        dataset: &str,
        user: &str,
        password: &str,
    ) -> Result<RunReport> {
        let files = match collect_files(&self.config.base_dir).await {
            Ok(files) => files,
            Err(e) => return self.abort_fatal(e),
        };
        self.upload_files(service, dataset, user, password, files)
            .await
    }

    /// Upload the given local files into the named dataset.
    ///
    /// Remote names are computed relative to the configured base
    /// directory, so every path must live under it.
    pub async fn upload_files(
        &self,
        service: Url,
        dataset: &str,
        user: &str,
        password: &str,
        files: Vec<PathBuf>,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let (pool, remote) = self.connect(service, user, password).await?;

        let mut jobs = Vec::new();
        for path in files {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) => {
                    return self.abort_fatal(EngineError::storage(
                        StorageErrorKind::Io,
                        &path,
                        format!("Stat failed: {}", e),
                    ))
                }
            };
            let remote_name = match relative_name(&self.config.base_dir, &path) {
                Ok(name) => name,
                Err(e) => return self.abort_fatal(e),
            };
            jobs.push(TransferJob {
                local_path: path,
                remote_name,
                size: meta.len(),
                direction: Direction::Upload,
                state: JobState::Queued,
            });
        }

        self.run(pool, remote, dataset, jobs, started).await
    }

    /// Download every file of the named dataset into the configured
    /// base directory.
    pub async fn download(
        &self,
        service: Url,
        dataset: &str,
        user: &str,
        password: &str,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let (pool, remote) = self.connect(service, user, password).await?;

        let listing = match remote.list_dataset(dataset).await {
            Ok(listing) => listing,
            Err(e) => return self.abort_fatal(e),
        };

        let mut jobs = Vec::new();
        for entry in listing {
            let local_path = match local_path_for(&self.config.base_dir, &entry.name) {
                Ok(path) => path,
                Err(e) => return self.abort_fatal(e),
            };
            jobs.push(TransferJob {
                local_path,
                remote_name: entry.name,
                size: entry.bytes,
                direction: Direction::Download,
                state: JobState::Queued,
            });
        }

        self.run(pool, remote, dataset, jobs, started).await
    }

    /// Authenticate and hand back a logged-in client.
    ///
    /// Any error here is fatal: the run terminates with `Fatal` before
    /// a single chunk request is issued.
    async fn connect(
        &self,
        service: Url,
        user: &str,
        password: &str,
    ) -> Result<(Arc<ConnectionPool>, Arc<RemoteClient>)> {
        *self.state.lock() = RunState::Authenticating;

        let outcome = async {
            let pool = ConnectionPool::new(&self.config)?;
            let remote = RemoteClient::new(service, pool.client().clone())?;
            remote.login(user, password).await?;
            Ok((Arc::new(pool), Arc::new(remote)))
        }
        .await;

        match outcome {
            Ok(connected) => Ok(connected),
            Err(e) => self.abort_fatal(e),
        }
    }

    fn abort_fatal<T>(&self, error: EngineError) -> Result<T> {
        tracing::error!("Run aborted: {}", error);
        self.observer.on_event(&TransferEvent::RunFatal {
            message: error.to_string(),
        });
        *self.state.lock() = RunState::Terminal(Terminal::Fatal);
        Err(error)
    }

    async fn run(
        &self,
        pool: Arc<ConnectionPool>,
        remote: Arc<RemoteClient>,
        dataset: &str,
        jobs: Vec<TransferJob>,
        started: Instant,
    ) -> Result<RunReport> {
        let total_bytes: u64 = jobs.iter().map(|j| j.size).sum();
        let counters = Arc::new(ProgressCounters::new(total_bytes));
        self.observer.on_event(&TransferEvent::RunStarted {
            dataset: dataset.to_string(),
            total_bytes,
            total_files: jobs.len() as u64,
        });
        *self.state.lock() = RunState::Running;

        let run_cancel = self.cancel.child_token();
        let scheduler = Arc::new(ChunkScheduler::new(
            Arc::clone(&remote),
            Arc::clone(&pool),
            RetryPolicy::from_config(&self.config),
            Arc::clone(&self.observer),
            Arc::clone(&counters),
            run_cancel.clone(),
            self.config.chunk_size,
            self.config.allow_chunks,
        ));

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let remote = Arc::clone(&remote);
            let scheduler = Arc::clone(&scheduler);
            let observer = Arc::clone(&self.observer);
            let counters = Arc::clone(&counters);
            let run_cancel = run_cancel.clone();
            let dataset = dataset.to_string();
            let enable_checksum = self.config.enable_checksum;
            let buffer_size = self.config.socket_buffer_size;

            handles.push(tokio::spawn(async move {
                let mut job = job;
                job.state = JobState::InProgress;
                let outcome = transfer_job(
                    &remote,
                    &scheduler,
                    observer.as_ref(),
                    &counters,
                    &dataset,
                    &job,
                    enable_checksum,
                    buffer_size,
                )
                .await;
                match outcome {
                    Ok(state) => {
                        job.state = state;
                        (job, None)
                    }
                    Err(e) => {
                        if e.is_fatal() {
                            run_cancel.cancel();
                        }
                        tracing::warn!("Transfer of '{}' failed: {}", job.remote_name, e);
                        observer.on_event(&TransferEvent::LogMessage {
                            message: format!("Transfer of '{}' failed: {}", job.remote_name, e),
                        });
                        job.state = JobState::Failed {
                            code: e.code().to_string(),
                            message: e.to_string(),
                        };
                        (job, Some(e))
                    }
                }
            }));
        }

        *self.state.lock() = RunState::Draining;
        let mut first_failure: Option<(String, String)> = None;
        let mut fatal: Option<EngineError> = None;
        for handle in handles {
            match handle.await {
                Ok((job, error)) => {
                    if let JobState::Failed { code, message } = job.state {
                        if first_failure.is_none() {
                            first_failure = Some((code, message));
                        }
                    }
                    if let Some(e) = error {
                        if e.is_fatal() {
                            // A sibling cancelled by the real fatal
                            // error reports Shutdown; keep the cause,
                            // not the echo.
                            let replace = match &fatal {
                                None => true,
                                Some(EngineError::Shutdown) => {
                                    !matches!(e, EngineError::Shutdown)
                                }
                                Some(_) => false,
                            };
                            if replace {
                                fatal = Some(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Job task panicked: {:?}", e);
                    if first_failure.is_none() {
                        first_failure =
                            Some(("internal".to_string(), format!("Job task panicked: {}", e)));
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return self.abort_fatal(e);
        }

        let terminal = match first_failure {
            None => {
                self.observer.on_event(&TransferEvent::RunSuccess {
                    dataset: dataset.to_string(),
                });
                Terminal::Success
            }
            Some((code, message)) => {
                self.observer.on_event(&TransferEvent::RunFailure {
                    dataset: dataset.to_string(),
                    code,
                    message,
                });
                Terminal::Failure
            }
        };
        *self.state.lock() = RunState::Terminal(terminal);

        Ok(RunReport {
            terminal,
            elapsed: started.elapsed(),
            bytes_transferred: counters.completed_bytes(),
            files_completed: counters.completed_files(),
            files_skipped: counters.skipped_files(),
        })
    }
}

/// Carry one job to a terminal per-job state
#[allow(clippy::too_many_arguments)]
async fn transfer_job(
    remote: &RemoteClient,
    scheduler: &ChunkScheduler,
    observer: &dyn TransferObserver,
    counters: &ProgressCounters,
    dataset: &str,
    job: &TransferJob,
    enable_checksum: bool,
    buffer_size: usize,
) -> Result<JobState> {
    observer.on_event(&TransferEvent::FileStarted {
        name: job.remote_name.clone(),
    });

    match job.direction {
        Direction::Upload => {
            let local_digest = if enable_checksum && job.size > 0 {
                let digest = hash_file(&job.local_path, buffer_size).await?;
                if remote.fetch_digest(dataset, &job.remote_name).await? == Some(digest) {
                    tracing::debug!("'{}' already present with matching digest", job.remote_name);
                    counters.file_skipped();
                    observer.on_event(&TransferEvent::FileSkipped {
                        name: job.remote_name.clone(),
                    });
                    return Ok(JobState::Skipped);
                }
                Some(digest)
            } else {
                None
            };

            scheduler
                .upload(dataset, &job.remote_name, &job.local_path, job.size)
                .await?;

            // The chunk bytes are already counted at this point; a
            // failure past the scheduler must back them out so a
            // failed job contributes nothing to the aggregate tally.
            if let Some(digest) = local_digest {
                if let Err(e) = remote
                    .store_digest(dataset, &job.remote_name, &digest)
                    .await
                {
                    counters.retract_bytes(job.size);
                    return Err(e);
                }
            }
        }
        Direction::Download => {
            let expected: Option<DigestValue> = if enable_checksum {
                remote.fetch_digest(dataset, &job.remote_name).await?
            } else {
                None
            };

            if let Some(expected) = expected {
                if let Ok(meta) = tokio::fs::metadata(&job.local_path).await {
                    if meta.is_file()
                        && meta.len() == job.size
                        && hash_file(&job.local_path, buffer_size).await? == expected
                    {
                        tracing::debug!(
                            "'{}' already on disk with matching digest",
                            job.remote_name
                        );
                        counters.file_skipped();
                        observer.on_event(&TransferEvent::FileSkipped {
                            name: job.remote_name.clone(),
                        });
                        return Ok(JobState::Skipped);
                    }
                }
            }

            scheduler
                .download(dataset, &job.remote_name, &job.local_path, job.size, expected)
                .await?;
        }
    }

    counters.file_completed();
    observer.on_event(&TransferEvent::FileCompleted {
        name: job.remote_name.clone(),
        size: job.size,
    });
    Ok(JobState::Completed)
}

/// Enumerate every regular file under `root`, depth first, in a
/// stable order.
pub async fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await.map_err(|e| {
            EngineError::storage(StorageErrorKind::Io, &dir, format!("Read dir failed: {}", e))
        })?;
        while let Some(entry) = reader.next_entry().await.map_err(|e| {
            EngineError::storage(StorageErrorKind::Io, &dir, format!("Read dir failed: {}", e))
        })? {
            entries.push(entry.path());
        }
        entries.sort();
        for path in entries {
            let meta = tokio::fs::metadata(&path).await.map_err(|e| {
                EngineError::storage(StorageErrorKind::Io, &path, format!("Stat failed: {}", e))
            })?;
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Remote name of a local file, relative to the base directory with
/// forward-slash separators.
fn relative_name(base: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(base).map_err(|_| {
        EngineError::storage(
            StorageErrorKind::Io,
            path,
            "File escapes the base directory".to_string(),
        )
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Local destination of a remote name, refusing traversal outside the
/// base directory.
fn local_path_for(base: &Path, name: &str) -> Result<PathBuf> {
    let mut path = base.to_path_buf();
    for part in name.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(EngineError::invalid_input(
                "remote_name",
                format!("Unsafe remote name '{}'", name),
            ));
        }
        path.push(part);
    }
    Ok(path)
}
