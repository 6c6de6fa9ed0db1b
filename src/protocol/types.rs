//! Core protocol types
//!
//! Jobs, chunks and the run state machine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Direction of a transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local file pushed to the remote dataset
    Upload,
    /// Remote file pulled into the output directory
    Download,
}

/// Current state of a transfer job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to start
    Queued,
    /// Chunks are being transferred
    InProgress,
    /// All chunks acked and, if enabled, digest verified
    Completed,
    /// Remote counterpart already matches; no bytes moved
    Skipped,
    /// Failed with a machine-checkable code
    Failed { code: String, message: String },
}

impl JobState {
    /// Check if the job reached a terminal per-job state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed { .. })
    }
}

/// One file's end-to-end transfer, composed of one or more chunks.
///
/// Owned by the coordinator for the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJob {
    /// Local path (source for upload, destination for download)
    pub local_path: PathBuf,
    /// Remote name relative to the dataset (forward slashes)
    pub remote_name: String,
    /// Total size in bytes, known before the job starts
    pub size: u64,
    /// Transfer direction
    pub direction: Direction,
    /// Current state
    pub state: JobState,
}

/// State of a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// Not yet dispatched
    Pending,
    /// A connection slot is held and I/O is in progress
    InFlight,
    /// Transferred and acknowledged by the remote
    Acked,
    /// Retry budget exhausted
    Failed,
}

/// A contiguous byte range of a transfer job.
///
/// Chunk sets are recomputed each time a job starts; they are never
/// persisted across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Position within the file's chunk sequence
    pub index: usize,
    /// Byte offset of the range start
    pub offset: u64,
    /// Length of the range; zero only for a zero-byte file
    pub length: u64,
    /// Current state
    pub state: ChunkState,
    /// Transfer attempts so far
    pub attempts: u32,
}

impl Chunk {
    /// Exclusive end offset of the range
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Aggregate byte and file counters shared across all concurrently
/// running chunk transfers of one run.
///
/// Chunk completions land concurrently from different connections, so
/// every increment is atomic. A failed job's partial bytes are backed
/// out so the final tally equals the sum of completed job sizes.
#[derive(Debug)]
pub struct ProgressCounters {
    total_bytes: u64,
    completed_bytes: AtomicU64,
    completed_files: AtomicU64,
    skipped_files: AtomicU64,
}

impl ProgressCounters {
    /// Create counters for a run with a known total byte count
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            completed_bytes: AtomicU64::new(0),
            completed_files: AtomicU64::new(0),
            skipped_files: AtomicU64::new(0),
        }
    }

    /// Declared total bytes of the job set
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Record bytes moved by one acked chunk
    pub fn add_bytes(&self, bytes: u64) {
        self.completed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Back out a failed job's partial progress
    pub fn retract_bytes(&self, bytes: u64) {
        self.completed_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Record a job reaching `Completed`
    pub fn file_completed(&self) {
        self.completed_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching `Skipped`
    pub fn file_skipped(&self) {
        self.skipped_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Aggregate completed bytes so far
    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes.load(Ordering::Relaxed)
    }

    /// Number of jobs completed so far
    pub fn completed_files(&self) -> u64 {
        self.completed_files.load(Ordering::Relaxed)
    }

    /// Number of jobs skipped so far
    pub fn skipped_files(&self) -> u64 {
        self.skipped_files.load(Ordering::Relaxed)
    }
}

/// Run state machine of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// No run in progress
    Idle,
    /// Exchanging credentials for a session
    Authenticating,
    /// Jobs are feeding chunks into the pool
    Running,
    /// Waiting for every started job to reach a terminal state
    Draining,
    /// Run finished
    Terminal(Terminal),
}

/// Terminal outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminal {
    /// Every job completed or was skipped
    Success,
    /// At least one job failed for a recoverable reason
    Failure,
    /// Authentication or setup aborted the run early
    Fatal,
}

/// Summary returned to the caller when a run finishes
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Terminal outcome
    pub terminal: Terminal,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
    /// Actual bytes moved by completed jobs
    pub bytes_transferred: u64,
    /// Jobs that reached `Completed`
    pub files_completed: u64,
    /// Jobs that reached `Skipped`
    pub files_skipped: u64,
}

impl RunReport {
    /// Average transfer rate in bytes per second
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}
