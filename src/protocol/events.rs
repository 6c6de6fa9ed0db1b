//! Transfer events
//!
//! Events emitted by the transfer engine to whatever is listening:
//! a console renderer, a UI, or a test recorder. One tagged enum plus a
//! single capability trait; no listener hierarchy.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Events emitted by the transfer engine.
///
/// Exactly one of `RunSuccess`, `RunFailure`, `RunFatal` fires per run,
/// after all per-file events for jobs that were attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferEvent {
    /// Run accepted; totals are known up front
    RunStarted {
        dataset: String,
        total_bytes: u64,
        total_files: u64,
    },
    /// One chunk was acked; `file_complete` marks the file's last chunk
    ChunkTransferred { file_complete: bool, bytes: u64 },
    /// A file's transfer began
    FileStarted { name: String },
    /// A file's transfer finished
    FileCompleted { name: String, size: u64 },
    /// A file was deduplicated against its remote counterpart
    FileSkipped { name: String },
    /// Every job completed or was skipped
    RunSuccess { dataset: String },
    /// At least one job failed recoverably
    RunFailure {
        dataset: String,
        code: String,
        message: String,
    },
    /// The run aborted before or during transfer
    RunFatal { message: String },
    /// Diagnostic message for display
    LogMessage { message: String },
}

impl TransferEvent {
    /// Check if this is a terminal run event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunSuccess { .. } | Self::RunFailure { .. } | Self::RunFatal { .. }
        )
    }
}

/// Capability interface the engine reports through.
///
/// Implementations must tolerate concurrent calls: chunk completions
/// arrive from multiple connections at once.
pub trait TransferObserver: Send + Sync {
    fn on_event(&self, event: &TransferEvent);
}

/// Observer that discards every event
#[derive(Debug, Default)]
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn on_event(&self, _event: &TransferEvent) {}
}

/// Observer that records every event, for tests and debugging
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TransferEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far
    pub fn events(&self) -> Vec<TransferEvent> {
        self.events.lock().clone()
    }

    /// Terminal run events received so far
    pub fn terminal_events(&self) -> Vec<TransferEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.is_terminal())
            .cloned()
            .collect()
    }
}

impl TransferObserver for RecordingObserver {
    fn on_event(&self, event: &TransferEvent) {
        self.events.lock().push(event.clone());
    }
}
