//! Protocol types for tagsync
//!
//! This module contains all types that cross the engine boundary:
//! - Events emitted to progress observers
//! - Job, chunk and progress state
//!
//! These types are designed for serialization and can be used for IPC,
//! RPC, or any message-passing interface.

mod events;
mod types;

// Re-export all protocol types
pub use events::{NullObserver, RecordingObserver, TransferEvent, TransferObserver};
pub use types::{
    Chunk, ChunkState, Direction, JobState, ProgressCounters, RunReport, RunState, Terminal,
    TransferJob,
};
