//! # tagsync
//!
//! A chunked, parallel file transfer engine for tag-based storage
//! services.
//!
//! ## Features
//!
//! - **Chunked transfers**: Large files move as fixed-size chunks over
//!   a bounded pool of concurrent connections
//! - **Uploads and downloads**: Whole datasets in either direction,
//!   with byte-range PUT and GET
//! - **Integrity**: Optional SHA-256 verification and digest-based
//!   deduplication against the remote
//! - **Resilient**: Per-chunk retry with exponential backoff
//! - **Async**: Built on Tokio for efficient concurrent transfers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tagsync::{EngineConfig, NullObserver, TransferCoordinator};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new()
//!         .base_dir("/data/study-42")
//!         .max_connections(4)
//!         .enable_checksum(true);
//!     let coordinator = TransferCoordinator::new(config, Arc::new(NullObserver))?;
//!
//!     let service = Url::parse("https://tags.example.org/tagfiler/")?;
//!     let report = coordinator
//!         .upload(service, "study-42", "alice", "secret")
//!         .await?;
//!     println!("{} bytes in {:?}", report.bytes_transferred, report.elapsed);
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod protocol;

// Re-exports for convenience
pub use config::{EngineConfig, HttpConfig, DEFAULT_CHUNK_SIZE, DEFAULT_SOCKET_BUFFER_SIZE};
pub use coordinator::TransferCoordinator;
pub use error::{EngineError, NetworkErrorKind, Result, StorageErrorKind};
pub use protocol::{
    Chunk, ChunkState, Direction, JobState, NullObserver, ProgressCounters, RecordingObserver,
    RunReport, RunState, Terminal, TransferEvent, TransferJob, TransferObserver,
};

// HTTP module exports
pub use http::{
    hash_file, plan_chunks, ConnectionPool, DigestValue, RemoteClient, RemoteFile, RetryPolicy,
    StreamingDigest,
};
