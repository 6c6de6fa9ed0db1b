//! Engine configuration
//!
//! This module contains all configuration options for the transfer engine.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default socket buffer size
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 8192;

/// Main configuration for the transfer engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent in-flight network operations across the whole
    /// engine, regardless of how many files are being transferred
    pub max_connections: usize,

    /// Read buffer size for whole-file digest computation; chunk
    /// bodies travel as single in-memory buffers of `chunk_size`
    pub socket_buffer_size: usize,

    /// Chunk size in bytes for splitting files
    pub chunk_size: u64,

    /// Whether to split files into chunks at all; disabled means each
    /// file travels as a single chunk
    pub allow_chunks: bool,

    /// Whether to verify SHA-256 digests end to end
    pub enable_checksum: bool,

    /// Base directory: relative remote names are computed against it on
    /// upload, and downloaded files are written under it
    pub base_dir: PathBuf,

    /// HTTP configuration
    pub http: HttpConfig,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Retry attempts per chunk before the chunk is marked failed
    pub max_retries: usize,

    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    pub max_retry_delay_ms: u64,

    /// Whether to accept invalid TLS certificates (dangerous!)
    pub accept_invalid_certs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            allow_chunks: true,
            enable_checksum: false,
            base_dir: PathBuf::from("."),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30000,
            accept_invalid_certs: false,
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the socket buffer size
    pub fn socket_buffer_size(mut self, size: usize) -> Self {
        self.socket_buffer_size = size;
        self
    }

    /// Set the chunk size
    pub fn chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size;
        self
    }

    /// Enable or disable chunking
    pub fn allow_chunks(mut self, allow: bool) -> Self {
        self.allow_chunks = allow;
        self
    }

    /// Enable or disable end-to-end checksum verification
    pub fn enable_checksum(mut self, enable: bool) -> Self {
        self.enable_checksum = enable;
        self
    }

    /// Set the base directory
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_dir = path.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(EngineError::invalid_input(
                "max_connections",
                "Must be at least 1",
            ));
        }

        if self.chunk_size == 0 {
            return Err(EngineError::invalid_input(
                "chunk_size",
                "Must be at least 1 byte",
            ));
        }

        if self.socket_buffer_size == 0 {
            return Err(EngineError::invalid_input(
                "socket_buffer_size",
                "Must be at least 1 byte",
            ));
        }

        if !self.base_dir.exists() {
            return Err(EngineError::invalid_input(
                "base_dir",
                format!("Directory does not exist: {:?}", self.base_dir),
            ));
        }

        if !self.base_dir.is_dir() {
            return Err(EngineError::invalid_input(
                "base_dir",
                format!("Path is not a directory: {:?}", self.base_dir),
            ));
        }

        Ok(())
    }
}
