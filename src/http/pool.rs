//! Connection pool
//!
//! Bounds the number of concurrent in-flight network operations across
//! the whole engine with a semaphore, and owns the shared HTTP client.
//! Concurrency is a property of the engine, not per file: chunks of
//! every job compete for the same slot budget.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Connection pool with a global slot budget
pub struct ConnectionPool {
    /// HTTP client (reqwest handles its own socket reuse)
    client: reqwest::Client,
    /// Slot semaphore; permits == configured maximum connections
    slots: Arc<Semaphore>,
    /// Configured maximum, minimum 1
    max_connections: usize,
    /// In-flight operation gauge
    active: Arc<AtomicU64>,
}

/// A permit for one in-flight network operation.
///
/// The slot is released on drop, so it cannot leak on any exit path.
pub struct ConnectionSlot {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicU64>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ConnectionPool {
    /// Create a new connection pool from the engine configuration
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let max_connections = config.max_connections.max(1);

        // Redirects are handled explicitly: the login endpoint answers
        // with a redirect status that must stay visible.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.http.connect_timeout))
            .read_timeout(Duration::from_secs(config.http.read_timeout))
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.http.accept_invalid_certs)
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            active: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Configured maximum concurrent connections
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Acquire a connection slot, suspending until one is free.
    ///
    /// Permits are granted in request order, which keeps chunk
    /// completion skew small.
    pub async fn acquire(&self) -> Result<ConnectionSlot> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)?;
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(ConnectionSlot {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Current number of in-flight operations
    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Retry policy with exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts per chunk
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            jitter_factor: 0.25,
        }
    }

    /// Derive the policy from the engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.http.max_retries.max(1) as u32,
            config.http.retry_delay_ms,
            config.http.max_retry_delay_ms,
        )
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Exponential backoff
        let base = self.initial_delay_ms * 2u64.pow(attempt.min(10));
        let capped = base.min(self.max_delay_ms);

        // Jitter of +/- jitter_factor
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        let with_jitter = (capped as f64 * (1.0 + jitter)) as u64;

        Duration::from_millis(with_jitter)
    }

    /// Check whether another attempt should follow a failure, given
    /// the number of attempts already made
    pub fn should_retry(&self, attempts: u32, error: &EngineError) -> bool {
        if attempts >= self.max_attempts {
            return false;
        }
        error.is_retryable()
    }
}
