//! End-to-end integrity verification
//!
//! SHA-256 digests computed incrementally as chunk bytes move, so no
//! second pass over the file is needed. Digests are compared
//! byte-for-byte, never string-for-string.

use crate::error::{EngineError, Result, StorageErrorKind};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// A SHA-256 digest value.
///
/// Comparison is over the raw bytes; hex encoding happens only at the
/// wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestValue(pub [u8; 32]);

impl DigestValue {
    /// Hex-encode for the remote tag representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex-encoded digest; `None` for anything malformed
    pub fn parse_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for DigestValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental digest over a file whose chunks complete out of order.
///
/// Bytes are fed with their file offset; in-order bytes stream straight
/// into the hasher, out-of-order chunks are parked until their
/// predecessors arrive. The parked set stays small in practice because
/// connection slots are granted in chunk order.
#[derive(Debug, Default)]
pub struct StreamingDigest {
    inner: Mutex<DigestInner>,
}

#[derive(Debug)]
struct DigestInner {
    hasher: Sha256,
    next_offset: u64,
    pending: BTreeMap<u64, Vec<u8>>,
}

impl Default for DigestInner {
    fn default() -> Self {
        Self {
            hasher: Sha256::new(),
            next_offset: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl StreamingDigest {
    /// New digest state, scoped to one file
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the bytes of one chunk at the given file offset
    pub fn update(&self, offset: u64, data: &[u8]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if offset == inner.next_offset {
            inner.hasher.update(data);
            inner.next_offset += data.len() as u64;
            // Drain any parked successors that are now contiguous.
            while let Some(entry) = inner.pending.first_entry() {
                if *entry.key() != inner.next_offset {
                    break;
                }
                let buf = entry.remove();
                inner.hasher.update(&buf);
                inner.next_offset += buf.len() as u64;
            }
        } else {
            inner.pending.insert(offset, data.to_vec());
        }
    }

    /// Finalize once every chunk has been fed
    pub fn finalize(self) -> DigestValue {
        let mut inner = self.inner.into_inner();
        // Any chunks still parked at this point fold in offset order.
        let pending = std::mem::take(&mut inner.pending);
        for (_, buf) in pending {
            inner.hasher.update(&buf);
        }
        DigestValue(inner.hasher.finalize().into())
    }
}

/// Compute the SHA-256 digest of a whole file.
///
/// Used for upload dedup and for the stored digest tag; downloads hash
/// in-stream via [`StreamingDigest`] instead.
pub async fn hash_file(path: &Path, buffer_size: usize) -> Result<DigestValue> {
    let mut file = File::open(path).await.map_err(|e| {
        EngineError::storage(
            StorageErrorKind::Io,
            path,
            format!("Failed to open file for checksum: {}", e),
        )
    })?;

    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut hasher = Sha256::new();
    loop {
        let n = file.read(&mut buffer).await.map_err(|e| {
            EngineError::storage(
                StorageErrorKind::Io,
                path,
                format!("Failed to read file for checksum: {}", e),
            )
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(DigestValue(hasher.finalize().into()))
}

/// Create an integrity mismatch error for a file
pub fn digest_mismatch_error(name: &str, expected: &DigestValue, actual: &DigestValue) -> EngineError {
    EngineError::Integrity {
        name: name.to_string(),
        expected: expected.to_hex(),
        actual: actual.to_hex(),
    }
}
