//! HTTP transport for the transfer engine
//!
//! This module talks to the remote tagging/storage service:
//! - session login and cookie handling
//! - dataset listing resolution
//! - chunk-addressable upload (`Content-Range` PUT) and download
//!   (`Range` GET)
//! - stored digest tags for end-to-end verification and dedup

pub mod checksum;
pub mod chunk;
pub mod pool;
pub mod session;

pub use checksum::{hash_file, DigestValue, StreamingDigest};
pub use chunk::{plan_chunks, ChunkScheduler};
pub use pool::{ConnectionPool, ConnectionSlot, RetryPolicy};
pub use session::{authenticate, SessionCredential};

use crate::error::{EngineError, Result};
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_RANGE, CONTENT_TYPE, COOKIE, RANGE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use url::Url;

/// One member file of a remote dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Name relative to the dataset (forward slashes)
    pub name: String,
    /// Size in bytes
    pub bytes: u64,
}

/// Wire shape of one listing entry; `bytes` is null for non-file
/// subjects, which are not transferable.
#[derive(Debug, Deserialize)]
struct ListingEntry {
    name: String,
    bytes: Option<u64>,
}

/// Client for the remote tagging/storage service.
///
/// Wraps the base URL, the connection pool's HTTP client and the
/// session credential. The credential is written once at login and
/// read-only afterwards.
pub struct RemoteClient {
    base: Url,
    client: reqwest::Client,
    credential: RwLock<Option<SessionCredential>>,
}

impl RemoteClient {
    /// Create a client for the service rooted at `base`
    pub fn new(base: Url, client: reqwest::Client) -> Result<Self> {
        if base.cannot_be_a_base() {
            return Err(EngineError::invalid_input(
                "base_url",
                format!("Not a usable base URL: {}", base),
            ));
        }
        // Joins below rely on a trailing slash.
        let mut base = base;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            client,
            credential: RwLock::new(None),
        })
    }

    /// The login endpoint is a sibling of the service root
    fn login_url(&self) -> Result<Url> {
        Ok(self.base.join("../webauthn/login")?)
    }

    /// Authenticate and store the session credential
    pub async fn login(&self, user: &str, password: &str) -> Result<()> {
        let url = self.login_url()?;
        let credential = session::authenticate(&self.client, &url, user, password).await?;
        *self.credential.write() = Some(credential);
        Ok(())
    }

    /// Build a request with the session cookie attached
    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(ref credential) = *self.credential.read() {
            request = request.header(COOKIE, credential.header_value());
        }
        request
    }

    fn file_url(&self, dataset: &str, name: &str) -> Result<Url> {
        Ok(self.base.join(&format!(
            "file/{}/{}",
            urlencoding::encode(dataset),
            encode_name(name)
        ))?)
    }

    fn digest_url(&self, dataset: &str, name: &str) -> Result<Url> {
        Ok(self.base.join(&format!(
            "tags/{}/{}/sha256",
            urlencoding::encode(dataset),
            encode_name(name)
        ))?)
    }

    fn listing_url(&self, dataset: &str) -> Result<Url> {
        Ok(self
            .base
            .join(&format!("dataset/{}", urlencoding::encode(dataset)))?)
    }

    /// Resolve a dataset identifier into its member files and sizes.
    ///
    /// Entries with a null byte count are non-file subjects (tag
    /// definitions and the like) and are dropped.
    pub async fn list_dataset(&self, dataset: &str) -> Result<Vec<RemoteFile>> {
        let url = self.listing_url(dataset)?;
        let response = self
            .request(Method::GET, url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(
                status.as_u16(),
                format!("Dataset listing failed for '{}'", dataset),
            ));
        }

        let entries: Vec<ListingEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| e.bytes.map(|bytes| RemoteFile { name: e.name, bytes }))
            .collect())
    }

    /// Fetch the stored digest tag of a remote file.
    ///
    /// Absent or malformed tags yield `None`, which simply disables
    /// dedup for that file.
    pub async fn fetch_digest(&self, dataset: &str, name: &str) -> Result<Option<DigestValue>> {
        let url = self.digest_url(dataset, name)?;
        let response = self.request(Method::GET, url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(EngineError::from_status(
                status.as_u16(),
                format!("Digest lookup failed for '{}'", name),
            ));
        }

        let text = response.text().await?;
        let parsed = DigestValue::parse_hex(&text);
        if parsed.is_none() {
            tracing::warn!("Malformed digest tag for '{}': {:?}", name, text);
        }
        Ok(parsed)
    }

    /// Store the digest tag of an uploaded file
    pub async fn store_digest(
        &self,
        dataset: &str,
        name: &str,
        digest: &DigestValue,
    ) -> Result<()> {
        let url = self.digest_url(dataset, name)?;
        let response = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, "text/plain")
            .body(digest.to_hex())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(
                status.as_u16(),
                format!("Digest store failed for '{}'", name),
            ));
        }
        Ok(())
    }

    /// Upload one chunk as a byte-range PUT
    pub async fn upload_chunk(
        &self,
        dataset: &str,
        name: &str,
        offset: u64,
        total_size: u64,
        body: Vec<u8>,
    ) -> Result<()> {
        let url = self.file_url(dataset, name)?;
        let last = offset + body.len() as u64 - 1;
        let response = self
            .request(Method::PUT, url)
            .header(
                CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, last, total_size),
            )
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(
                status.as_u16(),
                format!("Chunk upload rejected for '{}' at offset {}", name, offset),
            ));
        }
        Ok(())
    }

    /// Request one chunk as a ranged GET.
    ///
    /// Returns the raw response; the scheduler streams the body into
    /// place. A 200 answer is only acceptable for a range starting at
    /// zero, otherwise the server ignored the range request.
    pub async fn download_chunk(
        &self,
        dataset: &str,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Response> {
        let url = self.file_url(dataset, name)?;
        let last = offset + length.max(1) - 1;
        let response = self
            .request(Method::GET, url)
            .header(RANGE, format!("bytes={}-{}", offset, last))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK && offset > 0 {
            return Err(EngineError::protocol(
                200,
                format!("Server ignored range request for '{}' at offset {}", name, offset),
            ));
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(EngineError::from_status(
                status.as_u16(),
                format!(
                    "Chunk download rejected for '{}' at offset {}",
                    name, offset
                ),
            ));
        }
        Ok(response)
    }
}

/// Percent-encode a remote name, preserving its path separators
fn encode_name(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
