//! Chunked file upload and download pipelines.
//!
//! ## Upload
//! [`Client::upload_file`] reads the source into memory, declares the
//! transfer over RPC to obtain a [`TransferDescriptor`], then posts the
//! buffer to the upload endpoint part by part. The final part's receipt
//! becomes the returned [`TransferResult`].
//!
//! ## Download
//! [`Client::download_file`] resolves the storage host for a datacenter from
//! the injected [`crate::StorageMap`] and issues ranged fetches until the
//! window has covered the object. A failed range is skipped and logged, so
//! the result can come back shorter than the expected size — callers compare
//! lengths before trusting the bytes.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::sleep;

use crate::Client;
use crate::envelope::SendOptions;
use crate::errors::{DownloadError, RequestError, UploadError};
use crate::retry::{RetryContext, RetryPolicy};

// ─── Constants ────────────────────────────────────────────────────────────────

/// Default chunk size for uploads (2 MiB).
pub const UPLOAD_CHUNK_SIZE: usize = 2 * 1024 * 1024;
/// Default chunk size for downloads (128 KiB).
pub const DOWNLOAD_CHUNK_SIZE: u64 = 128 * 1024;

// ─── Callbacks ────────────────────────────────────────────────────────────────

/// Upload progress callback: `(total_bytes, bytes_sent)`. Returning
/// `ControlFlow::Break(())` cancels the transfer; the pipeline then stops
/// posting parts and returns no result.
pub type UploadProgress = Arc<dyn Fn(u64, u64) -> ControlFlow<()> + Send + Sync>;

/// Download progress callback: `(total_bytes, bytes_received)`. Observation
/// only — downloads expose no cancellation path.
pub type DownloadProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

// ─── UploadSource ─────────────────────────────────────────────────────────────

/// Where upload bytes come from.
#[derive(Clone, Debug)]
pub enum UploadSource {
    /// Read the whole file at this path into memory.
    Path(PathBuf),
    /// Use the buffer as-is.
    Bytes(Vec<u8>),
}

impl From<PathBuf> for UploadSource {
    fn from(p: PathBuf) -> Self { Self::Path(p) }
}

impl From<&Path> for UploadSource {
    fn from(p: &Path) -> Self { Self::Path(p.to_path_buf()) }
}

impl From<Vec<u8>> for UploadSource {
    fn from(b: Vec<u8>) -> Self { Self::Bytes(b) }
}

impl From<&[u8]> for UploadSource {
    fn from(b: &[u8]) -> Self { Self::Bytes(b.to_vec()) }
}

// ─── Transfer types ───────────────────────────────────────────────────────────

/// Server-issued metadata for one upload, returned by the transfer RPC and
/// consumed for the lifetime of that single transfer.
#[derive(Clone, Debug, Deserialize)]
pub struct TransferDescriptor {
    /// File identifier assigned by the server.
    pub id:               String,
    /// Datacenter that will store the file.
    pub dc_id:            String,
    /// URL the parts are posted to.
    pub upload_url:       String,
    /// Capability token authorizing the part posts.
    pub access_hash_send: String,
}

/// The artifact of a completed upload, built from the final part's receipt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferResult {
    pub mime:            String,
    pub size:            u64,
    pub dc_id:           String,
    pub file_id:         String,
    pub file_name:       String,
    pub access_hash_rec: String,
}

#[derive(Debug, Deserialize)]
struct PartReply {
    status:     String,
    status_det: Option<String>,
    data:       Option<PartReceipt>,
}

#[derive(Debug, Deserialize)]
struct PartReceipt {
    access_hash_rec: Option<String>,
}

// ─── Upload ───────────────────────────────────────────────────────────────────

impl Client {
    /// Upload a file in parts.
    ///
    /// Returns `Ok(None)` when the progress callback cancelled the transfer;
    /// any other non-success outcome is a typed [`UploadError`].
    ///
    /// The part count is `size / chunk_size + 1`, matching the wire protocol:
    /// when the size is an exact multiple of the chunk size the final part is
    /// empty, and the server still expects it.
    pub async fn upload_file(
        &self,
        source: impl Into<UploadSource>,
        mime: Option<&str>,
        file_name: Option<&str>,
        chunk_size: usize,
        on_progress: Option<UploadProgress>,
    ) -> Result<Option<TransferResult>, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidInput("chunk_size must be non-zero".into()));
        }

        let (bytes, derived_name) = match source.into() {
            UploadSource::Path(path) => {
                if !path.is_file() {
                    return Err(UploadError::InvalidInput(format!(
                        "no file at {}",
                        path.display()
                    )));
                }
                let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| UploadError::InvalidInput(e.to_string()))?;
                (bytes, name)
            }
            UploadSource::Bytes(bytes) => (bytes, None),
        };

        let file_name = file_name
            .map(str::to_owned)
            .or(derived_name)
            .ok_or(UploadError::MissingName)?;
        let mime = mime.map(str::to_owned).unwrap_or_else(|| guess_mime(&file_name));
        let size = bytes.len() as u64;

        let reply = self
            .send(
                "requestSendFile",
                json!({ "file_name": file_name, "size": size, "mime": mime }),
                SendOptions::default(),
            )
            .await?;
        let descriptor: TransferDescriptor =
            serde_json::from_value(reply.get("data").cloned().unwrap_or(Value::Null)).map_err(
                |e| UploadError::Request(RequestError::BadResponse(format!(
                    "transfer descriptor: {e}"
                ))),
            )?;

        let total_parts = size / chunk_size as u64 + 1;
        tracing::info!(
            file = %file_name,
            size,
            parts = total_parts,
            dc = %descriptor.dc_id,
            "upload: starting",
        );

        let mut last_reply = None;
        for part in 0..total_parts {
            let start = (part as usize).saturating_mul(chunk_size);
            let end = start.saturating_add(chunk_size).min(bytes.len());
            let chunk = if start < bytes.len() { &bytes[start..end] } else { &[][..] };

            let reply = self.post_part(&descriptor, part, total_parts, chunk).await?;
            if reply.status != "OK" {
                return Err(UploadError::Rejected {
                    status: reply.status,
                    detail: reply.status_det,
                });
            }
            tracing::debug!(part = part + 1, total = total_parts, "upload: part stored");

            if let Some(callback) = &on_progress {
                let sent = ((part + 1) * chunk_size as u64).min(size);
                if callback(size, sent).is_break() {
                    tracing::info!(file = %file_name, "upload: cancelled by caller");
                    return Ok(None);
                }
            }
            last_reply = Some(reply);
        }

        let bad = |what: &str| {
            UploadError::Request(RequestError::BadResponse(what.to_string()))
        };
        let reply = last_reply.ok_or_else(|| bad("no parts were posted"))?;
        if reply.status_det.as_deref() != Some("OK") {
            return Err(UploadError::Rejected {
                status: reply.status,
                detail: reply.status_det,
            });
        }
        let access_hash_rec = reply
            .data
            .and_then(|d| d.access_hash_rec)
            .ok_or_else(|| bad("final part carried no access_hash_rec"))?;

        tracing::info!(file = %file_name, size, "upload: complete");
        Ok(Some(TransferResult {
            mime,
            size,
            dc_id: descriptor.dc_id,
            file_id: descriptor.id,
            file_name,
            access_hash_rec,
        }))
    }

    /// Post one part, retrying the same index under the per-part budget for
    /// anything except an explicit rejection by the server.
    async fn post_part(
        &self,
        descriptor: &TransferDescriptor,
        part: u64,
        total_parts: u64,
        chunk: &[u8],
    ) -> Result<PartReply, UploadError> {
        let headers = vec![
            ("auth".to_string(), self.inner.auth.clone()),
            ("file-id".to_string(), descriptor.id.clone()),
            ("total-part".to_string(), total_parts.to_string()),
            ("part-number".to_string(), (part + 1).to_string()),
            ("chunk-size".to_string(), chunk.len().to_string()),
            ("access-hash-send".to_string(), descriptor.access_hash_send.clone()),
        ];

        let mut fail_count   = NonZeroU32::new(1).unwrap();
        let mut slept_so_far = Duration::default();
        loop {
            let err = match self
                .inner
                .http
                .post(&descriptor.upload_url, &headers, chunk.to_vec())
                .await
            {
                Ok(resp) if resp.is_success() => {
                    match serde_json::from_slice::<PartReply>(&resp.body) {
                        Ok(reply) => return Ok(reply),
                        Err(e) => RequestError::BadResponse(e.to_string()),
                    }
                }
                Ok(resp) => RequestError::Status(resp.status),
                Err(e) => RequestError::Transport(e),
            };

            let ctx = RetryContext { fail_count, slept_so_far };
            match self.inner.part_retry.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    tracing::warn!(
                        part = part + 1,
                        attempt = fail_count.get(),
                        error = %err,
                        "upload: part failed — retrying same part",
                    );
                    sleep(delay).await;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => {
                    return Err(UploadError::GaveUp {
                        part:     part + 1,
                        attempts: fail_count.get(),
                    });
                }
            }
        }
    }
}

// ─── Download ─────────────────────────────────────────────────────────────────

impl Client {
    /// Download a file with ranged fetches from its datacenter's storage
    /// host.
    ///
    /// A range that fails is skipped — logged, window advanced — so the
    /// returned buffer may be shorter than `size`. Compare lengths before
    /// trusting the result.
    pub async fn download_file(
        &self,
        dc_id: &str,
        file_id: &str,
        access_hash: &str,
        size: u64,
        chunk_size: u64,
        on_progress: Option<DownloadProgress>,
    ) -> Result<Vec<u8>, DownloadError> {
        if chunk_size == 0 {
            return Err(DownloadError::Request(RequestError::InvalidInput(
                "chunk_size must be non-zero".into(),
            )));
        }
        let host = self
            .inner
            .storage_map
            .host(dc_id)
            .ok_or_else(|| DownloadError::UnknownDatacenter(dc_id.to_string()))?
            .to_string();
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut result = Vec::with_capacity(size as usize);
        let mut start: u64 = 0;
        while start < size && (result.len() as u64) < size {
            let last = (start + chunk_size - 1).min(size - 1);
            let headers = vec![
                ("auth".to_string(), self.inner.auth.clone()),
                ("access-hash-rec".to_string(), access_hash.to_string()),
                ("file-id".to_string(), file_id.to_string()),
                ("user-agent".to_string(), self.inner.user_agent.clone()),
                ("start-index".to_string(), start.to_string()),
                ("last-index".to_string(), last.to_string()),
            ];

            match self.inner.http.post(&host, &headers, Vec::new()).await {
                Ok(resp) if resp.is_success() && !resp.body.is_empty() => {
                    result.extend_from_slice(&resp.body);
                    if let Some(callback) = &on_progress {
                        callback(size, result.len() as u64);
                    }
                }
                Ok(resp) => {
                    tracing::warn!(
                        status = resp.status,
                        start,
                        last,
                        "download: range skipped",
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, start, last, "download: range failed — skipped");
                }
            }
            start = last + 1;
        }

        if (result.len() as u64) < size {
            tracing::warn!(
                expected = size,
                received = result.len() as u64,
                "download: result shorter than expected",
            );
        }
        Ok(result)
    }
}

fn guess_mime(file_name: &str) -> String {
    if let Some(mime) = mime_guess::from_path(file_name).first_raw() {
        return mime.to_string();
    }
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}
