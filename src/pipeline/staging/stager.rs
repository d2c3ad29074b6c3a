//! Artifact Stager: puts an inbound image on local disk for the worker.
//!
//! Every staged file lives in the shared scratch directory under a random
//! `source-*` name and is owned by exactly one [`StagedArtifact`]. The
//! artifact removes its file on [`StagedArtifact::release`] or, failing
//! that, on drop, so a cancelled pipeline never leaks scratch files.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use base64::Engine;
use futures_util::StreamExt;
use regex::Regex;
use tempfile::TempPath;

use super::format::{detect_image_format, ImageFormat};
use super::hash::content_hash;
use super::StagingError;

/// File name prefix for staged inputs. Orphan cleanup only touches these.
pub const STAGED_PREFIX: &str = "source-";

const MB: u64 = 1024 * 1024;

static DATA_URI_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^data:image/[\w.+-]+;base64,").unwrap());

/// How the caller hands us an image.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Raw bytes of an uploaded file.
    Bytes(Vec<u8>),
    /// `data:image/<type>;base64,<payload>`
    DataUri(String),
    /// `http(s)://` location to download from.
    Url(String),
    /// A file already on local disk (copied, never handed to the worker directly).
    File(PathBuf),
}

impl ImageInput {
    /// Classify a caller-supplied image reference string.
    pub fn parse_reference(reference: &str) -> Result<Self, StagingError> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(StagingError::EmptyPayload);
        }
        if trimmed.starts_with("data:") {
            return Ok(Self::DataUri(trimmed.to_string()));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(Self::Url(trimmed.to_string()));
        }
        let shown: String = trimmed.chars().take(40).collect();
        Err(StagingError::UnsupportedSource(shown))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::DataUri(_) => "data_uri",
            Self::Url(_) => "url",
            Self::File(_) => "file",
        }
    }
}

/// Strip the `data:image/...;base64,` prefix and decode the payload.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, StagingError> {
    let prefix = DATA_URI_PREFIX
        .find(uri)
        .ok_or(StagingError::InvalidDataUri)?;
    // Browsers sometimes wrap long payloads; base64 itself never contains whitespace.
    let payload: String = uri[prefix.end()..]
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if payload.is_empty() {
        return Err(StagingError::EmptyPayload);
    }
    Ok(base64::engine::general_purpose::STANDARD.decode(payload)?)
}

pub fn encode_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime_type};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// A staged input image. Dropping it deletes the file.
#[derive(Debug)]
pub struct StagedArtifact {
    path: Option<TempPath>,
    location: PathBuf,
    pub format: ImageFormat,
    pub sha256: String,
    /// The reference persisted as `original_image_ref`.
    pub original_ref: String,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        &self.location
    }

    /// Delete the staged file. Idempotent and infallible: a file that is
    /// already gone is fine, any other failure is logged and swallowed.
    pub fn release(mut self) {
        if let Some(path) = self.path.take() {
            release_temp_path(path);
        }
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            tracing::debug!(path = %self.location.display(), "Staged image released on drop");
            release_temp_path(path);
        }
    }
}

fn release_temp_path(path: TempPath) {
    let location = path.to_path_buf();
    match path.close() {
        Ok(()) => tracing::debug!(path = %location.display(), "Staged image removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %location.display(), "Staged image already removed");
        }
        Err(e) => tracing::warn!(
            path = %location.display(),
            error = %e,
            "Failed to clean up staged image"
        ),
    }
}

/// Best-effort delete of a scratch path. Returns whether a file was removed.
pub fn release_path(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to clean up staged image");
            false
        }
    }
}

/// Remove `source-*` leftovers of crashed runs.
///
/// The scratch directory is shared with other processes, so only files last
/// modified at least `older_than` ago are touched. Live invocations must
/// finish with their staged file well within that age.
pub fn cleanup_orphaned_staging(scratch_dir: &Path, older_than: Duration) -> usize {
    let entries = match std::fs::read_dir(scratch_dir) {
        Ok(e) => e,
        Err(_) => return 0, // Scratch dir may not exist yet
    };

    let now = SystemTime::now();
    let mut count = 0;
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(STAGED_PREFIX) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        // Unreadable or future mtimes count as fresh.
        let stale = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= older_than);
        if stale && release_path(&entry.path()) {
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!(
            files_cleaned = count,
            dir = %scratch_dir.display(),
            "Cleaned orphaned staging files from previous run"
        );
    }
    count
}

/// Writes inbound images to the scratch directory.
pub struct Stager {
    scratch_dir: PathBuf,
    max_bytes: u64,
    http: reqwest::Client,
}

impl Stager {
    pub fn new(
        scratch_dir: impl Into<PathBuf>,
        max_bytes: u64,
        download_timeout: Duration,
    ) -> Result<Self, StagingError> {
        let http = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()?;
        Ok(Self::with_client(scratch_dir, max_bytes, http))
    }

    pub fn with_client(scratch_dir: impl Into<PathBuf>, max_bytes: u64, http: reqwest::Client) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            max_bytes,
            http,
        }
    }

    /// Resolve the input to bytes, validate it, and write it to a fresh
    /// scratch file.
    pub async fn stage(&self, input: ImageInput) -> Result<StagedArtifact, StagingError> {
        let (bytes, original_ref) = match input {
            ImageInput::Bytes(bytes) => (bytes, None),
            ImageInput::DataUri(uri) => (decode_data_uri(&uri)?, Some(uri)),
            ImageInput::Url(url) => (self.download(&url).await?, Some(url)),
            ImageInput::File(path) => {
                self.check_size(tokio::fs::metadata(&path).await?.len())?;
                (tokio::fs::read(&path).await?, None)
            }
        };

        if bytes.is_empty() {
            return Err(StagingError::EmptyPayload);
        }
        self.check_size(bytes.len() as u64)?;
        let format = detect_image_format(&bytes).ok_or(StagingError::NotAnImage)?;

        let sha256 = content_hash(&bytes);
        let original_ref =
            original_ref.unwrap_or_else(|| encode_data_uri(format.mime_type(), &bytes));
        let size_bytes = bytes.len();

        let dir = self.scratch_dir.clone();
        let path = tokio::task::spawn_blocking(move || write_scratch_file(&dir, format, &bytes))
            .await
            .map_err(|e| StagingError::Task(e.to_string()))??;

        tracing::debug!(
            path = %path.display(),
            size = size_bytes,
            mime = format.mime_type(),
            "Image staged"
        );

        Ok(StagedArtifact {
            location: path.to_path_buf(),
            path: Some(path),
            format,
            sha256,
            original_ref,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, StagingError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StagingError::DownloadStatus(status.as_u16()));
        }
        if let Some(len) = response.content_length() {
            self.check_size(len)?;
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
            self.check_size(body.len() as u64)?;
        }
        Ok(body)
    }

    fn check_size(&self, size: u64) -> Result<(), StagingError> {
        if size > self.max_bytes {
            return Err(StagingError::TooLarge {
                size_mb: size as f64 / MB as f64,
                max_mb: self.max_bytes / MB,
            });
        }
        Ok(())
    }
}

fn write_scratch_file(dir: &Path, format: ImageFormat, bytes: &[u8]) -> Result<TempPath, StagingError> {
    std::fs::create_dir_all(dir)?;
    let suffix = format!(".{}", format.extension());
    let mut file = tempfile::Builder::new()
        .prefix(STAGED_PREFIX)
        .suffix(&suffix)
        .rand_bytes(16)
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file.into_temp_path())
}
