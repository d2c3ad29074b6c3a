//! Pipeline Orchestrator: stage → worker → parse → persist → cleanup.
//!
//! The only component callers talk to. Engines are injected behind traits
//! (`RedactionWorker`, `PreviewStore`) so the whole flow is testable with
//! in-process fakes. Internal errors are logged here once and reduced to a
//! [`PreviewError`] carrying nothing but a [`PreviewErrorKind`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use uuid::Uuid;

use crate::config::{ConfigError, PipelineConfig};
use crate::db::DatabaseError;
use crate::models::{ConsumedPreview, ImageVariant, NewPreview, Preview, PreviewOutcome, RedactedImages};
use crate::pipeline::protocol::{self, ProtocolError};
use crate::pipeline::staging::{cleanup_orphaned_staging, ImageInput, StagedArtifact, Stager, StagingError};
use crate::pipeline::store::{ConsumeError, PreviewStore, SqlitePreviewStore};
use crate::pipeline::worker::{excerpt_tail, ProcessWorker, RedactionWorker, WorkerError};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Caller-visible failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreviewErrorKind {
    InvalidInput,
    StagingFailed,
    WorkerFailed,
    MalformedOutput,
    PersistFailed,
}

impl PreviewErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::StagingFailed => "STAGING_FAILED",
            Self::WorkerFailed => "WORKER_FAILED",
            Self::MalformedOutput => "MALFORMED_OUTPUT",
            Self::PersistFailed => "PERSIST_FAILED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidInput => "The image could not be read. Please upload a JPEG or PNG photo.",
            Self::StagingFailed => "The image could not be prepared for processing.",
            Self::WorkerFailed => "Image processing failed. Please try again.",
            Self::MalformedOutput => "Image processing returned an unexpected result.",
            Self::PersistFailed => "The processed image could not be saved.",
        }
    }
}

/// Boundary error. `Display` is a fixed message safe to show a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreviewError {
    pub kind: PreviewErrorKind,
}

impl fmt::Display for PreviewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.message())
    }
}

impl std::error::Error for PreviewError {}

/// Internal aggregate of every stage failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("Worker failed: {0}")]
    Worker(#[from] WorkerError),

    #[error("Malformed worker output: {0}")]
    MalformedOutput(#[from] ProtocolError),

    #[error("Persist failed: {0}")]
    Persist(#[from] DatabaseError),
}

impl PipelineError {
    pub fn kind(&self) -> PreviewErrorKind {
        match self {
            Self::Staging(e) if e.is_invalid_input() => PreviewErrorKind::InvalidInput,
            Self::Staging(_) => PreviewErrorKind::StagingFailed,
            Self::Worker(_) => PreviewErrorKind::WorkerFailed,
            Self::MalformedOutput(_) => PreviewErrorKind::MalformedOutput,
            Self::Persist(_) => PreviewErrorKind::PersistFailed,
        }
    }
}

/// Failure while assembling a pipeline from configuration.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot open preview store: {0}")]
    Store(#[from] DatabaseError),

    #[error("Cannot build image stager: {0}")]
    Stager(#[from] StagingError),
}

/// Progress of one invocation. Failures jump straight to `CleanedUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Staged,
    WorkerInvoked,
    ParsedOutput,
    Persisted,
    CleanedUp,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct PreviewPipeline {
    config: PipelineConfig,
    stager: Stager,
    worker: Arc<dyn RedactionWorker>,
    store: Arc<dyn PreviewStore>,
    permits: Arc<Semaphore>,
}

impl PreviewPipeline {
    pub fn new(
        config: PipelineConfig,
        worker: Arc<dyn RedactionWorker>,
        store: Arc<dyn PreviewStore>,
    ) -> Result<Self, OpenError> {
        config.validate()?;
        let stager = Stager::new(
            config.scratch_dir.clone(),
            config.max_image_bytes,
            config.download_timeout,
        )?;
        let permits = Arc::new(Semaphore::new(config.worker.max_concurrent));
        Ok(Self {
            config,
            stager,
            worker,
            store,
            permits,
        })
    }

    /// Production wiring: SQLite store and process worker.
    pub fn open(config: PipelineConfig) -> Result<Self, OpenError> {
        config.validate()?;
        let store = Arc::new(SqlitePreviewStore::open(&config.database_path)?);
        let worker = Arc::new(ProcessWorker::new(config.worker.clone()));
        tracing::info!(
            scratch_dir = %config.scratch_dir.display(),
            worker = %config.worker.program.display(),
            max_concurrent = config.worker.max_concurrent,
            "Preview pipeline ready"
        );
        Self::new(config, worker, store)
    }

    /// Delete staged files abandoned by crashed runs. Other processes may
    /// share the scratch dir, so only files past
    /// [`PipelineConfig::stale_staging_age`] are removed.
    pub fn sweep_stale_staging(&self) -> usize {
        cleanup_orphaned_staging(&self.config.scratch_dir, self.config.stale_staging_age())
    }

    /// Stop admitting new worker runs. In-flight runs finish normally;
    /// later invocations fail with `WORKER_FAILED`.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    /// Redact an image and persist both variants as a new preview.
    pub async fn generate_preview(
        &self,
        user_id: &str,
        input: ImageInput,
    ) -> Result<PreviewOutcome, PreviewError> {
        let started = Instant::now();
        tracing::debug!(stage = ?PipelineStage::Received, user_id, source = input.kind());

        let preview = self
            .generate(user_id, input)
            .await
            .map_err(|e| report("generate_preview", e))?;

        tracing::info!(
            preview_id = %preview.preview_id,
            user_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Preview generated"
        );
        Ok(PreviewOutcome::from(&preview))
    }

    /// Redact an image without storing anything.
    pub async fn redact_image(&self, input: ImageInput) -> Result<RedactedImages, PreviewError> {
        tracing::debug!(stage = ?PipelineStage::Received, source = input.kind());
        self.redact(input).await.map_err(|e| report("redact_image", e))
    }

    pub async fn lookup_preview(&self, preview_id: Uuid) -> Result<Option<Preview>, DatabaseError> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.get(&preview_id)).await?
    }

    pub async fn list_previews(&self, user_id: &str) -> Result<Vec<Preview>, DatabaseError> {
        let store = Arc::clone(&self.store);
        let user_id = user_id.to_string();
        run_blocking(move || store.list_for_user(&user_id)).await?
    }

    /// Bind a preview to a post. Succeeds at most once per preview.
    pub async fn consume_preview(
        &self,
        preview_id: Uuid,
        variant: ImageVariant,
    ) -> Result<ConsumedPreview, ConsumeError> {
        let store = Arc::clone(&self.store);
        let consumed = run_blocking(move || store.consume(&preview_id, variant)).await??;
        tracing::info!(
            preview_id = %preview_id,
            variant = variant.as_str(),
            "Preview consumed"
        );
        Ok(consumed)
    }

    async fn generate(&self, user_id: &str, input: ImageInput) -> Result<Preview, PipelineError> {
        let (artifact, redacted) = {
            let _slot = self.worker_slot().await?;
            let artifact = self.stager.stage(input).await?;
            tracing::debug!(stage = ?PipelineStage::Staged, path = %artifact.path().display());
            let redacted = self.redact_staged(&artifact).await;
            (artifact, redacted)
        };

        let result = match redacted {
            Ok(images) => self.persist_preview(user_id, &artifact, images).await,
            Err(e) => Err(e),
        };

        // Dropping the artifact on cancellation removes the file too.
        artifact.release();
        tracing::debug!(stage = ?PipelineStage::CleanedUp, ok = result.is_ok());
        result
    }

    async fn redact(&self, input: ImageInput) -> Result<RedactedImages, PipelineError> {
        let _slot = self.worker_slot().await?;
        let artifact = self.stager.stage(input).await?;
        tracing::debug!(stage = ?PipelineStage::Staged, path = %artifact.path().display());

        let result = self.redact_staged(&artifact).await;
        artifact.release();
        tracing::debug!(stage = ?PipelineStage::CleanedUp, ok = result.is_ok());
        result
    }

    /// A worker slot is held from staging until the worker exits, so a
    /// staged file never outlives one worker run by much.
    async fn worker_slot(&self) -> Result<SemaphorePermit<'_>, WorkerError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| WorkerError::AdmissionClosed)
    }

    async fn persist_preview(
        &self,
        user_id: &str,
        artifact: &StagedArtifact,
        images: RedactedImages,
    ) -> Result<Preview, PipelineError> {
        let new = NewPreview {
            user_id: user_id.to_string(),
            original_image_ref: artifact.original_ref.clone(),
            original_mime: artifact.format.mime_type().to_string(),
            original_sha256: artifact.sha256.clone(),
            auto_mosaic_image: images.auto_mosaic_image,
            plate_visible_image: images.plate_visible_image,
        };
        let preview = self.persist(new).await?;
        tracing::debug!(stage = ?PipelineStage::Persisted, preview_id = %preview.preview_id);
        Ok(preview)
    }

    async fn redact_staged(&self, artifact: &StagedArtifact) -> Result<RedactedImages, PipelineError> {
        let raw = self.worker.invoke(artifact.path()).await?;
        tracing::debug!(
            stage = ?PipelineStage::WorkerInvoked,
            stdout_bytes = raw.stdout.len(),
            stderr_bytes = raw.stderr.len()
        );

        let images = protocol::parse_worker_output(&raw.stdout).inspect_err(|e| {
            tracing::debug!(
                reason = %e,
                stderr = %excerpt_tail(&raw.stderr, self.config.worker.stderr_excerpt_chars),
                "Worker output rejected"
            );
        })?;
        tracing::debug!(stage = ?PipelineStage::ParsedOutput);
        Ok(images)
    }

    /// Insert with bounded retry. The worker run is already paid for, so a
    /// transient database failure gets another attempt.
    async fn persist(&self, new: NewPreview) -> Result<Preview, DatabaseError> {
        let attempts = self.config.persist_attempts.max(1);
        let mut attempt = 1;
        loop {
            let store = Arc::clone(&self.store);
            let row = new.clone();
            match run_blocking(move || store.create(&row)).await.and_then(|r| r) {
                Ok(preview) => return Ok(preview),
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    tracing::warn!(attempt, max_attempts = attempts, error = %e, "Preview persist failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(err: &DatabaseError) -> bool {
    match err {
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => {
            failure.code != rusqlite::ErrorCode::ConstraintViolation
        }
        DatabaseError::Sqlite(_) | DatabaseError::TaskFailed(_) => true,
        _ => false,
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, DatabaseError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))
}

/// Log the internal error once with its details and reduce it to a kind.
fn report(operation: &'static str, err: PipelineError) -> PreviewError {
    let kind = err.kind();
    match &err {
        PipelineError::Staging(e) if e.is_invalid_input() => {
            tracing::warn!(operation, code = kind.code(), error = %err, "Image rejected");
        }
        PipelineError::Worker(WorkerError::Failed {
            exit_code,
            stderr_excerpt,
        }) => {
            tracing::error!(
                operation,
                code = kind.code(),
                exit_code = ?exit_code,
                stderr = %stderr_excerpt,
                "Redaction worker failed"
            );
        }
        _ => {
            tracing::error!(operation, code = kind.code(), error = %err, "Preview pipeline failed");
        }
    }
    PreviewError { kind }
}
