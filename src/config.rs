//! Application constants and pipeline configuration.
//!
//! Everything the pipeline needs from the environment (worker binary, model
//! paths, limits, directories) is resolved once into a [`PipelineConfig`]
//! and injected into the orchestrator at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "mosaic-preview";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Flag that designates the input image path on the worker command line.
pub const DEFAULT_INPUT_FLAG: &str = "--input";

const DEFAULT_WORKER_PROGRAM: &str = "python";
const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_CONCURRENT_WORKERS: usize = 2;
const DEFAULT_MAX_IMAGE_MB: u64 = 20;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PERSIST_ATTEMPTS: u32 = 2;
const DEFAULT_STDERR_EXCERPT_CHARS: usize = 2000;
const STALE_STAGING_MARGIN: Duration = Duration::from_secs(60);

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,mosaic_preview=debug"
}

/// Base directory for the database, scratch files and models.
///
/// `MOSAIC_DATA_DIR` wins; otherwise the platform local data dir, falling
/// back to the system temp dir on hosts without one.
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MOSAIC_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Scratch directory for staged input images.
pub fn scratch_dir() -> PathBuf {
    app_data_dir().join("tmp")
}

/// Models directory (face and plate detectors).
pub fn models_dir() -> PathBuf {
    app_data_dir().join("models")
}

/// Default SQLite database path.
pub fn database_path() -> PathBuf {
    app_data_dir().join("previews.db")
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("Malformed model argument '{0}' (expected flag=path)")]
    MalformedModelArg(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One model artifact handed to the worker as `<flag> <path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelArg {
    pub flag: String,
    pub path: PathBuf,
}

impl ModelArg {
    pub fn new(flag: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            flag: flag.into(),
            path: path.into(),
        }
    }
}

/// How to launch the external redaction worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    /// Executable to spawn (the Python interpreter for the stock worker).
    pub program: PathBuf,
    /// Arguments placed before the input flag (the worker script path).
    pub leading_args: Vec<String>,
    /// Flag preceding the staged input path.
    pub input_flag: String,
    /// One `<flag> <path>` pair per detection model.
    pub models: Vec<ModelArg>,
    /// Hard limit on a single worker run. The child is killed on expiry.
    pub timeout: Duration,
    /// Maximum number of worker processes alive at once.
    pub max_concurrent: usize,
    /// How much of stderr is kept for diagnostics on failure.
    pub stderr_excerpt_chars: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let models = models_dir();
        Self {
            program: PathBuf::from(DEFAULT_WORKER_PROGRAM),
            leading_args: vec![default_worker_script().to_string_lossy().into_owned()],
            input_flag: DEFAULT_INPUT_FLAG.into(),
            models: vec![
                ModelArg::new("--face-model", models.join("face").join("yolov8n-face.pt")),
                ModelArg::new("--plate-model", models.join("plate").join("plate-detector.pt")),
            ],
            timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS),
            max_concurrent: DEFAULT_MAX_CONCURRENT_WORKERS,
            stderr_excerpt_chars: DEFAULT_STDERR_EXCERPT_CHARS,
        }
    }
}

fn default_worker_script() -> PathBuf {
    app_data_dir().join("scripts").join("mosaic").join("mosaic_processor.py")
}

/// Full pipeline configuration, built once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    /// Where staged input images are written. Shared across invocations.
    pub scratch_dir: PathBuf,
    /// SQLite file holding the `image_previews` table.
    pub database_path: PathBuf,
    pub worker: WorkerConfig,
    /// Upper bound on an inbound image after decoding.
    pub max_image_bytes: u64,
    /// Timeout for fetching `http(s)` image sources.
    pub download_timeout: Duration,
    /// Total tries for the persistence step (1 = no retry).
    pub persist_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scratch_dir: scratch_dir(),
            database_path: database_path(),
            worker: WorkerConfig::default(),
            max_image_bytes: DEFAULT_MAX_IMAGE_MB * 1024 * 1024,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            persist_attempts: DEFAULT_PERSIST_ATTEMPTS,
        }
    }
}

impl PipelineConfig {
    /// Build from `MOSAIC_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("MOSAIC_DATA_DIR") {
            Some(dir) => Self::rooted_at(Path::new(&dir)),
            None => Self::default(),
        };

        if let Some(dir) = lookup("MOSAIC_SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("MOSAIC_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(program) = lookup("MOSAIC_WORKER_PROGRAM") {
            config.worker.program = PathBuf::from(program);
        }
        if let Some(script) = lookup("MOSAIC_WORKER_SCRIPT") {
            config.worker.leading_args = if script.is_empty() { Vec::new() } else { vec![script] };
        }
        if let Some(path) = lookup("MOSAIC_FACE_MODEL") {
            replace_model(&mut config.worker.models, "--face-model", path);
        }
        if let Some(path) = lookup("MOSAIC_PLATE_MODEL") {
            replace_model(&mut config.worker.models, "--plate-model", path);
        }
        if let Some(spec) = lookup("MOSAIC_MODEL_ARGS") {
            config.worker.models = parse_model_args(&spec)?;
        }
        if let Some(raw) = lookup("MOSAIC_WORKER_TIMEOUT_SECS") {
            config.worker.timeout = Duration::from_secs(parse_number("MOSAIC_WORKER_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("MOSAIC_MAX_CONCURRENT_WORKERS") {
            config.worker.max_concurrent = parse_number("MOSAIC_MAX_CONCURRENT_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("MOSAIC_MAX_IMAGE_MB") {
            let mb: u64 = parse_number("MOSAIC_MAX_IMAGE_MB", &raw)?;
            config.max_image_bytes = mb.checked_mul(1024 * 1024).ok_or(ConfigError::InvalidValue {
                var: "MOSAIC_MAX_IMAGE_MB",
                value: raw,
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Defaults with every directory placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let models = root.join("models");
        let mut config = Self {
            scratch_dir: root.join("tmp"),
            database_path: root.join("previews.db"),
            ..Self::default()
        };
        config.worker.leading_args = vec![root
            .join("scripts")
            .join("mosaic")
            .join("mosaic_processor.py")
            .to_string_lossy()
            .into_owned()];
        config.worker.models = vec![
            ModelArg::new("--face-model", models.join("face").join("yolov8n-face.pt")),
            ModelArg::new("--plate-model", models.join("plate").join("plate-detector.pt")),
        ];
        config
    }

    /// Age past which a staged file can only belong to a dead run.
    /// Staging and the worker run share one admission slot, so a live
    /// file is never older than one download plus one worker timeout.
    pub fn stale_staging_age(&self) -> Duration {
        self.download_timeout + self.worker.timeout + STALE_STAGING_MARGIN
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.max_concurrent == 0 {
            return Err(ConfigError::Invalid("worker concurrency cap must be at least 1".into()));
        }
        if self.worker.timeout.is_zero() {
            return Err(ConfigError::Invalid("worker timeout must be non-zero".into()));
        }
        if self.worker.models.is_empty() {
            return Err(ConfigError::Invalid("at least one model argument is required".into()));
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::Invalid("image size limit must be non-zero".into()));
        }
        if self.persist_attempts == 0 {
            return Err(ConfigError::Invalid("persist_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn replace_model(models: &mut Vec<ModelArg>, flag: &str, path: String) {
    match models.iter_mut().find(|m| m.flag == flag) {
        Some(model) => model.path = PathBuf::from(path),
        None => models.push(ModelArg::new(flag, path)),
    }
}

/// Parse `--face-model=/a.pt;--plate-model=/b.pt`.
pub fn parse_model_args(spec: &str) -> Result<Vec<ModelArg>, ConfigError> {
    spec.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (flag, path) = part
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedModelArg(part.to_string()))?;
            let (flag, path) = (flag.trim(), path.trim());
            if flag.is_empty() || path.is_empty() {
                return Err(ConfigError::MalformedModelArg(part.to_string()));
            }
            let flag = if flag.starts_with('-') {
                flag.to_string()
            } else {
                format!("--{flag}")
            };
            Ok(ModelArg::new(flag, path))
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
    })
}
