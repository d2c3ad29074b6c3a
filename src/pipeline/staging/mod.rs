pub mod format;
pub mod hash;
pub mod stager;

pub use format::*;
pub use hash::*;
pub use stager::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image payload is empty")]
    EmptyPayload,

    #[error("Image too large: {size_mb:.1}MB exceeds {max_mb}MB limit")]
    TooLarge { size_mb: f64, max_mb: u64 },

    #[error("Malformed data URI (expected data:image/<type>;base64,...)")]
    InvalidDataUri,

    #[error("Base64 decode failed: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Unsupported image source: {0}")]
    UnsupportedSource(String),

    #[error("Not a recognised image format")]
    NotAnImage,

    #[error("Download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Download failed with HTTP status {0}")]
    DownloadStatus(u16),

    #[error("Staging task failed: {0}")]
    Task(String),
}

impl StagingError {
    /// Whether the failure is the caller's fault (bad payload) rather than
    /// a local or network problem.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::EmptyPayload
                | Self::TooLarge { .. }
                | Self::InvalidDataUri
                | Self::Decode(_)
                | Self::UnsupportedSource(_)
                | Self::NotAnImage
        )
    }
}
