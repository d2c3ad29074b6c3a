use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::ImageVariant;

/// A persisted redaction result. Both image variants are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    pub preview_id: Uuid,
    pub user_id: String,
    /// Original image as received (data URI or URL), stored verbatim.
    pub original_image_ref: String,
    pub original_mime: String,
    /// Base64 SHA-256 of the staged bytes.
    pub original_sha256: String,
    /// Faces and plates redacted, `data:image/jpeg;base64,...`.
    pub auto_mosaic_image: String,
    /// Faces redacted, plates visible.
    pub plate_visible_image: String,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,
    pub consumed_variant: Option<ImageVariant>,
}

impl Preview {
    pub fn image(&self, variant: ImageVariant) -> &str {
        match variant {
            ImageVariant::Auto => &self.auto_mosaic_image,
            ImageVariant::PlateVisible => &self.plate_visible_image,
        }
    }
}

/// Everything needed to insert a preview row. The id and timestamp are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewPreview {
    pub user_id: String,
    pub original_image_ref: String,
    pub original_mime: String,
    pub original_sha256: String,
    pub auto_mosaic_image: String,
    pub plate_visible_image: String,
}

/// Returned to the caller after a successful `generate_preview`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOutcome {
    pub preview_id: Uuid,
    pub auto_mosaic_image: String,
    pub plate_visible_image: String,
}

impl From<&Preview> for PreviewOutcome {
    fn from(preview: &Preview) -> Self {
        Self {
            preview_id: preview.preview_id,
            auto_mosaic_image: preview.auto_mosaic_image.clone(),
            plate_visible_image: preview.plate_visible_image.clone(),
        }
    }
}

/// Both redacted variants without a stored preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactedImages {
    pub auto_mosaic_image: String,
    pub plate_visible_image: String,
}

/// Result of binding a preview to a post.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedPreview {
    pub preview_id: Uuid,
    pub variant: ImageVariant,
    pub image: String,
    pub consumed_at: DateTime<Utc>,
}
