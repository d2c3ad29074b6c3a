use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::DatabaseError;
use crate::models::{ImageVariant, NewPreview, Preview};

const PREVIEW_COLUMNS: &str = "preview_id, user_id, original_image_ref, original_mime, original_sha256,
     auto_mosaic_image, plate_visible_image, created_at, is_used, used_at, used_variant";

// Raw row as stored; converted in `preview_from_row`.
struct PreviewRow {
    preview_id: String,
    user_id: String,
    original_image_ref: String,
    original_mime: String,
    original_sha256: String,
    auto_mosaic_image: String,
    plate_visible_image: String,
    created_at: String,
    is_used: i32,
    used_at: Option<String>,
    used_variant: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PreviewRow> {
    Ok(PreviewRow {
        preview_id: row.get(0)?,
        user_id: row.get(1)?,
        original_image_ref: row.get(2)?,
        original_mime: row.get(3)?,
        original_sha256: row.get(4)?,
        auto_mosaic_image: row.get(5)?,
        plate_visible_image: row.get(6)?,
        created_at: row.get(7)?,
        is_used: row.get(8)?,
        used_at: row.get(9)?,
        used_variant: row.get(10)?,
    })
}

fn preview_from_row(row: PreviewRow) -> Result<Preview, DatabaseError> {
    let preview_id = Uuid::parse_str(&row.preview_id).map_err(|_| DatabaseError::InvalidValue {
        field: "preview_id".into(),
        value: row.preview_id.clone(),
    })?;

    Ok(Preview {
        preview_id,
        user_id: row.user_id,
        original_image_ref: row.original_image_ref,
        original_mime: row.original_mime,
        original_sha256: row.original_sha256,
        auto_mosaic_image: row.auto_mosaic_image,
        plate_visible_image: row.plate_visible_image,
        created_at: parse_timestamp("created_at", &row.created_at)?,
        consumed: row.is_used != 0,
        consumed_at: row
            .used_at
            .as_deref()
            .map(|s| parse_timestamp("used_at", s))
            .transpose()?,
        consumed_variant: row
            .used_variant
            .as_deref()
            .map(str::parse::<ImageVariant>)
            .transpose()?,
    })
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidValue {
            field: field.into(),
            value: value.into(),
        })
}

/// Insert a fully populated preview row. Single statement, so either the
/// whole row lands or nothing does.
pub fn insert_preview(conn: &Connection, new: &NewPreview) -> Result<Preview, DatabaseError> {
    if new.auto_mosaic_image.is_empty() || new.plate_visible_image.is_empty() {
        return Err(DatabaseError::ConstraintViolation(
            "preview requires both image variants".into(),
        ));
    }

    let preview = Preview {
        preview_id: Uuid::new_v4(),
        user_id: new.user_id.clone(),
        original_image_ref: new.original_image_ref.clone(),
        original_mime: new.original_mime.clone(),
        original_sha256: new.original_sha256.clone(),
        auto_mosaic_image: new.auto_mosaic_image.clone(),
        plate_visible_image: new.plate_visible_image.clone(),
        created_at: Utc::now(),
        consumed: false,
        consumed_at: None,
        consumed_variant: None,
    };

    conn.execute(
        "INSERT INTO image_previews
         (preview_id, user_id, original_image_ref, original_mime, original_sha256,
          auto_mosaic_image, plate_visible_image, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            preview.preview_id.to_string(),
            preview.user_id,
            preview.original_image_ref,
            preview.original_mime,
            preview.original_sha256,
            preview.auto_mosaic_image,
            preview.plate_visible_image,
            format_timestamp(&preview.created_at),
        ],
    )?;

    Ok(preview)
}

pub fn get_preview(conn: &Connection, id: &Uuid) -> Result<Option<Preview>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PREVIEW_COLUMNS} FROM image_previews WHERE preview_id = ?1"
    ))?;

    match stmt.query_row(params![id.to_string()], read_row) {
        Ok(row) => Ok(Some(preview_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_previews_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Preview>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PREVIEW_COLUMNS} FROM image_previews WHERE user_id = ?1 ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map(params![user_id], read_row)?;

    let mut previews = Vec::new();
    for row in rows {
        previews.push(preview_from_row(row?)?);
    }
    Ok(previews)
}

/// Mark a preview as used, only if it is currently unused.
///
/// Returns `true` if this call flipped the flag, `false` if the row is
/// missing or was already consumed.
pub fn mark_preview_consumed(
    conn: &Connection,
    id: &Uuid,
    variant: ImageVariant,
    at: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE image_previews
         SET is_used = 1, used_at = ?2, used_variant = ?3
         WHERE preview_id = ?1 AND is_used = 0",
        params![id.to_string(), format_timestamp(at), variant.as_str()],
    )?;
    Ok(changed == 1)
}

pub fn count_previews(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row("SELECT COUNT(*) FROM image_previews", [], |row| row.get(0))?;
    Ok(count)
}
