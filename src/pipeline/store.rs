//! Preview Persistence: durable storage of redaction results.
//!
//! A preview row is inserted in a single statement with both variants, so a
//! reader never observes a preview with only one image. Consumption is a
//! conditional update; a preview can be bound to a post at most once.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{self, DatabaseError};
use crate::models::{ConsumedPreview, ImageVariant, NewPreview, Preview};

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("Preview not found: {0}")]
    NotFound(Uuid),

    #[error("Preview already used: {0}")]
    AlreadyConsumed(Uuid),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Storage seam for previews. Implementations are blocking; async callers
/// go through `spawn_blocking`.
pub trait PreviewStore: Send + Sync {
    /// Persist a new preview and return it with its assigned id.
    fn create(&self, new: &NewPreview) -> Result<Preview, DatabaseError>;

    fn get(&self, id: &Uuid) -> Result<Option<Preview>, DatabaseError>;

    fn list_for_user(&self, user_id: &str) -> Result<Vec<Preview>, DatabaseError>;

    /// Mark the preview used and return the selected image.
    fn consume(&self, id: &Uuid, variant: ImageVariant) -> Result<ConsumedPreview, ConsumeError>;

    fn count(&self) -> Result<i64, DatabaseError>;
}

/// SQLite-backed store. One connection, serialized by a mutex.
pub struct SqlitePreviewStore {
    conn: Mutex<Connection>,
}

impl SqlitePreviewStore {
    /// Open (or create) the database file and apply migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let conn = db::open_database(path)?;
        tracing::info!(path = %path.display(), "Preview store opened");
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(db::open_memory_database()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }
}

impl PreviewStore for SqlitePreviewStore {
    fn create(&self, new: &NewPreview) -> Result<Preview, DatabaseError> {
        self.with_conn(|conn| db::insert_preview(conn, new))
    }

    fn get(&self, id: &Uuid) -> Result<Option<Preview>, DatabaseError> {
        self.with_conn(|conn| db::get_preview(conn, id))
    }

    fn list_for_user(&self, user_id: &str) -> Result<Vec<Preview>, DatabaseError> {
        self.with_conn(|conn| db::list_previews_for_user(conn, user_id))
    }

    fn consume(&self, id: &Uuid, variant: ImageVariant) -> Result<ConsumedPreview, ConsumeError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let now = Utc::now();

        if !db::mark_preview_consumed(&conn, id, variant, &now)? {
            // Lock is still held, so this read explains exactly why the update missed.
            return match db::get_preview(&conn, id)? {
                Some(_) => Err(ConsumeError::AlreadyConsumed(*id)),
                None => Err(ConsumeError::NotFound(*id)),
            };
        }

        let preview = db::get_preview(&conn, id)?.ok_or(ConsumeError::NotFound(*id))?;
        Ok(ConsumedPreview {
            preview_id: preview.preview_id,
            variant,
            image: preview.image(variant).to_string(),
            consumed_at: preview.consumed_at.unwrap_or(now),
        })
    }

    fn count(&self) -> Result<i64, DatabaseError> {
        self.with_conn(db::count_previews)
    }
}
