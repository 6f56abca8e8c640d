use std::future::Future;
use std::path::Path;

use emotes_core::Watermark;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tokio::sync::broadcast;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubredditRecord {
    pub name: String,
    pub enabled: bool,
    pub last_sync: Watermark,
    pub added_at: i64,
    pub size_bytes: i64,
}

/// One (hash, name) association. A hash published under several names is
/// stored as several rows sharing hash and image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteInput {
    pub hash: String,
    pub name: String,
    pub subreddit: String,
    pub image: String,
    pub animated: bool,
    pub adult: bool,
    pub delay_ms: i64,
    pub frame_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteRecord {
    pub id: i64,
    pub hash: String,
    pub name: String,
    pub subreddit: String,
    pub image: String,
    pub animated: bool,
    pub adult: bool,
    pub delay_ms: i64,
    pub frame_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    InsertEmote(EmoteInput),
    /// Removes every name of `hash` within `subreddit`.
    DeleteEmoteHash { subreddit: String, hash: String },
    DeleteEmoteName { id: i64 },
    DeleteSubredditEmotes { subreddit: String },
    /// Inserts a new subreddit (enabled, never synced) or refreshes the
    /// catalog metadata of a known one without touching enabled/watermark.
    UpsertSubreddit {
        name: String,
        size_bytes: i64,
        added_at: i64,
    },
    DeleteSubreddit { name: String },
    SetSubredditWatermark { name: String, watermark: Watermark },
    /// Disabling also resets the watermark so re-enabling forces a full sync.
    SetSubredditEnabled { name: String, enabled: bool },
    SetCatalogWatermark(Watermark),
    /// Forces every subreddit to be fetched in full on its next sync.
    ResetSubredditWatermarks,
    SetSettingsFingerprint(String),
}

/// Rows touched by a committed batch. `inserted` and `deleted` count emote
/// rows; every other operation lands in `updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub inserted: u64,
    pub deleted: u64,
    pub updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Emotes,
    Subreddits,
}

/// Query and batch surface the sync engine needs from durable storage.
///
/// `apply_batch` must commit every operation or none of them.
pub trait CatalogStore: Send + Sync + 'static {
    fn list_subreddits(
        &self,
    ) -> impl Future<Output = Result<Vec<SubredditRecord>, StoreError>> + Send;

    fn get_subreddit(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<SubredditRecord>, StoreError>> + Send;

    fn list_emotes(
        &self,
        subreddit: &str,
    ) -> impl Future<Output = Result<Vec<EmoteRecord>, StoreError>> + Send;

    fn distinct_emote_subreddits(
        &self,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn distinct_images(
        &self,
        subreddit: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn catalog_watermark(&self) -> impl Future<Output = Result<Watermark, StoreError>> + Send;

    fn settings_fingerprint(
        &self,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    fn apply_batch(
        &self,
        ops: Vec<StoreOp>,
    ) -> impl Future<Output = Result<BatchSummary, StoreError>> + Send;
}

pub struct IndexStore {
    pool: SqlitePool,
    changes: broadcast::Sender<StoreChange>,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { pool, changes }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Notifications published after each committed batch.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, summary: &BatchSummary, emotes: bool, subreddits: bool) {
        // Send only fails when nobody is listening.
        if emotes && (summary.inserted > 0 || summary.deleted > 0) {
            let _ = self.changes.send(StoreChange::Emotes);
        }
        if subreddits {
            let _ = self.changes.send(StoreChange::Subreddits);
        }
    }
}

impl CatalogStore for IndexStore {
    async fn list_subreddits(&self) -> Result<Vec<SubredditRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, enabled, last_sync, added_at, size_bytes FROM subreddits ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subreddit_from_row).collect()
    }

    async fn get_subreddit(&self, name: &str) -> Result<Option<SubredditRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT name, enabled, last_sync, added_at, size_bytes FROM subreddits WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subreddit_from_row).transpose()
    }

    async fn list_emotes(&self, subreddit: &str) -> Result<Vec<EmoteRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, hash, name, subreddit, image, animated, adult, delay_ms, frame_index
             FROM emotes
             WHERE subreddit = ?1
             ORDER BY id ASC",
        )
        .bind(subreddit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(emote_from_row).collect()
    }

    async fn distinct_emote_subreddits(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT subreddit FROM emotes ORDER BY subreddit ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("subreddit").map_err(StoreError::from))
            .collect()
    }

    async fn distinct_images(&self, subreddit: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT image FROM emotes WHERE subreddit = ?1 ORDER BY image ASC",
        )
        .bind(subreddit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("image").map_err(StoreError::from))
            .collect()
    }

    async fn catalog_watermark(&self) -> Result<Watermark, StoreError> {
        let row = sqlx::query("SELECT catalog_last_modified FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Watermark::from_millis(row.try_get("catalog_last_modified")?)),
            None => Ok(Watermark::NONE),
        }
    }

    async fn settings_fingerprint(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT settings_fingerprint FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("settings_fingerprint")?),
            None => Ok(None),
        }
    }

    async fn apply_batch(&self, ops: Vec<StoreOp>) -> Result<BatchSummary, StoreError> {
        let mut summary = BatchSummary::default();
        if ops.is_empty() {
            return Ok(summary);
        }
        let mut touches_emotes = false;
        let mut touches_subreddits = false;

        let mut tx = self.pool.begin().await?;
        for op in &ops {
            match op {
                StoreOp::InsertEmote(emote) => {
                    let result = sqlx::query(
                        "INSERT INTO emotes (hash, name, subreddit, image, animated, adult, delay_ms, frame_index)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .bind(&emote.hash)
                    .bind(&emote.name)
                    .bind(&emote.subreddit)
                    .bind(&emote.image)
                    .bind(if emote.animated { 1 } else { 0 })
                    .bind(if emote.adult { 1 } else { 0 })
                    .bind(emote.delay_ms)
                    .bind(emote.frame_index)
                    .execute(&mut *tx)
                    .await?;
                    summary.inserted += result.rows_affected();
                    touches_emotes = true;
                }
                StoreOp::DeleteEmoteHash { subreddit, hash } => {
                    let result =
                        sqlx::query("DELETE FROM emotes WHERE subreddit = ?1 AND hash = ?2")
                            .bind(subreddit)
                            .bind(hash)
                            .execute(&mut *tx)
                            .await?;
                    summary.deleted += result.rows_affected();
                    touches_emotes = true;
                }
                StoreOp::DeleteEmoteName { id } => {
                    let result = sqlx::query("DELETE FROM emotes WHERE id = ?1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    summary.deleted += result.rows_affected();
                    touches_emotes = true;
                }
                StoreOp::DeleteSubredditEmotes { subreddit } => {
                    let result = sqlx::query("DELETE FROM emotes WHERE subreddit = ?1")
                        .bind(subreddit)
                        .execute(&mut *tx)
                        .await?;
                    summary.deleted += result.rows_affected();
                    touches_emotes = true;
                }
                StoreOp::UpsertSubreddit {
                    name,
                    size_bytes,
                    added_at,
                } => {
                    let result = sqlx::query(
                        "INSERT INTO subreddits (name, size_bytes, added_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(name) DO UPDATE SET
                            size_bytes = excluded.size_bytes,
                            added_at = excluded.added_at",
                    )
                    .bind(name)
                    .bind(size_bytes)
                    .bind(added_at)
                    .execute(&mut *tx)
                    .await?;
                    summary.updated += result.rows_affected();
                    touches_subreddits = true;
                }
                StoreOp::DeleteSubreddit { name } => {
                    let result = sqlx::query("DELETE FROM subreddits WHERE name = ?1")
                        .bind(name)
                        .execute(&mut *tx)
                        .await?;
                    summary.updated += result.rows_affected();
                    touches_subreddits = true;
                }
                StoreOp::SetSubredditWatermark { name, watermark } => {
                    let result = sqlx::query("UPDATE subreddits SET last_sync = ?1 WHERE name = ?2")
                        .bind(watermark.as_millis())
                        .bind(name)
                        .execute(&mut *tx)
                        .await?;
                    summary.updated += result.rows_affected();
                    touches_subreddits = true;
                }
                StoreOp::SetSubredditEnabled { name, enabled } => {
                    let result = sqlx::query(
                        "UPDATE subreddits
                         SET enabled = ?1,
                             last_sync = CASE WHEN ?1 = 0 THEN 0 ELSE last_sync END
                         WHERE name = ?2",
                    )
                    .bind(if *enabled { 1 } else { 0 })
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                    summary.updated += result.rows_affected();
                    touches_subreddits = true;
                }
                StoreOp::SetCatalogWatermark(watermark) => {
                    let result = sqlx::query(
                        "INSERT INTO sync_state (id, catalog_last_modified) VALUES (1, ?1)
                         ON CONFLICT(id) DO UPDATE SET
                            catalog_last_modified = excluded.catalog_last_modified",
                    )
                    .bind(watermark.as_millis())
                    .execute(&mut *tx)
                    .await?;
                    summary.updated += result.rows_affected();
                }
                StoreOp::ResetSubredditWatermarks => {
                    let result =
                        sqlx::query("UPDATE subreddits SET last_sync = 0 WHERE last_sync <> 0")
                            .execute(&mut *tx)
                            .await?;
                    summary.updated += result.rows_affected();
                    touches_subreddits |= result.rows_affected() > 0;
                }
                StoreOp::SetSettingsFingerprint(fingerprint) => {
                    let result = sqlx::query(
                        "INSERT INTO sync_state (id, settings_fingerprint) VALUES (1, ?1)
                         ON CONFLICT(id) DO UPDATE SET
                            settings_fingerprint = excluded.settings_fingerprint",
                    )
                    .bind(fingerprint)
                    .execute(&mut *tx)
                    .await?;
                    summary.updated += result.rows_affected();
                }
            }
        }
        tx.commit().await?;

        self.notify(&summary, touches_emotes, touches_subreddits);
        Ok(summary)
    }
}

fn subreddit_from_row(row: &SqliteRow) -> Result<SubredditRecord, StoreError> {
    let enabled: i64 = row.try_get("enabled")?;
    Ok(SubredditRecord {
        name: row.try_get("name")?,
        enabled: enabled != 0,
        last_sync: Watermark::from_millis(row.try_get("last_sync")?),
        added_at: row.try_get("added_at")?,
        size_bytes: row.try_get("size_bytes")?,
    })
}

fn emote_from_row(row: &SqliteRow) -> Result<EmoteRecord, StoreError> {
    let animated: i64 = row.try_get("animated")?;
    let adult: i64 = row.try_get("adult")?;
    Ok(EmoteRecord {
        id: row.try_get("id")?,
        hash: row.try_get("hash")?,
        name: row.try_get("name")?,
        subreddit: row.try_get("subreddit")?,
        image: row.try_get("image")?,
        animated: animated != 0,
        adult: adult != 0,
        delay_ms: row.try_get("delay_ms")?,
        frame_index: row.try_get("frame_index")?,
    })
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
