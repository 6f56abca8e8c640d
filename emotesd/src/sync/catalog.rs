use std::collections::HashSet;
use std::sync::Arc;

use emotes_core::{CatalogClient, CatalogResult, RemoteEmote, RemoteSubreddit, Watermark};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SyncError;
use super::gate::CapabilityGate;
use super::index::{CatalogStore, StoreOp};

/// What a subreddit-list refresh changed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubredditRefresh {
    NotModified,
    Updated {
        added: usize,
        removed: usize,
        updated: usize,
    },
    /// The server returned an empty list while subreddits are known
    /// locally; nothing was applied.
    EmptyCatalog,
    /// Another caller holds the subreddit-list lock.
    Skipped,
}

/// Gate-checked, cancellation-aware access to the remote catalogs.
///
/// Emote catalogs are partitioned by subreddit and fetched without any
/// coordination. The subreddit list is global and is refreshed by one
/// caller at a time.
#[derive(Clone)]
pub struct CatalogFetcher {
    client: CatalogClient,
    gate: CapabilityGate,
    subreddit_lock: Arc<Mutex<()>>,
}

impl CatalogFetcher {
    pub fn new(client: CatalogClient, gate: CapabilityGate) -> Self {
        Self {
            client,
            gate,
            subreddit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn client(&self) -> &CatalogClient {
        &self.client
    }

    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }

    pub async fn fetch_emotes(
        &self,
        subreddit: &str,
        since: Watermark,
        cancel: &CancellationToken,
    ) -> Result<CatalogResult<RemoteEmote>, SyncError> {
        self.checkpoint(cancel)?;
        let result = self.client.fetch_emotes(subreddit, since).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Interrupted);
        }
        Ok(result)
    }

    pub async fn fetch_subreddits(
        &self,
        since: Watermark,
        cancel: &CancellationToken,
    ) -> Result<CatalogResult<RemoteSubreddit>, SyncError> {
        self.checkpoint(cancel)?;
        let result = self.client.fetch_subreddits(since).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Interrupted);
        }
        Ok(result)
    }

    /// Refreshes the subreddit table, waiting for any refresh in progress.
    pub async fn refresh_subreddits<S: CatalogStore>(
        &self,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<SubredditRefresh, SyncError> {
        let _guard = self.subreddit_lock.lock().await;
        self.refresh_locked(store, cancel).await
    }

    /// Like [`refresh_subreddits`](Self::refresh_subreddits) but returns
    /// [`SubredditRefresh::Skipped`] instead of waiting for the lock.
    pub async fn try_refresh_subreddits<S: CatalogStore>(
        &self,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<SubredditRefresh, SyncError> {
        let Ok(_guard) = self.subreddit_lock.try_lock() else {
            debug!("subreddit list refresh already running");
            return Ok(SubredditRefresh::Skipped);
        };
        self.refresh_locked(store, cancel).await
    }

    async fn refresh_locked<S: CatalogStore>(
        &self,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<SubredditRefresh, SyncError> {
        let since = store.catalog_watermark().await?;
        let (entries, last_modified) = match self.fetch_subreddits(since, cancel).await? {
            CatalogResult::NotModified => {
                debug!("subreddit list not modified");
                return Ok(SubredditRefresh::NotModified);
            }
            CatalogResult::Gone => {
                return Err(SyncError::Transport(emotes_core::CatalogError::Status {
                    status: reqwest::StatusCode::NOT_FOUND,
                }));
            }
            CatalogResult::Catalog {
                entries,
                last_modified,
            } => (entries, last_modified),
        };
        info!(count = entries.len(), "subreddit list loaded");

        let known = store.list_subreddits().await?;
        if entries.is_empty() && !known.is_empty() {
            warn!(known = known.len(), "empty subreddit list ignored");
            return Ok(SubredditRefresh::EmptyCatalog);
        }

        let listed: HashSet<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        let known_names: HashSet<&str> = known.iter().map(|row| row.name.as_str()).collect();

        let mut ops = Vec::with_capacity(entries.len() + known.len() + 1);
        let mut removed = 0;
        for row in &known {
            if !listed.contains(row.name.as_str()) {
                ops.push(StoreOp::DeleteSubreddit {
                    name: row.name.clone(),
                });
                removed += 1;
            }
        }
        let mut added = 0;
        let mut updated = 0;
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.name.is_empty() || !seen.insert(entry.name.as_str()) {
                continue;
            }
            if known_names.contains(entry.name.as_str()) {
                updated += 1;
            } else {
                added += 1;
            }
            ops.push(StoreOp::UpsertSubreddit {
                name: entry.name.clone(),
                size_bytes: entry.size_bytes,
                added_at: entry.added_at,
            });
        }
        ops.push(StoreOp::SetCatalogWatermark(last_modified));

        if cancel.is_cancelled() {
            return Err(SyncError::Interrupted);
        }
        store.apply_batch(ops).await?;
        info!(added, removed, updated, "subreddit list stored");
        Ok(SubredditRefresh::Updated {
            added,
            removed,
            updated,
        })
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Interrupted);
        }
        self.gate.check_can_download()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod tests;
