use std::path::PathBuf;
use std::sync::Arc;

use emotes_core::{CatalogResult, RemoteEmote, Watermark};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog::CatalogFetcher;
use super::error::SyncError;
use super::index::{CatalogStore, StoreOp};
use super::outcome::SyncOutcome;
use super::paths::image_path_for;
use super::reconcile::{CatalogFilter, InsertCandidate, StaleHash, plan, prepare_catalog};
use super::transfer::{ImageFetch, TransferClient, ensure_nomedia, remove_if_exists};

/// Everything a pipeline needs, shared by all pipelines of a pass.
pub struct SyncContext<S> {
    pub store: S,
    pub fetcher: CatalogFetcher,
    pub transfer: TransferClient,
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    FetchingCatalog,
    Reconciling,
    DownloadingImages,
    ApplyingBatch,
    Done,
    Failed,
    Aborted,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Failed | PipelineState::Aborted
        )
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub subreddit: String,
    pub state: PipelineState,
    pub outcome: SyncOutcome,
}

/// One subreddit's fetch, reconcile, download and commit sequence.
pub struct SubredditPipeline<S> {
    ctx: Arc<SyncContext<S>>,
    subreddit: String,
    filter: CatalogFilter,
    cancel: CancellationToken,
    state: PipelineState,
    outcome: SyncOutcome,
}

impl<S: CatalogStore> SubredditPipeline<S> {
    pub fn new(
        ctx: Arc<SyncContext<S>>,
        subreddit: String,
        filter: CatalogFilter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            subreddit,
            filter,
            cancel,
            state: PipelineState::Idle,
            outcome: SyncOutcome::default(),
        }
    }

    /// Runs to a terminal state. Errors never escape; they are folded into
    /// the returned outcome.
    pub async fn run(mut self) -> PipelineReport {
        if let Err(err) = self.drive().await {
            err.record(&mut self.outcome);
            if matches!(err, SyncError::Interrupted) {
                info!(subreddit = %self.subreddit, "sync interrupted");
                self.state = PipelineState::Aborted;
            } else {
                warn!(subreddit = %self.subreddit, error = %err, "subreddit sync failed");
                self.state = PipelineState::Failed;
            }
        }
        PipelineReport {
            subreddit: self.subreddit,
            state: self.state,
            outcome: self.outcome,
        }
    }

    async fn drive(&mut self) -> Result<(), SyncError> {
        self.transition(PipelineState::FetchingCatalog)?;
        let since = self
            .ctx
            .store
            .get_subreddit(&self.subreddit)
            .await?
            .map(|row| row.last_sync)
            .unwrap_or_default();

        let fetched = self
            .ctx
            .fetcher
            .fetch_emotes(&self.subreddit, since, &self.cancel)
            .await?;
        let (entries, last_modified) = match fetched {
            CatalogResult::NotModified => {
                debug!(subreddit = %self.subreddit, "emote list already up to date");
                return self.finish(PipelineState::Done);
            }
            CatalogResult::Gone => {
                info!(subreddit = %self.subreddit, "emote list missing on server, removing emotes");
                let deleted = delete_subreddit(&self.ctx, &self.subreddit, &self.cancel).await?;
                self.outcome.deleted += deleted;
                return self.finish(PipelineState::Aborted);
            }
            CatalogResult::Catalog {
                entries,
                last_modified,
            } => (entries, last_modified),
        };
        info!(subreddit = %self.subreddit, count = entries.len(), "emote list loaded");

        let local = self.ctx.store.list_emotes(&self.subreddit).await?;
        if entries.is_empty() {
            // An empty list never wipes local emotes; the watermark stays so
            // the next pass asks again.
            if local.is_empty() {
                self.advance_watermark(last_modified).await?;
            } else {
                warn!(
                    subreddit = %self.subreddit,
                    local = local.len(),
                    "empty emote list would delete every emote, skipping"
                );
                self.outcome.too_many_deletions = true;
            }
            return self.finish(PipelineState::Done);
        }

        self.transition(PipelineState::Reconciling)?;
        let remote = prepare_catalog(&self.subreddit, entries, &self.filter);
        let plan = plan(&remote, &local);
        self.remove_stale_files(&plan.stale_hashes).await?;

        self.transition(PipelineState::DownloadingImages)?;
        let accepted = self.download_images(plan.inserts).await?;

        self.transition(PipelineState::ApplyingBatch)?;
        let mut ops = Vec::new();
        for stale in &plan.stale_hashes {
            debug!(subreddit = %self.subreddit, hash = %stale.hash, image = %stale.image, "removing (not in emote list)");
            ops.push(StoreOp::DeleteEmoteHash {
                subreddit: self.subreddit.clone(),
                hash: stale.hash.clone(),
            });
        }
        for row in &plan.stale_names {
            debug!(subreddit = %self.subreddit, name = %row.name, hash = %row.hash, "removing name");
            ops.push(StoreOp::DeleteEmoteName { id: row.id });
        }
        for candidate in &accepted {
            ops.extend(candidate.rows(&self.subreddit).map(StoreOp::InsertEmote));
        }
        // Per-item failures already landed in the outcome; a dirty outcome
        // keeps the old watermark so the next pass refetches.
        if !self.outcome.has_error() {
            ops.push(StoreOp::SetSubredditWatermark {
                name: self.subreddit.clone(),
                watermark: last_modified,
            });
        }

        self.checkpoint()?;
        let summary = self.ctx.store.apply_batch(ops).await?;
        self.outcome.inserted += summary.inserted;
        self.outcome.deleted += summary.deleted;
        if summary.deleted > 0 {
            info!(subreddit = %self.subreddit, count = summary.deleted, "removed emotes from store");
        }
        if summary.inserted > 0 {
            info!(subreddit = %self.subreddit, count = summary.inserted, "added emotes to store");
        }
        self.finish(PipelineState::Done)
    }

    async fn remove_stale_files(&self, stale: &[StaleHash]) -> Result<(), SyncError> {
        for entry in stale {
            if !entry.remove_file {
                continue;
            }
            self.checkpoint()?;
            self.ctx.fetcher.gate().check_storage()?;
            match image_path_for(&self.ctx.base_dir, &entry.image) {
                Ok(path) => {
                    remove_if_exists(&path).await?;
                }
                Err(err) => {
                    warn!(subreddit = %self.subreddit, image = %entry.image, error = %err, "not removing image");
                }
            }
        }
        Ok(())
    }

    async fn download_images(
        &mut self,
        candidates: Vec<InsertCandidate>,
    ) -> Result<Vec<InsertCandidate>, SyncError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        ensure_nomedia(&self.ctx.base_dir, self.ctx.fetcher.gate()).await?;

        let mut accepted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            self.checkpoint()?;
            match self.download_image(&candidate.entry).await {
                Ok(fetched) => {
                    debug!(subreddit = %self.subreddit, image = %candidate.entry.image, ?fetched, "image ready");
                    accepted.push(candidate);
                }
                Err(err) if err.is_per_item() => {
                    warn!(subreddit = %self.subreddit, image = %candidate.entry.image, error = %err, "failed to download");
                    err.record(&mut self.outcome);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(accepted)
    }

    async fn download_image(&self, entry: &RemoteEmote) -> Result<ImageFetch, SyncError> {
        let url = self.ctx.fetcher.client().image_url(&entry.image)?;
        let target = image_path_for(&self.ctx.base_dir, &entry.image)?;
        let fetched = self
            .ctx
            .transfer
            .fetch_image(url, &target, self.ctx.fetcher.gate(), &self.cancel)
            .await?;
        Ok(fetched)
    }

    async fn advance_watermark(&self, watermark: Watermark) -> Result<(), SyncError> {
        self.checkpoint()?;
        self.ctx
            .store
            .apply_batch(vec![StoreOp::SetSubredditWatermark {
                name: self.subreddit.clone(),
                watermark,
            }])
            .await?;
        Ok(())
    }

    fn transition(&mut self, next: PipelineState) -> Result<(), SyncError> {
        self.checkpoint()?;
        debug!(subreddit = %self.subreddit, from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
        Ok(())
    }

    fn finish(&mut self, terminal: PipelineState) -> Result<(), SyncError> {
        debug!(subreddit = %self.subreddit, from = ?self.state, to = ?terminal, "pipeline state");
        self.state = terminal;
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Removes every image and emote row of `subreddit` and resets its
/// watermark. Returns the number of emote rows deleted.
pub async fn delete_subreddit<S: CatalogStore>(
    ctx: &SyncContext<S>,
    subreddit: &str,
    cancel: &CancellationToken,
) -> Result<u64, SyncError> {
    debug!(subreddit, "removing emotes");
    for image in ctx.store.distinct_images(subreddit).await? {
        if cancel.is_cancelled() {
            return Err(SyncError::Interrupted);
        }
        ctx.fetcher.gate().check_storage()?;
        match image_path_for(&ctx.base_dir, &image) {
            Ok(path) => {
                remove_if_exists(&path).await?;
            }
            Err(err) => warn!(subreddit, image = %image, error = %err, "not removing image"),
        }
    }

    if cancel.is_cancelled() {
        return Err(SyncError::Interrupted);
    }
    let summary = ctx
        .store
        .apply_batch(vec![
            StoreOp::DeleteSubredditEmotes {
                subreddit: subreddit.to_string(),
            },
            StoreOp::SetSubredditWatermark {
                name: subreddit.to_string(),
                watermark: Watermark::NONE,
            },
        ])
        .await?;
    if summary.deleted > 0 {
        info!(subreddit, count = summary.deleted, "subreddit deleted");
    }
    Ok(summary.deleted)
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
