use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::catalog::{CatalogFetcher, SubredditRefresh};
use super::error::SyncError;
use super::index::{CatalogStore, StoreOp};
use super::outcome::SyncOutcome;
use super::pipeline::{PipelineReport, SubredditPipeline, SyncContext, delete_subreddit};
use super::reconcile::CatalogFilter;
use super::transfer::TransferClient;

pub const DEFAULT_WORKERS: usize = 4;

/// User preferences the engine reads at the start of every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub wifi_only: bool,
    pub include_adult: bool,
    pub sync_all: bool,
    /// Subreddits to keep enabled. `None` leaves the stored flags alone.
    pub subreddits: Option<Vec<String>>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            wifi_only: true,
            include_adult: false,
            sync_all: true,
            subreddits: None,
        }
    }
}

impl SyncSettings {
    /// Identifies the catalog filter watermarks were taken under. A change
    /// means conditional fetches can no longer be trusted.
    pub fn fingerprint(&self) -> String {
        format!(
            "include_adult={};sync_all={}",
            self.include_adult, self.sync_all
        )
    }
}

pub struct SyncEngine<S> {
    ctx: Arc<SyncContext<S>>,
    settings: SyncSettings,
    workers: usize,
}

impl<S: CatalogStore> SyncEngine<S> {
    pub fn new(
        store: S,
        fetcher: CatalogFetcher,
        transfer: TransferClient,
        base_dir: PathBuf,
        settings: SyncSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(SyncContext {
                store,
                fetcher,
                transfer,
                base_dir,
            }),
            settings,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.ctx.store
    }

    /// Refreshes the subreddit list unless a refresh is already running.
    pub async fn refresh_subreddit_list(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SubredditRefresh, SyncError> {
        self.ctx
            .fetcher
            .try_refresh_subreddits(&self.ctx.store, cancel)
            .await
    }

    /// Runs one full pass: subreddit list refresh, one pipeline per
    /// subreddit on the worker pool, then removal of subreddits that are no
    /// longer synced. Never fails; everything lands in the outcome.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> SyncOutcome {
        info!("emote sync started");
        let mut total = SyncOutcome::default();

        let gate = self.ctx.fetcher.gate();
        if let Err(err) = gate.check_can_download().and_then(|()| gate.check_storage()) {
            error!(error = %err, "emote sync not possible");
            SyncError::from(err).record(&mut total);
            return total;
        }

        if let Err(err) = self.reset_on_settings_change().await {
            error!(error = %err, "failed to check sync settings");
            err.record(&mut total);
            return total;
        }

        match self
            .ctx
            .fetcher
            .refresh_subreddits(&self.ctx.store, cancel)
            .await
        {
            Ok(SubredditRefresh::EmptyCatalog) => total.too_many_deletions = true,
            Ok(refresh) => debug!(?refresh, "subreddit list refreshed"),
            Err(SyncError::Interrupted) => {
                info!("emote sync interrupted");
                total.more_records_to_get = true;
                return total;
            }
            Err(err) => {
                warn!(error = %err, "subreddit list refresh failed, using known subreddits");
                err.record(&mut total);
            }
        }

        if let Some(selection) = &self.settings.subreddits {
            if let Err(err) = self.apply_selection(selection).await {
                warn!(error = %err, "failed to apply subreddit selection");
                err.record(&mut total);
            }
        }

        let subreddits = match self.ctx.store.list_subreddits().await {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "failed to read subreddits");
                SyncError::from(err).record(&mut total);
                return total;
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut dispatched = HashSet::new();
        let mut doomed = Vec::new();
        for row in subreddits {
            if !(self.settings.sync_all || row.enabled) {
                doomed.push(row.name);
                continue;
            }
            let filter = CatalogFilter {
                sync_all: self.settings.sync_all,
                subreddit_enabled: row.enabled,
                include_adult: self.settings.include_adult,
            };
            let pipeline =
                SubredditPipeline::new(self.ctx.clone(), row.name.clone(), filter, cancel.clone());
            let permits = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                Some(pipeline.run().await)
            });
            dispatched.insert(row.name);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(report)) => self.fold_report(&mut total, report),
                Ok(None) => total.more_records_to_get = true,
                Err(err) => {
                    error!(error = %err, "pipeline task failed");
                    total.more_records_to_get = true;
                }
            }
        }

        match self.ctx.store.distinct_emote_subreddits().await {
            Ok(names) => {
                for name in names {
                    if !dispatched.contains(&name) && !doomed.contains(&name) {
                        doomed.push(name);
                    }
                }
            }
            Err(err) => SyncError::from(err).record(&mut total),
        }
        for name in doomed {
            match delete_subreddit(&self.ctx, &name, cancel).await {
                Ok(deleted) => total.deleted += deleted,
                Err(err) => {
                    warn!(subreddit = %name, error = %err, "failed to remove subreddit");
                    err.record(&mut total);
                    if matches!(err, SyncError::Interrupted) {
                        break;
                    }
                }
            }
        }

        info!(
            inserted = total.inserted,
            deleted = total.deleted,
            io_errors = total.io_errors,
            parse_errors = total.parse_errors,
            "emote sync finished"
        );
        total
    }

    async fn reset_on_settings_change(&self) -> Result<(), SyncError> {
        let current = self.settings.fingerprint();
        let stored = self.ctx.store.settings_fingerprint().await?;
        if stored.as_deref() == Some(current.as_str()) {
            return Ok(());
        }
        if stored.is_some() {
            info!(settings = %current, "sync settings changed, resyncing every subreddit");
        }
        self.ctx
            .store
            .apply_batch(vec![
                StoreOp::ResetSubredditWatermarks,
                StoreOp::SetSettingsFingerprint(current),
            ])
            .await?;
        Ok(())
    }

    async fn apply_selection(&self, selection: &[String]) -> Result<(), SyncError> {
        let wanted: HashSet<&str> = selection.iter().map(String::as_str).collect();
        let ops: Vec<StoreOp> = self
            .ctx
            .store
            .list_subreddits()
            .await?
            .into_iter()
            .filter(|row| row.enabled != wanted.contains(row.name.as_str()))
            .map(|row| {
                let enabled = !row.enabled;
                debug!(subreddit = %row.name, enabled, "subreddit selection changed");
                StoreOp::SetSubredditEnabled {
                    name: row.name,
                    enabled,
                }
            })
            .collect();
        if !ops.is_empty() {
            self.ctx.store.apply_batch(ops).await?;
        }
        Ok(())
    }

    fn fold_report(&self, total: &mut SyncOutcome, report: PipelineReport) {
        debug_assert!(report.state.is_terminal());
        debug!(subreddit = %report.subreddit, state = ?report.state, "pipeline finished");
        total.merge(&report.outcome);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
