use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use emotes_core::CatalogClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::catalog::{CatalogFetcher, SubredditRefresh};
use crate::sync::engine::{DEFAULT_WORKERS, SyncEngine, SyncSettings};
use crate::sync::error::SyncError;
use crate::sync::gate::{CapabilityGate, DirectoryProbe, NetworkInfo, NetworkMonitor};
use crate::sync::index::{CatalogStore, IndexStore, StoreChange, SubredditRecord};
use crate::sync::outcome::SyncOutcome;
use crate::sync::transfer::TransferClient;

const DEFAULT_BASE_URL: &str = "http://berrymotes.pew.cc/";
const DEFAULT_SYNC_INTERVAL_HOURS: u64 = 6;
const APP_DIR_NAME: &str = "emotes";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub base_url: String,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub settings: SyncSettings,
    pub workers: usize,
    /// Zero runs a single pass.
    pub sync_interval: Duration,
    pub on_wifi: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let app_root = default_app_root();
        let base_url =
            std::env::var("EMOTES_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let data_dir = std::env::var("EMOTES_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| app_root.join("images"));
        let db_path = std::env::var("EMOTES_DB_PATH")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| app_root.join("catalog.db"));
        let settings = SyncSettings {
            wifi_only: read_bool_env("EMOTES_WIFI_ONLY", true),
            include_adult: read_bool_env("EMOTES_SYNC_ADULT", false),
            sync_all: read_bool_env("EMOTES_SYNC_ALL", true),
            subreddits: std::env::var("EMOTES_SUBREDDITS")
                .ok()
                .map(|value| parse_subreddit_list(&value)),
        };
        let workers = read_u64_env("EMOTES_WORKERS", DEFAULT_WORKERS as u64).max(1) as usize;
        let sync_interval = Duration::from_secs(
            hours_to_secs(read_u64_env(
                "EMOTES_SYNC_INTERVAL_HOURS",
                DEFAULT_SYNC_INTERVAL_HOURS,
            )),
        );
        let on_wifi = read_bool_env("EMOTES_ON_WIFI", true);

        Ok(Self {
            base_url,
            data_dir,
            db_path,
            settings,
            workers,
            sync_interval,
            on_wifi,
        })
    }
}

/// The host process around the sync engine. Exposes the two entry points a
/// scheduler needs: run one pass now, and cancel the pass in progress.
pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: SyncEngine<IndexStore>,
    network: Arc<NetworkMonitor>,
    current_pass: Mutex<Option<CancellationToken>>,
    pass_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;
        let store = IndexStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open catalog store at {:?}", config.db_path))?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: DaemonConfig, store: IndexStore) -> anyhow::Result<Self> {
        let client = CatalogClient::with_base_url(&config.base_url)
            .with_context(|| format!("invalid catalog base url {:?}", config.base_url))?;
        let network = Arc::new(NetworkMonitor::new(NetworkInfo {
            connected: true,
            on_wifi: config.on_wifi,
        }));
        let gate = CapabilityGate::new(
            Arc::clone(&network),
            Arc::new(DirectoryProbe::new(config.data_dir.clone())),
            config.settings.wifi_only,
        );
        let engine = SyncEngine::new(
            store,
            CatalogFetcher::new(client, gate),
            TransferClient::new(),
            config.data_dir.clone(),
            config.settings.clone(),
        )
        .with_workers(config.workers);

        Ok(Self {
            config,
            engine,
            network,
            current_pass: Mutex::new(None),
            pass_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Connectivity monitor the host updates on network changes.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn subscribe_changes(&self) -> tokio::sync::broadcast::Receiver<StoreChange> {
        self.engine.store().subscribe()
    }

    /// Runs one sync pass now. Concurrent calls wait for the running pass
    /// to finish first.
    pub async fn run_pass(&self) -> SyncOutcome {
        let _guard = self.pass_lock.lock().await;
        let cancel = self.shutdown.child_token();
        self.set_current_pass(Some(cancel.clone()));
        let outcome = self.engine.run_pass(&cancel).await;
        self.set_current_pass(None);
        outcome
    }

    /// Refreshes the subreddit list without waiting behind a refresh that
    /// is already running, then returns the known subreddits.
    pub async fn refresh_subreddits(&self) -> Result<Vec<SubredditRecord>, SyncError> {
        let cancel = self.shutdown.child_token();
        match self.engine.refresh_subreddit_list(&cancel).await? {
            SubredditRefresh::Skipped => info!("subreddit list refresh already running"),
            refresh => debug!(?refresh, "subreddit list refreshed"),
        }
        Ok(self.engine.store().list_subreddits().await?)
    }

    /// Asks the running pass, if any, to stop at its next checkpoint.
    pub fn cancel_pass(&self) -> bool {
        let current = self
            .current_pass
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match current.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            base_url = %self.config.base_url,
            data_dir = %self.config.data_dir.display(),
            workers = self.config.workers,
            "emotesd started"
        );
        let shutdown = self.shutdown.clone();
        let signal_handle = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling sync");
                shutdown.cancel();
            }
        });

        loop {
            let outcome = self.run_pass().await;
            log_outcome(&outcome);
            if self.shutdown.is_cancelled() || self.config.sync_interval.is_zero() {
                break;
            }
            let wait = next_pass_delay(self.config.sync_interval, &outcome);
            info!(wait_secs = wait.as_secs(), "next sync scheduled");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        signal_handle.abort();
        info!("emotesd stopped");
        Ok(())
    }

    fn set_current_pass(&self, token: Option<CancellationToken>) {
        let mut current = self
            .current_pass
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = token;
    }
}

fn log_outcome(outcome: &SyncOutcome) {
    if outcome.has_error() {
        warn!(
            io_errors = outcome.io_errors,
            parse_errors = outcome.parse_errors,
            database_error = outcome.database_error,
            too_many_deletions = outcome.too_many_deletions,
            more_records_to_get = outcome.more_records_to_get,
            retry_delay_secs = outcome.retry_delay.as_secs(),
            "sync pass finished with errors"
        );
    } else {
        info!(
            inserted = outcome.inserted,
            deleted = outcome.deleted,
            "sync pass finished"
        );
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
