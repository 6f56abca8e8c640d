use std::time::Duration;

use emotes_core::CatalogError;
use thiserror::Error;

use super::gate::GateError;
use super::index::StoreError;
use super::outcome::SyncOutcome;
use super::paths::PathError;
use super::transfer::TransferError;

pub const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(30 * 60);
pub const MALFORMED_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network not available: {0}")]
    NetworkUnavailable(&'static str),
    #[error("storage not available")]
    StorageUnavailable,
    #[error("transport error: {0}")]
    Transport(#[source] CatalogError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed endpoint: {0}")]
    MalformedEndpoint(#[source] CatalogError),
    #[error("malformed catalog: {0}")]
    Parse(#[source] CatalogError),
    #[error("bad image path: {0}")]
    Path(#[from] PathError),
    #[error("download failed: {0}")]
    DownloadFailed(#[source] TransferError),
    #[error("store commit failed: {0}")]
    StoreCommit(#[from] StoreError),
    #[error("interrupted")]
    Interrupted,
}

impl SyncError {
    /// Errors that only affect a single image; the pipeline drops the item
    /// and carries on.
    pub fn is_per_item(&self) -> bool {
        matches!(self, SyncError::DownloadFailed(_) | SyncError::Path(_))
    }

    /// Folds this error into `outcome`: counters, flags and the suggested
    /// retry delay.
    pub fn record(&self, outcome: &mut SyncOutcome) {
        match self {
            SyncError::NetworkUnavailable(_)
            | SyncError::StorageUnavailable
            | SyncError::Transport(_)
            | SyncError::Io(_)
            | SyncError::DownloadFailed(_) => {
                outcome.io_errors += 1;
                outcome.suggest_retry(TRANSPORT_RETRY_DELAY);
            }
            SyncError::MalformedEndpoint(_) | SyncError::Parse(_) | SyncError::Path(_) => {
                outcome.parse_errors += 1;
                outcome.suggest_retry(MALFORMED_RETRY_DELAY);
            }
            SyncError::StoreCommit(_) => outcome.database_error = true,
            SyncError::Interrupted => outcome.more_records_to_get = true,
        }
    }
}

impl From<GateError> for SyncError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::NetworkUnavailable(reason) => SyncError::NetworkUnavailable(reason),
            GateError::StorageUnavailable => SyncError::StorageUnavailable,
        }
    }
}

impl From<CatalogError> for SyncError {
    fn from(err: CatalogError) -> Self {
        if err.is_malformed_endpoint() {
            SyncError::MalformedEndpoint(err)
        } else if matches!(err, CatalogError::Json(_)) {
            SyncError::Parse(err)
        } else {
            SyncError::Transport(err)
        }
    }
}

impl From<TransferError> for SyncError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Gate(gate) => gate.into(),
            TransferError::Interrupted => SyncError::Interrupted,
            TransferError::Io(io) => SyncError::Io(io),
            other => SyncError::DownloadFailed(other),
        }
    }
}
