use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("network not available: {0}")]
    NetworkUnavailable(&'static str),
    #[error("storage not available")]
    StorageUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkInfo {
    pub connected: bool,
    pub on_wifi: bool,
}

/// Connectivity as last reported by the host. Shared by every pipeline and
/// updated whenever the host observes a connectivity change.
#[derive(Debug, Default)]
pub struct NetworkMonitor {
    info: Mutex<NetworkInfo>,
}

impl NetworkMonitor {
    pub fn new(info: NetworkInfo) -> Self {
        Self {
            info: Mutex::new(info),
        }
    }

    pub fn update(&self, info: NetworkInfo) {
        let mut guard = self.info.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = info;
    }

    pub fn current(&self) -> NetworkInfo {
        *self.info.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub trait StorageProbe: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Storage is available while the base directory exists as a directory.
#[derive(Debug, Clone)]
pub struct DirectoryProbe {
    root: PathBuf,
}

impl DirectoryProbe {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl StorageProbe for DirectoryProbe {
    fn is_available(&self) -> bool {
        std::fs::metadata(&self.root)
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

/// Host-driven storage flag, flipped on mount/unmount notifications.
#[derive(Debug)]
pub struct StorageSwitch(AtomicBool);

impl StorageSwitch {
    pub fn new(available: bool) -> Self {
        Self(AtomicBool::new(available))
    }

    pub fn set(&self, available: bool) {
        self.0.store(available, Ordering::SeqCst);
    }
}

impl StorageProbe for StorageSwitch {
    fn is_available(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Both gates are evaluated on every call; nothing is cached between
/// attempts, so a flip mid-sync is seen by the next checkpoint.
#[derive(Clone)]
pub struct CapabilityGate {
    network: Arc<NetworkMonitor>,
    storage: Arc<dyn StorageProbe>,
    wifi_only: bool,
}

impl CapabilityGate {
    pub fn new(
        network: Arc<NetworkMonitor>,
        storage: Arc<dyn StorageProbe>,
        wifi_only: bool,
    ) -> Self {
        Self {
            network,
            storage,
            wifi_only,
        }
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn check_can_download(&self) -> Result<(), GateError> {
        let info = self.network.current();
        if !info.connected {
            Err(GateError::NetworkUnavailable("no network connection"))
        } else if self.wifi_only && !info.on_wifi {
            Err(GateError::NetworkUnavailable("downloading on mobile is disabled"))
        } else {
            Ok(())
        }
    }

    pub fn check_storage(&self) -> Result<(), GateError> {
        if self.storage.is_available() {
            Ok(())
        } else {
            Err(GateError::StorageUnavailable)
        }
    }
}
