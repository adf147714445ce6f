use std::path::PathBuf;
use std::fs;
use crate::common::config::StorageConfig;
use crate::common::error::Result;
use crate::common::paths;

/// Resolves where durable state lives: `./dev_data` in dev mode,
/// the system layout otherwise. Explicit `[storage]` paths win over both.
#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        Self::with_base_dir(enabled, PathBuf::from("./dev_data"))
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        if enabled {
            fs::create_dir_all(&base_dir)?;
            fs::create_dir_all(base_dir.join("profiles"))?;
            fs::create_dir_all(base_dir.join("ledger"))?;
            fs::create_dir_all(base_dir.join("snapshots"))?;

            tracing::info!("Development mode enabled - data will be saved to: {}",
                     base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn profiles_dir(&self, storage: &StorageConfig) -> PathBuf {
        match &storage.profiles_dir {
            Some(dir) => dir.clone(),
            None if self.enabled => self.base_dir.join("profiles"),
            None => paths::system_profiles_dir(),
        }
    }

    pub fn ledger_path(&self, storage: &StorageConfig) -> PathBuf {
        match &storage.ledger_path {
            Some(path) => path.clone(),
            None if self.enabled => self.base_dir.join("ledger").join("detections.jsonl"),
            None => paths::system_ledger_file(),
        }
    }

    pub fn ledger_key_path(&self, storage: &StorageConfig) -> PathBuf {
        match &storage.ledger_key_path {
            Some(path) => path.clone(),
            None if self.enabled => self.base_dir.join("ledger").join(".key"),
            None => paths::system_ledger_key(),
        }
    }

    pub fn control_socket(&self, storage: &StorageConfig) -> PathBuf {
        match &storage.control_socket {
            Some(path) => path.clone(),
            None if self.enabled => self.base_dir.join("kioskface.sock"),
            None => paths::system_control_socket(),
        }
    }

    pub fn snapshots_dir(&self, storage: &StorageConfig) -> PathBuf {
        match &storage.snapshots_dir {
            Some(dir) => dir.clone(),
            None if self.enabled => self.base_dir.join("snapshots"),
            None => paths::system_snapshots_dir(),
        }
    }
}
