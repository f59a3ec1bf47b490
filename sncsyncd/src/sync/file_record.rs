use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use super::hash::fingerprint;
use super::paths::{MappingError, SyncCoordinate, normalize_path, resolve};
use super::sidecar::{self, SidecarError, SyncMeta, sidecar_path_for};
use crate::config::SyncConfig;

/// One tracked local file: its coordinate, sticky errors and last-synced metadata.
#[derive(Debug)]
pub struct FileRecord {
    path: PathBuf,
    key: String,
    coordinate: SyncCoordinate,
    sidecar: PathBuf,
    errors: Mutex<Vec<String>>,
    newly_discovered: AtomicBool,
    meta: tokio::sync::Mutex<Option<SyncMeta>>,
}

impl FileRecord {
    /// Returns `Ok(None)` when the path is outside the sync set; such a record must
    /// not be tracked.
    pub fn new(config: &SyncConfig, path: &Path) -> Result<Option<Self>, MappingError> {
        let Some(coordinate) = resolve(config, path)? else {
            return Ok(None);
        };
        let Ok(sidecar) = sidecar_path_for(&coordinate.root, path) else {
            return Ok(None);
        };
        Ok(Some(Self {
            path: path.to_path_buf(),
            key: normalize_path(path),
            coordinate,
            sidecar,
            errors: Mutex::new(Vec::new()),
            newly_discovered: AtomicBool::new(false),
            meta: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forward-slash form of the path.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn coordinate(&self) -> &SyncCoordinate {
        &self.coordinate
    }

    /// Last synced fingerprint, or an empty string when it is unknown.
    pub async fn get_fingerprint(&self) -> String {
        let mut meta = self.meta.lock().await;
        if let Some(meta) = meta.as_ref() {
            return meta.sync_hash.clone();
        }
        match sidecar::load(&self.sidecar).await {
            Ok(loaded) => {
                let hash = loaded.sync_hash.clone();
                *meta = Some(loaded);
                hash
            }
            Err(err) => {
                warn!(file = %self.key, error = %err, "no usable sync data");
                String::new()
            }
        }
    }

    /// Remote record id from the last sync, if the record carried one.
    pub async fn sys_id(&self) -> Option<String> {
        self.meta
            .lock()
            .await
            .as_ref()
            .and_then(|meta| meta.sys_id.clone())
    }

    /// Stores the fingerprint of `content` (and the record id when known) in the
    /// sidecar. Returns the new fingerprint.
    pub async fn save_fingerprint(
        &self,
        content: &[u8],
        sys_id: Option<&str>,
    ) -> Result<String, SidecarError> {
        let hash = fingerprint(content);
        let mut guard = self.meta.lock().await;
        let mut meta = match guard.take() {
            Some(meta) => meta,
            None => sidecar::load(&self.sidecar).await.unwrap_or_default(),
        };
        meta.sync_hash = hash.clone();
        if let Some(sys_id) = sys_id.filter(|id| !id.is_empty()) {
            meta.sys_id = Some(sys_id.to_string());
        }
        let result = sidecar::save(&self.sidecar, &meta).await;
        *guard = Some(meta);
        result?;
        debug!(file = %self.key, %hash, "sync data saved");
        Ok(hash)
    }

    /// Deletes the sidecar and forgets cached metadata.
    pub async fn clear_sync_state(&self) -> Result<(), SidecarError> {
        let mut guard = self.meta.lock().await;
        *guard = None;
        sidecar::clear(&self.sidecar).await
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(file = %self.key, %message, "file excluded from sync");
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(message);
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }

    pub fn has_errors(&self) -> bool {
        self.errors
            .lock()
            .map(|errors| !errors.is_empty())
            .unwrap_or(true)
    }

    pub fn mark_newly_discovered(&self, value: bool) {
        self.newly_discovered.store(value, Ordering::SeqCst);
    }

    /// Reads and clears the flag.
    pub fn take_newly_discovered(&self) -> bool {
        self.newly_discovered.swap(false, Ordering::SeqCst)
    }
}
