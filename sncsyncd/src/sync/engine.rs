use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snc_core::{RecordClient, SncError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::conflict::{SyncDecision, check_local, check_remote};
use super::file_record::FileRecord;
use super::hash::fingerprint;
use super::local_watcher::{WatchControl, WatchEventKind};
use super::paths::{MappingError, normalize_path};
use super::queue::{QueueTransition, TransferQueue};
use super::sidecar::SidecarError;
use crate::config::SyncConfig;
use crate::notifier::{Notifier, NotifyCode, NotifyContext};

/// Quiet period before watching resumes after the last download.
pub const WATCH_RESTART_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),
    #[error("api error: {0}")]
    Api(#[from] SncError),
    #[error("sync data error: {0}")]
    Sidecar(#[from] SidecarError),
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no client configured for root {0:?}")]
    NoClient(PathBuf),
    #[error("no record matches {table}?{query}")]
    RecordNotFound { table: String, query: String },
    #[error("record has no field {0:?}")]
    MissingField(String),
    #[error("{0:?} is not valid UTF-8 text")]
    NotText(PathBuf),
}

impl EngineError {
    /// Failures that will repeat on every retry; the file is excluded for the session.
    fn is_sticky(&self) -> bool {
        match self {
            EngineError::RecordNotFound { .. } | EngineError::MissingField(_) => true,
            EngineError::Api(err) => !err.is_transient(),
            _ => false,
        }
    }

    fn notify_code(&self) -> NotifyCode {
        match self {
            EngineError::RecordNotFound { .. } => NotifyCode::RecordNotFound,
            EngineError::MissingField(_) => NotifyCode::ReceivedFileError,
            EngineError::Sidecar(_) => NotifyCode::SyncStateError,
            _ => NotifyCode::ComplexError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Receive,
    Send,
}

/// Orchestrates downloads and uploads for every tracked file of a session.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    clients: HashMap<PathBuf, RecordClient>,
    records: Mutex<HashMap<String, Arc<FileRecord>>>,
    queue: Arc<Mutex<TransferQueue>>,
    watcher: Arc<dyn WatchControl>,
    notifier: Arc<dyn Notifier>,
    watcher_ready: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config: Arc<SyncConfig>,
        watcher: Arc<dyn WatchControl>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, EngineError> {
        let mut clients = HashMap::new();
        for root in &config.roots {
            let client = RecordClient::new(root.client_options(config.request_timeout))?;
            clients.insert(root.path.clone(), client);
        }
        Ok(Self {
            config,
            clients,
            records: Mutex::new(HashMap::new()),
            queue: Arc::new(Mutex::new(TransferQueue::default())),
            watcher,
            notifier,
            watcher_ready: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn client_for(&self, root: &Path) -> Option<&RecordClient> {
        self.clients.get(root)
    }

    /// Returns the tracked record for `path`, creating it on first sight.
    /// `Ok(None)` means the file is not part of the sync set.
    pub fn track_file(&self, path: &Path) -> Result<Option<Arc<FileRecord>>, MappingError> {
        let key = normalize_path(path);
        if let Some(record) = self.cached(&key) {
            return Ok(Some(record));
        }
        let Some(record) = FileRecord::new(&self.config, path)? else {
            debug!(file = %key, "not a mapped file");
            return Ok(None);
        };
        let record = Arc::new(record);
        if let Ok(mut records) = self.records.lock() {
            let record = records.entry(key).or_insert(record);
            return Ok(Some(Arc::clone(record)));
        }
        Ok(Some(record))
    }

    fn cached(&self, key: &str) -> Option<Arc<FileRecord>> {
        self.records.lock().ok()?.get(key).cloned()
    }

    fn usable(&self, path: &Path) -> Option<Arc<FileRecord>> {
        let record = match self.track_file(path) {
            Ok(record) => record?,
            Err(err) => {
                error!(error = %err, "file cannot be mapped; check the configured roots");
                return None;
            }
        };
        if record.has_errors() {
            info!(
                file = %record.key(),
                errors = ?record.errors(),
                "skipping file that failed previously"
            );
            return None;
        }
        Some(record)
    }

    /// Downloads `path` from its record regardless of watcher state.
    pub async fn add_file(&self, path: &Path) -> Result<bool, EngineError> {
        let Some(record) = self.track_file(path)? else {
            return Ok(false);
        };
        if record.has_errors() {
            return Ok(false);
        }
        Ok(self.receive(&record).await)
    }

    /// Uploads `path` if the three-way check allows it.
    pub async fn send_file(&self, path: &Path) -> Result<bool, EngineError> {
        let Some(record) = self.track_file(path)? else {
            return Ok(false);
        };
        Ok(self.send(&record).await)
    }

    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, EngineError> {
        tokio::fs::read(path).await.map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), EngineError> {
        let io_err = |source: std::io::Error| EngineError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(path, data).await.map_err(io_err)
    }

    fn plan_add(&self, path: &Path, size: u64) -> Option<(Transfer, Arc<FileRecord>)> {
        let record = self.usable(path)?;
        if !self.is_watcher_ready() || size > 0 {
            return None;
        }
        info!(file = %record.key(), "syncing empty file from instance");
        record.mark_newly_discovered(true);
        Some((Transfer::Receive, record))
    }

    fn plan_change(&self, path: &Path, size: u64) -> Option<(Transfer, Arc<FileRecord>)> {
        let record = self.usable(path)?;
        if size > 0 {
            info!(file = %record.key(), "potentially syncing changed file to instance");
            Some((Transfer::Send, record))
        } else {
            info!(file = %record.key(), "file emptied; syncing from instance");
            Some((Transfer::Receive, record))
        }
    }

    async fn run(&self, transfer: Transfer, record: &FileRecord) -> bool {
        match transfer {
            Transfer::Receive => self.receive(record).await,
            Transfer::Send => self.send(record).await,
        }
    }

    /// Returns `None` when the event caused no transfer.
    pub async fn on_add(&self, path: &Path, size: u64) -> Option<bool> {
        let (transfer, record) = self.plan_add(path, size)?;
        Some(self.run(transfer, &record).await)
    }

    pub async fn on_change(&self, path: &Path, size: u64) -> Option<bool> {
        let (transfer, record) = self.plan_change(path, size)?;
        Some(self.run(transfer, &record).await)
    }

    pub fn on_ready(&self) {
        info!("watching for changes");
        self.watcher_ready.store(true, Ordering::SeqCst);
    }

    pub fn is_watcher_ready(&self) -> bool {
        self.watcher_ready.load(Ordering::SeqCst)
    }

    /// Decides synchronously and runs any resulting transfer on its own task, so
    /// events keep their order relative to `Ready`.
    pub fn handle_watch_event(self: &Arc<Self>, kind: WatchEventKind) -> Option<JoinHandle<bool>> {
        let (transfer, record) = match kind {
            WatchEventKind::Add { path, size } => self.plan_add(&path, size)?,
            WatchEventKind::Change { path, size } => self.plan_change(&path, size)?,
            WatchEventKind::Ready => {
                self.on_ready();
                return None;
            }
            WatchEventKind::Error(message) => {
                warn!(%message, "watcher error");
                return None;
            }
        };
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            engine.run(transfer, &record).await
        }))
    }

    pub fn in_flight(&self) -> usize {
        self.queue.lock().map(|queue| queue.in_flight()).unwrap_or(0)
    }

    fn notify(&self, code: NotifyCode, context: &NotifyContext) {
        let enabled = self
            .queue
            .lock()
            .map(|queue| queue.notifications_enabled())
            .unwrap_or(true);
        if enabled {
            self.notifier.notify(code, context);
        } else {
            debug!(?code, file = %context.file, "notification folded into batch summary");
        }
    }

    fn enter_queue(&self) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        if queue.enter() == QueueTransition::Activated {
            debug!("first transfer queued; pausing watcher");
            self.watcher_ready.store(false, Ordering::SeqCst);
            self.watcher.stop();
        }
    }

    fn leave_queue(&self, ok: bool) {
        let drained = match self.queue.lock() {
            Ok(mut queue) => queue.leave(ok),
            Err(_) => None,
        };
        let Some(drained) = drained else {
            return;
        };
        match drained.summary {
            Some(true) => self
                .notifier
                .notify(NotifyCode::AllDownloadsComplete, &NotifyContext::default()),
            Some(false) => self
                .notifier
                .notify(NotifyCode::DownloadsFailed, &NotifyContext::default()),
            None => {}
        }

        let queue = Arc::clone(&self.queue);
        let watcher = Arc::clone(&self.watcher);
        tokio::spawn(async move {
            tokio::time::sleep(WATCH_RESTART_DELAY).await;
            // held across start so a concurrent enter_queue cannot stop in between
            let Ok(queue) = queue.lock() else {
                return;
            };
            if queue.in_flight() == 0
                && let Err(err) = watcher.start()
            {
                error!(error = %err, "failed to restart watcher");
            }
        });
    }

    fn fail(&self, record: &FileRecord, err: &EngineError, context: &NotifyContext) {
        if err.is_sticky() {
            record.record_error(err.to_string());
        } else if matches!(err, EngineError::Sidecar(_)) {
            error!(
                file = %record.key(),
                error = %err,
                "content transferred but sync data not saved"
            );
        } else {
            warn!(file = %record.key(), error = %err, "transfer failed");
        }
        self.notify(err.notify_code(), context);
    }
}

include!("engine_transfer.rs");

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
