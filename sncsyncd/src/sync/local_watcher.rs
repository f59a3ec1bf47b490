use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::paths::is_hidden;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Add { path: PathBuf, size: u64 },
    Change { path: PathBuf, size: u64 },
    /// Initial scan of this generation finished.
    Ready,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub generation: u64,
    pub kind: WatchEventKind,
}

/// Start/stop handle the engine uses to pause watching around its own writes.
/// Both operations are idempotent.
pub trait WatchControl: Send + Sync {
    fn start(&self) -> Result<(), WatchError>;
    fn stop(&self);
    fn is_running(&self) -> bool;
}

#[derive(Default)]
struct WatchState {
    last_generation: u64,
    watcher: Option<RecommendedWatcher>,
    scan: Option<JoinHandle<()>>,
}

/// Recursive watcher over every root, restartable any number of times.
pub struct FolderWatcher {
    roots: Arc<Vec<PathBuf>>,
    tx: mpsc::UnboundedSender<WatchEvent>,
    active: Arc<AtomicU64>,
    state: Mutex<WatchState>,
}

impl FolderWatcher {
    pub fn new(roots: Vec<PathBuf>) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                roots: Arc::new(roots),
                tx,
                active: Arc::new(AtomicU64::new(0)),
                state: Mutex::new(WatchState::default()),
            },
            rx,
        )
    }

    /// Whether an event belongs to the running generation.
    pub fn is_current(&self, generation: u64) -> bool {
        generation != 0 && self.active.load(Ordering::SeqCst) == generation
    }
}

impl WatchControl for FolderWatcher {
    fn start(&self) -> Result<(), WatchError> {
        let Ok(mut state) = self.state.lock() else {
            return Ok(());
        };
        if state.watcher.is_some() {
            return Ok(());
        }
        state.last_generation += 1;
        let generation = state.last_generation;

        let roots = Arc::clone(&self.roots);
        let tx = self.tx.clone();
        let active = Arc::clone(&self.active);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if active.load(Ordering::SeqCst) != generation {
                return;
            }
            let kinds = match res {
                Ok(event) => map_event(&roots, event, file_size),
                Err(err) => vec![WatchEventKind::Error(err.to_string())],
            };
            for kind in kinds {
                let _ = tx.send(WatchEvent { generation, kind });
            }
        })?;
        for root in self.roots.iter() {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }

        self.active.store(generation, Ordering::SeqCst);
        state.watcher = Some(watcher);
        state.scan = Some(tokio::spawn(initial_scan(
            Arc::clone(&self.roots),
            self.tx.clone(),
            Arc::clone(&self.active),
            generation,
        )));
        info!(generation, "watcher started");
        Ok(())
    }

    fn stop(&self) {
        self.active.store(0, Ordering::SeqCst);
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(scan) = state.scan.take() {
            scan.abort();
        }
        if state.watcher.take().is_some() {
            info!(generation = state.last_generation, "watcher stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.watcher.is_some())
            .unwrap_or(false)
    }
}

/// Watcher stand-in that only records start/stop calls. Used when events are driven
/// by hand.
#[derive(Debug, Default)]
pub struct IdleWatcher {
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl IdleWatcher {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl WatchControl for IdleWatcher {
    fn start(&self) -> Result<(), WatchError> {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn initial_scan(
    roots: Arc<Vec<PathBuf>>,
    tx: mpsc::UnboundedSender<WatchEvent>,
    active: Arc<AtomicU64>,
    generation: u64,
) {
    let mut pending: Vec<PathBuf> = roots.iter().cloned().collect();
    let mut found = 0usize;
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "skipping unreadable directory");
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                if active.load(Ordering::SeqCst) != generation {
                    return;
                }
                found += 1;
                let _ = tx.send(WatchEvent {
                    generation,
                    kind: WatchEventKind::Add {
                        path: entry.path(),
                        size: meta.len(),
                    },
                });
            }
        }
    }
    if active.load(Ordering::SeqCst) == generation {
        debug!(generation, files = found, "initial scan complete");
        let _ = tx.send(WatchEvent {
            generation,
            kind: WatchEventKind::Ready,
        });
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

fn is_watched(roots: &[PathBuf], path: &Path) -> bool {
    roots.iter().any(|root| {
        path.strip_prefix(root)
            .map(|relative| !relative.as_os_str().is_empty() && !is_hidden(relative))
            .unwrap_or(false)
    })
}

fn map_event<F>(roots: &[PathBuf], event: Event, size_of: F) -> Vec<WatchEventKind>
where
    F: Fn(&Path) -> Option<u64>,
{
    let is_create = matches!(event.kind, EventKind::Create(_));
    let paths: Vec<PathBuf> = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().skip(1).take(1).collect()
        }
        EventKind::Create(CreateKind::Folder) => return Vec::new(),
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        _ => return Vec::new(),
    };

    paths
        .into_iter()
        .filter(|path| is_watched(roots, path))
        .filter_map(|path| {
            let size = size_of(&path)?;
            Some(if is_create {
                WatchEventKind::Add { path, size }
            } else {
                WatchEventKind::Change { path, size }
            })
        })
        .collect()
}
