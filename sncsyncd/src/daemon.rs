use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{DEFAULT_CONFIG_FILE, SyncConfig};
use crate::logging::init_tracing;
use crate::notifier::{DesktopNotifier, LogNotifier, Notifier};
use crate::selftest;
use crate::sync::engine::SyncEngine;
use crate::sync::local_watcher::{FolderWatcher, IdleWatcher, WatchControl, WatchEvent};
use crate::sync::paths::is_hidden;

/// Sync data directory used by releases before `.sync_data`.
const LEGACY_SYNC_DIR: &str = ".sync";
const CONCURRENT_DOWNLOADS: usize = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DaemonConfig {
    pub config_path: PathBuf,
    pub setup: bool,
    pub resync: bool,
}

impl DaemonConfig {
    /// `--config` wins over `SNC_CONFIG`, which wins over `app.config.json` in the
    /// working directory.
    pub fn from_env(config_arg: Option<&str>) -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let raw = config_arg
            .map(str::to_string)
            .or_else(|| std::env::var("SNC_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        Ok(Self {
            config_path: expand_with_home(&raw, &home),
            setup: false,
            resync: false,
        })
    }
}

pub struct DaemonRuntime {
    options: DaemonConfig,
    config: Arc<SyncConfig>,
    engine: Arc<SyncEngine>,
    watcher: Arc<FolderWatcher>,
    events: mpsc::UnboundedReceiver<WatchEvent>,
}

impl DaemonRuntime {
    pub async fn bootstrap(options: DaemonConfig) -> anyhow::Result<Self> {
        let config = load_config(&options.config_path)?;
        let (watcher, events) =
            FolderWatcher::new(config.roots.iter().map(|root| root.path.clone()).collect());
        let watcher = Arc::new(watcher);
        let engine = SyncEngine::new(
            Arc::clone(&config),
            watcher.clone(),
            build_notifier(&config),
        )
        .context("failed to create sync engine")?;
        Ok(Self {
            options,
            config,
            engine: Arc::new(engine),
            watcher,
            events,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        if self.options.setup || self.config.create_all_folders {
            let created = setup_folders(&self.config)
                .await
                .context("failed to create folders")?;
            info!(created, "folders ready");
        }
        if self.config.pre_load {
            let paths = preload_paths(&self.config);
            info!(
                files = paths.len(),
                "downloading preload list (disable with preLoad=false)"
            );
            download_all(&self.engine, paths).await;
        }
        if self.options.resync {
            let paths = collect_files(&self.config).await;
            if paths.is_empty() {
                warn!("no files found to resync");
            }
            info!(files = paths.len(), "re-downloading existing files");
            download_all(&self.engine, paths).await;
        }

        self.watcher
            .start()
            .context("failed to start folder watcher")?;

        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    info!("shutting down");
                    break;
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if self.watcher.is_current(event.generation) {
                        let _ = self.engine.handle_watch_event(event.kind);
                    }
                }
            }
        }
        self.watcher.stop();
        Ok(())
    }
}

/// `--test`: exercises download, upload, conflict and data-loss protection against
/// the first configured root.
pub async fn run_self_test(options: DaemonConfig) -> anyhow::Result<()> {
    let config = load_config(&options.config_path)?;
    let engine = SyncEngine::new(
        Arc::clone(&config),
        Arc::new(IdleWatcher::default()),
        Arc::new(LogNotifier),
    )
    .context("failed to create sync engine")?;
    info!("test mode activated");
    let report = selftest::run(&engine).await?;
    report.log();
    if report.failed() > 0 {
        anyhow::bail!("{} of {} self-test checks failed", report.failed(), report.total());
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Arc<SyncConfig>> {
    let config = SyncConfig::load(path)
        .with_context(|| format!("configuration error in {}", path.display()))?;
    init_tracing(config.debug);
    config.log_summary();

    let legacy = legacy_sync_dirs(&config);
    if !legacy.is_empty() {
        for dir in &legacy {
            error!(dir = %dir.display(), "please remove this directory and re-run with --resync");
        }
        anyhow::bail!("upgrade is needed: legacy sync data found");
    }
    Ok(Arc::new(config))
}

fn build_notifier(config: &SyncConfig) -> Arc<dyn Notifier> {
    if config.desktop_notifications {
        Arc::new(DesktopNotifier::new())
    } else {
        Arc::new(LogNotifier)
    }
}

async fn download_all(engine: &Arc<SyncEngine>, paths: Vec<PathBuf>) {
    stream::iter(paths)
        .for_each_concurrent(CONCURRENT_DOWNLOADS, |path| {
            let engine = Arc::clone(engine);
            async move {
                match engine.add_file(&path).await {
                    Ok(true) => {}
                    Ok(false) => info!(file = %path.display(), "could not add file"),
                    Err(err) => error!(file = %path.display(), error = %err, "could not add file"),
                }
            }
        })
        .await;
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
