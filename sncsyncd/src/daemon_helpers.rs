fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn legacy_sync_dirs(config: &SyncConfig) -> Vec<PathBuf> {
    config
        .roots
        .iter()
        .map(|root| root.path.join(LEGACY_SYNC_DIR))
        .filter(|dir| dir.exists())
        .collect()
}

/// Creates `<root>/<folder>` for every root and mapped folder. Returns how many
/// directories were missing.
async fn setup_folders(config: &SyncConfig) -> std::io::Result<usize> {
    let mut created = 0;
    for root in &config.roots {
        for folder in config.folders.keys() {
            let dir = root.path.join(folder);
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                continue;
            }
            tokio::fs::create_dir_all(&dir).await?;
            info!(dir = %dir.display(), "created folder");
            created += 1;
        }
    }
    Ok(created)
}

fn preload_paths(config: &SyncConfig) -> Vec<PathBuf> {
    let mut paths = BTreeSet::new();
    for root in &config.roots {
        for (folder, files) in &root.pre_load_list {
            for file in files {
                paths.insert(root.path.join(folder).join(file));
            }
        }
    }
    paths.into_iter().collect()
}

/// Every non-hidden file below the configured roots.
async fn collect_files(config: &SyncConfig) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in &config.roots {
        let mut pending = vec![root.path.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let hidden = path
                    .strip_prefix(&root.path)
                    .map(is_hidden)
                    .unwrap_or(true);
                if hidden {
                    continue;
                }
                match entry.file_type().await {
                    Ok(kind) if kind.is_dir() => pending.push(path),
                    Ok(kind) if kind.is_file() => files.push(path),
                    _ => {}
                }
            }
        }
    }
    files.sort();
    files
}
