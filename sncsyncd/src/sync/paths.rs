use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::config::SyncConfig;

const SASS_MARKER: &str = "_scss";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("no configured root contains {0:?}")]
    NoRoot(PathBuf),
}

/// Where a local file lives on the remote side. Built fresh for every resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCoordinate {
    pub root: PathBuf,
    pub folder: String,
    pub table: String,
    pub key_field: String,
    pub key_value: String,
    pub field: String,
}

impl SyncCoordinate {
    /// Encoded query selecting the record, e.g. `name=JSUtil`.
    pub fn query(&self) -> String {
        format!("{}={}", self.key_field, self.key_value)
    }
}

pub fn find_root<'a>(config: &'a SyncConfig, path: &Path) -> Option<&'a Path> {
    path.ancestors().find_map(|ancestor| {
        config
            .roots
            .iter()
            .find(|root| root.path == ancestor)
            .map(|root| root.path.as_path())
    })
}

/// Maps a file path to its record coordinate.
///
/// `Ok(None)` means the file is outside the sync set (hidden, unmapped folder or no
/// matching suffix). A path under no configured root is a configuration problem and is
/// reported as an error.
pub fn resolve(config: &SyncConfig, path: &Path) -> Result<Option<SyncCoordinate>, MappingError> {
    let root = find_root(config, path).ok_or_else(|| MappingError::NoRoot(path.to_path_buf()))?;
    let Ok(relative) = path.strip_prefix(root) else {
        return Ok(None);
    };
    if relative.as_os_str().is_empty() || is_hidden(relative) {
        return Ok(None);
    }

    let Some(folder) = path
        .parent()
        .filter(|parent| *parent != root)
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
    else {
        return Ok(None);
    };
    let Some(mapping) = config.folder(folder) else {
        return Ok(None);
    };
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return Ok(None);
    };

    let mut suffixes: Vec<(&str, &str)> = mapping
        .fields
        .iter()
        .map(|(suffix, field)| (suffix.trim_start_matches('.'), field.as_str()))
        .collect();
    suffixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    for (suffix, field) in suffixes {
        let Some(key) = strip_suffix(file_name, suffix) else {
            continue;
        };
        let mut key_value = key.to_string();
        if suffix.ends_with("scss") && !key_value.ends_with(SASS_MARKER) {
            key_value.push_str(SASS_MARKER);
        }
        return Ok(Some(SyncCoordinate {
            root: root.to_path_buf(),
            folder: folder.to_string(),
            table: mapping.table.clone(),
            key_field: mapping.key.clone(),
            key_value,
            field: field.to_string(),
        }));
    }
    Ok(None)
}

fn strip_suffix<'a>(file_name: &'a str, suffix: &str) -> Option<&'a str> {
    let key = file_name.strip_suffix(suffix)?.strip_suffix('.')?;
    (!key.is_empty()).then_some(key)
}

/// True if any component under the root starts with a dot.
pub fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Forward-slash rendering used for record cache keys and logs.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
