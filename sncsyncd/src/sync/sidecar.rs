use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Hidden directory under each root mirroring the tree with per-file metadata.
pub const SYNC_DATA_DIR: &str = ".sync_data";

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid sidecar {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{file:?} is not inside root {root:?}")]
    OutsideRoot { root: PathBuf, file: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(rename = "syncHash", default)]
    pub sync_hash: String,
    #[serde(rename = "sysId", default, skip_serializing_if = "Option::is_none")]
    pub sys_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub fn sidecar_path_for(root: &Path, file: &Path) -> Result<PathBuf, SidecarError> {
    let relative = file
        .strip_prefix(root)
        .map_err(|_| SidecarError::OutsideRoot {
            root: root.to_path_buf(),
            file: file.to_path_buf(),
        })?;
    Ok(root.join(SYNC_DATA_DIR).join(relative))
}

pub async fn load(path: &Path) -> Result<SyncMeta, SidecarError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| SidecarError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| SidecarError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub async fn save(path: &Path, meta: &SyncMeta) -> Result<(), SidecarError> {
    let io_err = |source: std::io::Error| SidecarError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let bytes = serde_json::to_vec(meta).map_err(|source| SidecarError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tokio::fs::write(path, bytes).await.map_err(io_err)
}

/// Removes the sidecar; a missing file is not an error.
pub async fn clear(path: &Path) -> Result<(), SidecarError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SidecarError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
