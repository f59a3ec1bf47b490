use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snc_core::ClientOptions;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_FILE: &str = "app.config.json";
const DEFAULT_PROTOCOL: &str = "https";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("at least one root folder must be configured")]
    NoRoots,
    #[error("root folder {0:?} was not found")]
    RootMissing(PathBuf),
    #[error("root folder {0:?} is not a directory")]
    RootNotDir(PathBuf),
    #[error("root {0:?} has no host")]
    MissingHost(String),
    #[error("root {0:?} needs either auth or both user and pass")]
    MissingCredentials(String),
    #[error("root {root:?} has an invalid auth value: {reason}")]
    InvalidAuth { root: String, reason: String },
    #[error("folder {folder:?} is invalid: {reason}")]
    InvalidFolder {
        folder: String,
        reason: &'static str,
    },
}

/// Maps one directory name to a remote table. `fields` maps a filename suffix
/// (without the leading dot) to the record field holding that file's content.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FolderMapping {
    pub table: String,
    pub key: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RootConfig {
    pub path: PathBuf,
    pub host: String,
    pub protocol: String,
    pub user: String,
    pub password: String,
    pub accept_bad_ssl: bool,
    pub pre_load_list: BTreeMap<String, Vec<String>>,
}

impl RootConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.host)
    }

    pub fn client_options(&self, timeout: Duration) -> ClientOptions {
        let mut options = ClientOptions::new(self.base_url(), &self.user, &self.password);
        options.accept_invalid_certs = self.accept_bad_ssl;
        options.timeout = timeout;
        options
    }
}

/// Immutable session configuration, validated once at load.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub roots: Vec<RootConfig>,
    pub folders: BTreeMap<String, FolderMapping>,
    pub debug: bool,
    pub pre_load: bool,
    pub create_all_folders: bool,
    pub desktop_notifications: bool,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    roots: BTreeMap<String, RawRoot>,
    #[serde(default)]
    folders: BTreeMap<String, FolderMapping>,
    #[serde(default)]
    ignore_default_folders: bool,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    pre_load: bool,
    #[serde(default)]
    create_all_folders: bool,
    #[serde(default = "default_true")]
    desktop_notifications: bool,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRoot {
    #[serde(default)]
    host: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    pass: Option<String>,
    #[serde(default, rename = "acceptBadSSL")]
    accept_bad_ssl: bool,
    #[serde(default)]
    pre_load_list: BTreeMap<String, Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl SyncConfig {
    /// Reads and validates the config file. Plain `user`/`pass` credentials are
    /// encoded into `auth` and written back to the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut value: Value = serde_json::from_str(&text)?;
        if encode_credentials(&mut value) {
            let rendered = serde_json::to_string_pretty(&value)?;
            std::fs::write(path, rendered).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "configuration credentials encoded");
        }
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_value(value)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }

        let mut roots = Vec::with_capacity(raw.roots.len());
        for (name, root) in raw.roots {
            roots.push(validate_root(&name, root)?);
        }

        let mut folders = if raw.ignore_default_folders {
            BTreeMap::new()
        } else {
            default_folders()
        };
        folders.extend(raw.folders);
        for (name, folder) in &folders {
            validate_folder(name, folder)?;
        }

        Ok(Self {
            roots,
            folders,
            debug: raw.debug,
            pre_load: raw.pre_load,
            create_all_folders: raw.create_all_folders,
            desktop_notifications: raw.desktop_notifications,
            request_timeout: Duration::from_secs(
                raw.request_timeout_secs
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
        })
    }

    pub fn folder(&self, name: &str) -> Option<&FolderMapping> {
        self.folders.get(name)
    }

    pub fn log_summary(&self) {
        for root in &self.roots {
            info!(root = %root.path.display(), host = %root.host, "root mapped to instance");
        }
        for (folder, mapping) in &self.folders {
            tracing::debug!(%folder, table = %mapping.table, "folder mapped to table");
        }
    }
}

fn validate_root(name: &str, root: RawRoot) -> Result<RootConfig, ConfigError> {
    let path = PathBuf::from(name);
    let meta =
        std::fs::metadata(&path).map_err(|_| ConfigError::RootMissing(path.clone()))?;
    if !meta.is_dir() {
        return Err(ConfigError::RootNotDir(path));
    }
    let path = std::fs::canonicalize(&path).map_err(|_| ConfigError::RootMissing(path))?;

    if root.host.trim().is_empty() {
        return Err(ConfigError::MissingHost(name.to_string()));
    }

    let (user, password) = match (root.auth, root.user, root.pass) {
        (Some(auth), _, _) => decode_auth(&auth).map_err(|reason| ConfigError::InvalidAuth {
            root: name.to_string(),
            reason,
        })?,
        (None, Some(user), Some(pass)) if !user.is_empty() => (user, pass),
        _ => return Err(ConfigError::MissingCredentials(name.to_string())),
    };

    Ok(RootConfig {
        path,
        host: root.host,
        protocol: root
            .protocol
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
        user,
        password,
        accept_bad_ssl: root.accept_bad_ssl,
        pre_load_list: root.pre_load_list,
    })
}

fn validate_folder(name: &str, folder: &FolderMapping) -> Result<(), ConfigError> {
    let reason = if folder.table.trim().is_empty() {
        "table is empty"
    } else if folder.key.trim().is_empty() {
        "key is empty"
    } else if folder.fields.is_empty() {
        "no suffix to field mapping"
    } else if folder
        .fields
        .iter()
        .any(|(suffix, field)| suffix.trim_start_matches('.').is_empty() || field.is_empty())
    {
        "empty suffix or field name"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidFolder {
        folder: name.to_string(),
        reason,
    })
}

pub fn encode_auth(user: &str, password: &str) -> String {
    BASE64.encode(format!("{user}:{password}"))
}

fn decode_auth(auth: &str) -> Result<(String, String), String> {
    let bytes = BASE64.decode(auth.trim()).map_err(|err| err.to_string())?;
    let text = String::from_utf8(bytes).map_err(|err| err.to_string())?;
    let (user, password) = text
        .split_once(':')
        .ok_or_else(|| "expected base64 of user:pass".to_string())?;
    Ok((user.to_string(), password.to_string()))
}

/// Replaces plain `user`/`pass` pairs with an encoded `auth` value. Returns whether
/// anything changed.
fn encode_credentials(config: &mut Value) -> bool {
    let Some(roots) = config.get_mut("roots").and_then(Value::as_object_mut) else {
        return false;
    };
    let mut changed = false;
    for root in roots.values_mut() {
        let Some(root) = root.as_object_mut() else {
            continue;
        };
        if root.contains_key("auth") {
            continue;
        }
        let (Some(user), Some(pass)) = (
            root.get("user").and_then(Value::as_str),
            root.get("pass").and_then(Value::as_str),
        ) else {
            continue;
        };
        let auth = encode_auth(user, pass);
        root.insert("auth".to_string(), Value::String(auth));
        root.remove("user");
        root.remove("pass");
        changed = true;
    }
    changed
}

fn folder(table: &str, fields: &[(&str, &str)]) -> FolderMapping {
    FolderMapping {
        table: table.to_string(),
        key: "name".to_string(),
        fields: fields
            .iter()
            .map(|(suffix, field)| (suffix.to_string(), field.to_string()))
            .collect(),
    }
}

/// Folder mappings available without any `folders` section in the config.
pub fn default_folders() -> BTreeMap<String, FolderMapping> {
    BTreeMap::from([
        (
            "business_rules".to_string(),
            folder("sys_script", &[("js", "script")]),
        ),
        (
            "client_scripts".to_string(),
            folder("sys_script_client", &[("js", "script")]),
        ),
        (
            "processors".to_string(),
            folder("sys_processor", &[("js", "script")]),
        ),
        (
            "scheduled_jobs".to_string(),
            folder("sysauto_script", &[("js", "script")]),
        ),
        (
            "script_actions".to_string(),
            folder("sysevent_script_action", &[("js", "script")]),
        ),
        (
            "script_includes".to_string(),
            folder("sys_script_include", &[("js", "script")]),
        ),
        (
            "style_sheets".to_string(),
            folder("content_css", &[("css", "style"), ("scss", "style")]),
        ),
        (
            "ui_actions".to_string(),
            folder("sys_ui_action", &[("js", "script")]),
        ),
        (
            "ui_pages".to_string(),
            folder(
                "sys_ui_page",
                &[
                    ("xhtml", "html"),
                    ("client.js", "client_script"),
                    ("server.js", "processing_script"),
                ],
            ),
        ),
        (
            "ui_scripts".to_string(),
            folder("sys_ui_script", &[("js", "script")]),
        ),
    ])
}

#[cfg(test)]
pub(crate) fn test_config(root: &Path, base_url: &str) -> SyncConfig {
    let (protocol, host) = base_url.split_once("://").unwrap_or(("http", base_url));
    SyncConfig {
        roots: vec![RootConfig {
            path: root.to_path_buf(),
            host: host.to_string(),
            protocol: protocol.to_string(),
            user: "admin".to_string(),
            password: "secret".to_string(),
            accept_bad_ssl: false,
            pre_load_list: BTreeMap::new(),
        }],
        folders: default_folders(),
        debug: true,
        pre_load: false,
        create_all_folders: false,
        desktop_notifications: false,
        request_timeout: Duration::from_secs(5),
    }
}
