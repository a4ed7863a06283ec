//! Persisted user settings.
//!
//! The settings document is a JSON file shared with the roster store; only the
//! `config` object inside it is read or written here, and only the whitelisted
//! keys modelled by [`SettingKey`] can be addressed.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

const CONFIG_OBJECT: &str = "config";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("failed to write settings {path}: {source}")]
    Write { source: io::Error, path: PathBuf },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid config key: {0}")]
    InvalidKey(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SettingKey {
    #[serde(rename = "downloadDirectory")]
    DownloadDirectory,
    #[serde(rename = "ffmpegDirectory")]
    FfmpegDirectory,
    #[serde(rename = "userAgent")]
    UserAgent,
}

impl SettingKey {
    pub const ALL: [SettingKey; 3] = [
        SettingKey::DownloadDirectory,
        SettingKey::FfmpegDirectory,
        SettingKey::UserAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::DownloadDirectory => "downloadDirectory",
            SettingKey::FfmpegDirectory => "ffmpegDirectory",
            SettingKey::UserAgent => "userAgent",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| SettingsError::InvalidKey(s.to_string()))
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: SettingKey) -> SettingsResult<Option<String>>;

    async fn set(&self, key: SettingKey, value: String) -> SettingsResult<()>;

    async fn get_or(&self, key: SettingKey, default: &str) -> SettingsResult<String> {
        Ok(self
            .get(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    /// Reads a directory-valued key; empty strings count as unset.
    async fn directory(&self, key: SettingKey) -> SettingsResult<Option<PathBuf>> {
        Ok(self
            .get(key)
            .await?
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from))
    }
}

/// JSON-file backed store. Call [`JsonSettingsStore::open`] before first use.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    document: AsyncMutex<Value>,
}

impl JsonSettingsStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> SettingsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let document = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => empty_document(),
            Ok(content) => {
                let mut document: Value =
                    serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                        source,
                        path: path.clone(),
                    })?;
                ensure_config_object(&mut document);
                document
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let document = empty_document();
                write_document(&path, &document).await?;
                info!(path = %path.display(), "created settings file");
                document
            }
            Err(source) => return Err(SettingsError::Read { source, path }),
        };
        debug!(path = %path.display(), "settings loaded");
        Ok(Self {
            path,
            document: AsyncMutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn get(&self, key: SettingKey) -> SettingsResult<Option<String>> {
        let document = self.document.lock().await;
        Ok(document
            .get(CONFIG_OBJECT)
            .and_then(|config| config.get(key.as_str()))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn set(&self, key: SettingKey, value: String) -> SettingsResult<()> {
        let mut document = self.document.lock().await;
        ensure_config_object(&mut document);
        if let Some(config) = document
            .get_mut(CONFIG_OBJECT)
            .and_then(Value::as_object_mut)
        {
            config.insert(key.as_str().to_string(), Value::String(value));
        }
        write_document(&self.path, &document).await?;
        debug!(key = %key, "setting persisted");
        Ok(())
    }
}

fn empty_document() -> Value {
    let mut root = Map::new();
    root.insert(CONFIG_OBJECT.to_string(), Value::Object(Map::new()));
    Value::Object(root)
}

fn ensure_config_object(document: &mut Value) {
    if !document.is_object() {
        *document = empty_document();
        return;
    }
    let has_config = document
        .get(CONFIG_OBJECT)
        .map(Value::is_object)
        .unwrap_or(false);
    if !has_config {
        if let Some(root) = document.as_object_mut() {
            root.insert(CONFIG_OBJECT.to_string(), Value::Object(Map::new()));
        }
    }
}

async fn write_document(path: &Path, document: &Value) -> SettingsResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| SettingsError::Write {
                source,
                path: parent.to_path_buf(),
            })?;
    }
    let content = serde_json::to_string_pretty(document)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, content)
        .await
        .map_err(|source| SettingsError::Write {
            source,
            path: staging.clone(),
        })?;
    fs::rename(&staging, path)
        .await
        .map_err(|source| SettingsError::Write {
            source,
            path: path.to_path_buf(),
        })
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<SettingKey, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: SettingKey, value: impl Into<String>) -> Self {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.into());
        self
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, key: SettingKey) -> SettingsResult<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned())
    }

    async fn set(&self, key: SettingKey, value: String) -> SettingsResult<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
        Ok(())
    }
}
