use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::settings::SettingsError;

use super::task::TaskStatus;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("save directory is not set")]
    SaveDirectoryUnset,
    #[error("save directory does not exist: {path}")]
    SaveDirectoryMissing { path: PathBuf },
    #[error("ffmpeg directory is not set")]
    ToolDirectoryUnset,
    #[error("ffmpeg directory does not exist: {path}")]
    ToolDirectoryMissing { path: PathBuf },
    #[error("executable not found: {path}")]
    ExecutableNotFound { path: PathBuf },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("segment server is not running")]
    SegmentServerUnavailable,
    #[error("task {live_id} cannot start while {status}")]
    InvalidState { live_id: String, status: TaskStatus },
    #[error("transcode {live_id} failed before becoming ready: {detail}")]
    TranscodeFailed { live_id: String, detail: String },
    #[error("transcode {live_id} produced no segments within {waited:?}")]
    ReadinessTimeout { live_id: String, waited: Duration },
}

impl MediaError {
    /// Precondition failures raised before any subprocess exists.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MediaError::SaveDirectoryUnset
                | MediaError::SaveDirectoryMissing { .. }
                | MediaError::ToolDirectoryUnset
                | MediaError::ToolDirectoryMissing { .. }
                | MediaError::ExecutableNotFound { .. }
        )
    }
}

pub type MediaResult<T> = Result<T, MediaError>;
