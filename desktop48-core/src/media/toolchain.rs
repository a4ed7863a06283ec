use std::path::{Path, PathBuf};

use crate::config::{FfmpegSection, HlsSection, PlayerSection};
use crate::settings::{SettingKey, SettingsStore};

use super::error::{MediaError, MediaResult};

#[cfg(windows)]
const EXE_SUFFIX: &str = ".exe";
#[cfg(not(windows))]
const EXE_SUFFIX: &str = "";

/// Locates ffmpeg and ffplay inside the user-configured tool directory.
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    directory: Option<PathBuf>,
}

impl Toolchain {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self { directory }
    }

    pub async fn from_settings(settings: &dyn SettingsStore) -> MediaResult<Self> {
        Ok(Self::new(
            settings.directory(SettingKey::FfmpegDirectory).await?,
        ))
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn ffmpeg(&self) -> MediaResult<PathBuf> {
        self.executable("ffmpeg")
    }

    pub fn ffplay(&self) -> MediaResult<PathBuf> {
        self.executable("ffplay")
    }

    fn executable(&self, name: &str) -> MediaResult<PathBuf> {
        let directory = self
            .directory
            .as_ref()
            .ok_or(MediaError::ToolDirectoryUnset)?;
        if !directory.is_dir() {
            return Err(MediaError::ToolDirectoryMissing {
                path: directory.clone(),
            });
        }
        let path = directory.join(format!("{name}{EXE_SUFFIX}"));
        if path.is_file() {
            Ok(path)
        } else {
            Err(MediaError::ExecutableNotFound { path })
        }
    }
}

/// How a download/record stream is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputProfile {
    /// Stream copy, container taken from the file extension.
    Copy,
    /// Stream copy into a forced container, e.g. `flv`.
    Container(String),
}

fn preamble(config: &FfmpegSection) -> Vec<String> {
    let mut args = Vec::new();
    if config.hide_banner {
        args.push("-hide_banner".to_string());
    }
    args.extend(["-loglevel".to_string(), config.log_level.clone()]);
    args
}

pub fn capture_args(
    config: &FfmpegSection,
    profile: &OutputProfile,
    source_url: &str,
    output: &Path,
) -> Vec<String> {
    let mut args = preamble(config);
    args.extend([
        "-y".to_string(),
        "-i".to_string(),
        source_url.to_string(),
        "-c".to_string(),
        "copy".to_string(),
    ]);
    if let OutputProfile::Container(format) = profile {
        args.extend(["-f".to_string(), format.clone()]);
    }
    args.push(output.display().to_string());
    args
}

pub fn manifest_path(output_dir: &Path, live_id: &str) -> PathBuf {
    output_dir.join(format!("{live_id}.m3u8"))
}

pub fn segment_pattern(output_dir: &Path, live_id: &str) -> PathBuf {
    output_dir.join(format!("{live_id}_%03d.ts"))
}

/// Copies audio and video into a rolling HLS playlist under `output_dir`.
pub fn hls_args(
    ffmpeg: &FfmpegSection,
    hls: &HlsSection,
    source_url: &str,
    output_dir: &Path,
    live_id: &str,
) -> Vec<String> {
    let mut args = preamble(ffmpeg);
    args.extend([
        "-i".to_string(),
        source_url.to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "copy".to_string(),
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        hls.segment_duration.to_string(),
        "-hls_list_size".to_string(),
        hls.list_size.to_string(),
    ]);
    if !hls.flags.is_empty() {
        args.extend(["-hls_flags".to_string(), hls.flags.join("+")]);
    }
    args.extend([
        "-hls_segment_type".to_string(),
        hls.segment_type.clone(),
        "-hls_segment_filename".to_string(),
        segment_pattern(output_dir, live_id).display().to_string(),
        manifest_path(output_dir, live_id).display().to_string(),
    ]);
    args
}

/// Low-latency ffplay flags followed by the stream URL.
pub fn player_args(config: &PlayerSection, title: &str, url: &str) -> Vec<String> {
    let mut args = vec!["-window_title".to_string(), title.to_string()];
    if config.infinite_buffer {
        args.push("-infbuf".to_string());
    }
    if config.framedrop {
        args.push("-framedrop".to_string());
    }
    if let Some(sync) = &config.sync {
        args.extend(["-sync".to_string(), sync.clone()]);
    }
    if let Some(probesize) = config.probesize {
        args.extend(["-probesize".to_string(), probesize.to_string()]);
    }
    if let Some(duration) = config.analyzeduration_us {
        args.extend(["-analyzeduration".to_string(), duration.to_string()]);
    }
    if let Some(timeout) = config.io_timeout_us {
        args.extend(["-timeout".to_string(), timeout.to_string()]);
    }
    if config.autoexit {
        args.push("-autoexit".to_string());
    }
    args.push(url.to_string());
    args
}
