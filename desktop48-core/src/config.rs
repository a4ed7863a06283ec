use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AppConfig {
    pub paths: PathsSection,
    pub server: ServerSection,
    pub hls: HlsSection,
    pub ffmpeg: FfmpegSection,
    pub player: PlayerSection,
}

impl AppConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    /// Shared directory holding every transcode session's manifest and segments.
    ///
    /// Relative names are placed under the system temp directory.
    pub fn output_dir(&self) -> PathBuf {
        let dir = Path::new(&self.paths.hls_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::temp_dir().join(dir)
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.settings_file)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub hls_dir: String,
    pub settings_file: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            hls_dir: "desktop48_hls".to_string(),
            settings_file: "database.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    /// Host name used when handing manifest URLs to players.
    pub public_host: String,
    pub start_port: u16,
    pub max_attempts: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            public_host: "localhost".to_string(),
            start_port: 8080,
            max_attempts: 11,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HlsSection {
    pub segment_duration: u32,
    pub list_size: u32,
    pub flags: Vec<String>,
    pub segment_type: String,
    pub readiness_poll_ms: u64,
    pub min_ready_segments: usize,
    /// Unset means the readiness poll never gives up.
    pub readiness_timeout_seconds: Option<u64>,
}

impl Default for HlsSection {
    fn default() -> Self {
        Self {
            segment_duration: 3,
            list_size: 12,
            flags: vec!["delete_segments".to_string(), "append_list".to_string()],
            segment_type: "mpegts".to_string(),
            readiness_poll_ms: 1000,
            min_ready_segments: 2,
            readiness_timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FfmpegSection {
    pub log_level: String,
    pub hide_banner: bool,
    /// Container forced onto recordings so a stopped recording stays playable.
    pub record_format: String,
}

impl Default for FfmpegSection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            hide_banner: true,
            record_format: "flv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerSection {
    pub infinite_buffer: bool,
    pub framedrop: bool,
    pub sync: Option<String>,
    pub probesize: Option<u64>,
    pub analyzeduration_us: Option<u64>,
    pub io_timeout_us: Option<u64>,
    pub autoexit: bool,
}

impl Default for PlayerSection {
    fn default() -> Self {
        Self {
            infinite_buffer: true,
            framedrop: true,
            sync: Some("ext".to_string()),
            probesize: Some(1_048_576),
            analyzeduration_us: Some(1_000_000),
            io_timeout_us: Some(10_000_000),
            autoexit: true,
        }
    }
}

pub fn load_app_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
