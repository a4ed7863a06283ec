#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use desktop48_core::config::AppConfig;
use desktop48_core::media::{ProcessSpawner, SystemProcessSpawner};
use desktop48_core::settings::{MemorySettingsStore, SettingKey};
use tempfile::TempDir;
use tokio::process::{Child, Command};

/// Prints two progress lines, touches the output, then idles until signalled.
pub const CAPTURE_LONG: &str = r#"
for last; do :; done
echo "ffmpeg version fake" >&2
printf 'frame=1 time=00:00:01.50 bitrate=1\r' >&2
printf 'frame=2 time=00:00:03.00 bitrate=1\r' >&2
: > "$last"
exec sleep 30
"#;

pub const CAPTURE_DONE: &str = r#"
for last; do :; done
printf 'frame=1 time=00:00:01.50 bitrate=1\r' >&2
printf 'frame=2 time=00:00:03.00 bitrate=1\r' >&2
: > "$last"
exit 0
"#;

/// Takes a second to wind down after SIGINT, like ffmpeg finalizing a file.
pub const CAPTURE_SLOW_STOP: &str = r#"
trap 'sleep 1; exit 255' INT
for last; do :; done
: > "$last"
while :; do sleep 0.1; done
"#;

/// Floods stderr with progress before exiting cleanly at 40 seconds.
pub const CAPTURE_CHATTY: &str = r#"
for last; do :; done
i=1
while [ $i -le 40 ]; do
  printf 'frame=%d time=00:00:%02d.00 bitrate=1\r' $i $i >&2
  i=$((i + 1))
done
: > "$last"
exit 0
"#;

pub const CAPTURE_FAIL: &str = r#"
echo "Connection refused" >&2
exit 1
"#;

/// Writes the manifest plus two segments next to it, then keeps running.
pub const HLS_READY: &str = r#"
for last; do :; done
dir=$(dirname "$last")
id=$(basename "$last" .m3u8)
: > "$dir/${id}_000.ts"
: > "$dir/${id}_001.ts"
printf '#EXTM3U\n' > "$last"
exec sleep 30
"#;

pub const HLS_STALL: &str = "exec sleep 30\n";

pub const HLS_FAIL: &str = "echo \"Invalid data found\" >&2\nexit 1\n";

pub fn write_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Temp layout with a tool directory, a save directory and an HLS directory.
pub struct Sandbox {
    pub root: TempDir,
    pub tools: PathBuf,
    pub videos: PathBuf,
    pub hls: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let tools = root.path().join("ffmpeg");
        let videos = root.path().join("videos");
        let hls = root.path().join("hls");
        for dir in [&tools, &videos, &hls] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self {
            root,
            tools,
            videos,
            hls,
        }
    }

    pub fn ffmpeg(&self, body: &str) -> PathBuf {
        write_tool(&self.tools, "ffmpeg", body)
    }

    pub fn ffplay(&self, body: &str) -> PathBuf {
        write_tool(&self.tools, "ffplay", body)
    }

    pub fn settings(&self) -> MemorySettingsStore {
        MemorySettingsStore::new()
            .with(SettingKey::FfmpegDirectory, self.tools.display().to_string())
            .with(SettingKey::DownloadDirectory, self.videos.display().to_string())
    }

    pub fn config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.hls_dir = self.hls.display().to_string();
        config.hls.readiness_poll_ms = 50;
        config
    }

    pub fn hls_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.hls)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

#[derive(Default)]
pub struct CountingSpawner {
    spawned: AtomicUsize,
}

impl CountingSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl ProcessSpawner for CountingSpawner {
    fn spawn(&self, command: &mut Command) -> std::io::Result<Child> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        SystemProcessSpawner.spawn(command)
    }
}

pub struct RefusingSpawner;

impl ProcessSpawner for RefusingSpawner {
    fn spawn(&self, _command: &mut Command) -> std::io::Result<Child> {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "spawning disabled",
        ))
    }
}

pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
