use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, FfmpegSection, HlsSection};
use crate::settings::SettingsStore;

use super::error::{MediaError, MediaResult};
use super::server::ServerPort;
use super::supervisor::{ProcessHandle, ProcessSupervisor, SpawnRequest, StopSignal};
use super::toolchain::{self, Toolchain};
use super::TaskKind;

/// One live HLS transcode, keyed by its live id.
#[derive(Debug, Clone)]
pub struct TranscodeSession {
    pub live_id: String,
    pub source_url: String,
    pub manifest_path: PathBuf,
    pub url: String,
    pub started_at: DateTime<Utc>,
    handle: ProcessHandle,
}

impl TranscodeSession {
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

pub struct TranscodeSessionManager {
    settings: Arc<dyn SettingsStore>,
    supervisor: ProcessSupervisor,
    ffmpeg: FfmpegSection,
    hls: HlsSection,
    public_host: String,
    output_dir: PathBuf,
    port: ServerPort,
    sessions: Mutex<HashMap<String, TranscodeSession>>,
}

impl fmt::Debug for TranscodeSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeSessionManager")
            .field("output_dir", &self.output_dir)
            .field("port", &self.port.get())
            .field("sessions", &self.active_sessions())
            .finish()
    }
}

impl TranscodeSessionManager {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        supervisor: ProcessSupervisor,
        config: &AppConfig,
        port: ServerPort,
    ) -> Self {
        Self {
            settings,
            supervisor,
            ffmpeg: config.ffmpeg.clone(),
            hls: config.hls.clone(),
            public_host: config.server.public_host.clone(),
            output_dir: config.output_dir(),
            port,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Starts (or reuses) the transcode for `live_id` and resolves with the
    /// manifest URL once enough segments exist.
    ///
    /// A second request for a registered id returns the existing URL at once,
    /// even while the first request is still waiting for readiness.
    pub async fn request(&self, source_url: &str, live_id: &str) -> MediaResult<String> {
        if let Some(url) = self.session_url(live_id) {
            debug!(live_id, "transcode already running");
            return Ok(url);
        }

        let ffmpeg = Toolchain::from_settings(self.settings.as_ref())
            .await?
            .ffmpeg()?;
        let port = self.port.get().ok_or(MediaError::SegmentServerUnavailable)?;
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| MediaError::Io {
                source,
                path: self.output_dir.clone(),
            })?;

        let session = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = sessions.get(live_id) {
                return Ok(existing.url.clone());
            }
            let handle = self.supervisor.spawn(SpawnRequest {
                kind: TaskKind::Transcode,
                live_id: live_id.to_string(),
                program: ffmpeg,
                args: toolchain::hls_args(
                    &self.ffmpeg,
                    &self.hls,
                    source_url,
                    &self.output_dir,
                    live_id,
                ),
                output: toolchain::manifest_path(&self.output_dir, live_id),
            })?;
            let session = TranscodeSession {
                live_id: live_id.to_string(),
                source_url: source_url.to_string(),
                manifest_path: toolchain::manifest_path(&self.output_dir, live_id),
                url: format!("http://{}:{}/{}.m3u8", self.public_host, port, live_id),
                started_at: Utc::now(),
                handle,
            };
            sessions.insert(live_id.to_string(), session.clone());
            session
        };
        info!(live_id, source = source_url, "transcode started");

        match self.await_ready(&session).await {
            Ok(()) => {
                info!(live_id, url = %session.url, "transcode ready");
                Ok(session.url)
            }
            Err(err) => {
                warn!(live_id, error = %err, "transcode did not become ready");
                self.discard(&session).await;
                Err(err)
            }
        }
    }

    async fn await_ready(&self, session: &TranscodeSession) -> MediaResult<()> {
        let poll = Duration::from_millis(self.hls.readiness_poll_ms.max(1));
        let limit = self.hls.readiness_timeout_seconds.map(Duration::from_secs);
        let started = Instant::now();
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            if self.is_ready(&session.live_id).await {
                return Ok(());
            }
            if let Some(outcome) = session.handle.exit_outcome() {
                return Err(MediaError::TranscodeFailed {
                    live_id: session.live_id.clone(),
                    detail: outcome.describe("ffmpeg"),
                });
            }
            if let Some(limit) = limit {
                if started.elapsed() >= limit {
                    return Err(MediaError::ReadinessTimeout {
                        live_id: session.live_id.clone(),
                        waited: started.elapsed(),
                    });
                }
            }
        }
    }

    async fn is_ready(&self, live_id: &str) -> bool {
        let manifest = toolchain::manifest_path(&self.output_dir, live_id);
        if !fs::try_exists(&manifest).await.unwrap_or(false) {
            return false;
        }
        let Ok(mut entries) = fs::read_dir(&self.output_dir).await else {
            return false;
        };
        let mut segments = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if is_segment_of(&entry.file_name().to_string_lossy(), live_id) {
                segments += 1;
                if segments >= self.hls.min_ready_segments {
                    return true;
                }
            }
        }
        false
    }

    /// Drops a session that never became ready. Files are left alone once a
    /// newer session owns the live id.
    async fn discard(&self, session: &TranscodeSession) {
        if session.handle.stop(StopSignal::Kill) {
            session.handle.wait().await;
        }
        if self.forget(session) {
            purge_session_files(&self.output_dir, &session.live_id).await;
        } else {
            debug!(live_id = %session.live_id, "newer transcode owns the files, skipping purge");
        }
    }

    /// Removes the entry only while it still refers to `session`'s process.
    fn forget(&self, session: &TranscodeSession) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let same = sessions
            .get(&session.live_id)
            .map(|current| current.handle.same_process(&session.handle))
            .unwrap_or(false);
        if same {
            sessions.remove(&session.live_id);
        }
        same
    }

    fn session_url(&self, live_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(live_id)
            .map(|session| session.url.clone())
    }

    pub fn session(&self, live_id: &str) -> Option<TranscodeSession> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(live_id)
            .cloned()
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Terminates the transcode and deletes its manifest and segments.
    /// Returns false when no session is registered under `live_id`.
    pub async fn stop(&self, live_id: &str) -> bool {
        let Some(session) = self.session(live_id) else {
            debug!(live_id, "no transcode to stop");
            return false;
        };
        session.handle.stop(StopSignal::Terminate);
        let outcome = session.handle.wait().await;
        debug!(live_id, ?outcome, "transcode exited");
        let report = purge_session_files(&self.output_dir, live_id).await;
        self.forget(&session);
        info!(live_id, removed = report.removed, failed = report.failed, "transcode stopped");
        true
    }

    /// Kills every transcode and empties the output directory.
    pub async fn shutdown(&self) {
        let sessions: Vec<TranscodeSession> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in &sessions {
            session.handle.stop(StopSignal::Kill);
        }
        join_all(sessions.iter().map(|session| session.handle.wait())).await;
        let report = purge_directory(&self.output_dir).await;
        info!(
            sessions = sessions.len(),
            removed = report.removed,
            failed = report.failed,
            path = %self.output_dir.display(),
            "transcode output purged"
        );
    }
}

fn is_segment_of(name: &str, live_id: &str) -> bool {
    name.strip_prefix(live_id)
        .and_then(|rest| rest.strip_prefix('_'))
        .map(|rest| rest.ends_with(".ts"))
        .unwrap_or(false)
}

/// Deletes `{live_id}.m3u8` and every `{live_id}_*.ts` under `dir`.
/// Individual failures are logged and counted; the sweep always runs to the end.
pub async fn purge_session_files(dir: &Path, live_id: &str) -> CleanupReport {
    let manifest = format!("{live_id}.m3u8");
    purge_matching(dir, |name| name == manifest || is_segment_of(name, live_id)).await
}

async fn purge_directory(dir: &Path) -> CleanupReport {
    purge_matching(dir, |_| true).await
}

async fn purge_matching<F>(dir: &Path, matches: F) -> CleanupReport
where
    F: Fn(&str) -> bool,
{
    let mut report = CleanupReport::default();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(path = %dir.display(), error = %err, "nothing to purge");
            return report;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "failed to list output directory");
                break;
            }
        };
        if !matches(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => report.removed += 1,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to delete transcode file");
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn segment_names_are_matched_by_prefix() {
        assert!(is_segment_of("X_000.ts", "X"));
        assert!(is_segment_of("X_123.ts", "X"));
        assert!(!is_segment_of("X.m3u8", "X"));
        assert!(!is_segment_of("XY_000.ts", "X"));
        assert!(!is_segment_of("Y_000.ts", "X"));
        assert!(!is_segment_of("X_000.ts.tmp", "X"));
    }

    #[tokio::test]
    async fn purge_leaves_other_sessions_alone() {
        let dir = TempDir::new().unwrap();
        for name in ["X.m3u8", "X_000.ts", "X_001.ts", "Y.m3u8", "Y_000.ts"] {
            std::fs::write(dir.path().join(name), b"data").unwrap();
        }

        let report = purge_session_files(dir.path(), "X").await;
        assert_eq!(report, CleanupReport { removed: 3, failed: 0 });

        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, ["Y.m3u8", "Y_000.ts"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn discarding_a_replaced_session_keeps_the_newer_files() {
        use crate::media::events::EventBus;
        use crate::settings::MemorySettingsStore;

        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.paths.hls_dir = dir.path().display().to_string();
        let supervisor = ProcessSupervisor::new(None, EventBus::default());
        let manager = TranscodeSessionManager::new(
            Arc::new(MemorySettingsStore::new()),
            supervisor.clone(),
            &config,
            ServerPort::new(),
        );
        let sleeper = || SpawnRequest {
            kind: TaskKind::Transcode,
            live_id: "X".to_string(),
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
            output: dir.path().join("X.m3u8"),
        };
        let session = |handle: ProcessHandle| TranscodeSession {
            live_id: "X".to_string(),
            source_url: "rtmp://example/live".to_string(),
            manifest_path: dir.path().join("X.m3u8"),
            url: "http://127.0.0.1:8081/X.m3u8".to_string(),
            started_at: Utc::now(),
            handle,
        };
        let older = session(supervisor.spawn(sleeper()).unwrap());
        let newer = session(supervisor.spawn(sleeper()).unwrap());
        manager
            .sessions
            .lock()
            .unwrap()
            .insert("X".to_string(), newer.clone());
        for name in ["X.m3u8", "X_000.ts"] {
            std::fs::write(dir.path().join(name), b"data").unwrap();
        }

        manager.discard(&older).await;

        assert!(!older.handle.is_running());
        assert!(newer.handle.is_running());
        assert_eq!(manager.active_sessions(), ["X"]);
        assert!(dir.path().join("X.m3u8").exists());
        assert!(dir.path().join("X_000.ts").exists());

        manager.shutdown().await;
        assert!(!newer.handle.is_running());
        assert!(manager.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn purge_of_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let report = purge_session_files(&dir.path().join("gone"), "X").await;
        assert_eq!(report, CleanupReport::default());
    }
}
