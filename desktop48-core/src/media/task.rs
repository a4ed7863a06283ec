use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, FfmpegSection};
use crate::settings::{SettingKey, SettingsStore};

use super::error::{MediaError, MediaResult};
use super::events::{EventPayload, Subscription};
use super::supervisor::{ProcessHandle, ProcessSupervisor, SpawnRequest, StopSignal};
use super::toolchain::{self, OutputProfile, Toolchain};
use super::TaskKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Prepared,
    Active,
    Finished,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Prepared => "prepared",
            TaskStatus::Active => "active",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub source_url: String,
    pub target_filename: String,
    pub live_id: String,
}

impl TaskRequest {
    pub fn new(
        source_url: impl Into<String>,
        target_filename: impl Into<String>,
        live_id: impl Into<String>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            target_filename: target_filename.into(),
            live_id: live_id.into(),
        }
    }
}

/// Point-in-time view of a task for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub kind: TaskKind,
    pub live_id: String,
    pub source_url: String,
    pub status: TaskStatus,
    /// Last elapsed time reported by ffmpeg.
    pub progress: Option<Duration>,
    pub file_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Opens a directory in the platform file manager.
pub trait FileRevealer: Send + Sync {
    fn reveal(&self, path: &Path) -> std::io::Result<()>;
}

#[derive(Debug, Default)]
pub struct SystemFileRevealer;

impl FileRevealer for SystemFileRevealer {
    fn reveal(&self, path: &Path) -> std::io::Result<()> {
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else if cfg!(windows) {
            "explorer"
        } else {
            "xdg-open"
        };
        tokio::process::Command::new(opener)
            .arg(path)
            .spawn()
            .map(|_| ())
    }
}

type EndCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TaskState {
    status: TaskStatus,
    progress: Option<Duration>,
    file_path: Option<PathBuf>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    process: Option<ProcessHandle>,
    subscription: Option<Subscription>,
    on_end: Option<EndCallback>,
}

/// What a terminal transition hands back to run outside the state lock.
struct Settled {
    on_end: Option<EndCallback>,
    subscription: Option<Subscription>,
}

impl Settled {
    fn finish(self) {
        drop(self.subscription);
        if let Some(on_end) = self.on_end {
            on_end();
        }
    }
}

impl TaskState {
    /// Only an active task can settle, and only once.
    fn settle(&mut self, status: TaskStatus) -> Option<Settled> {
        if self.status != TaskStatus::Active {
            return None;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        if let Some(last) = self.process.as_ref().and_then(ProcessHandle::last_progress) {
            self.progress = Some(last);
        }
        Some(Settled {
            on_end: self.on_end.take(),
            subscription: self.subscription.take(),
        })
    }
}

/// A download or recording driven by one ffmpeg subprocess.
///
/// Built through [`TaskFactory`] so the save and tool directories are already
/// read from settings when the task is handed out.
pub struct MediaTask {
    kind: TaskKind,
    request: TaskRequest,
    save_directory: Option<PathBuf>,
    toolchain: Toolchain,
    ffmpeg: FfmpegSection,
    profile: OutputProfile,
    supervisor: ProcessSupervisor,
    revealer: Arc<dyn FileRevealer>,
    state: Arc<Mutex<TaskState>>,
}

impl fmt::Debug for MediaTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTask")
            .field("kind", &self.kind)
            .field("live_id", &self.request.live_id)
            .field("status", &self.status())
            .finish()
    }
}

impl MediaTask {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn live_id(&self) -> &str {
        &self.request.live_id
    }

    pub fn source_url(&self) -> &str {
        &self.request.source_url
    }

    pub fn save_directory(&self) -> Option<&Path> {
        self.save_directory.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn progress(&self) -> Option<Duration> {
        self.lock().progress
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.lock().file_path.clone()
    }

    pub fn is_active(&self) -> bool {
        self.status() == TaskStatus::Active
    }

    pub fn is_finished(&self) -> bool {
        self.status() == TaskStatus::Finished
    }

    pub fn process(&self) -> Option<ProcessHandle> {
        self.lock().process.clone()
    }

    /// Registers the callback run once when the task leaves `Active`.
    pub fn set_on_end<F>(&self, on_end: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().on_end = Some(Arc::new(on_end));
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock();
        TaskSnapshot {
            kind: self.kind,
            live_id: self.request.live_id.clone(),
            source_url: self.request.source_url.clone(),
            status: state.status,
            progress: state.progress,
            file_path: state.file_path.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            error: state.error.clone(),
        }
    }

    /// Validates directories, resolves the output path and spawns ffmpeg.
    ///
    /// Configuration problems are returned before anything is spawned.
    /// Progress then arrives through the event bus; completion and failure
    /// follow the exit of this task's own process.
    pub fn start<F>(&self, on_started: F) -> MediaResult<()>
    where
        F: FnOnce(),
    {
        self.ensure_prepared()?;
        let save_directory = self
            .save_directory
            .as_ref()
            .ok_or(MediaError::SaveDirectoryUnset)?;
        if !save_directory.is_dir() {
            return Err(MediaError::SaveDirectoryMissing {
                path: save_directory.clone(),
            });
        }
        let program = self.toolchain.ffmpeg()?;
        let output = save_directory.join(&self.request.target_filename);

        // Registered before the transition so a concurrent stop always finds
        // the subscription it has to release.
        let subscription = self.subscribe();
        {
            let mut state = self.lock();
            if state.status != TaskStatus::Prepared {
                return Err(MediaError::InvalidState {
                    live_id: self.request.live_id.clone(),
                    status: state.status,
                });
            }
            state.status = TaskStatus::Active;
            state.file_path = Some(output.clone());
            state.started_at = Some(Utc::now());
            state.subscription = Some(subscription);
        }
        on_started();
        info!(
            kind = %self.kind,
            live_id = %self.request.live_id,
            source = %self.request.source_url,
            path = %output.display(),
            "task started"
        );

        let spawned = self.supervisor.spawn(SpawnRequest {
            kind: self.kind,
            live_id: self.request.live_id.clone(),
            program,
            args: toolchain::capture_args(
                &self.ffmpeg,
                &self.profile,
                &self.request.source_url,
                &output,
            ),
            output,
        });
        match spawned {
            Ok(handle) => {
                let adopted = {
                    let mut state = self.lock();
                    if state.status == TaskStatus::Active {
                        state.process = Some(handle.clone());
                        true
                    } else {
                        false
                    }
                };
                if adopted {
                    tokio::spawn(settle_on_exit(
                        Arc::clone(&self.state),
                        handle,
                        self.kind,
                        self.request.live_id.clone(),
                    ));
                } else {
                    // Stopped while spawning.
                    handle.stop(StopSignal::Interrupt);
                }
                Ok(())
            }
            Err(err) => {
                let settled = {
                    let mut state = self.lock();
                    state.error = Some(err.to_string());
                    state.settle(TaskStatus::Failed)
                };
                if let Some(settled) = settled {
                    settled.finish();
                }
                Err(err)
            }
        }
    }

    /// Sends the graceful interrupt and marks the task finished without
    /// waiting for the subprocess to exit. No-op unless active.
    pub fn stop(&self) {
        let (settled, process) = {
            let mut state = self.lock();
            let process = state.process.clone();
            (state.settle(TaskStatus::Finished), process)
        };
        let Some(settled) = settled else {
            return;
        };
        // Without a handle the spawn is still in flight; start() interrupts it.
        let delivered = process
            .map(|handle| handle.stop(StopSignal::Interrupt))
            .unwrap_or(false);
        info!(
            kind = %self.kind,
            live_id = %self.request.live_id,
            delivered,
            "task stopped"
        );
        settled.finish();
    }

    pub fn open_save_directory(&self) {
        let Some(directory) = self.save_directory.as_ref() else {
            error!(live_id = %self.request.live_id, "save directory is not initialized");
            return;
        };
        if let Err(err) = self.revealer.reveal(directory) {
            warn!(path = %directory.display(), error = %err, "failed to open save directory");
        }
    }

    fn ensure_prepared(&self) -> MediaResult<()> {
        let status = self.status();
        if status == TaskStatus::Prepared {
            Ok(())
        } else {
            Err(MediaError::InvalidState {
                live_id: self.request.live_id.clone(),
                status,
            })
        }
    }

    /// Progress only. Terminal transitions come from the process handle, so
    /// a lagging listener or a previous process with the same live id cannot
    /// settle this task.
    fn subscribe(&self) -> Subscription {
        let state = Arc::clone(&self.state);
        self.supervisor
            .events()
            .listen(self.kind, self.request.live_id.clone(), move |event| {
                if let EventPayload::Progress(elapsed) = event.payload {
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    let own = matches!(
                        (&state.process, event.process),
                        (Some(handle), Some(id)) if handle.id() == id
                    );
                    if own && state.status == TaskStatus::Active {
                        state.progress = Some(elapsed);
                    }
                }
                ControlFlow::Continue(())
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn settle_on_exit(
    state: Arc<Mutex<TaskState>>,
    handle: ProcessHandle,
    kind: TaskKind,
    live_id: String,
) {
    let outcome = handle.wait().await;
    let settled = {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if outcome.is_completed() {
            state.settle(TaskStatus::Finished)
        } else {
            let message = outcome.describe("ffmpeg");
            if state.status == TaskStatus::Active {
                state.error = Some(message);
            }
            state.settle(TaskStatus::Failed)
        }
    };
    match &settled {
        Some(_) if outcome.is_completed() => info!(%kind, live_id = %live_id, "task completed"),
        Some(_) => error!(%kind, live_id = %live_id, ?outcome, "task failed"),
        None => debug!(%kind, live_id = %live_id, ?outcome, "process exited after task settled"),
    }
    if let Some(settled) = settled {
        settled.finish();
    }
}

/// Builds tasks with their settings already resolved.
#[derive(Clone)]
pub struct TaskFactory {
    settings: Arc<dyn SettingsStore>,
    supervisor: ProcessSupervisor,
    ffmpeg: FfmpegSection,
    revealer: Arc<dyn FileRevealer>,
}

impl fmt::Debug for TaskFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFactory")
            .field("ffmpeg", &self.ffmpeg)
            .finish()
    }
}

impl TaskFactory {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        supervisor: ProcessSupervisor,
        config: &AppConfig,
    ) -> Self {
        Self {
            settings,
            supervisor,
            ffmpeg: config.ffmpeg.clone(),
            revealer: Arc::new(SystemFileRevealer),
        }
    }

    pub fn with_revealer(mut self, revealer: Arc<dyn FileRevealer>) -> Self {
        self.revealer = revealer;
        self
    }

    pub async fn download(&self, request: TaskRequest) -> MediaResult<MediaTask> {
        self.build(TaskKind::Download, request, OutputProfile::Copy)
            .await
    }

    /// Recordings force a streaming container so a stopped file stays playable.
    pub async fn record(&self, request: TaskRequest) -> MediaResult<MediaTask> {
        let profile = OutputProfile::Container(self.ffmpeg.record_format.clone());
        self.build(TaskKind::Record, request, profile).await
    }

    async fn build(
        &self,
        kind: TaskKind,
        request: TaskRequest,
        profile: OutputProfile,
    ) -> MediaResult<MediaTask> {
        let save_directory = self
            .settings
            .directory(SettingKey::DownloadDirectory)
            .await?;
        let toolchain = Toolchain::from_settings(self.settings.as_ref()).await?;
        Ok(MediaTask {
            kind,
            request,
            save_directory,
            toolchain,
            ffmpeg: self.ffmpeg.clone(),
            profile,
            supervisor: self.supervisor.clone(),
            revealer: Arc::clone(&self.revealer),
            state: Arc::new(Mutex::new(TaskState::default())),
        })
    }
}
