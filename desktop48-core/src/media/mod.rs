//! Media task lifecycle: supervised ffmpeg/ffplay subprocesses, HLS
//! transcode sessions, the local segment server, and the download/record
//! task objects the UI drives.

pub mod error;
pub mod events;
pub mod player;
pub mod progress;
pub mod runtime;
pub mod server;
pub mod supervisor;
pub mod task;
pub mod toolchain;
pub mod transcode;

use std::fmt;

use serde::Serialize;

pub use error::{MediaError, MediaResult};
pub use events::{EventBus, EventPayload, MediaEvent, Subscription};
pub use player::PlaybackLauncher;
pub use progress::{format_elapsed, parse_progress_time};
pub use runtime::MediaRuntime;
pub use server::{start_segment_server, SegmentServer, ServerError, ServerPort};
pub use supervisor::{
    ExitOutcome, ProcessHandle, ProcessSpawner, ProcessSupervisor, SpawnRequest, StopSignal,
    SystemProcessSpawner,
};
pub use task::{
    FileRevealer, MediaTask, SystemFileRevealer, TaskFactory, TaskRequest, TaskSnapshot,
    TaskStatus,
};
pub use toolchain::{OutputProfile, Toolchain};
pub use transcode::{purge_session_files, CleanupReport, TranscodeSession, TranscodeSessionManager};

/// Which kind of work a subprocess or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Download,
    Record,
    Transcode,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Download => "download",
            TaskKind::Record => "record",
            TaskKind::Transcode => "transcode",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
