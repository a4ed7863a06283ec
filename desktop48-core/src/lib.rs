pub mod config;
pub mod error;
pub mod media;
pub mod settings;

pub use config::{
    load_app_config, AppConfig, FfmpegSection, HlsSection, PathsSection, PlayerSection,
    ServerSection,
};
pub use error::{ConfigError, Result};
pub use media::{
    EventBus, EventPayload, MediaError, MediaEvent, MediaResult, MediaRuntime, MediaTask,
    PlaybackLauncher, ProcessHandle, ProcessSupervisor, ServerPort, StopSignal, TaskFactory,
    TaskKind, TaskRequest, TaskSnapshot, TaskStatus, TranscodeSessionManager,
};
pub use settings::{JsonSettingsStore, MemorySettingsStore, SettingKey, SettingsError, SettingsStore};
