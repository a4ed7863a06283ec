use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use desktop48_core::media::{format_elapsed, Toolchain};
use desktop48_core::{
    load_app_config, AppConfig, EventPayload, JsonSettingsStore, MediaRuntime, MediaTask,
    SettingKey, SettingsStore, TaskKind, TaskRequest, TaskSnapshot,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "configs/desktop48.toml";

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] desktop48_core::ConfigError),
    #[error("settings error: {0}")]
    Settings(#[from] desktop48_core::SettingsError),
    #[error("{0}")]
    Media(#[from] desktop48_core::MediaError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("one or more checks failed")]
    ChecksFailed,
    #[error("interrupted before the transcode was ready")]
    Interrupted,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "desktop48 media task control", long_about = None)]
pub struct Cli {
    /// Path to desktop48.toml (defaults apply when absent)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Path to the persisted settings document
    #[arg(long)]
    pub settings: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a replay into the save directory
    Download(CaptureArgs),
    /// Record a live stream into the save directory
    Record(CaptureArgs),
    /// Serve a live stream as local HLS until interrupted
    Transcode(TranscodeArgs),
    /// Open a stream in ffplay
    Play(PlayArgs),
    /// Read or change persisted settings
    #[command(subcommand)]
    Settings(SettingsCommands),
    /// Configuration checks
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
pub struct CaptureArgs {
    /// Source stream URL
    pub url: String,
    /// Output file name inside the save directory
    pub filename: String,
    /// Correlation id; a random one is generated when omitted
    #[arg(long)]
    pub live_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct TranscodeArgs {
    pub url: String,
    #[arg(long)]
    pub live_id: Option<String>,
    /// Also open the local manifest in ffplay
    #[arg(long, default_value_t = false)]
    pub play: bool,
    #[arg(long, default_value = "desktop48")]
    pub title: String,
}

#[derive(Args, Debug)]
pub struct PlayArgs {
    pub url: String,
    #[arg(long, default_value = "desktop48")]
    pub title: String,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Show one key, or every key when none is given
    Get { key: Option<String> },
    /// Persist a value
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Verify directories and tools
    Check,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli).await?;

    match &cli.command {
        Commands::Download(args) => {
            let report = context.capture(TaskKind::Download, args).await?;
            render(&report, cli.format)?;
        }
        Commands::Record(args) => {
            let report = context.capture(TaskKind::Record, args).await?;
            render(&report, cli.format)?;
        }
        Commands::Transcode(args) => {
            let report = context.transcode(args, cli.format).await?;
            render(&report, cli.format)?;
        }
        Commands::Play(args) => {
            let report = context.play(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Settings(SettingsCommands::Get { key }) => {
            let report = context.settings_get(key.as_deref()).await?;
            render(&report, cli.format)?;
        }
        Commands::Settings(SettingsCommands::Set { key, value }) => {
            let report = context.settings_set(key, value).await?;
            render(&report, cli.format)?;
        }
        Commands::Config(ConfigCommands::Check) => {
            let report = context.config_check().await?;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::ChecksFailed);
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    config: AppConfig,
    config_path: Option<PathBuf>,
    settings: Arc<JsonSettingsStore>,
    runtime: MediaRuntime,
}

impl AppContext {
    async fn new(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => Some(path.clone()),
            None => Some(PathBuf::from(DEFAULT_CONFIG)).filter(|path| path.exists()),
        };
        let config = match &config_path {
            Some(path) => load_app_config(path)?,
            None => AppConfig::default(),
        };
        let settings_path = cli
            .settings
            .clone()
            .unwrap_or_else(|| config.settings_path());
        let settings = Arc::new(JsonSettingsStore::open(&settings_path).await?);
        let runtime = MediaRuntime::new(config.clone(), settings.clone(), None);
        Ok(Self {
            config,
            config_path,
            settings,
            runtime,
        })
    }

    async fn capture(&self, kind: TaskKind, args: &CaptureArgs) -> Result<TaskReport> {
        let request = TaskRequest::new(
            args.url.clone(),
            args.filename.clone(),
            live_id_or_random(args.live_id.as_deref()),
        );
        let task = match kind {
            TaskKind::Record => self.runtime.tasks().record(request).await?,
            _ => self.runtime.tasks().download(request).await?,
        };
        let ended = Arc::new(Notify::new());
        let signal = ended.clone();
        task.set_on_end(move || signal.notify_one());

        let _progress = self.runtime.events().listen(kind, task.live_id(), |event| {
            if let EventPayload::Progress(elapsed) = event.payload {
                info!(elapsed = %format_elapsed(elapsed), "progress");
            }
            std::ops::ControlFlow::Continue(())
        });
        task.start(|| info!("press Ctrl-C to stop"))?;

        tokio::select! {
            _ = ended.notified() => {}
            _ = tokio::signal::ctrl_c() => {
                task.stop();
                wait_for_exit(&task).await;
            }
        }
        let report = TaskReport::from(task.snapshot());
        self.runtime.shutdown().await;
        Ok(report)
    }

    async fn transcode(&self, args: &TranscodeArgs, format: OutputFormat) -> Result<TranscodeReport> {
        self.transcode_until(args, format, interrupted()).await
    }

    /// Serves the transcode until `cancel` resolves. Cancelling during the
    /// readiness wait still tears the runtime down.
    async fn transcode_until<C>(
        &self,
        args: &TranscodeArgs,
        format: OutputFormat,
        cancel: C,
    ) -> Result<TranscodeReport>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        self.runtime.start_segment_server().await;
        let live_id = live_id_or_random(args.live_id.as_deref());
        let sessions = self.runtime.sessions();
        let pending = async {
            if args.play {
                self.runtime
                    .player()
                    .launch_transcoded(sessions, &args.title, &args.url, &live_id)
                    .await
            } else {
                sessions.request(&args.url, &live_id).await
            }
        };
        let url = tokio::select! {
            biased;
            _ = &mut cancel => {
                warn!(live_id = %live_id, "interrupted while waiting for the transcode");
                self.runtime.shutdown().await;
                return Err(AppError::Interrupted);
            }
            url = pending => url,
        };
        let url = match url {
            Ok(url) => url,
            Err(err) => {
                self.runtime.shutdown().await;
                return Err(err.into());
            }
        };
        render(
            &TranscodeReport {
                live_id: live_id.clone(),
                url: url.clone(),
                stopped: false,
            },
            format,
        )?;

        cancel.await;
        sessions.stop(&live_id).await;
        self.runtime.shutdown().await;
        Ok(TranscodeReport {
            live_id,
            url,
            stopped: true,
        })
    }

    async fn play(&self, args: &PlayArgs) -> Result<PlayReport> {
        self.runtime.player().launch(&args.title, &args.url).await?;
        Ok(PlayReport {
            title: args.title.clone(),
            url: args.url.clone(),
        })
    }

    async fn settings_get(&self, key: Option<&str>) -> Result<SettingsReport> {
        let keys = match key {
            Some(key) => vec![key.parse::<SettingKey>()?],
            None => SettingKey::ALL.to_vec(),
        };
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            entries.push(SettingEntry {
                key: key.as_str().to_string(),
                value: self.settings.get(key).await?,
            });
        }
        Ok(SettingsReport {
            path: self.settings.path().to_path_buf(),
            entries,
        })
    }

    async fn settings_set(&self, key: &str, value: &str) -> Result<SettingsReport> {
        let key = key.parse::<SettingKey>()?;
        self.settings.set(key, value.to_string()).await?;
        Ok(SettingsReport {
            path: self.settings.path().to_path_buf(),
            entries: vec![SettingEntry {
                key: key.as_str().to_string(),
                value: Some(value.to_string()),
            }],
        })
    }

    async fn config_check(&self) -> Result<Vec<HealthEntry>> {
        let mut results = Vec::new();
        results.push(match &self.config_path {
            Some(path) => HealthEntry::ok("config", path.display().to_string()),
            None => HealthEntry::warn("config", "no config file, using defaults"),
        });
        results.push(HealthEntry::ok(
            "settings",
            self.settings.path().display().to_string(),
        ));

        match self.settings.directory(SettingKey::DownloadDirectory).await? {
            Some(path) => results.push(self.check_directory("download_directory", &path)),
            None => results.push(HealthEntry::error("download_directory", "not set")),
        }

        let toolchain = Toolchain::from_settings(self.settings.as_ref()).await?;
        results.push(match toolchain.ffmpeg() {
            Ok(path) => HealthEntry::ok("ffmpeg", path.display().to_string()),
            Err(err) => HealthEntry::error("ffmpeg", err.to_string()),
        });
        results.push(match toolchain.ffplay() {
            Ok(path) => HealthEntry::ok("ffplay", path.display().to_string()),
            Err(err) => HealthEntry::warn("ffplay", err.to_string()),
        });

        let output_dir = self.config.output_dir();
        results.push(match self.check_directory("hls_output", &output_dir) {
            entry if matches!(entry.status, CheckStatus::Ok) => entry,
            _ => HealthEntry::warn(
                "hls_output",
                format!("{} will be created on first use", output_dir.display()),
            ),
        });
        results.push(HealthEntry::ok(
            "segment_server",
            format!(
                "{}:{}..{}",
                self.config.server.bind_addr,
                self.config.server.start_port,
                self.config
                    .server
                    .start_port
                    .saturating_add(self.config.server.max_attempts.saturating_sub(1))
            ),
        ));
        Ok(results)
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, path.display().to_string()),
            Ok(_) => HealthEntry::error(name, format!("{} is not a directory", path.display())),
            Err(_) => HealthEntry::error(name, format!("{} not found", path.display())),
        }
    }
}

async fn wait_for_exit(task: &MediaTask) {
    if let Some(process) = task.process() {
        let outcome = process.wait().await;
        info!(live_id = %task.live_id(), ?outcome, "ffmpeg exited");
    } else {
        warn!(live_id = %task.live_id(), "task had no running process");
    }
}

async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c, shutting down");
    }
}

fn live_id_or_random(live_id: Option<&str>) -> String {
    live_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub kind: TaskKind,
    pub live_id: String,
    pub status: String,
    pub progress: Option<String>,
    pub file_path: Option<PathBuf>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

impl From<TaskSnapshot> for TaskReport {
    fn from(snapshot: TaskSnapshot) -> Self {
        Self {
            kind: snapshot.kind,
            live_id: snapshot.live_id,
            status: snapshot.status.to_string(),
            progress: snapshot.progress.map(format_elapsed),
            file_path: snapshot.file_path,
            started_at: snapshot.started_at.map(|ts| ts.to_rfc3339()),
            finished_at: snapshot.finished_at.map(|ts| ts.to_rfc3339()),
            error: snapshot.error,
        }
    }
}

impl DisplayFallback for TaskReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("{} {}: {}", self.kind, self.live_id, self.status)];
        if let Some(path) = &self.file_path {
            lines.push(format!("  file: {}", path.display()));
        }
        if let Some(progress) = &self.progress {
            lines.push(format!("  progress: {progress}"));
        }
        if let Some(error) = &self.error {
            lines.push(format!("  error: {error}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TranscodeReport {
    pub live_id: String,
    pub url: String,
    pub stopped: bool,
}

impl DisplayFallback for TranscodeReport {
    fn display(&self) -> String {
        if self.stopped {
            format!("transcode {} stopped", self.live_id)
        } else {
            format!("transcode {} ready at {}", self.live_id, self.url)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlayReport {
    pub title: String,
    pub url: String,
}

impl DisplayFallback for PlayReport {
    fn display(&self) -> String {
        format!("playing {} ({})", self.title, self.url)
    }
}

#[derive(Debug, Serialize)]
pub struct SettingsReport {
    pub path: PathBuf,
    pub entries: Vec<SettingEntry>,
}

#[derive(Debug, Serialize)]
pub struct SettingEntry {
    pub key: String,
    pub value: Option<String>,
}

impl DisplayFallback for SettingsReport {
    fn display(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                format!(
                    "{} = {}",
                    entry.key,
                    entry.value.as_deref().unwrap_or("<unset>")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
