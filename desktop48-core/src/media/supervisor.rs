use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::error::{MediaError, MediaResult};
use super::events::{EventBus, MediaEvent};
use super::progress::parse_progress_time;
use super::TaskKind;

const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches a prepared command. Swapped out in tests to count or refuse spawns.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &mut Command) -> std::io::Result<Child>;
}

#[derive(Debug, Default)]
pub struct SystemProcessSpawner;

impl ProcessSpawner for SystemProcessSpawner {
    fn spawn(&self, command: &mut Command) -> std::io::Result<Child> {
        command.spawn()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSignal {
    /// Graceful: lets ffmpeg flush and finalize the container.
    Interrupt,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExitOutcome {
    Completed,
    Failed {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ExitOutcome {
    /// A clean exit, an interrupt, or any exit following an interrupt we sent
    /// counts as completion.
    pub fn classify(status: ExitStatus, interrupted: bool) -> Self {
        let signal = exit_signal(&status);
        if status.success() || interrupted || signal == Some(SIGINT) {
            ExitOutcome::Completed
        } else {
            ExitOutcome::Failed {
                code: status.code(),
                signal,
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ExitOutcome::Completed)
    }

    pub fn describe(&self, program: &str) -> String {
        match self {
            ExitOutcome::Completed => format!("{program} completed"),
            ExitOutcome::Failed {
                code: Some(code), ..
            } => format!("{program} exited with code {code}"),
            ExitOutcome::Failed {
                signal: Some(signal),
                ..
            } => format!("{program} terminated by signal {signal}"),
            ExitOutcome::Failed { .. } => format!("{program} exited abnormally"),
        }
    }
}

#[cfg(unix)]
const SIGINT: i32 = libc::SIGINT;
#[cfg(not(unix))]
const SIGINT: i32 = 2;

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub kind: TaskKind,
    pub live_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Reported back in the completion event.
    pub output: PathBuf,
}

/// Cloneable reference to one supervised subprocess.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    kind: TaskKind,
    live_id: String,
    id: u64,
    pid: Option<u32>,
    stops: mpsc::UnboundedSender<StopSignal>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    progress: watch::Receiver<Option<Duration>>,
}

impl ProcessHandle {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn live_id(&self) -> &str {
        &self.live_id
    }

    /// Unique per spawn, unlike `(kind, live_id)` which may be reused.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Asks the monitor to signal the process. Returns false once it has exited.
    pub fn stop(&self, signal: StopSignal) -> bool {
        self.is_running() && self.stops.send(signal).is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Latest `time=` position seen on stderr. Complete once the process
    /// has exited, since stderr is drained before the exit is reported.
    pub fn last_progress(&self) -> Option<Duration> {
        *self.progress.borrow()
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        *self.exit.borrow()
    }

    pub async fn wait(&self) -> ExitOutcome {
        let mut exit = self.exit.clone();
        let outcome = match exit.wait_for(Option::is_some).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        outcome.unwrap_or(ExitOutcome::Failed {
            code: None,
            signal: None,
        })
    }

    pub(crate) fn same_process(&self, other: &ProcessHandle) -> bool {
        self.id == other.id
    }
}

type Registry = Mutex<HashMap<(TaskKind, String), ProcessHandle>>;

/// Owns every running ffmpeg child, forwards its stderr as progress events and
/// reports exactly one terminal event per process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    events: EventBus,
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("running", &self.registry_len())
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(spawner: Option<Arc<dyn ProcessSpawner>>, events: EventBus) -> Self {
        Self {
            spawner: spawner.unwrap_or_else(|| Arc::new(SystemProcessSpawner)),
            events,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn spawn(&self, request: SpawnRequest) -> MediaResult<ProcessHandle> {
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match self.spawner.spawn(&mut command) {
            Ok(child) => child,
            Err(source) => {
                warn!(
                    kind = %request.kind,
                    live_id = %request.live_id,
                    program = %request.program.display(),
                    error = %source,
                    "failed to spawn process"
                );
                self.events.publish(MediaEvent::failed(
                    request.kind,
                    request.live_id.clone(),
                    source.to_string(),
                ));
                return Err(MediaError::Spawn {
                    program: request.program,
                    source,
                });
            }
        };

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (progress_tx, progress_rx) = watch::channel(None);
        let handle = ProcessHandle {
            kind: request.kind,
            live_id: request.live_id.clone(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pid: child.id(),
            stops: stop_tx,
            exit: exit_rx,
            progress: progress_rx,
        };

        let previous = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((request.kind, request.live_id.clone()), handle.clone());
        if let Some(previous) = previous {
            warn!(
                kind = %request.kind,
                live_id = %request.live_id,
                pid = ?previous.pid,
                "replacing registry entry of a still running process"
            );
        }
        info!(
            kind = %request.kind,
            live_id = %request.live_id,
            pid = ?handle.pid,
            "process started"
        );

        let forwarder = child.stderr.take().map(|stderr| {
            tokio::spawn(forward_stderr(
                stderr,
                self.events.clone(),
                request.kind,
                request.live_id.clone(),
                handle.id,
                progress_tx,
            ))
        });
        let monitor = Monitor {
            supervisor: self.clone(),
            handle: handle.clone(),
            program: request
                .program
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| request.program.display().to_string()),
            output: request.output,
        };
        tokio::spawn(monitor.run(child, stop_rx, exit_tx, forwarder));
        Ok(handle)
    }

    pub fn handle(&self, kind: TaskKind, live_id: &str) -> Option<ProcessHandle> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, live_id.to_string()))
            .cloned()
    }

    pub fn request_stop(&self, kind: TaskKind, live_id: &str, signal: StopSignal) -> bool {
        match self.handle(kind, live_id) {
            Some(handle) => handle.stop(signal),
            None => {
                debug!(%kind, live_id, "stop requested for unknown process");
                false
            }
        }
    }

    pub fn is_running(&self, kind: TaskKind, live_id: &str) -> bool {
        self.handle(kind, live_id)
            .map(|handle| handle.is_running())
            .unwrap_or(false)
    }

    pub fn active(&self, kind: TaskKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(entry_kind, _)| *entry_kind == kind)
            .map(|(_, live_id)| live_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Kills every remaining child and waits for their monitors to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<ProcessHandle> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "stopping supervised processes");
        for handle in &handles {
            handle.stop(StopSignal::Kill);
        }
        join_all(handles.iter().map(|handle| handle.wait())).await;
    }

    fn registry_len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn forget(&self, handle: &ProcessHandle) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (handle.kind, handle.live_id.clone());
        if registry
            .get(&key)
            .map(|current| current.same_process(handle))
            .unwrap_or(false)
        {
            registry.remove(&key);
        }
    }
}

struct Monitor {
    supervisor: ProcessSupervisor,
    handle: ProcessHandle,
    program: String,
    output: PathBuf,
}

impl Monitor {
    async fn run(
        self,
        mut child: Child,
        mut stops: mpsc::UnboundedReceiver<StopSignal>,
        exit: watch::Sender<Option<ExitOutcome>>,
        forwarder: Option<tokio::task::JoinHandle<()>>,
    ) {
        let mut interrupted = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = stops.recv() => {
                    interrupted |= signal == StopSignal::Interrupt;
                    self.deliver(&mut child, signal);
                }
            }
        };

        if let Some(forwarder) = forwarder {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, forwarder)
                .await
                .is_err()
            {
                debug!(live_id = %self.handle.live_id, "stderr still open after exit");
            }
        }

        let outcome = match status {
            Ok(status) => ExitOutcome::classify(status, interrupted),
            Err(err) => {
                warn!(live_id = %self.handle.live_id, error = %err, "failed to wait on process");
                ExitOutcome::Failed {
                    code: None,
                    signal: None,
                }
            }
        };

        self.supervisor.forget(&self.handle);
        let kind = self.handle.kind;
        let live_id = self.handle.live_id.clone();
        let event = match outcome {
            ExitOutcome::Completed => {
                info!(%kind, live_id = %live_id, "process completed");
                MediaEvent::completed(kind, live_id, self.output.clone())
            }
            ExitOutcome::Failed { .. } => {
                let message = outcome.describe(&self.program);
                warn!(%kind, live_id = %live_id, %message, "process failed");
                MediaEvent::failed(kind, live_id, message)
            }
        };
        self.supervisor
            .events
            .publish(event.with_process(self.handle.id));
        exit.send_replace(Some(outcome));
    }

    fn deliver(&self, child: &mut Child, signal: StopSignal) {
        debug!(live_id = %self.handle.live_id, ?signal, "delivering stop signal");
        let result = match signal {
            StopSignal::Kill => child.start_kill(),
            StopSignal::Interrupt | StopSignal::Terminate => send_signal(child, signal),
        };
        if let Err(err) = result {
            warn!(live_id = %self.handle.live_id, ?signal, error = %err, "failed to signal process");
        }
    }
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: StopSignal) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let raw = match signal {
        StopSignal::Interrupt => libc::SIGINT,
        StopSignal::Terminate => libc::SIGTERM,
        StopSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: pid belongs to a child we have not reaped yet.
    let rc = unsafe { libc::kill(pid as libc::pid_t, raw) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _signal: StopSignal) -> std::io::Result<()> {
    child.start_kill()
}

/// ffmpeg rewrites its status line with `\r`; both separators end a line.
async fn forward_stderr(
    mut stderr: ChildStderr,
    events: EventBus,
    kind: TaskKind,
    live_id: String,
    process: u64,
    progress: watch::Sender<Option<Duration>>,
) {
    let source = LineSource {
        events: &events,
        kind,
        live_id: &live_id,
        process,
        progress: &progress,
    };
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                pending.extend_from_slice(&chunk[..read]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    source.handle_line(&line[..line.len() - 1]);
                }
            }
            Err(err) => {
                debug!(live_id = %live_id, error = %err, "stderr read failed");
                break;
            }
        }
    }
    if !pending.is_empty() {
        source.handle_line(&pending);
    }
}

struct LineSource<'a> {
    events: &'a EventBus,
    kind: TaskKind,
    live_id: &'a str,
    process: u64,
    progress: &'a watch::Sender<Option<Duration>>,
}

impl LineSource<'_> {
    fn handle_line(&self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_progress_time(line) {
            Some(elapsed) => {
                self.progress.send_replace(Some(elapsed));
                self.events.publish(
                    MediaEvent::progress(self.kind, self.live_id, elapsed)
                        .with_process(self.process),
                );
            }
            None => debug!(kind = %self.kind, live_id = self.live_id, line, "ffmpeg"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn clean_exit_is_completion() {
        let status = ExitStatus::from_raw(0);
        assert_eq!(ExitOutcome::classify(status, false), ExitOutcome::Completed);
    }

    #[test]
    fn interrupt_counts_as_completion() {
        let by_signal = ExitStatus::from_raw(libc::SIGINT);
        assert_eq!(ExitOutcome::classify(by_signal, false), ExitOutcome::Completed);

        // ffmpeg exits 255 after handling SIGINT itself.
        let after_interrupt = ExitStatus::from_raw(255 << 8);
        assert_eq!(
            ExitOutcome::classify(after_interrupt, true),
            ExitOutcome::Completed
        );
    }

    #[test]
    fn nonzero_exit_is_failure() {
        let status = ExitStatus::from_raw(1 << 8);
        let outcome = ExitOutcome::classify(status, false);
        assert_eq!(
            outcome,
            ExitOutcome::Failed {
                code: Some(1),
                signal: None
            }
        );
        assert_eq!(outcome.describe("ffmpeg"), "ffmpeg exited with code 1");

        let killed = ExitOutcome::classify(ExitStatus::from_raw(libc::SIGKILL), false);
        assert_eq!(
            killed.describe("ffmpeg"),
            format!("ffmpeg terminated by signal {}", libc::SIGKILL)
        );
    }
}
