use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use super::TaskKind;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Elapsed position into the output reported by the subprocess.
    Progress(Duration),
    /// Final output path.
    Completed(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub kind: TaskKind,
    pub live_id: String,
    /// Supervisor id of the emitting process; unset when spawning failed.
    pub process: Option<u64>,
    pub payload: EventPayload,
}

impl MediaEvent {
    pub fn progress(kind: TaskKind, live_id: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            kind,
            live_id: live_id.into(),
            process: None,
            payload: EventPayload::Progress(elapsed),
        }
    }

    pub fn completed(kind: TaskKind, live_id: impl Into<String>, path: PathBuf) -> Self {
        Self {
            kind,
            live_id: live_id.into(),
            process: None,
            payload: EventPayload::Completed(path),
        }
    }

    pub fn failed(kind: TaskKind, live_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            live_id: live_id.into(),
            process: None,
            payload: EventPayload::Failed(message.into()),
        }
    }

    pub fn with_process(mut self, process: u64) -> Self {
        self.process = Some(process);
        self
    }

    pub fn is_for(&self, kind: TaskKind, live_id: &str) -> bool {
        self.kind == kind && self.live_id == live_id
    }
}

/// Shared channel every supervised process reports on.
///
/// Ordering holds per `(kind, live_id)` only; subscribers filter by identity.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MediaEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: MediaEvent) {
        // No receivers is fine: nobody is watching this id.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.sender.subscribe()
    }

    /// Runs `handler` for each event addressed to `(kind, live_id)` until it
    /// breaks or the returned [`Subscription`] is dropped.
    ///
    /// The receiver is registered before this returns, so events published
    /// afterwards are never missed.
    pub fn listen<F>(&self, kind: TaskKind, live_id: impl Into<String>, mut handler: F) -> Subscription
    where
        F: FnMut(MediaEvent) -> ControlFlow<()> + Send + 'static,
    {
        let live_id = live_id.into();
        let mut stream = BroadcastStream::new(self.sender.subscribe());
        let handle = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) if event.is_for(kind, &live_id) => {
                        if handler(event).is_break() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(%kind, live_id = %live_id, skipped, "event listener lagged");
                    }
                }
            }
        });
        Subscription { handle }
    }
}

/// Listener registration; dropping it stops the listener.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn release(self) {}

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
