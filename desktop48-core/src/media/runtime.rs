use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::AppConfig;
use crate::settings::SettingsStore;

use super::events::EventBus;
use super::player::PlaybackLauncher;
use super::server::{self, ServerPort};
use super::supervisor::{ProcessSpawner, ProcessSupervisor};
use super::task::TaskFactory;
use super::transcode::TranscodeSessionManager;

/// Wires the media components together around one supervisor and one
/// segment server, and tears them down in order on shutdown.
pub struct MediaRuntime {
    config: AppConfig,
    supervisor: ProcessSupervisor,
    port: ServerPort,
    sessions: Arc<TranscodeSessionManager>,
    tasks: TaskFactory,
    player: PlaybackLauncher,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl MediaRuntime {
    pub fn new(
        config: AppConfig,
        settings: Arc<dyn SettingsStore>,
        spawner: Option<Arc<dyn ProcessSpawner>>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(spawner.clone(), EventBus::default());
        let port = ServerPort::new();
        let sessions = Arc::new(TranscodeSessionManager::new(
            Arc::clone(&settings),
            supervisor.clone(),
            &config,
            port.clone(),
        ));
        let tasks = TaskFactory::new(Arc::clone(&settings), supervisor.clone(), &config);
        let player = PlaybackLauncher::new(settings, config.player.clone(), spawner);
        Self {
            config,
            supervisor,
            port,
            sessions,
            tasks,
            player,
            server: Mutex::new(None),
        }
    }

    /// Returns whether the server is (now) listening.
    pub async fn start_segment_server(&self) -> bool {
        if self.port.get().is_some() {
            return true;
        }
        let handle = server::start_segment_server(
            &self.config.server,
            self.config.output_dir(),
            &self.port,
        )
        .await;
        let started = handle.is_some();
        *self.server.lock().unwrap_or_else(PoisonError::into_inner) = handle;
        started
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn events(&self) -> &EventBus {
        self.supervisor.events()
    }

    pub fn port(&self) -> &ServerPort {
        &self.port
    }

    pub fn sessions(&self) -> &Arc<TranscodeSessionManager> {
        &self.sessions
    }

    pub fn tasks(&self) -> &TaskFactory {
        &self.tasks
    }

    pub fn player(&self) -> &PlaybackLauncher {
        &self.player
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.supervisor.shutdown().await;
        if let Some(server) = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            server.abort();
        }
        info!("media runtime stopped");
    }
}
