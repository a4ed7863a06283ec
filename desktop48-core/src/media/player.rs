use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::PlayerSection;
use crate::settings::SettingsStore;

use super::error::{MediaError, MediaResult};
use super::supervisor::{ProcessSpawner, SystemProcessSpawner};
use super::toolchain::{self, Toolchain};
use super::transcode::TranscodeSessionManager;

/// Starts ffplay windows that outlive the request that opened them.
pub struct PlaybackLauncher {
    settings: Arc<dyn SettingsStore>,
    config: PlayerSection,
    spawner: Arc<dyn ProcessSpawner>,
}

impl fmt::Debug for PlaybackLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackLauncher")
            .field("config", &self.config)
            .finish()
    }
}

impl PlaybackLauncher {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        config: PlayerSection,
        spawner: Option<Arc<dyn ProcessSpawner>>,
    ) -> Self {
        Self {
            settings,
            config,
            spawner: spawner.unwrap_or_else(|| Arc::new(SystemProcessSpawner)),
        }
    }

    /// Resolves as soon as ffplay is spawned. Later playback problems are
    /// only logged.
    pub async fn launch(&self, title: &str, url: &str) -> MediaResult<()> {
        let program = Toolchain::from_settings(self.settings.as_ref())
            .await?
            .ffplay()?;
        let mut command = Command::new(&program);
        command
            .args(toolchain::player_args(&self.config, title, url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = self
            .spawner
            .spawn(&mut command)
            .map_err(|source| MediaError::Spawn {
                program: program.clone(),
                source,
            })?;
        info!(title, url, pid = ?child.id(), "player started");

        let title = title.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!(title = %title, "player closed"),
                Ok(status) => warn!(title = %title, %status, "player exited unexpectedly"),
                Err(err) => warn!(title = %title, error = %err, "failed to wait on player"),
            }
        });
        Ok(())
    }

    /// Transcodes `source_url` to local HLS first, then plays the manifest.
    pub async fn launch_transcoded(
        &self,
        sessions: &TranscodeSessionManager,
        title: &str,
        source_url: &str,
        live_id: &str,
    ) -> MediaResult<String> {
        let url = sessions.request(source_url, live_id).await?;
        self.launch(title, &url).await?;
        Ok(url)
    }
}
