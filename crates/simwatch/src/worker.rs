//! One running simulation worker: a spawned OS process plus the control
//! channel used to push live values into it.
//!
//! The handle outlives the process it supervises. The channel socket path is
//! generated once per handle and reused when an exited process is respawned,
//! so a restarted worker finds its channel at the same address. The worker
//! executable is opaque: it receives exactly two launch arguments (channel
//! path, target API root), inherits the full parent environment, and is
//! expected to consume pushed `Token=`/`Month=` lines for its lifetime.

use std::path::{Path, PathBuf};

use simwatch_channel::server::ChannelServer;
use simwatch_channel::{ChannelError, ChannelMessage, LaunchArgs};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::catalog::ResolvedSimulation;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to spawn {exe}: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Handle to one simulation worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    simulation: ResolvedSimulation,
    api_root: String,
    channel: ChannelServer,
    process: Option<Child>,
}

impl WorkerHandle {
    /// Bind the worker's channel and launch its process.
    pub fn spawn(simulation: ResolvedSimulation, api_root: String) -> Result<Self, WorkerError> {
        let channel_path = simwatch_channel::unique_channel_path(&simulation.simulation_type);
        let channel = ChannelServer::bind(channel_path)?;

        let mut handle = Self {
            simulation,
            api_root,
            channel,
            process: None,
        };
        handle.start()?;
        Ok(handle)
    }

    /// Launch (or relaunch) the worker process, reusing the channel.
    fn start(&mut self) -> Result<(), WorkerError> {
        let args = LaunchArgs {
            channel: self.channel.path().to_path_buf(),
            api_endpoint: self.api_root.clone(),
        };
        let args = args.to_args();
        info!(
            "Starting simulation {} {} with arguments: {}",
            self.simulation.simulation_type,
            self.simulation.version,
            args.join(" ")
        );

        let mut command = Command::new(&self.simulation.exe);
        command.args(&args).kill_on_drop(true);
        // The parent environment is inherited as-is; workers pick up proxy
        // settings and the like from the watchdog's own environment.
        if let Some(dir) = self.simulation.exe.parent()
            && dir.as_os_str().len() > 0
        {
            command.current_dir(dir);
        }

        match command.spawn() {
            Ok(child) => {
                self.process = Some(child);
                Ok(())
            }
            Err(source) => {
                self.process = None;
                Err(WorkerError::Spawn {
                    exe: self.simulation.exe.clone(),
                    source,
                })
            }
        }
    }

    /// Respawn the process if it is absent or has exited. Idempotent while
    /// the process is alive. A spawn failure leaves the handle restartable,
    /// so the next call tries again.
    pub fn ensure_running(&mut self) -> Result<(), WorkerError> {
        let needs_start = match self.process.as_mut() {
            None => true,
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    info!(
                        "Simulation {} {} should be running but exited with {status}. Restarting...",
                        self.simulation.simulation_type, self.simulation.version
                    );
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(
                        "Could not poll simulation {} process: {e}. Restarting...",
                        self.simulation.simulation_type
                    );
                    true
                }
            },
        };

        if needs_start { self.start() } else { Ok(()) }
    }

    /// Kill the process if it is still running and reap it.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.process.take() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    if let Err(e) = child.start_kill() {
                        warn!(
                            "Failed to kill simulation {}: {e}",
                            self.simulation.simulation_type
                        );
                    }
                    let _ = child.wait().await;
                }
            }
        }
    }

    /// Push a new access token, and keep it as the channel's connect message
    /// so a worker that attaches later still receives it.
    pub async fn push_token(&self, token: &str) {
        let message = ChannelMessage::Token(token.to_string());
        self.channel.set_connect_message(Some(message.clone()));
        self.channel.push(&message).await;
    }

    pub async fn push_month(&self, month: i32) {
        self.channel.push(&ChannelMessage::Month(month)).await;
    }

    /// Keep-alive push; lets the channel notice a silently exited peer.
    pub async fn ping(&self) {
        self.channel.push(&ChannelMessage::KeepAlive).await;
    }

    pub fn simulation_type(&self) -> &str {
        &self.simulation.simulation_type
    }

    pub fn channel_path(&self) -> &Path {
        self.channel.path()
    }

    /// Shared write handle to this worker's channel, used by the detached
    /// token-refresh task.
    pub fn channel_handle(&self) -> ChannelServer {
        self.channel.clone()
    }

    /// OS process id of the current incarnation, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|c| c.id())
    }
}
