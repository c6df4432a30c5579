//! Per-session state: the lifecycle state machine, the set of running
//! workers, and the debounced background token refresh.
//!
//! A session mirrors one planning exercise on the platform, identified by an
//! opaque session token. The supervisor loop is the only mutator of a
//! session; the one concession to concurrency is the token pair, which lives
//! behind an `Arc<Mutex>` because the detached refresh task replaces it
//! while the loop may be fanning out a token of its own. Token writes are
//! whole-value replacements — last write wins.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use simwatch_channel::ChannelMessage;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{ApiClient, ApiToken, TokenPair};
use crate::catalog::ResolvedSimulation;
use crate::worker::WorkerHandle;

/// How long between token renewal checks for one session.
pub const TOKEN_CHECK_INTERVAL: Duration = Duration::from_secs(900);

/// Session lifecycle state as reported by the platform.
///
/// Only the idle-like and ended states get special treatment; every other
/// reported state means "keep the workers running", so unknown state strings
/// deliberately land on [`GameState::Play`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Setup,
    Pause,
    Play,
    End,
}

impl GameState {
    /// Permissive parse: anything not explicitly idle-like or ended is
    /// treated as playing.
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "setup" => Self::Setup,
            "pause" | "paused" => Self::Pause,
            "end" | "ended" => Self::End,
            _ => Self::Play,
        }
    }

    /// Idle sessions keep their workers but are candidates for eviction
    /// after the inactivity window.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Setup | Self::Pause)
    }

    /// Stopped sessions are torn down on the tick that observes them.
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::End)
    }
}

impl std::fmt::Display for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Pause => write!(f, "pause"),
            Self::Play => write!(f, "play"),
            Self::End => write!(f, "end"),
        }
    }
}

/// One active platform session and everything the watchdog runs for it.
pub struct Session {
    session_token: String,
    api_root: String,
    configured: Vec<ResolvedSimulation>,
    workers: Vec<WorkerHandle>,
    state: GameState,
    last_state_change: Instant,
    tokens: Arc<Mutex<TokenPair>>,
    last_token_check: Instant,
    refresh_task: Option<JoinHandle<()>>,
    api: ApiClient,
    token_check_interval: Duration,
}

impl Session {
    pub fn new(
        session_token: String,
        api_root: String,
        configured: Vec<ResolvedSimulation>,
        tokens: TokenPair,
        api: ApiClient,
        token_check_interval: Duration,
    ) -> Self {
        Self {
            session_token,
            api_root,
            configured,
            workers: Vec::new(),
            state: GameState::Setup,
            last_state_change: Instant::now(),
            tokens: Arc::new(Mutex::new(tokens)),
            last_token_check: Instant::now(),
            refresh_task: None,
            api,
            token_check_interval,
        }
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    /// Time since the last reported state change; drives idle eviction.
    pub fn idle_since(&self) -> Duration {
        self.last_state_change.elapsed()
    }

    /// Record the reported state unconditionally and reset the idle clock.
    /// No transition validation — the platform is the source of truth.
    pub fn set_state(&mut self, state: GameState) {
        self.state = state;
        self.last_state_change = Instant::now();
    }

    /// Spawn every configured worker that is missing and health-check the
    /// ones that exist. A worker that fails to spawn is logged and retried
    /// on the next tick.
    pub async fn ensure_workers_running(&mut self) {
        for simulation in self.configured.clone() {
            let existing = self
                .workers
                .iter_mut()
                .find(|w| w.simulation_type() == simulation.simulation_type);

            match existing {
                Some(worker) => {
                    if let Err(e) = worker.ensure_running() {
                        error!(
                            session = %self.session_token,
                            "Failed to restart simulation {}: {e}",
                            simulation.simulation_type
                        );
                    }
                }
                None => {
                    info!(
                        "Starting simulation {} {} for {} on session token {}",
                        simulation.simulation_type,
                        simulation.version,
                        self.api_root,
                        self.session_token
                    );
                    match WorkerHandle::spawn(simulation, self.api_root.clone()) {
                        Ok(worker) => {
                            // Hand the newly bound channel the current token
                            // so the worker receives it as soon as it connects.
                            let access = self.access_token_string();
                            worker.push_token(&access).await;
                            self.workers.push(worker);
                        }
                        Err(e) => {
                            error!(session = %self.session_token, "Failed to start simulation: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Stop and discard every worker.
    pub async fn stop_all_workers(&mut self) {
        for worker in &mut self.workers {
            info!(
                "Killing simulation {} for {}",
                worker.simulation_type(),
                self.api_root
            );
            worker.stop().await;
        }
        self.workers.clear();
    }

    /// Replace the access token and fan it out to every live worker.
    pub async fn set_access_token(&mut self, token: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .access
            .token = token.to_string();
        for worker in &self.workers {
            worker.push_token(token).await;
        }
    }

    /// Replace the recovery token. Not pushed to workers; only the refresh
    /// cycle consumes it.
    pub fn set_recovery_token(&mut self, token: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recovery
            .token = token.to_string();
    }

    /// Fan the current month out to every live worker.
    pub async fn set_month(&mut self, month: i32) {
        for worker in &self.workers {
            worker.push_month(month).await;
        }
    }

    /// Kick off a background token renewal when one is due and none is in
    /// flight. Returns whether a renewal task was scheduled.
    ///
    /// The check timestamp advances on every due cycle, scheduled or not, so
    /// a long-running renewal does not cause a burst of follow-ups.
    pub fn refresh_tokens_if_due(&mut self) -> bool {
        if self.last_token_check.elapsed() <= self.token_check_interval {
            return false;
        }
        let in_flight = self.refresh_task.as_ref().is_some_and(|t| !t.is_finished());
        self.last_token_check = Instant::now();
        if in_flight {
            return false;
        }

        let api = self.api.clone();
        let api_root = self.api_root.clone();
        let tokens = Arc::clone(&self.tokens);
        let channels: Vec<_> = self.workers.iter().map(|w| w.channel_handle()).collect();

        self.refresh_task = Some(tokio::spawn(async move {
            // Keep-alive first: lets each channel notice a dead peer before
            // the fresh token is pushed.
            for channel in &channels {
                channel.push(&ChannelMessage::KeepAlive).await;
            }

            info!("Requesting new access token from server {api_root}");
            let (access, recovery) = {
                let tokens = tokens.lock().unwrap_or_else(|e| e.into_inner());
                (tokens.access.token.clone(), tokens.recovery.token.clone())
            };

            match api
                .request_token_with_retry(&api_root, &access, &recovery)
                .await
            {
                Ok(pair) => {
                    let fresh = pair.access.token.clone();
                    *tokens.lock().unwrap_or_else(|e| e.into_inner()) = pair;
                    info!("Successfully updated access and recovery tokens for server {api_root}");

                    let message = ChannelMessage::Token(fresh);
                    for channel in &channels {
                        channel.set_connect_message(Some(message.clone()));
                        channel.push(&message).await;
                    }
                }
                Err(e) => {
                    // Old tokens stay in place; retried on the next due cycle.
                    warn!("Request to get new token from {api_root} failed: {e}");
                }
            }
        }));
        true
    }

    /// Whether a renewal task is currently in flight.
    pub fn refresh_in_flight(&self) -> bool {
        self.refresh_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn worker(&self, simulation_type: &str) -> Option<&WorkerHandle> {
        self.workers
            .iter()
            .find(|w| w.simulation_type() == simulation_type)
    }

    /// Snapshot of the current token pair.
    pub fn current_tokens(&self) -> TokenPair {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn access_token_string(&self) -> String {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .access
            .token
            .clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.take()
            && !task.is_finished()
        {
            task.abort();
        }
    }
}

/// Convenience constructor for the initial token pair of a new session.
pub fn initial_tokens(access: ApiToken, recovery: ApiToken) -> TokenPair {
    TokenPair { access, recovery }
}
