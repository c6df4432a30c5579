//! The fixed-tick coordination loop.
//!
//! The supervisor is the sole owner and mutator of the active-session set;
//! everything funnels through its tick, which keeps session state
//! transitions atomic and ordered. Per tick, in order: drain the `SetMonth`
//! buffer, drain the `UpdateState` buffer (creating or tearing down
//! sessions as reported), run the per-session token-refresh bookkeeping,
//! then evict idle and stopped sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::ApiClient;
use crate::catalog::SimulationCatalog;
use crate::ingress::{RequestBuffers, SetMonthRequest, UpdateStateRequest};
use crate::session::{initial_tokens, Session, TOKEN_CHECK_INTERVAL};

/// Coordination cadence of the loop.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Idle sessions older than this are torn down. Kept generous: restarting a
/// mid-run simulation is not perfectly accurate, so eviction should only hit
/// sessions nobody is coming back to.
pub const INACTIVITY_WINDOW: Duration = Duration::from_secs(72 * 60 * 60);

/// Loop timing knobs, injectable so tests can shrink hours to milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    pub tick: Duration,
    pub token_check_interval: Duration,
    pub inactivity_window: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            tick: TICK_INTERVAL,
            token_check_interval: TOKEN_CHECK_INTERVAL,
            inactivity_window: INACTIVITY_WINDOW,
        }
    }
}

/// The watchdog coordinator.
pub struct Supervisor {
    catalog: SimulationCatalog,
    api: ApiClient,
    buffers: Arc<RequestBuffers>,
    sessions: Vec<Session>,
    timings: SupervisorTimings,
}

impl Supervisor {
    pub fn new(
        catalog: SimulationCatalog,
        api: ApiClient,
        buffers: Arc<RequestBuffers>,
        timings: SupervisorTimings,
    ) -> Self {
        Self {
            catalog,
            api,
            buffers,
            sessions: Vec::new(),
            timings,
        }
    }

    /// Run the loop until cancelled, then stop every worker.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.timings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Watchdog started successfully, waiting for requests...");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("Shutting down; stopping workers of {} session(s)", self.sessions.len());
        for session in &mut self.sessions {
            session.stop_all_workers().await;
        }
    }

    /// One coordination cycle.
    pub async fn tick(&mut self) {
        for request in self.buffers.drain_set_month() {
            self.handle_set_month(request).await;
        }
        for request in self.buffers.drain_update_state() {
            self.handle_update_state(request).await;
        }

        for session in &mut self.sessions {
            session.refresh_tokens_if_due();
        }

        self.sweep_inactive_sessions().await;
    }

    async fn handle_set_month(&mut self, request: SetMonthRequest) {
        let Some(session) = self
            .sessions
            .iter_mut()
            .find(|s| s.session_token() == request.game_session_token)
        else {
            // Unknown session token: dropped without error, no session created.
            debug!(
                "SetMonth for unknown session token {}, discarding",
                request.game_session_token
            );
            return;
        };
        info!("Setting month to {}", request.month);
        session.set_month(request.month).await;
    }

    async fn handle_update_state(&mut self, request: UpdateStateRequest) {
        let existing = self
            .sessions
            .iter()
            .position(|s| s.session_token() == request.game_session_token);

        match existing {
            Some(index) => {
                if request.game_state.is_stopped() {
                    let mut session = self.sessions.remove(index);
                    session.stop_all_workers().await;
                    info!(
                        "Stopped simulation server instance for {}",
                        request.game_session_api
                    );
                    // Tokens and state are still recorded on the outgoing
                    // session before it is dropped.
                    apply_reported_values(&mut session, &request).await;
                } else {
                    let session = &mut self.sessions[index];
                    session.ensure_workers_running().await;
                    apply_reported_values(session, &request).await;
                }
            }
            None => {
                if request.game_state.is_stopped() {
                    return;
                }

                let mut configured = Vec::with_capacity(request.required_simulations.len());
                for sim in &request.required_simulations {
                    match self
                        .catalog
                        .resolve(&sim.simulation_type, &sim.simulation_version)
                    {
                        Ok(resolved) => configured.push(resolved),
                        Err(e) => {
                            // Fatal for this request only; the session is not created.
                            error!(
                                "Cannot create session for {}: {e}",
                                request.game_session_api
                            );
                            return;
                        }
                    }
                }

                let mut session = Session::new(
                    request.game_session_token.clone(),
                    request.game_session_api.clone(),
                    configured,
                    initial_tokens(request.access_token.clone(), request.recovery_token.clone()),
                    self.api.clone(),
                    self.timings.token_check_interval,
                );
                session.ensure_workers_running().await;
                apply_reported_values(&mut session, &request).await;
                info!(
                    "Created new simulation server instance for {}",
                    request.game_session_api
                );
                self.sessions.push(session);
            }
        }
    }

    /// Evict sessions that are stopped, or idle beyond the inactivity window.
    async fn sweep_inactive_sessions(&mut self) {
        let mut index = self.sessions.len();
        while index > 0 {
            index -= 1;
            let session = &self.sessions[index];
            let expired_idle = session.state().is_idle()
                && session.idle_since() > self.timings.inactivity_window;
            if expired_idle || session.state().is_stopped() {
                let mut session = self.sessions.remove(index);
                info!(
                    "Evicting session {} (state {})",
                    session.session_token(),
                    session.state()
                );
                session.stop_all_workers().await;
            }
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, session_token: &str) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|s| s.session_token() == session_token)
    }
}

/// Apply the reported state, tokens, and month, in the platform's order.
async fn apply_reported_values(session: &mut Session, request: &UpdateStateRequest) {
    session.set_state(request.game_state);
    session.set_access_token(request.access_token.as_str()).await;
    session.set_recovery_token(request.recovery_token.as_str());
    session.set_month(request.month).await;
}
