//! Watchdog daemon supervising per-session simulation workers.
//!
//! A central planning platform reports session lifecycle changes to this
//! daemon over a small HTTP control surface. For every non-stopped session
//! the daemon keeps the session's configured simulation workers running
//! (spawning, health-checking, and restarting them as OS processes), pushes
//! live configuration — API access tokens and the current simulated month —
//! into the running workers over per-worker control channels, renews the
//! session's token pair against the platform in the background, and tears
//! everything down when the session ends or goes idle for too long.
//!
//! Module map, leaves first:
//!
//! - [`config`] — the TOML file naming the known simulations
//! - [`catalog`] — executable/version resolution for requested simulations
//! - [`api`] — outbound platform API client (token renewal)
//! - [`worker`] — one spawned worker process plus its control channel
//! - [`session`] — the per-session state machine and token refresh
//! - [`ingress`] — the inbound HTTP listener and request buffers
//! - [`supervisor`] — the fixed-tick coordination loop

pub mod api;
pub mod catalog;
pub mod config;
pub mod ingress;
pub mod session;
pub mod supervisor;
pub mod worker;

/// Default HTTP control-surface port.
pub const DEFAULT_PORT: u16 = 45000;
