//! Control channel between the simwatch supervisor and simulation workers.
//!
//! The supervisor pushes live configuration (API access tokens, the current
//! simulated month) into already-running simulation processes over a one-way
//! local channel, so workers never have to be restarted for a token renewal
//! or a month advance.
//!
//! The channel is a Unix domain socket carrying newline-terminated UTF-8
//! text lines:
//!
//! ```text
//! Token=<opaque access token>
//! Month=<integer>
//! KeepAliveMessage
//! ```
//!
//! Unrecognized lines are ignored by the reader. The channel is
//! last-value-wins: a push that fails because the peer went away is dropped,
//! not queued, and the next successful push after a reconnect delivers only
//! the latest value.
//!
//! The supervisor owns the [`server::ChannelServer`] (write-only); each
//! worker embeds a [`client::ChannelClient`] (read-only). The socket path is
//! handed to the worker as a `Channel=<path>` launch argument, see
//! [`LaunchArgs`].

pub mod client;
pub mod server;

use std::path::PathBuf;

/// Line prefix for access token pushes.
pub const TOKEN_PRELUDE: &str = "Token=";
/// Line prefix for month pushes.
pub const MONTH_PRELUDE: &str = "Month=";
/// Content-free keep-alive line.
pub const KEEP_ALIVE_MESSAGE: &str = "KeepAliveMessage";

/// Launch argument key carrying the channel socket path.
pub const CHANNEL_ARG: &str = "Channel";
/// Launch argument key carrying the platform API root the worker should target.
pub const API_ENDPOINT_ARG: &str = "ApiEndpoint";

/// Errors surfaced by the channel endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The server could not bind or the client could not connect.
    #[error("channel I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single recognized protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// `Token=<value>` — a new API access token.
    Token(String),
    /// `Month=<integer>` — the current simulated month.
    Month(i32),
    /// `KeepAliveMessage` — no payload; lets the peer observe liveness.
    KeepAlive,
}

impl ChannelMessage {
    /// Serialize to one protocol line, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Self::Token(token) => format!("{TOKEN_PRELUDE}{token}"),
            Self::Month(month) => format!("{MONTH_PRELUDE}{month}"),
            Self::KeepAlive => KEEP_ALIVE_MESSAGE.to_string(),
        }
    }

    /// Parse one received line. Returns `None` for unrecognized lines,
    /// which the reader silently skips.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(token) = line.strip_prefix(TOKEN_PRELUDE) {
            return Some(Self::Token(token.to_string()));
        }
        if let Some(month) = line.strip_prefix(MONTH_PRELUDE) {
            return month.parse::<i32>().ok().map(Self::Month);
        }
        if line == KEEP_ALIVE_MESSAGE {
            return Some(Self::KeepAlive);
        }
        None
    }
}

/// Launch arguments a worker receives from the supervisor.
///
/// The supervisor passes exactly two `Key=value` arguments when spawning a
/// worker process; everything else (the full environment) is inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    /// Socket path of the worker's control channel.
    pub channel: PathBuf,
    /// Platform API root the worker should talk to.
    pub api_endpoint: String,
}

impl LaunchArgs {
    /// Render the two launch arguments in the order the supervisor passes them.
    pub fn to_args(&self) -> [String; 2] {
        [
            format!("{CHANNEL_ARG}={}", self.channel.display()),
            format!("{API_ENDPOINT_ARG}={}", self.api_endpoint),
        ]
    }

    /// Recover the launch arguments from an argument iterator
    /// (typically `std::env::args().skip(1)`).
    ///
    /// Returns `None` when either argument is missing, e.g. when the worker
    /// was started by hand rather than by the supervisor.
    pub fn from_iter<I, S>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut channel = None;
        let mut api_endpoint = None;
        for arg in args {
            let arg = arg.as_ref();
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            match key {
                CHANNEL_ARG => channel = Some(PathBuf::from(value)),
                API_ENDPOINT_ARG => api_endpoint = Some(value.to_string()),
                _ => {}
            }
        }
        Some(Self {
            channel: channel?,
            api_endpoint: api_endpoint?,
        })
    }
}

/// Generate a unique socket path for one worker's channel.
///
/// The name is unique per worker handle and stays stable across process
/// restarts of that worker (the supervisor reuses it when it respawns an
/// exited process).
pub fn unique_channel_path(simulation_type: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "simwatch-{simulation_type}-{}.sock",
        uuid::Uuid::new_v4().simple()
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_token_line() {
        let msg = ChannelMessage::Token("abc123".to_string());
        assert_eq!(msg.encode(), "Token=abc123");
    }

    #[test]
    fn encode_month_line() {
        assert_eq!(ChannelMessage::Month(42).encode(), "Month=42");
    }

    #[test]
    fn encode_keep_alive_line() {
        assert_eq!(ChannelMessage::KeepAlive.encode(), "KeepAliveMessage");
    }

    #[test]
    fn parse_round_trips() {
        for msg in [
            ChannelMessage::Token("tok".to_string()),
            ChannelMessage::Month(-1),
            ChannelMessage::KeepAlive,
        ] {
            assert_eq!(ChannelMessage::parse(&msg.encode()), Some(msg));
        }
    }

    #[test]
    fn parse_strips_line_endings() {
        assert_eq!(
            ChannelMessage::parse("Month=7\r\n"),
            Some(ChannelMessage::Month(7))
        );
    }

    #[test]
    fn parse_ignores_unrecognized_lines() {
        assert_eq!(ChannelMessage::parse(""), None);
        assert_eq!(ChannelMessage::parse("Hello=world"), None);
        assert_eq!(ChannelMessage::parse("Token"), None);
    }

    #[test]
    fn parse_rejects_non_integer_month() {
        assert_eq!(ChannelMessage::parse("Month=soon"), None);
    }

    #[test]
    fn token_value_may_contain_equals() {
        assert_eq!(
            ChannelMessage::parse("Token=a=b=c"),
            Some(ChannelMessage::Token("a=b=c".to_string()))
        );
    }

    #[test]
    fn launch_args_round_trip() {
        let args = LaunchArgs {
            channel: PathBuf::from("/tmp/simwatch-energy-1.sock"),
            api_endpoint: "http://localhost/api/".to_string(),
        };
        let rendered = args.to_args();
        assert_eq!(LaunchArgs::from_iter(rendered.iter()), Some(args));
    }

    #[test]
    fn launch_args_missing_channel_is_none() {
        assert_eq!(
            LaunchArgs::from_iter(["ApiEndpoint=http://localhost/"]),
            None
        );
    }

    #[test]
    fn launch_args_skips_unrelated_arguments() {
        let args = LaunchArgs::from_iter([
            "--verbose",
            "Channel=/tmp/ch.sock",
            "Other=ignored",
            "ApiEndpoint=http://host/",
        ])
        .unwrap();
        assert_eq!(args.channel, PathBuf::from("/tmp/ch.sock"));
        assert_eq!(args.api_endpoint, "http://host/");
    }

    #[test]
    fn unique_channel_paths_differ() {
        assert_ne!(unique_channel_path("mel"), unique_channel_path("mel"));
    }
}
