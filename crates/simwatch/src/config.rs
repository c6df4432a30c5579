//! Daemon configuration.
//!
//! A single TOML file names the simulations this watchdog knows how to run
//! and, optionally, the HTTP listen port:
//!
//! ```toml
//! port = 45000
//!
//! [[simulations]]
//! name = "MEL"
//! exe = "simulations/MEL/MEL"
//!
//! [[simulations]]
//! name = "SEL"
//! exe = "simulations/SEL/SEL"
//! ```
//!
//! The file is read once at startup and the resulting value is passed into
//! every component constructor; nothing in the daemon reaches for a global
//! config instance.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Errors raised while loading the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// One configured simulation: its type name and worker executable.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Simulation type name as the platform reports it (e.g. `"MEL"`).
    pub name: String,
    /// Path to the worker executable, absolute or relative to the daemon's
    /// working directory.
    pub exe: PathBuf,
}

/// Parsed daemon configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// HTTP listen port; the CLI `--port` flag overrides it.
    pub port: Option<u16>,
    /// Simulations this watchdog can launch.
    #[serde(default)]
    pub simulations: Vec<SimulationConfig>,
}

impl WatchdogConfig {
    /// Load and parse the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simwatch.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_simulations_and_port() {
        let (_dir, path) = write_config(
            r#"
port = 45001

[[simulations]]
name = "MEL"
exe = "simulations/MEL/MEL"

[[simulations]]
name = "SEL"
exe = "simulations/SEL/SEL"
"#,
        );

        let config = WatchdogConfig::load(&path).unwrap();
        assert_eq!(config.port, Some(45001));
        assert_eq!(config.simulations.len(), 2);
        assert_eq!(config.simulations[0].name, "MEL");
        assert_eq!(config.simulations[1].exe, PathBuf::from("simulations/SEL/SEL"));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let (_dir, path) = write_config("");
        let config = WatchdogConfig::load(&path).unwrap();
        assert_eq!(config.port, None);
        assert!(config.simulations.is_empty());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = WatchdogConfig::load(Path::new("/nonexistent/simwatch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let (_dir, path) = write_config("simulations = \"oops\"");
        let err = WatchdogConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
