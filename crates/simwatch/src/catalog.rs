//! Catalog of simulations this watchdog can launch.
//!
//! Built once at startup from the config file. Each configured simulation
//! registers the versions found on disk; `UpdateState` requests are then
//! resolved against the catalog to find the executable for a requested
//! (type, version) pair. Requesting an unknown simulation type is a
//! configuration error; requesting an unknown version falls back to the
//! latest version available with a warning.

use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::config::SimulationConfig;

/// Version assumed when no version file is found next to the executable.
pub const LATEST_VERSION_NAME: &str = "1.0.0";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The platform asked for a simulation type this watchdog was never
    /// configured with. Fatal for the request that named it.
    #[error("unknown simulation with type {0}")]
    UnknownSimulation(String),
}

/// A fully resolved simulation: what to call it and what to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSimulation {
    pub simulation_type: String,
    pub version: String,
    pub exe: PathBuf,
}

#[derive(Debug, Clone)]
struct SimulationVersion {
    version: String,
    exe: PathBuf,
}

/// One configured simulation type and its discovered versions.
#[derive(Debug, Clone)]
pub struct AvailableSimulation {
    name: String,
    versions: Vec<SimulationVersion>,
}

impl AvailableSimulation {
    fn discover(config: &SimulationConfig) -> Self {
        let version = discover_version(config);
        info!("Registering {} version {version}", config.name);

        if !config.exe.exists() {
            error!(
                "Simulation executable at {} does not exist",
                config.exe.display()
            );
        }

        Self {
            name: config.name.clone(),
            versions: vec![SimulationVersion {
                version,
                exe: config.exe.clone(),
            }],
        }
    }

    fn latest(&self) -> &SimulationVersion {
        // At least one version is always registered.
        self.versions.last().unwrap_or_else(|| unreachable!())
    }

    fn resolve_version(&self, requested: &str) -> ResolvedSimulation {
        let version = if requested.is_empty() {
            self.latest()
        } else {
            match self
                .versions
                .iter()
                .find(|v| v.version.eq_ignore_ascii_case(requested))
            {
                Some(version) => version,
                None => {
                    if !requested.eq_ignore_ascii_case(LATEST_VERSION_NAME) {
                        warn!(
                            "Requested simulation version {requested:?} for simulation type \
                             {:?} which is not known. Falling back to latest version available",
                            self.name
                        );
                    }
                    self.latest()
                }
            }
        };

        ResolvedSimulation {
            simulation_type: self.name.clone(),
            version: version.version.clone(),
            exe: version.exe.clone(),
        }
    }
}

/// All simulations known to this watchdog instance.
#[derive(Debug, Clone, Default)]
pub struct SimulationCatalog {
    simulations: Vec<AvailableSimulation>,
}

impl SimulationCatalog {
    /// Discover versions for every configured simulation.
    pub fn discover(configs: &[SimulationConfig]) -> Self {
        Self {
            simulations: configs.iter().map(AvailableSimulation::discover).collect(),
        }
    }

    /// Resolve a requested (type, version) pair to a launchable simulation.
    ///
    /// An empty `requested_version` means "latest". An unknown version falls
    /// back to the latest available; an unknown type is an error.
    pub fn resolve(
        &self,
        simulation_type: &str,
        requested_version: &str,
    ) -> Result<ResolvedSimulation, CatalogError> {
        self.simulations
            .iter()
            .find(|s| s.name == simulation_type)
            .map(|s| s.resolve_version(requested_version))
            .ok_or_else(|| CatalogError::UnknownSimulation(simulation_type.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.simulations.is_empty()
    }
}

/// Read the version file shipped next to a simulation's executable
/// (`<name>data/version.txt`), falling back to [`LATEST_VERSION_NAME`].
fn discover_version(config: &SimulationConfig) -> String {
    let data_dir = format!("{}data", config.name);
    let version_file = config
        .exe
        .parent()
        .map(|dir| dir.join(&data_dir))
        .unwrap_or_else(|| PathBuf::from(&data_dir))
        .join("version.txt");

    let Ok(contents) = std::fs::read_to_string(&version_file) else {
        warn!(
            "{} not found, so no version could be determined",
            version_file.display()
        );
        return LATEST_VERSION_NAME.to_string();
    };

    match extract_version_token(&contents) {
        Some(version) => version,
        None => {
            warn!(
                "{} found, but version in it seems to be of wrong format. \
                 Make sure it's something like 1.0.0",
                version_file.display()
            );
            LATEST_VERSION_NAME.to_string()
        }
    }
}

/// First run of digits and dots in the contents, e.g. `"2.1.0"` out of
/// `"version 2.1.0 (stable)"`.
fn extract_version_token(contents: &str) -> Option<String> {
    let start = contents.find(|c: char| c.is_ascii_digit())?;
    let tail = &contents[start..];
    let end = tail
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(tail.len());
    Some(tail[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with(name: &str, exe: &str) -> SimulationCatalog {
        SimulationCatalog::discover(&[SimulationConfig {
            name: name.to_string(),
            exe: PathBuf::from(exe),
        }])
    }

    #[test]
    fn resolves_known_type_with_empty_version_to_latest() {
        let catalog = catalog_with("MEL", "/opt/sims/MEL");
        let resolved = catalog.resolve("MEL", "").unwrap();
        assert_eq!(resolved.simulation_type, "MEL");
        assert_eq!(resolved.version, LATEST_VERSION_NAME);
        assert_eq!(resolved.exe, PathBuf::from("/opt/sims/MEL"));
    }

    #[test]
    fn unknown_version_falls_back_to_latest() {
        let catalog = catalog_with("MEL", "/opt/sims/MEL");
        let resolved = catalog.resolve("MEL", "9.9.9").unwrap();
        assert_eq!(resolved.version, LATEST_VERSION_NAME);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let catalog = catalog_with("MEL", "/opt/sims/MEL");
        let err = catalog.resolve("REL", "1.0.0").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownSimulation(t) if t == "REL"));
    }

    #[test]
    fn version_discovered_from_version_file() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("MEL");
        std::fs::write(&exe, b"").unwrap();
        let data_dir = dir.path().join("MELdata");
        std::fs::create_dir(&data_dir).unwrap();
        std::fs::write(data_dir.join("version.txt"), "version 2.1.0 stable").unwrap();

        let catalog = SimulationCatalog::discover(&[SimulationConfig {
            name: "MEL".to_string(),
            exe,
        }]);
        assert_eq!(catalog.resolve("MEL", "").unwrap().version, "2.1.0");
    }

    #[test]
    fn extract_version_token_variants() {
        assert_eq!(extract_version_token("1.0.0"), Some("1.0.0".to_string()));
        assert_eq!(
            extract_version_token("v2.3.4\n"),
            Some("2.3.4".to_string())
        );
        assert_eq!(extract_version_token("no digits here"), None);
    }

    #[test]
    fn empty_catalog_reports_empty() {
        assert!(SimulationCatalog::discover(&[]).is_empty());
        assert!(!catalog_with("MEL", "/opt/sims/MEL").is_empty());
    }
}
