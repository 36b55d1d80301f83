use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;

use crate::fleet::{FlavorLabels, FleetRules, VmSeed};
use crate::render::ViewSettings;

pub const DEFAULT_EVENT_FILE_ENV: &str = "FLEETMON_EVENT_FILE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("duplicate vm name in config: {0}")]
    DuplicateVm(String),
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Session settings and the seed list, read from a TOML file.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub deployment: String,
    pub poll_interval_ms: u64,
    pub stream_wait_secs: u64,
    pub log_tail_lines: usize,
    pub max_error_lines: usize,
    pub control_tags: Vec<String>,
    pub bare_tags: Vec<String>,
    pub coordinator_hosts: Vec<String>,
    pub entity_prefixes: Vec<String>,
    pub event_file_env: String,
    pub flavor_labels: IndexMap<String, String>,
    #[serde(rename = "vm")]
    pub vms: Vec<VmSeed>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let rules = FleetRules::default();
        Self {
            deployment: "fleet".to_owned(),
            poll_interval_ms: 500,
            stream_wait_secs: 10,
            log_tail_lines: 8,
            max_error_lines: 3,
            control_tags: rules.control_tags,
            bare_tags: rules.bare_tags,
            coordinator_hosts: vec!["localhost".to_owned()],
            entity_prefixes: rules.entity_prefixes,
            event_file_env: DEFAULT_EVENT_FILE_ENV.to_owned(),
            flavor_labels: IndexMap::new(),
            vms: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source, path)
    }

    /// Parses and validates config text. `origin` only labels errors.
    pub fn parse(source: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: MonitorConfig =
            toml::from_str(source).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.entity_prefixes.iter().all(|prefix| prefix.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "entity_prefixes",
                reason: "needs at least one non-empty prefix".to_owned(),
            });
        }
        if self.event_file_env.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "event_file_env",
                reason: "must name an environment variable".to_owned(),
            });
        }
        let mut seen = HashSet::new();
        for seed in &self.vms {
            if seed.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "vm.name",
                    reason: "vm names cannot be empty".to_owned(),
                });
            }
            if !seen.insert(seed.name.as_str()) {
                return Err(ConfigError::DuplicateVm(seed.name.clone()));
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> FleetRules {
        FleetRules {
            control_tags: self.control_tags.clone(),
            bare_tags: self.bare_tags.clone(),
            entity_prefixes: self
                .entity_prefixes
                .iter()
                .filter(|prefix| !prefix.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn flavors(&self) -> FlavorLabels {
        FlavorLabels::new(self.flavor_labels.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stream_wait(&self) -> Duration {
        Duration::from_secs(self.stream_wait_secs)
    }

    pub fn view_settings(&self) -> ViewSettings {
        ViewSettings {
            deployment: self.deployment.clone(),
            max_error_lines: self.max_error_lines,
            log_tail_lines: self.log_tail_lines,
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
