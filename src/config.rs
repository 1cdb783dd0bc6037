use std::{fs, path::Path, path::PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use commissioner_api::{
    constants::{IP_CATALOG_PATH_DEFAULT, MIN_LOCAL_DATASTORE_FREE_BYTES},
    error::{CommissionError, InitializationError, ReportError},
};

use crate::retry::{Backoff, RetryPolicy};

/// Which appliance driver serves the driver operations.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DriverKind {
    ComputeProxy,
    #[default]
    NetworkAppliance,
    Noop,
}

/// Agent configuration, read from `/etc/commissioner/config.yaml` by default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    #[serde(default)]
    pub driver: DriverKind,

    /// Location of the persisted IP catalog.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// In-memory platform inventory to run against instead of a real platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated_inventory: Option<PathBuf>,

    #[serde(flatten)]
    pub settings: Settings,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from(IP_CATALOG_PATH_DEFAULT)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            catalog_path: default_catalog_path(),
            simulated_inventory: None,
            settings: Settings::default(),
        }
    }
}

impl AgentConfig {
    /// Loads the agent config. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CommissionError> {
        if !path.exists() {
            info!(
                "No agent configuration at '{}', using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).structured(InitializationError::LoadAgentConfig {
            path: path.to_string_lossy().into(),
        })?;
        let config: Self =
            serde_yaml::from_str(&contents).structured(InitializationError::ParseAgentConfig)?;
        debug!("Loaded agent configuration: {config:?}");
        Ok(config)
    }
}

/// Tunables of the commissioning engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Number of hosts commissioned concurrently.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Bound on update rounds while waiting for a platform task.
    #[serde(default = "default_task_wait")]
    pub task_wait: RetryPolicy,

    #[serde(default = "default_guest_tools_wait")]
    pub guest_tools_wait: RetryPolicy,

    #[serde(default = "default_guest_shutdown_wait")]
    pub guest_shutdown_wait: RetryPolicy,

    #[serde(default = "default_guest_ip_wait")]
    pub guest_ip_wait: RetryPolicy,

    /// Free space a local datastore needs when a cluster has a single active host.
    #[serde(default = "default_min_datastore_free_bytes")]
    pub min_datastore_free_bytes: u64,

    /// Whether appliances are excluded from HA restarts and DRS migrations by default.
    #[serde(default = "default_true")]
    pub disable_ha_drs: bool,
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_task_wait() -> RetryPolicy {
    RetryPolicy::new(3600, Backoff::None)
}

fn default_guest_tools_wait() -> RetryPolicy {
    RetryPolicy::linear(60, 5_000, 0)
}

fn default_guest_shutdown_wait() -> RetryPolicy {
    RetryPolicy::linear(10, 2_000, 2_000)
}

fn default_guest_ip_wait() -> RetryPolicy {
    RetryPolicy::linear(30, 2_000, 1_000)
}

fn default_min_datastore_free_bytes() -> u64 {
    MIN_LOCAL_DATASTORE_FREE_BYTES
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            task_wait: default_task_wait(),
            guest_tools_wait: default_guest_tools_wait(),
            guest_shutdown_wait: default_guest_shutdown_wait(),
            guest_ip_wait: default_guest_ip_wait(),
            min_datastore_free_bytes: default_min_datastore_free_bytes(),
            disable_ha_drs: default_true(),
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.driver, DriverKind::NetworkAppliance);
        assert_eq!(config.catalog_path, PathBuf::from(IP_CATALOG_PATH_DEFAULT));
    }

    #[test]
    fn test_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            indoc! {"
                driver: compute-proxy
                catalog-path: /tmp/ip.sqlite
                worker-pool-size: 2
                guest-shutdown-wait:
                  attempts: 5
                  backoff:
                    kind: fixed
                    delay-ms: 100
                disable-ha-drs: false
            "},
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.driver, DriverKind::ComputeProxy);
        assert_eq!(config.catalog_path, PathBuf::from("/tmp/ip.sqlite"));
        assert_eq!(config.settings.worker_pool_size, 2);
        assert_eq!(
            config.settings.guest_shutdown_wait,
            RetryPolicy::new(5, Backoff::Fixed { delay_ms: 100 })
        );
        assert!(!config.settings.disable_ha_drs);
        assert_eq!(config.settings.task_wait, default_task_wait());
    }

    #[test]
    fn test_malformed_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "worker-pool-size: many\n").unwrap();

        let err = AgentConfig::load(&path).unwrap_err();
        assert_eq!(err.category(), "initialization");
    }
}
