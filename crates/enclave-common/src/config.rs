//! Global configuration model for the Enclave daemon.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{EnclaveError, Result};

/// Root configuration for the Enclave daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveConfig {
    /// Directory holding the lifecycle scripts (`linux/*.sh`) and helpers.
    pub root_path: PathBuf,
    /// Directory in which container directories are created.
    pub depot_path: PathBuf,
    /// Root filesystem shared by new containers.
    pub rootfs_path: PathBuf,
    /// Directory for container snapshots; `None` disables restart survival.
    pub snapshots_path: Option<PathBuf>,
    /// Root of the per-subsystem cgroup mounts.
    pub cgroups_path: PathBuf,
    /// Whether disk quotas are disabled.
    pub disable_quotas: bool,
    /// Default idle time after which containers may be reaped.
    pub container_grace_time: Duration,
    /// Whether helper command output is logged.
    pub debug: bool,
    /// First UID handed to containers.
    pub uid_pool_start: u32,
    /// Number of container UIDs.
    pub uid_pool_size: u32,
    /// Subnet carved into per-container `/30` networks.
    pub network_pool: String,
    /// First host port available for mappings.
    pub port_pool_start: u32,
    /// Number of host ports available for mappings.
    pub port_pool_size: u32,
}

impl EnclaveConfig {
    /// Directory holding the container pool's lifecycle scripts.
    #[must_use]
    pub fn scripts_path(&self) -> PathBuf {
        self.root_path.join("linux")
    }

    /// Checks that the paths the Linux backend needs are present.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::Config`] naming the first missing path.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("root", &self.root_path),
            ("depot", &self.depot_path),
            ("rootfs", &self.rootfs_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(EnclaveError::Config {
                    message: format!("must specify {name} path with the linux backend"),
                });
            }
        }
        Ok(())
    }
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::new(),
            depot_path: PathBuf::new(),
            rootfs_path: PathBuf::new(),
            snapshots_path: None,
            cgroups_path: PathBuf::from(constants::DEFAULT_CGROUPS_PATH),
            disable_quotas: false,
            container_grace_time: Duration::ZERO,
            debug: false,
            uid_pool_start: constants::DEFAULT_UID_POOL_START,
            uid_pool_size: constants::DEFAULT_UID_POOL_SIZE,
            network_pool: constants::DEFAULT_NETWORK_POOL.to_string(),
            port_pool_start: constants::DEFAULT_PORT_POOL_START,
            port_pool_size: constants::DEFAULT_PORT_POOL_SIZE,
        }
    }
}
