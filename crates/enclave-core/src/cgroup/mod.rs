//! Cgroup-style resource control for a single container.
//!
//! Limits and counters are exposed as key/value files under
//! `<cgroups>/<subsystem>/instance-<id>/<name>`. The mounts themselves
//! are prepared by the lifecycle scripts; this module only reads and
//! writes the files.

pub mod cpu;
pub mod fake;
pub mod memory;

use std::path::PathBuf;

use enclave_common::error::{EnclaveError, Result};

pub use fake::FakeCgroupsManager;

/// Read/write access to one container's cgroup entries.
pub trait CgroupsManager: Send + Sync {
    /// Writes `value` to `name` in `subsystem`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn set(&self, subsystem: &str, name: &str, value: &str) -> Result<()>;

    /// Reads `name` from `subsystem`, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn get(&self, subsystem: &str, name: &str) -> Result<String>;

    /// Directory of this container's cgroup in `subsystem`.
    fn subsystem_path(&self, subsystem: &str) -> PathBuf;
}

/// Cgroups manager backed by the host's cgroup filesystem.
#[derive(Debug, Clone)]
pub struct LinuxCgroupsManager {
    cgroups_path: PathBuf,
    id: String,
}

impl LinuxCgroupsManager {
    /// Creates a manager for container `id` under `cgroups_path`.
    pub fn new(cgroups_path: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self {
            cgroups_path: cgroups_path.into(),
            id: id.into(),
        }
    }
}

impl CgroupsManager for LinuxCgroupsManager {
    fn set(&self, subsystem: &str, name: &str, value: &str) -> Result<()> {
        let file = self.subsystem_path(subsystem).join(name);
        std::fs::write(&file, value).map_err(|e| EnclaveError::io(&file, e))?;
        tracing::debug!(id = %self.id, file = %file.display(), value, "cgroup value set");
        Ok(())
    }

    fn get(&self, subsystem: &str, name: &str) -> Result<String> {
        let file = self.subsystem_path(subsystem).join(name);
        let value = std::fs::read_to_string(&file).map_err(|e| EnclaveError::io(&file, e))?;
        Ok(value.trim_end().to_string())
    }

    fn subsystem_path(&self, subsystem: &str) -> PathBuf {
        self.cgroups_path
            .join(subsystem)
            .join(format!("instance-{}", self.id))
    }
}
