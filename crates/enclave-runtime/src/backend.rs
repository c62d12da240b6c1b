//! Handle-keyed registry of live containers.
//!
//! The backend is what a front end talks to. It hands creation and
//! teardown to a [`ContainerPool`], and on shutdown writes one snapshot
//! per container so the next daemon can pick them up again in
//! [`Backend::start`].

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::ContainerSpec;

use crate::container::LinuxContainer;
use crate::container_pool::ContainerPool;

const SNAPSHOT_TEMP_PREFIX: &str = ".snapshot-";

/// Registry of containers, keyed by handle.
pub struct Backend {
    pool: Box<dyn ContainerPool>,
    snapshots_path: Option<PathBuf>,
    containers: RwLock<HashMap<String, Arc<LinuxContainer>>>,
}

impl Backend {
    /// Creates a backend. Without a snapshots path, containers do not
    /// survive a restart.
    pub fn new(pool: Box<dyn ContainerPool>, snapshots_path: Option<PathBuf>) -> Self {
        Self {
            pool,
            snapshots_path,
            containers: RwLock::new(HashMap::new()),
        }
    }

    /// Prepares the host through the container pool.
    ///
    /// # Errors
    ///
    /// Returns the pool setup failure.
    pub fn setup(&self) -> Result<()> {
        self.pool.setup()
    }

    /// Restores snapshotted containers, resets the snapshots directory,
    /// and prunes depot entries that were not restored.
    ///
    /// # Errors
    ///
    /// Returns the first restore, directory, or prune failure.
    pub fn start(&self) -> Result<()> {
        if let Some(snapshots) = &self.snapshots_path {
            if snapshots.exists() {
                self.restore_snapshots(snapshots)?;
                if let Err(e) = fs::remove_dir_all(snapshots) {
                    tracing::warn!(path = %snapshots.display(), error = %e, "failed to clear snapshots");
                }
            }
            fs::create_dir_all(snapshots).map_err(|e| EnclaveError::io(snapshots, e))?;
        }

        let keep: HashSet<String> = self
            .containers()
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        self.pool.prune(&keep)
    }

    /// Creates and starts a container, then registers it.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::HandleTaken`] for a handle already in use,
    /// or the create or start failure. A container that fails to start is
    /// destroyed.
    pub fn create(&self, spec: &ContainerSpec) -> Result<Arc<LinuxContainer>> {
        if let Some(handle) = &spec.handle {
            if self.read().contains_key(handle) {
                return Err(EnclaveError::HandleTaken {
                    handle: handle.clone(),
                });
            }
        }

        let container = self.pool.create(spec)?;
        if let Err(e) = container.start() {
            self.discard(&container);
            return Err(e);
        }

        let mut containers = self.write();
        if containers.contains_key(container.handle()) {
            drop(containers);
            self.discard(&container);
            return Err(EnclaveError::HandleTaken {
                handle: container.handle().to_string(),
            });
        }
        let _ = containers.insert(container.handle().to_string(), Arc::clone(&container));
        Ok(container)
    }

    /// Destroys the container registered under `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::NotFound`] for an unknown handle, or the
    /// destroy failure, in which case the container stays registered.
    pub fn destroy(&self, handle: &str) -> Result<()> {
        let container = self.lookup(handle)?;
        self.pool.destroy(&container)?;
        let _ = self.write().remove(handle);
        Ok(())
    }

    /// Every registered container.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<LinuxContainer>> {
        self.read().values().cloned().collect()
    }

    /// Finds a container by handle.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::NotFound`] for an unknown handle.
    pub fn lookup(&self, handle: &str) -> Result<Arc<LinuxContainer>> {
        self.read()
            .get(handle)
            .cloned()
            .ok_or_else(|| EnclaveError::NotFound {
                kind: "handle",
                id: handle.to_string(),
            })
    }

    /// Detaches from every container and writes its snapshot.
    ///
    /// Every container is attempted even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first [`EnclaveError::Snapshot`] failure.
    pub fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for container in self.containers() {
            container.cleanup();
            if let Err(e) = self.save_snapshot(&container) {
                tracing::warn!(id = %container.id(), error = %e, "failed to save snapshot");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn restore_snapshots(&self, snapshots: &Path) -> Result<()> {
        let entries = fs::read_dir(snapshots).map_err(|e| EnclaveError::io(snapshots, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EnclaveError::io(snapshots, e))?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            paths.push(entry.path());
        }
        paths.sort();

        for path in paths {
            tracing::info!(snapshot = %path.display(), "loading snapshot");
            let mut file = File::open(&path).map_err(|e| EnclaveError::io(&path, e))?;
            let container = self.pool.restore(&mut file)?;
            let _ = self
                .write()
                .insert(container.handle().to_string(), container);
        }
        Ok(())
    }

    fn save_snapshot(&self, container: &LinuxContainer) -> Result<()> {
        let Some(snapshots) = &self.snapshots_path else {
            return Ok(());
        };
        tracing::info!(id = %container.id(), "saving snapshot");

        let failed = |e: &dyn std::fmt::Display| EnclaveError::Snapshot {
            message: e.to_string(),
        };
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{SNAPSHOT_TEMP_PREFIX}{}", container.id()))
            .tempfile_in(snapshots)
            .map_err(|e| failed(&e))?;
        container.snapshot(&mut file).map_err(|e| failed(&e))?;
        let _ = file
            .persist(snapshots.join(container.id()))
            .map_err(|e| failed(&e))?;
        Ok(())
    }

    fn discard(&self, container: &LinuxContainer) {
        if let Err(e) = self.pool.destroy(container) {
            tracing::warn!(id = %container.id(), error = %e, "failed to destroy container");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<LinuxContainer>>> {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<LinuxContainer>>> {
        self.containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
