//! Creation and destruction of containers in the depot.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use enclave_common::config::EnclaveConfig;
use enclave_common::constants::{CONTAINER_NETMASK, DEPOT_TMP_DIR, SCRIPT_PATH_ENV};
use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::{BindMount, ContainerSpec};
use enclave_core::bandwidth::ContainerBandwidthManager;
use enclave_core::cgroup::LinuxCgroupsManager;
use enclave_core::command::{CommandRunner, HelperCommand};
use enclave_core::pool::{ContainerNetwork, NetworkPool, PortPool, UidPool};
use enclave_core::quota::QuotaManager;

use crate::container::{ContainerParts, LinuxContainer, Resources};
use crate::snapshot::ContainerSnapshot;

/// Factory for containers and owner of their pooled resources.
pub trait ContainerPool: Send + Sync {
    /// Prepares the host for containers.
    ///
    /// # Errors
    ///
    /// Returns the setup script failure.
    fn setup(&self) -> Result<()>;

    /// Creates a container in the `Born` state.
    ///
    /// # Errors
    ///
    /// Returns pool exhaustion, or the create script failure.
    fn create(&self, spec: &ContainerSpec) -> Result<Arc<LinuxContainer>>;

    /// Rebuilds a container from a snapshot document.
    ///
    /// # Errors
    ///
    /// Returns a decode error, [`EnclaveError::ResourceTaken`] when a
    /// snapshotted resource is already in use, or a restore failure.
    fn restore(&self, snapshot: &mut dyn Read) -> Result<Arc<LinuxContainer>>;

    /// Tears a container down and returns its resources to the pools.
    ///
    /// # Errors
    ///
    /// Returns the destroy script failure; resources are kept in that case.
    fn destroy(&self, container: &LinuxContainer) -> Result<()>;

    /// Destroys every depot entry whose ID is not in `keep`.
    ///
    /// # Errors
    ///
    /// Returns the first listing or destroy failure.
    fn prune(&self, keep: &HashSet<String>) -> Result<()>;
}

/// The UID, network, and port pools containers draw from.
#[derive(Clone)]
pub struct ResourcePools {
    /// Container user IDs.
    pub uids: Arc<UidPool>,
    /// Container `/30` networks.
    pub networks: Arc<NetworkPool>,
    /// Host ports for inbound mappings.
    pub ports: Arc<PortPool>,
}

/// Container pool driving the depot's lifecycle scripts.
pub struct LinuxContainerPool {
    scripts_path: PathBuf,
    depot_path: PathBuf,
    rootfs_path: PathBuf,
    cgroups_path: PathBuf,
    default_grace_time: Duration,

    pools: ResourcePools,
    runner: Arc<dyn CommandRunner>,
    quota: Arc<dyn QuotaManager>,

    next_id: AtomicU64,
}

impl LinuxContainerPool {
    /// Builds a pool from the daemon configuration.
    pub fn new(
        config: &EnclaveConfig,
        pools: ResourcePools,
        runner: Arc<dyn CommandRunner>,
        quota: Arc<dyn QuotaManager>,
    ) -> Self {
        let seed = chrono::Utc::now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or_default();
        Self {
            scripts_path: config.scripts_path(),
            depot_path: config.depot_path.clone(),
            rootfs_path: config.rootfs_path.clone(),
            cgroups_path: config.cgroups_path.clone(),
            default_grace_time: config.container_grace_time,
            pools,
            runner,
            quota,
            next_id: AtomicU64::new(seed),
        }
    }

    fn generate_id(&self) -> String {
        container_id(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn container_path(&self, id: &str) -> PathBuf {
        self.depot_path.join(id)
    }

    fn build(
        &self,
        id: String,
        handle: String,
        grace_time: Duration,
        resources: Resources,
    ) -> Arc<LinuxContainer> {
        let path = self.container_path(&id);
        LinuxContainer::new(ContainerParts {
            cgroups: Arc::new(LinuxCgroupsManager::new(&self.cgroups_path, &id)),
            bandwidth: Arc::new(ContainerBandwidthManager::new(
                &path,
                &id,
                Arc::clone(&self.runner),
            )),
            id,
            handle,
            path,
            grace_time,
            resources,
            port_pool: Arc::clone(&self.pools.ports),
            runner: Arc::clone(&self.runner),
            quota: Arc::clone(&self.quota),
        })
    }

    fn run_destroy(&self, id: &str) -> Result<()> {
        let _ = self.runner.run(
            &HelperCommand::new(self.scripts_path.join("destroy.sh"))
                .arg(self.container_path(id).display().to_string()),
        )?;
        Ok(())
    }

    fn release(&self, uid: u32, network: ContainerNetwork, ports: &[u32]) {
        for &port in ports {
            self.pools.ports.release(port);
        }
        self.pools.uids.release(uid);
        self.pools.networks.release(network);
    }
}

impl ContainerPool for LinuxContainerPool {
    fn setup(&self) -> Result<()> {
        tracing::info!(network = %self.pools.networks.network(), "setting up container pool");
        let _ = self.runner.run(
            &HelperCommand::new(self.scripts_path.join("setup.sh"))
                .env("POOL_NETWORK", self.pools.networks.network().to_string())
                .env("ALLOW_NETWORKS", "")
                .env("DENY_NETWORKS", "")
                .env("CONTAINER_ROOTFS_PATH", self.rootfs_path.display().to_string())
                .env("CONTAINER_DEPOT_PATH", self.depot_path.display().to_string())
                .env(
                    "CONTAINER_DEPOT_MOUNT_POINT_PATH",
                    self.quota.mount_point().display().to_string(),
                )
                .env("DISK_QUOTA_ENABLED", self.quota.is_enabled().to_string())
                .env("PATH", SCRIPT_PATH_ENV),
        )?;
        Ok(())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<Arc<LinuxContainer>> {
        let uid = self.pools.uids.acquire()?;
        let network = match self.pools.networks.acquire() {
            Ok(network) => network,
            Err(e) => {
                self.pools.uids.release(uid);
                return Err(e);
            }
        };

        let id = self.generate_id();
        let handle = spec.handle.clone().unwrap_or_else(|| id.clone());
        tracing::info!(id = %id, handle = %handle, uid, network = %network, "creating container");

        let grace_time = if spec.grace_time.is_zero() {
            self.default_grace_time
        } else {
            spec.grace_time
        };
        let container = self.build(
            id,
            handle,
            grace_time,
            Resources::new(uid, network, Vec::new()),
        );

        let create = HelperCommand::new(self.scripts_path.join("create.sh"))
            .arg(container.path().display().to_string())
            .env("id", container.id())
            .env("rootfs_path", self.rootfs_path.display().to_string())
            .env("user_uid", uid.to_string())
            .env("network_host_ip", network.host_ip().to_string())
            .env("network_container_ip", network.container_ip().to_string())
            .env("network_netmask", CONTAINER_NETMASK)
            .env("PATH", SCRIPT_PATH_ENV);
        if let Err(e) = self.runner.run(&create) {
            self.release(uid, network, &[]);
            return Err(e);
        }

        if let Err(e) = write_bind_mounts(container.path(), &spec.bind_mounts) {
            tracing::warn!(id = %container.id(), error = %e, "failed to write bind mounts");
            if let Err(destroy_err) = self.destroy(&container) {
                tracing::warn!(id = %container.id(), error = %destroy_err, "failed to destroy container");
            }
            return Err(e);
        }

        Ok(container)
    }

    fn restore(&self, snapshot: &mut dyn Read) -> Result<Arc<LinuxContainer>> {
        let snapshot = ContainerSnapshot::read_from(snapshot)?;
        let resources = &snapshot.resources;
        tracing::info!(id = %snapshot.id, handle = %snapshot.handle, "restoring container");

        self.pools.uids.remove(resources.uid)?;
        if let Err(e) = self.pools.networks.remove(resources.network) {
            self.pools.uids.release(resources.uid);
            return Err(e);
        }
        for (claimed, &port) in resources.ports.iter().enumerate() {
            if let Err(e) = self.pools.ports.remove(port) {
                self.release(resources.uid, resources.network, &resources.ports[..claimed]);
                return Err(e);
            }
        }

        let container = self.build(
            snapshot.id.clone(),
            snapshot.handle.clone(),
            snapshot.grace_time,
            Resources::new(resources.uid, resources.network, resources.ports.clone()),
        );
        container.restore(&snapshot)?;
        Ok(container)
    }

    fn destroy(&self, container: &LinuxContainer) -> Result<()> {
        tracing::info!(id = %container.id(), handle = %container.handle(), "destroying container");
        self.run_destroy(container.id())?;

        let resources = container.resources();
        self.release(resources.uid(), resources.network(), &resources.ports());
        Ok(())
    }

    fn prune(&self, keep: &HashSet<String>) -> Result<()> {
        let listing = self.runner.run(
            &HelperCommand::new("ls").arg(self.depot_path.display().to_string()),
        )?;
        for id in listing.stdout_lossy().lines() {
            if id.is_empty() || id == DEPOT_TMP_DIR || keep.contains(id) {
                continue;
            }
            tracing::info!(id, "pruning container");
            self.run_destroy(id)?;
        }
        Ok(())
    }
}

const ID_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Renders the low 55 bits of `n` as 11 base-32 digits.
fn container_id(n: u64) -> String {
    (0..11u32)
        .map(|i| {
            let shift = 55 - (i + 1) * 5;
            // Masked to five bits, so the index is always in range.
            #[allow(clippy::cast_possible_truncation)]
            let digit = ((n >> shift) & 31) as usize;
            char::from(ID_ALPHABET[digit])
        })
        .collect()
}

/// Appends the mount commands for `mounts` to the hook run inside the
/// container before it pivots into its root filesystem.
fn write_bind_mounts(container_path: &Path, mounts: &[BindMount]) -> Result<()> {
    if mounts.is_empty() {
        return Ok(());
    }
    let hook = container_path.join("lib").join("hook-child-before-pivot.sh");
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&hook)
        .map_err(|e| EnclaveError::io(&hook, e))?;

    for mount in mounts {
        let relative = mount
            .dst_path
            .strip_prefix("/")
            .unwrap_or(&mount.dst_path);
        let dst = container_path.join("mnt").join(relative);
        let src = mount.src_path.display();
        let dst = dst.display();
        write!(
            file,
            "\nmkdir -p {dst}\n\
             mount -n --bind {src} {dst}\n\
             mount -n --bind -o remount,{mode} {src} {dst}\n",
            mode = mount.mode.as_option(),
        )
        .map_err(|e| EnclaveError::io(&hook, e))?;
    }
    Ok(())
}
