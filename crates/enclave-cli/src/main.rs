//! # enclaved: the Enclave daemon
//!
//! Supervises containers through the depot's lifecycle scripts and keeps
//! them alive across restarts by snapshotting on shutdown.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod daemon;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use enclave_common::config::EnclaveConfig;
use enclave_common::constants;
use tracing_subscriber::EnvFilter;

/// Enclave container supervision daemon.
#[derive(Parser, Debug)]
#[command(name = constants::BIN_NAME, version, about, long_about = None)]
struct Cli {
    /// Directory holding the lifecycle scripts and helpers.
    #[arg(long = "root", env = "ENCLAVE_ROOT")]
    root_path: PathBuf,

    /// Directory in which container directories are created.
    #[arg(long = "depot", env = "ENCLAVE_DEPOT")]
    depot_path: PathBuf,

    /// Root filesystem shared by new containers.
    #[arg(long = "rootfs", env = "ENCLAVE_ROOTFS")]
    rootfs_path: PathBuf,

    /// Directory for container snapshots; containers are not restored
    /// across restarts without it.
    #[arg(long = "snapshots", env = "ENCLAVE_SNAPSHOTS")]
    snapshots_path: Option<PathBuf>,

    /// Root of the per-subsystem cgroup mounts.
    #[arg(long = "cgroups", env = "ENCLAVE_CGROUPS", default_value = constants::DEFAULT_CGROUPS_PATH)]
    cgroups_path: PathBuf,

    /// Do not enforce disk quotas.
    #[arg(long, env = "ENCLAVE_DISABLE_QUOTAS")]
    disable_quotas: bool,

    /// Default idle time, in seconds, after which containers may be reaped.
    #[arg(long = "container-grace-time", env = "ENCLAVE_CONTAINER_GRACE_TIME", default_value_t = 0)]
    container_grace_time_secs: u64,

    /// Log at debug level, including helper command output.
    #[arg(long, env = "ENCLAVE_DEBUG")]
    debug: bool,

    /// First UID handed to containers.
    #[arg(long, env = "ENCLAVE_UID_POOL_START", default_value_t = constants::DEFAULT_UID_POOL_START)]
    uid_pool_start: u32,

    /// Number of container UIDs.
    #[arg(long, env = "ENCLAVE_UID_POOL_SIZE", default_value_t = constants::DEFAULT_UID_POOL_SIZE)]
    uid_pool_size: u32,

    /// Subnet carved into per-container /30 networks.
    #[arg(long, env = "ENCLAVE_NETWORK_POOL", default_value = constants::DEFAULT_NETWORK_POOL)]
    network_pool: String,

    /// First host port available for port mappings.
    #[arg(long, env = "ENCLAVE_PORT_POOL_START", default_value_t = constants::DEFAULT_PORT_POOL_START)]
    port_pool_start: u32,

    /// Number of host ports available for port mappings.
    #[arg(long, env = "ENCLAVE_PORT_POOL_SIZE", default_value_t = constants::DEFAULT_PORT_POOL_SIZE)]
    port_pool_size: u32,
}

impl From<Cli> for EnclaveConfig {
    fn from(cli: Cli) -> Self {
        Self {
            root_path: cli.root_path,
            depot_path: cli.depot_path,
            rootfs_path: cli.rootfs_path,
            snapshots_path: cli.snapshots_path,
            cgroups_path: cli.cgroups_path,
            disable_quotas: cli.disable_quotas,
            container_grace_time: Duration::from_secs(cli.container_grace_time_secs),
            debug: cli.debug,
            uid_pool_start: cli.uid_pool_start,
            uid_pool_size: cli.uid_pool_size,
            network_pool: cli.network_pool,
            port_pool_start: cli.port_pool_start,
            port_pool_size: cli.port_pool_size,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = EnclaveConfig::from(Cli::parse());

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    config.validate()?;
    daemon::run(&config)
}
