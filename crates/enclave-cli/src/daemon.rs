//! Wiring of the backend and the daemon's run loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use enclave_common::config::EnclaveConfig;
use enclave_core::command::CommandRunner;
use enclave_core::command::linux::LinuxCommandRunner;
use enclave_core::pool::{NetworkPool, PortPool, UidPool};
use enclave_core::quota::{LinuxQuotaManager, QuotaManager};
use enclave_runtime::backend::Backend;
use enclave_runtime::container_pool::{LinuxContainerPool, ResourcePools};

/// Builds the backend described by `config`.
fn build_backend(config: &EnclaveConfig) -> anyhow::Result<Backend> {
    let runner: Arc<dyn CommandRunner> = Arc::new(LinuxCommandRunner::new(config.debug));

    let pools = ResourcePools {
        uids: Arc::new(UidPool::uids(config.uid_pool_start, config.uid_pool_size)),
        networks: Arc::new(NetworkPool::from_cidr(&config.network_pool)?),
        ports: Arc::new(PortPool::ports(config.port_pool_start, config.port_pool_size)),
    };

    let quota = LinuxQuotaManager::new(&config.depot_path, &config.root_path, Arc::clone(&runner))
        .context("failed to discover depot mount point")?;
    if config.disable_quotas {
        quota.disable();
    }

    let pool = LinuxContainerPool::new(config, pools, runner, Arc::new(quota));
    Ok(Backend::new(Box::new(pool), config.snapshots_path.clone()))
}

/// Sets up the host, restores containers, and serves until interrupted,
/// then snapshots every container.
///
/// # Errors
///
/// Returns setup, start, or snapshot failures.
pub fn run(config: &EnclaveConfig) -> anyhow::Result<()> {
    let backend = build_backend(config)?;

    backend.setup().context("failed to set up container pool")?;
    backend.start().context("failed to start backend")?;
    tracing::info!(
        depot = %config.depot_path.display(),
        containers = backend.containers().len(),
        "daemon started"
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set signal handler")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }

    tracing::info!("shutting down");
    backend.stop().context("failed to snapshot containers")?;
    Ok(())
}
