//! A container and the operations clients perform on it.
//!
//! The container owns its lifecycle state, the resources it holds from the
//! pools, the limits it has applied, and its jobs. Each of those sits
//! behind its own lock, so a snapshot can be taken while a long link is in
//! progress.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use enclave_common::constants::{
    CONTAINER_IFACE_MTU, CONTAINER_ROOT_USER, CONTAINER_USER, OUT_OF_MEMORY_EVENT, SCRIPT_PATH_ENV,
};
use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::{
    BandwidthLimits, ContainerInfo, ContainerState, CpuLimits, DiskLimits, JobChunk, JobResult,
    JobSpec, MemoryLimits,
};
use enclave_core::bandwidth::BandwidthManager;
use enclave_core::cgroup::{CgroupsManager, cpu, memory};
use enclave_core::command::{CommandRunner, HelperCommand, ProcessHandle, Signal};
use enclave_core::pool::{ContainerNetwork, PortPool};
use enclave_core::quota::QuotaManager;

use crate::job::JobTracker;
use crate::snapshot::{
    ContainerSnapshot, JobSnapshot, LimitsSnapshot, NetInSpec, NetOutSpec, ResourcesSnapshot,
};

/// Pool allocations held by one container.
#[derive(Debug)]
pub struct Resources {
    uid: u32,
    network: ContainerNetwork,
    ports: Mutex<Vec<u32>>,
}

impl Resources {
    /// Bundles a UID, a network block, and any ports already held.
    #[must_use]
    pub const fn new(uid: u32, network: ContainerNetwork, ports: Vec<u32>) -> Self {
        Self {
            uid,
            network,
            ports: Mutex::new(ports),
        }
    }

    /// Container user ID.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// Container network block.
    #[must_use]
    pub const fn network(&self) -> ContainerNetwork {
        self.network
    }

    /// Host ports held, in acquisition order.
    #[must_use]
    pub fn ports(&self) -> Vec<u32> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn add_port(&self, port: u32) {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(port);
    }
}

/// Collaborators a [`LinuxContainer`] is built from.
pub struct ContainerParts {
    /// Internal container ID.
    pub id: String,
    /// Client-facing handle.
    pub handle: String,
    /// Container directory in the depot.
    pub path: PathBuf,
    /// Idle time after which the container may be reaped.
    pub grace_time: Duration,
    /// Pool allocations.
    pub resources: Resources,
    /// Pool for ports acquired by `net_in`.
    pub port_pool: Arc<PortPool>,
    /// Runner for scripts and helpers.
    pub runner: Arc<dyn CommandRunner>,
    /// Access to the container's cgroups.
    pub cgroups: Arc<dyn CgroupsManager>,
    /// Disk quotas for the container's UID.
    pub quota: Arc<dyn QuotaManager>,
    /// Bandwidth shaping for the container.
    pub bandwidth: Arc<dyn BandwidthManager>,
}

/// A container managed through the depot's lifecycle scripts.
pub struct LinuxContainer {
    id: String,
    handle: String,
    path: PathBuf,
    grace_time: Duration,

    state: RwLock<ContainerState>,
    events: RwLock<Vec<String>>,

    resources: Resources,
    port_pool: Arc<PortPool>,

    runner: Arc<dyn CommandRunner>,
    cgroups: Arc<dyn CgroupsManager>,
    quota: Arc<dyn QuotaManager>,
    bandwidth: Arc<dyn BandwidthManager>,

    jobs: JobTracker,

    oom_notifier: Mutex<Option<Arc<dyn ProcessHandle>>>,

    memory_limits: RwLock<Option<MemoryLimits>>,
    cpu_limits: RwLock<Option<CpuLimits>>,
    disk_limits: RwLock<Option<DiskLimits>>,
    bandwidth_limits: RwLock<Option<BandwidthLimits>>,

    net_ins: RwLock<Vec<NetInSpec>>,
    net_outs: RwLock<Vec<NetOutSpec>>,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

impl LinuxContainer {
    /// Builds a container in the `Born` state.
    #[must_use]
    pub fn new(parts: ContainerParts) -> Arc<Self> {
        let jobs = JobTracker::new(&parts.path, Arc::clone(&parts.runner));
        Arc::new(Self {
            id: parts.id,
            handle: parts.handle,
            path: parts.path,
            grace_time: parts.grace_time,
            state: RwLock::new(ContainerState::Born),
            events: RwLock::new(Vec::new()),
            resources: parts.resources,
            port_pool: parts.port_pool,
            runner: parts.runner,
            cgroups: parts.cgroups,
            quota: parts.quota,
            bandwidth: parts.bandwidth,
            jobs,
            oom_notifier: Mutex::new(None),
            memory_limits: RwLock::new(None),
            cpu_limits: RwLock::new(None),
            disk_limits: RwLock::new(None),
            bandwidth_limits: RwLock::new(None),
            net_ins: RwLock::new(Vec::new()),
            net_outs: RwLock::new(Vec::new()),
        })
    }

    /// Internal container ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Client-facing handle.
    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Container directory in the depot.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idle time after which the container may be reaped.
    #[must_use]
    pub const fn grace_time(&self) -> Duration {
        self.grace_time
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        read(&self.state)
    }

    /// Events recorded so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        read(&self.events)
    }

    /// Pool allocations held by the container.
    #[must_use]
    pub const fn resources(&self) -> &Resources {
        &self.resources
    }

    fn transition(&self, to: ContainerState) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition_to(to) {
            return Err(EnclaveError::InvalidState {
                id: self.id.clone(),
                from: *state,
                to,
            });
        }
        *state = to;
        Ok(())
    }

    fn check_transition(&self, to: ContainerState) -> Result<()> {
        let from = self.state();
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(EnclaveError::InvalidState {
                id: self.id.clone(),
                from,
                to,
            })
        }
    }

    fn register_event(&self, event: &str) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.to_string());
    }

    fn script(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    fn helper(&self, name: &str) -> PathBuf {
        self.path.join("bin").join(name)
    }

    fn wsh_socket(&self) -> PathBuf {
        self.path.join("run").join("wshd.sock")
    }

    /// Runs `start.sh` and moves the container to `Active`.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::InvalidState`] unless the container is
    /// `Born`, or the script failure.
    pub fn start(&self) -> Result<()> {
        tracing::info!(id = %self.id, "starting container");
        self.check_transition(ContainerState::Active)?;
        let _ = self.runner.run(
            &HelperCommand::new(self.script("start.sh"))
                .env("id", &self.id)
                .env("container_iface_mtu", CONTAINER_IFACE_MTU.to_string())
                .env("PATH", SCRIPT_PATH_ENV),
        )?;
        self.transition(ContainerState::Active)
    }

    /// Runs `stop.sh`, halts the OOM watcher, and moves the container to
    /// `Stopped`. With `kill`, processes get no time to exit.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::InvalidState`] unless the container is
    /// `Active`, or the script failure.
    pub fn stop(&self, kill: bool) -> Result<()> {
        tracing::info!(id = %self.id, kill, "stopping container");
        self.check_transition(ContainerState::Stopped)?;
        let mut stop = HelperCommand::new(self.script("stop.sh"));
        if kill {
            stop = stop.args(["-w", "0"]);
        }
        let _ = self.runner.run(&stop)?;
        self.stop_oom_notifier();
        self.transition(ContainerState::Stopped)
    }

    /// Stops the OOM watcher and detaches from every running job, leaving
    /// the jobs themselves running. Used before the daemon exits.
    pub fn cleanup(&self) {
        self.stop_oom_notifier();
        for job in self.jobs.active_jobs() {
            if let Err(e) = job.unlink() {
                tracing::warn!(id = %self.id, job = job.id(), error = %e, "failed to unlink job");
            }
        }
    }

    /// Gathers state, addresses, jobs, and resource usage.
    ///
    /// # Errors
    ///
    /// Returns the first failure reading a cgroup entry, the quota, or
    /// the bandwidth shaping.
    pub fn info(&self) -> Result<ContainerInfo> {
        let memory_stat = memory::parse_memory_stat(&self.cgroups.get("memory", "memory.stat")?)?;
        let cpu_stat = cpu::parse_cpu_stat(
            &self.cgroups.get("cpuacct", "cpuacct.usage")?,
            &self.cgroups.get("cpuacct", "cpuacct.stat")?,
        )?;
        let disk_stat = self.quota.get_usage(self.resources.uid)?;
        let bandwidth_stat = self.bandwidth.get_limits()?;
        let network = self.resources.network;

        Ok(ContainerInfo {
            state: self.state(),
            events: self.events(),
            host_ip: network.host_ip().to_string(),
            container_ip: network.container_ip().to_string(),
            container_path: self.path.clone(),
            job_ids: self.jobs.active_jobs().iter().map(|j| j.id()).collect(),
            memory_stat,
            cpu_stat,
            disk_stat,
            bandwidth_stat,
        })
    }

    /// Copies a host path into the container.
    ///
    /// # Errors
    ///
    /// Returns the `rsync` failure.
    pub fn copy_in(&self, src: &str, dst: &str) -> Result<()> {
        tracing::info!(id = %self.id, src, dst, "copying in");
        self.rsync(src, &format!("{CONTAINER_USER}@container:{dst}"))
    }

    /// Copies a container path out to the host, then hands it to `owner`
    /// if one is given.
    ///
    /// # Errors
    ///
    /// Returns the `rsync` or `chown` failure.
    pub fn copy_out(&self, src: &str, dst: &str, owner: Option<&str>) -> Result<()> {
        tracing::info!(id = %self.id, src, dst, "copying out");
        self.rsync(&format!("{CONTAINER_USER}@container:{src}"), dst)?;
        if let Some(owner) = owner.filter(|o| !o.is_empty()) {
            let _ = self
                .runner
                .run(&HelperCommand::new("chown").args(["-R", owner, dst]))?;
        }
        Ok(())
    }

    fn rsync(&self, src: &str, dst: &str) -> Result<()> {
        let rsh = format!(
            "{} --socket {} --rsh",
            self.helper("wsh").display(),
            self.wsh_socket().display()
        );
        let _ = self.runner.run(
            &HelperCommand::new("rsync").args([
                "-e".to_string(),
                rsh,
                "-r".to_string(),
                "-p".to_string(),
                "--links".to_string(),
                src.to_string(),
                dst.to_string(),
            ]),
        )?;
        Ok(())
    }

    /// Applies a memory limit and starts the OOM watcher if it is not
    /// running yet.
    ///
    /// The plain limit is written before and after the swap-inclusive
    /// one; the latter may never be below the former, whichever way the
    /// limit moves. The limit is only recorded once every write lands.
    ///
    /// # Errors
    ///
    /// Returns the notifier launch failure or a cgroup write failure.
    pub fn limit_memory(self: &Arc<Self>, limits: MemoryLimits) -> Result<()> {
        tracing::info!(id = %self.id, bytes = limits.limit_in_bytes, "limiting memory");
        self.start_oom_notifier()?;

        let limit = limits.limit_in_bytes.to_string();
        if let Err(e) = self.cgroups.set("memory", "memory.limit_in_bytes", &limit) {
            tracing::debug!(id = %self.id, error = %e, "initial memory limit write rejected");
        }
        self.cgroups.set("memory", "memory.memsw.limit_in_bytes", &limit)?;
        self.cgroups.set("memory", "memory.limit_in_bytes", &limit)?;

        write(&self.memory_limits, Some(limits));
        Ok(())
    }

    /// Memory limit currently in force, read from the cgroup.
    ///
    /// # Errors
    ///
    /// Returns a read failure or a parse error.
    pub fn current_memory_limits(&self) -> Result<MemoryLimits> {
        let raw = self.cgroups.get("memory", "memory.limit_in_bytes")?;
        Ok(MemoryLimits {
            limit_in_bytes: parse_number("memory.limit_in_bytes", &raw)?,
        })
    }

    /// Sets the container's CPU shares.
    ///
    /// # Errors
    ///
    /// Returns the cgroup write failure.
    pub fn limit_cpu(&self, limits: CpuLimits) -> Result<()> {
        tracing::info!(id = %self.id, shares = limits.limit_in_shares, "limiting cpu");
        self.cgroups
            .set("cpu", "cpu.shares", &limits.limit_in_shares.to_string())?;
        write(&self.cpu_limits, Some(limits));
        Ok(())
    }

    /// CPU shares currently in force, read from the cgroup.
    ///
    /// # Errors
    ///
    /// Returns a read failure or a parse error.
    pub fn current_cpu_limits(&self) -> Result<CpuLimits> {
        let raw = self.cgroups.get("cpu", "cpu.shares")?;
        Ok(CpuLimits {
            limit_in_shares: parse_number("cpu.shares", &raw)?,
        })
    }

    /// Applies disk quota limits for the container's user.
    ///
    /// # Errors
    ///
    /// Returns the quota tool failure.
    pub fn limit_disk(&self, limits: DiskLimits) -> Result<()> {
        tracing::info!(id = %self.id, "limiting disk");
        self.quota.set_limits(self.resources.uid, limits)?;
        write(&self.disk_limits, Some(limits));
        Ok(())
    }

    /// Disk limits in force, as reported by the quota tools.
    ///
    /// # Errors
    ///
    /// Returns the quota tool failure.
    pub fn current_disk_limits(&self) -> Result<DiskLimits> {
        self.quota.get_limits(self.resources.uid)
    }

    /// Applies bandwidth limits.
    ///
    /// # Errors
    ///
    /// Returns the script failure.
    pub fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<()> {
        tracing::info!(
            id = %self.id,
            rate = limits.rate_in_bytes_per_second,
            burst = limits.burst_rate_in_bytes_per_second,
            "limiting bandwidth"
        );
        self.bandwidth.set_limits(limits)?;
        write(&self.bandwidth_limits, Some(limits));
        Ok(())
    }

    /// Last bandwidth limits applied, or zero if none were.
    #[must_use]
    pub fn current_bandwidth_limits(&self) -> BandwidthLimits {
        read(&self.bandwidth_limits).unwrap_or_default()
    }

    /// Runs a script inside the container as a new job.
    ///
    /// # Errors
    ///
    /// Returns the spawn failure.
    pub fn spawn(&self, spec: &JobSpec) -> Result<u32> {
        tracing::info!(id = %self.id, privileged = spec.privileged, "spawning job");
        let user = if spec.privileged {
            CONTAINER_ROOT_USER
        } else {
            CONTAINER_USER
        };
        let wsh = HelperCommand::new(self.helper("wsh"))
            .args([
                "--socket".to_string(),
                self.wsh_socket().display().to_string(),
                "--user".to_string(),
                user.to_string(),
                "/bin/bash".to_string(),
            ])
            .envs(spec.limits.env())
            .stdin(spec.script.as_bytes());
        self.jobs.spawn(&wsh, spec.discard_output, spec.auto_link)
    }

    /// Blocks until the job exits and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::NotFound`] for an unknown job.
    pub fn link(&self, job_id: u32) -> Result<JobResult> {
        tracing::info!(id = %self.id, job = job_id, "linking to job");
        self.jobs.link(job_id)
    }

    /// Subscribes to a job's output.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::NotFound`] for an unknown job.
    pub fn stream(&self, job_id: u32) -> Result<Receiver<JobChunk>> {
        tracing::info!(id = %self.id, job = job_id, "streaming job");
        self.jobs.stream(job_id)
    }

    /// IDs of jobs that have not completed.
    #[must_use]
    pub fn job_ids(&self) -> Vec<u32> {
        self.jobs.active_jobs().iter().map(|j| j.id()).collect()
    }

    /// Maps a host port to a container port.
    ///
    /// A zero host port is taken from the port pool; a zero container
    /// port mirrors the host port. Returns the ports actually mapped.
    ///
    /// # Errors
    ///
    /// Returns pool exhaustion or the script failure.
    pub fn net_in(&self, host_port: u32, container_port: u32) -> Result<(u32, u32)> {
        let host_port = if host_port == 0 {
            let port = self.port_pool.acquire()?;
            self.resources.add_port(port);
            port
        } else {
            host_port
        };
        let container_port = if container_port == 0 {
            host_port
        } else {
            container_port
        };

        tracing::info!(id = %self.id, host_port, container_port, "mapping port");
        let _ = self.runner.run(
            &HelperCommand::new(self.script("net.sh"))
                .arg("in")
                .env("HOST_PORT", host_port.to_string())
                .env("CONTAINER_PORT", container_port.to_string()),
        )?;

        self.net_ins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NetInSpec {
                host_port,
                container_port,
            });
        Ok((host_port, container_port))
    }

    /// Permits outbound traffic to a network, a port, or both.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::InvalidArgument`] when neither is given,
    /// or the script failure.
    pub fn net_out(&self, network: &str, port: u32) -> Result<()> {
        if network.is_empty() && port == 0 {
            return Err(EnclaveError::InvalidArgument {
                message: "network and/or port must be provided".to_string(),
            });
        }
        tracing::info!(id = %self.id, network, port, "permitting outbound traffic");

        let port_env = if port == 0 {
            String::new()
        } else {
            port.to_string()
        };
        let _ = self.runner.run(
            &HelperCommand::new(self.script("net.sh"))
                .arg("out")
                .env("NETWORK", network)
                .env("PORT", port_env),
        )?;

        self.net_outs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NetOutSpec {
                network: network.to_string(),
                port,
            });
        Ok(())
    }

    /// Captures the container's restorable state.
    #[must_use]
    pub fn to_snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            id: self.id.clone(),
            handle: self.handle.clone(),
            grace_time: self.grace_time,
            state: self.state(),
            events: self.events(),
            limits: LimitsSnapshot {
                memory: read(&self.memory_limits),
                disk: read(&self.disk_limits),
                bandwidth: read(&self.bandwidth_limits),
                cpu: read(&self.cpu_limits),
            },
            resources: ResourcesSnapshot {
                uid: self.resources.uid,
                network: self.resources.network,
                ports: self.resources.ports(),
            },
            net_ins: read(&self.net_ins),
            net_outs: read(&self.net_outs),
            jobs: self
                .jobs
                .active_jobs()
                .iter()
                .map(|job| JobSnapshot {
                    id: job.id(),
                    discard_output: job.discard_output(),
                })
                .collect(),
        }
    }

    /// Writes the container's snapshot document to `out`.
    ///
    /// # Errors
    ///
    /// Returns a serialization or write failure.
    pub fn snapshot(&self, out: impl Write) -> Result<()> {
        self.to_snapshot().write_to(out)
    }

    /// Brings a freshly built container back to a snapshotted state.
    ///
    /// Reapplies the memory limit (restarting the OOM watcher), records
    /// the other limits, reattaches to surviving jobs, reruns network
    /// setup, and replays every port mapping and outbound rule.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub fn restore(self: &Arc<Self>, snapshot: &ContainerSnapshot) -> Result<()> {
        tracing::info!(id = %self.id, handle = %self.handle, "restoring container");
        write(&self.state, snapshot.state);
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(snapshot.events.iter().cloned());

        if let Some(limits) = snapshot.limits.memory {
            self.limit_memory(limits)?;
        }
        write(&self.cpu_limits, snapshot.limits.cpu);
        write(&self.disk_limits, snapshot.limits.disk);
        write(&self.bandwidth_limits, snapshot.limits.bandwidth);

        for job in &snapshot.jobs {
            self.jobs.restore(job.id, job.discard_output);
        }

        let _ = self
            .runner
            .run(&HelperCommand::new(self.script("net.sh")).arg("setup"))?;

        for rule in &snapshot.net_ins {
            let _ = self.net_in(rule.host_port, rule.container_port)?;
        }
        for rule in &snapshot.net_outs {
            self.net_out(&rule.network, rule.port)?;
        }
        Ok(())
    }

    fn start_oom_notifier(self: &Arc<Self>) -> Result<()> {
        let mut slot = self
            .oom_notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let notifier = HelperCommand::new(self.helper("oom"))
            .arg(self.cgroups.subsystem_path("memory").display().to_string());
        let running = self.runner.start(&notifier)?;
        let handle = running.handle();
        *slot = Some(Arc::clone(&handle));
        drop(slot);

        let container = Arc::downgrade(self);
        let _ = std::thread::spawn(move || watch_for_oom(&container, &*handle));
        Ok(())
    }

    fn stop_oom_notifier(&self) {
        let notifier = self
            .oom_notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(notifier) = notifier {
            if let Err(e) = notifier.signal(Signal::SIGKILL) {
                tracing::warn!(id = %self.id, error = %e, "failed to stop oom notifier");
            }
        }
    }
}

/// Waits for the notifier; its clean exit means the container ran out of
/// memory.
fn watch_for_oom(container: &Weak<LinuxContainer>, notifier: &dyn ProcessHandle) {
    let outcome = notifier.wait();
    let Some(container) = container.upgrade() else {
        return;
    };
    match outcome {
        Ok(Some(0)) => {
            tracing::warn!(id = %container.id, "out of memory");
            container.register_event(OUT_OF_MEMORY_EVENT);
            if let Err(e) = container.stop(false) {
                tracing::warn!(id = %container.id, error = %e, "failed to stop container after oom");
            }
        }
        Ok(status) => {
            tracing::debug!(id = %container.id, ?status, "oom notifier exited");
        }
        Err(e) => {
            tracing::warn!(id = %container.id, error = %e, "oom notifier failed");
        }
    }
}

fn parse_number(what: &'static str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| EnclaveError::parse(what, format!("{raw:?}")))
}

impl std::fmt::Debug for LinuxContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxContainer")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use enclave_common::types::ResourceLimits;
    use enclave_core::cgroup::FakeCgroupsManager;
    use enclave_core::cgroup::fake::SetValue;
    use enclave_core::command::fake::FakeCommandRunner;
    use enclave_core::quota::LinuxQuotaManager;
    use enclave_core::bandwidth::ContainerBandwidthManager;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        runner: FakeCommandRunner,
        cgroups: Arc<FakeCgroupsManager>,
        port_pool: Arc<PortPool>,
        container: Arc<LinuxContainer>,
    }

    fn harness() -> Harness {
        let runner = FakeCommandRunner::new();
        let cgroups = Arc::new(FakeCgroupsManager::new("/cgroups"));
        let port_pool = Arc::new(PortPool::ports(1000, 10));
        let shared: Arc<dyn CommandRunner> = Arc::new(runner.clone());
        let container = LinuxContainer::new(ContainerParts {
            id: "some-id".into(),
            handle: "some-handle".into(),
            path: "/depot/some-id".into(),
            grace_time: Duration::from_secs(1),
            resources: Resources::new(1234, "10.254.0.0/30".parse().unwrap(), Vec::new()),
            port_pool: Arc::clone(&port_pool),
            runner: Arc::clone(&shared),
            cgroups: cgroups.clone(),
            quota: Arc::new(LinuxQuotaManager::with_mount_point(
                "/mnt",
                "/root",
                Arc::clone(&shared),
            )),
            bandwidth: Arc::new(ContainerBandwidthManager::new(
                "/depot/some-id",
                "some-id",
                shared,
            )),
        });
        Harness {
            runner,
            cgroups,
            port_pool,
            container,
        }
    }

    /// Keeps the notifier running until it is killed.
    fn hold_oom_notifier(runner: &FakeCommandRunner) {
        runner.when_running("oom", |p| {
            let _ = p.wait_for_signal();
            None
        });
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_runs_script_and_activates() {
        let h = harness();
        h.container.start().unwrap();

        let cmd = &h.runner.executed()[0];
        assert_eq!(cmd.program(), Path::new("/depot/some-id/start.sh"));
        assert_eq!(cmd.env_value("id"), Some("some-id"));
        assert_eq!(cmd.env_value("container_iface_mtu"), Some("1500"));
        assert!(cmd.env_value("PATH").is_some());
        assert_eq!(h.container.state(), ContainerState::Active);
    }

    #[test]
    fn failed_start_keeps_state() {
        let h = harness();
        h.runner.when_running("start.sh", |_| Some(1));
        assert!(h.container.start().is_err());
        assert_eq!(h.container.state(), ContainerState::Born);
    }

    #[test]
    fn state_never_moves_backwards() {
        let h = harness();
        assert!(matches!(
            h.container.stop(false),
            Err(EnclaveError::InvalidState { .. })
        ));
        h.container.start().unwrap();
        assert!(h.container.start().is_err());
        h.container.stop(true).unwrap();
        assert_eq!(h.container.state(), ContainerState::Stopped);
        assert!(h.container.start().is_err());
        assert!(h.container.stop(false).is_err());
    }

    #[test]
    fn kill_stop_passes_no_wait() {
        let h = harness();
        h.container.start().unwrap();
        h.container.stop(true).unwrap();
        let stop = h.runner.launched("stop.sh");
        assert_eq!(stop[0].get_args(), ["-w", "0"]);
    }

    #[test]
    fn limit_memory_writes_in_order_and_caches() {
        let h = harness();
        hold_oom_notifier(&h.runner);
        h.container
            .limit_memory(MemoryLimits { limit_in_bytes: 102_400 })
            .unwrap();

        let names: Vec<String> = h.cgroups.set_values().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            [
                "memory.limit_in_bytes",
                "memory.memsw.limit_in_bytes",
                "memory.limit_in_bytes"
            ]
        );
        assert!(h.cgroups.set_values().iter().all(|s| s.value == "102400"));
        assert_eq!(
            h.container.to_snapshot().limits.memory,
            Some(MemoryLimits { limit_in_bytes: 102_400 })
        );
        assert_eq!(h.container.current_memory_limits().unwrap().limit_in_bytes, 102_400);
    }

    #[test]
    fn failed_swap_limit_leaves_memory_uncached() {
        let h = harness();
        hold_oom_notifier(&h.runner);
        h.cgroups.fail_set("memory", "memory.memsw.limit_in_bytes");
        assert!(h.container.limit_memory(MemoryLimits { limit_in_bytes: 1 }).is_err());
        assert_eq!(h.container.to_snapshot().limits.memory, None);
    }

    #[test]
    fn oom_notifier_starts_once() {
        let h = harness();
        hold_oom_notifier(&h.runner);
        h.container.limit_memory(MemoryLimits { limit_in_bytes: 1 }).unwrap();
        h.container.limit_memory(MemoryLimits { limit_in_bytes: 2 }).unwrap();

        let started = h.runner.launched("oom");
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].program(), Path::new("/depot/some-id/bin/oom"));
        assert_eq!(started[0].get_args(), ["/cgroups/memory"]);
    }

    #[test]
    fn oom_records_event_and_stops() {
        let h = harness();
        h.container.start().unwrap();
        h.container.limit_memory(MemoryLimits { limit_in_bytes: 1 }).unwrap();

        assert!(wait_until(|| h.container.state() == ContainerState::Stopped));
        assert_eq!(h.container.events(), vec![OUT_OF_MEMORY_EVENT.to_string()]);
        assert_eq!(h.runner.launched("stop.sh").len(), 1);
    }

    #[test]
    fn stop_kills_oom_notifier() {
        let h = harness();
        hold_oom_notifier(&h.runner);
        h.container.start().unwrap();
        h.container.limit_memory(MemoryLimits { limit_in_bytes: 1 }).unwrap();
        h.container.stop(false).unwrap();

        assert_eq!(h.runner.signals()[0].1, Signal::SIGKILL);
    }

    #[test]
    fn limit_cpu_sets_shares() {
        let h = harness();
        h.container.limit_cpu(CpuLimits { limit_in_shares: 512 }).unwrap();
        assert_eq!(
            h.cgroups.set_values(),
            vec![SetValue {
                subsystem: "cpu".into(),
                name: "cpu.shares".into(),
                value: "512".into(),
            }]
        );
        assert_eq!(h.container.current_cpu_limits().unwrap().limit_in_shares, 512);
    }

    #[test]
    fn bandwidth_limits_are_cached() {
        let h = harness();
        let limits = BandwidthLimits {
            rate_in_bytes_per_second: 1,
            burst_rate_in_bytes_per_second: 2,
        };
        assert_eq!(h.container.current_bandwidth_limits(), BandwidthLimits::default());
        h.container.limit_bandwidth(limits).unwrap();
        assert_eq!(h.container.current_bandwidth_limits(), limits);
    }

    #[test]
    fn failed_disk_limit_is_not_cached() {
        let h = harness();
        h.runner.when_running("setquota", |_| Some(1));
        assert!(h.container.limit_disk(DiskLimits::default()).is_err());
        assert_eq!(h.container.to_snapshot().limits.disk, None);
    }

    #[test]
    fn spawn_runs_wsh_with_user_and_rlimits() {
        let h = harness();
        h.runner.when_running("iomux-spawn", |p| {
            p.write_stdout("ready\nactive\n");
            Some(0)
        });
        let id = h
            .container
            .spawn(&JobSpec {
                script: "echo hi".into(),
                privileged: true,
                limits: ResourceLimits {
                    nofile: Some(16),
                    ..ResourceLimits::default()
                },
                ..JobSpec::default()
            })
            .unwrap();
        assert_eq!(id, 0);

        let spawn = &h.runner.launched("iomux-spawn")[0];
        assert_eq!(
            spawn.get_args(),
            [
                "/depot/some-id/jobs/0",
                "/depot/some-id/bin/wsh",
                "--socket",
                "/depot/some-id/run/wshd.sock",
                "--user",
                "root",
                "/bin/bash",
            ]
        );
        assert_eq!(spawn.env_value("RLIMIT_NOFILE"), Some("16"));
        assert_eq!(spawn.get_stdin(), Some(&b"echo hi"[..]));
    }

    #[test]
    fn net_in_acquires_port_when_zero() {
        let h = harness();
        let (host, container) = h.container.net_in(0, 0).unwrap();
        assert_eq!((host, container), (1000, 1000));
        assert_eq!(h.container.resources().ports(), vec![1000]);

        let net = &h.runner.executed()[0];
        assert_eq!(net.get_args(), ["in"]);
        assert_eq!(net.env_value("HOST_PORT"), Some("1000"));
        assert_eq!(net.env_value("CONTAINER_PORT"), Some("1000"));

        assert_eq!(h.container.net_in(8080, 80).unwrap(), (8080, 80));
        assert_eq!(h.port_pool.available(), 9);
    }

    #[test]
    fn net_out_validates_and_runs_script() {
        let h = harness();
        assert!(matches!(
            h.container.net_out("", 0),
            Err(EnclaveError::InvalidArgument { .. })
        ));
        assert!(h.runner.executed().is_empty());

        h.container.net_out("1.2.3.4/30", 0).unwrap();
        h.container.net_out("", 53).unwrap();
        let cmds = h.runner.executed();
        assert_eq!(cmds[0].env_value("NETWORK"), Some("1.2.3.4/30"));
        assert_eq!(cmds[0].env_value("PORT"), Some(""));
        assert_eq!(cmds[1].env_value("PORT"), Some("53"));
        assert_eq!(h.container.to_snapshot().net_outs.len(), 2);
    }

    #[test]
    fn copy_out_chowns_when_owner_given() {
        let h = harness();
        h.container.copy_out("/src", "/dst", Some("vcap")).unwrap();
        let cmds = h.runner.executed();
        assert_eq!(cmds[0].program(), Path::new("rsync"));
        assert_eq!(
            cmds[0].get_args(),
            [
                "-e",
                "/depot/some-id/bin/wsh --socket /depot/some-id/run/wshd.sock --rsh",
                "-r",
                "-p",
                "--links",
                "vcap@container:/src",
                "/dst",
            ]
        );
        assert_eq!(cmds[1].get_args(), ["-R", "vcap", "/dst"]);
    }

    #[test]
    fn copy_in_targets_container() {
        let h = harness();
        h.container.copy_in("/host/file", "/tmp/file").unwrap();
        let args = h.runner.executed()[0].get_args().to_vec();
        assert_eq!(args[5], "/host/file");
        assert_eq!(args[6], "vcap@container:/tmp/file");
    }

    #[test]
    fn info_reports_addresses_and_stats() {
        let h = harness();
        h.cgroups.when_getting("memory", "memory.stat", "rss 10\n");
        h.cgroups.when_getting("cpuacct", "cpuacct.usage", "100");
        h.cgroups.when_getting("cpuacct", "cpuacct.stat", "user 1\nsystem 2");

        let info = h.container.info().unwrap();
        assert_eq!(info.host_ip, "10.254.0.1");
        assert_eq!(info.container_ip, "10.254.0.2");
        assert_eq!(info.memory_stat.rss, 10);
        assert_eq!(info.cpu_stat.system, 2);
        assert_eq!(info.container_path, PathBuf::from("/depot/some-id"));
        assert!(info.job_ids.is_empty());
    }

    #[test]
    fn info_fails_when_cgroup_unreadable() {
        let h = harness();
        assert!(h.container.info().is_err());
    }
}
