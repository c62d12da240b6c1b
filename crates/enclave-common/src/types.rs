//! Domain primitive types used across the Enclave workspace.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a container.
///
/// States only move forward: `Born -> Active -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container has been created but its start script has not run.
    Born,
    /// Container has been started.
    Active,
    /// Container has been stopped.
    Stopped,
}

impl ContainerState {
    /// Returns whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!((self, next), (Self::Born, Self::Active) | (Self::Active, Self::Stopped))
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Born => write!(f, "born"),
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Memory limit applied through the memory cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemoryLimits {
    /// Hard limit in bytes (also used as the memory+swap limit).
    pub limit_in_bytes: u64,
}

/// CPU limit applied through the cpu cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CpuLimits {
    /// Relative CPU weight (`cpu.shares`).
    pub limit_in_shares: u64,
}

/// Disk quota limits for a container's user.
///
/// Byte limits, when non-zero, take precedence over block limits and are
/// rounded up to whole quota blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiskLimits {
    /// Soft block limit.
    pub block_soft: u64,
    /// Hard block limit.
    pub block_hard: u64,
    /// Soft inode limit.
    pub inode_soft: u64,
    /// Hard inode limit.
    pub inode_hard: u64,
    /// Soft limit in bytes.
    pub byte_soft: u64,
    /// Hard limit in bytes.
    pub byte_hard: u64,
}

/// Network bandwidth limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BandwidthLimits {
    /// Sustained rate in bytes per second.
    pub rate_in_bytes_per_second: u64,
    /// Burst rate in bytes per second.
    pub burst_rate_in_bytes_per_second: u64,
}

/// Per-process resource limits passed to the execution helper as
/// `RLIMIT_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ResourceLimits {
    pub as_: Option<u64>,
    pub core: Option<u64>,
    pub cpu: Option<u64>,
    pub data: Option<u64>,
    pub fsize: Option<u64>,
    pub locks: Option<u64>,
    pub memlock: Option<u64>,
    pub msgqueue: Option<u64>,
    pub nice: Option<u64>,
    pub nofile: Option<u64>,
    pub nproc: Option<u64>,
    pub rss: Option<u64>,
    pub rtprio: Option<u64>,
    pub sigpending: Option<u64>,
    pub stack: Option<u64>,
}

impl ResourceLimits {
    /// Returns the `RLIMIT_*` environment entries for every limit that is set.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        [
            ("RLIMIT_AS", self.as_),
            ("RLIMIT_CORE", self.core),
            ("RLIMIT_CPU", self.cpu),
            ("RLIMIT_DATA", self.data),
            ("RLIMIT_FSIZE", self.fsize),
            ("RLIMIT_LOCKS", self.locks),
            ("RLIMIT_MEMLOCK", self.memlock),
            ("RLIMIT_MSGQUEUE", self.msgqueue),
            ("RLIMIT_NICE", self.nice),
            ("RLIMIT_NOFILE", self.nofile),
            ("RLIMIT_NPROC", self.nproc),
            ("RLIMIT_RSS", self.rss),
            ("RLIMIT_RTPRIO", self.rtprio),
            ("RLIMIT_SIGPENDING", self.sigpending),
            ("RLIMIT_STACK", self.stack),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v.to_string())))
        .collect()
    }
}

/// Request to run a script inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSpec {
    /// Script body fed to `/bin/bash` on stdin.
    pub script: String,
    /// Run as root instead of the unprivileged container user.
    pub privileged: bool,
    /// Do not retain stdout/stderr.
    pub discard_output: bool,
    /// Start linking as soon as the job is spawned.
    pub auto_link: bool,
    /// Per-process resource limits.
    pub limits: ResourceLimits,
}

/// Exit status value recorded when the real status cannot be determined.
pub const UNKNOWN_EXIT_STATUS: u32 = 255;

/// Final outcome of a linked job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResult {
    /// Exit status of the job's command.
    pub exit_status: u32,
    /// Everything the job wrote to stdout.
    pub stdout: Vec<u8>,
    /// Everything the job wrote to stderr.
    pub stderr: Vec<u8>,
}

/// One element of a job's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobChunk {
    /// Bytes written to stdout.
    Stdout(Vec<u8>),
    /// Bytes written to stderr.
    Stderr(Vec<u8>),
    /// Exit status; always the last chunk before the stream closes.
    ExitStatus(u32),
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindMountMode {
    /// Read-only mount.
    #[default]
    ReadOnly,
    /// Read-write mount.
    ReadWrite,
}

impl BindMountMode {
    /// Returns the mount option keyword for this mode.
    #[must_use]
    pub const fn as_option(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

/// Host directory mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Path on the host.
    pub src_path: PathBuf,
    /// Path inside the container.
    pub dst_path: PathBuf,
    /// Access mode.
    pub mode: BindMountMode,
}

/// Request to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Client-chosen handle; defaults to the generated container ID.
    pub handle: Option<String>,
    /// Idle time after which the container may be reaped.
    pub grace_time: Duration,
    /// Host directories to mount into the container.
    pub bind_mounts: Vec<BindMount>,
}

/// Counters parsed from a memory cgroup's `memory.stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct MemoryStat {
    pub cache: u64,
    pub rss: u64,
    pub mapped_file: u64,
    pub pgpgin: u64,
    pub pgpgout: u64,
    pub swap: u64,
    pub pgfault: u64,
    pub pgmajfault: u64,
    pub inactive_anon: u64,
    pub active_anon: u64,
    pub inactive_file: u64,
    pub active_file: u64,
    pub unevictable: u64,
    pub hierarchical_memory_limit: u64,
    pub hierarchical_memsw_limit: u64,
    pub total_cache: u64,
    pub total_rss: u64,
    pub total_mapped_file: u64,
    pub total_pgpgin: u64,
    pub total_pgpgout: u64,
    pub total_swap: u64,
    pub total_pgfault: u64,
    pub total_pgmajfault: u64,
    pub total_inactive_anon: u64,
    pub total_active_anon: u64,
    pub total_inactive_file: u64,
    pub total_active_file: u64,
    pub total_unevictable: u64,
}

/// CPU accounting for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStat {
    /// Total CPU time consumed, in nanoseconds.
    pub usage: u64,
    /// User time, in clock ticks.
    pub user: u64,
    /// System time, in clock ticks.
    pub system: u64,
}

/// Disk usage of a container's user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStat {
    /// Bytes (quota blocks) in use.
    pub bytes_used: u64,
    /// Inodes in use.
    pub inodes_used: u64,
}

/// Bandwidth shaping currently in force.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthStat {
    /// Ingress rate in bytes per second.
    pub in_rate: u64,
    /// Ingress burst in bytes.
    pub in_burst: u64,
    /// Egress rate in bytes per second.
    pub out_rate: u64,
    /// Egress burst in bytes.
    pub out_burst: u64,
}

/// Point-in-time description of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Current lifecycle state.
    pub state: ContainerState,
    /// Events recorded so far, oldest first.
    pub events: Vec<String>,
    /// Host side of the container's network link.
    pub host_ip: String,
    /// Container side of the network link.
    pub container_ip: String,
    /// Container directory in the depot.
    pub container_path: PathBuf,
    /// IDs of jobs that have not finished.
    pub job_ids: Vec<u32>,
    /// Memory accounting.
    pub memory_stat: MemoryStat,
    /// CPU accounting.
    pub cpu_stat: CpuStat,
    /// Disk usage.
    pub disk_stat: DiskStat,
    /// Bandwidth shaping.
    pub bandwidth_stat: BandwidthStat,
}
