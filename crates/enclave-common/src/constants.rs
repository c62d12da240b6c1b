//! System-wide constants and default paths.

/// `PATH` handed to lifecycle scripts, which run with a fixed environment.
pub const SCRIPT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default root of the per-subsystem cgroup mounts.
pub const DEFAULT_CGROUPS_PATH: &str = "/tmp/enclave/cgroup";

/// Default first UID handed to containers.
pub const DEFAULT_UID_POOL_START: u32 = 10_000;
/// Default number of container UIDs.
pub const DEFAULT_UID_POOL_SIZE: u32 = 256;

/// Default subnet carved into per-container `/30` blocks.
pub const DEFAULT_NETWORK_POOL: &str = "10.254.0.0/22";

/// Default first host port available for port mappings.
pub const DEFAULT_PORT_POOL_START: u32 = 61_000;
/// Default number of host ports available for port mappings.
pub const DEFAULT_PORT_POOL_SIZE: u32 = 6_501;

/// Prefix length of each container network block.
pub const CONTAINER_NETWORK_PREFIX: u8 = 30;
/// Netmask matching [`CONTAINER_NETWORK_PREFIX`].
pub const CONTAINER_NETMASK: &str = "255.255.255.252";

/// Size in bytes of one disk quota block.
pub const QUOTA_BLOCK_SIZE: u64 = 1024;

/// Unprivileged user jobs run as inside a container.
pub const CONTAINER_USER: &str = "vcap";
/// Privileged user jobs run as inside a container.
pub const CONTAINER_ROOT_USER: &str = "root";

/// MTU configured on the container's network interface.
pub const CONTAINER_IFACE_MTU: u32 = 1500;

/// Event recorded when the OOM notifier fires.
pub const OUT_OF_MEMORY_EVENT: &str = "out of memory";

/// Depot entry that is never treated as a container.
pub const DEPOT_TMP_DIR: &str = "tmp";

/// Application name used in logs and the daemon binary.
pub const APP_NAME: &str = "enclave";

/// Binary name for the daemon.
pub const BIN_NAME: &str = "enclaved";
