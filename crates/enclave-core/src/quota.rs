//! Per-user disk quotas on the depot filesystem.
//!
//! Limits are applied with `setquota` and read back through the
//! `repquota` helper shipped in `<root>/bin`, which prints one line of
//! eight integer columns for a user:
//!
//! ```text
//! <uid> <blocks used> <block soft> <block hard> <block grace> <inodes used> <inode soft> <inode hard>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use enclave_common::constants::QUOTA_BLOCK_SIZE;
use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::{DiskLimits, DiskStat};

use crate::command::{CommandRunner, HelperCommand};

/// Disk quota operations keyed by container UID.
pub trait QuotaManager: Send + Sync {
    /// Applies limits for `uid`.
    ///
    /// # Errors
    ///
    /// Returns the `setquota` failure.
    fn set_limits(&self, uid: u32, limits: DiskLimits) -> Result<()>;

    /// Reads the limits in force for `uid`.
    ///
    /// # Errors
    ///
    /// Returns the helper failure or a parse error.
    fn get_limits(&self, uid: u32) -> Result<DiskLimits>;

    /// Reads current usage for `uid`.
    ///
    /// # Errors
    ///
    /// Returns the helper failure or a parse error.
    fn get_usage(&self, uid: u32) -> Result<DiskStat>;

    /// Filesystem mount point the quotas apply to.
    fn mount_point(&self) -> &Path;

    /// Turns every operation into a no-op.
    fn disable(&self);

    /// Whether quotas are enforced.
    fn is_enabled(&self) -> bool;
}

/// Quota manager that shells out to the host quota tools.
pub struct LinuxQuotaManager {
    enabled: AtomicBool,
    root_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    mount_point: PathBuf,
}

impl LinuxQuotaManager {
    /// Discovers the mount point holding `depot_path` with `df -P` and
    /// builds an enabled manager.
    ///
    /// # Errors
    ///
    /// Returns the `df` failure, or a parse error if it prints nothing.
    pub fn new(
        depot_path: &Path,
        root_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let out = runner.run(
            &HelperCommand::new("df")
                .arg("-P")
                .arg(depot_path.display().to_string()),
        )?;
        let stdout = out.stdout_lossy();
        let mount_point = stdout
            .split_whitespace()
            .last()
            .ok_or_else(|| EnclaveError::parse("df output", "empty"))?;
        tracing::debug!(mount_point, "quota mount point discovered");
        Ok(Self::with_mount_point(mount_point, root_path, runner))
    }

    /// Builds an enabled manager for a known mount point.
    pub fn with_mount_point(
        mount_point: impl Into<PathBuf>,
        root_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            root_path: root_path.into(),
            runner,
            mount_point: mount_point.into(),
        }
    }

    fn repquota(&self, uid: u32) -> Result<Option<[u64; 8]>> {
        let out = self.runner.run(
            &HelperCommand::new(self.root_path.join("bin").join("repquota"))
                .arg(self.mount_point.display().to_string())
                .arg(uid.to_string()),
        )?;
        parse_repquota(&out.stdout_lossy())
    }
}

/// Converts a byte limit to whole quota blocks, rounding up.
const fn bytes_to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(QUOTA_BLOCK_SIZE)
}

/// Parses the first line of `repquota` output into its eight columns.
/// Empty output means the user has no quota entry.
fn parse_repquota(output: &str) -> Result<Option<[u64; 8]>> {
    let Some(line) = output.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Ok(None);
    };
    let mut columns = [0u64; 8];
    let mut fields = line.split_whitespace();
    for (idx, slot) in columns.iter_mut().enumerate() {
        let raw = fields
            .next()
            .ok_or_else(|| EnclaveError::parse("repquota output", format!("missing column {}", idx + 1)))?;
        *slot = raw
            .parse()
            .map_err(|_| EnclaveError::parse("repquota output", format!("column {}: {raw:?}", idx + 1)))?;
    }
    Ok(Some(columns))
}

impl QuotaManager for LinuxQuotaManager {
    fn set_limits(&self, uid: u32, mut limits: DiskLimits) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if limits.byte_soft != 0 {
            limits.block_soft = bytes_to_blocks(limits.byte_soft);
        }
        if limits.byte_hard != 0 {
            limits.block_hard = bytes_to_blocks(limits.byte_hard);
        }

        let _ = self.runner.run(
            &HelperCommand::new("setquota").arg("-u").args([
                uid.to_string(),
                limits.block_soft.to_string(),
                limits.block_hard.to_string(),
                limits.inode_soft.to_string(),
                limits.inode_hard.to_string(),
                self.mount_point.display().to_string(),
            ]),
        )?;
        tracing::debug!(uid, block_soft = limits.block_soft, block_hard = limits.block_hard, "disk quota set");
        Ok(())
    }

    fn get_limits(&self, uid: u32) -> Result<DiskLimits> {
        if !self.is_enabled() {
            return Ok(DiskLimits::default());
        }
        Ok(self
            .repquota(uid)?
            .map(|c| DiskLimits {
                block_soft: c[2],
                block_hard: c[3],
                inode_soft: c[6],
                inode_hard: c[7],
                ..DiskLimits::default()
            })
            .unwrap_or_default())
    }

    fn get_usage(&self, uid: u32) -> Result<DiskStat> {
        if !self.is_enabled() {
            return Ok(DiskStat::default());
        }
        Ok(self
            .repquota(uid)?
            .map(|c| DiskStat {
                bytes_used: c[1],
                inodes_used: c[5],
            })
            .unwrap_or_default())
    }

    fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::fake::FakeCommandRunner;

    fn manager(runner: &FakeCommandRunner) -> LinuxQuotaManager {
        LinuxQuotaManager::with_mount_point("/depot-mount", "/root", Arc::new(runner.clone()))
    }

    #[test]
    fn discovers_mount_point_from_df() {
        let runner = FakeCommandRunner::new();
        runner.when_running("df", |p| {
            p.write_stdout(
                "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                 /dev/sda1 100 50 50 50% /var\n",
            );
            Some(0)
        });
        let mgr = LinuxQuotaManager::new(Path::new("/var/depot"), "/root", Arc::new(runner.clone()))
            .unwrap();
        assert_eq!(mgr.mount_point(), Path::new("/var"));
        assert_eq!(runner.executed()[0].get_args(), ["-P", "/var/depot"]);
    }

    #[test]
    fn set_limits_converts_bytes_to_blocks() {
        let runner = FakeCommandRunner::new();
        let mgr = manager(&runner);
        mgr.set_limits(
            1234,
            DiskLimits {
                block_soft: 1,
                block_hard: 2,
                inode_soft: 11,
                inode_hard: 12,
                byte_soft: 1025,
                byte_hard: 2048,
            },
        )
        .unwrap();

        let cmd = &runner.executed()[0];
        assert_eq!(cmd.program(), Path::new("setquota"));
        assert_eq!(
            cmd.get_args(),
            ["-u", "1234", "2", "2", "11", "12", "/depot-mount"]
        );
    }

    #[test]
    fn block_limits_pass_through_without_byte_limits() {
        let runner = FakeCommandRunner::new();
        let mgr = manager(&runner);
        mgr.set_limits(
            1,
            DiskLimits {
                block_soft: 5,
                block_hard: 6,
                ..DiskLimits::default()
            },
        )
        .unwrap();
        assert_eq!(
            runner.executed()[0].get_args(),
            ["-u", "1", "5", "6", "0", "0", "/depot-mount"]
        );
    }

    #[test]
    fn set_limits_propagates_failure() {
        let runner = FakeCommandRunner::new();
        runner.when_running("setquota", |_| Some(1));
        let mgr = manager(&runner);
        assert!(matches!(
            mgr.set_limits(1, DiskLimits::default()),
            Err(EnclaveError::CommandFailed { .. })
        ));
    }

    #[test]
    fn reads_limits_and_usage_from_repquota() {
        let runner = FakeCommandRunner::new();
        runner.when_running("/root/bin/repquota", |p| {
            assert_eq!(p.command().get_args(), ["/depot-mount", "1234"]);
            p.write_stdout("1234 111 222 333 444 555 666 777\n");
            Some(0)
        });
        let mgr = manager(&runner);

        let limits = mgr.get_limits(1234).unwrap();
        assert_eq!(limits.block_soft, 222);
        assert_eq!(limits.block_hard, 333);
        assert_eq!(limits.inode_soft, 666);
        assert_eq!(limits.inode_hard, 777);

        let usage = mgr.get_usage(1234).unwrap();
        assert_eq!(
            usage,
            DiskStat {
                bytes_used: 111,
                inodes_used: 555
            }
        );
    }

    #[test]
    fn empty_repquota_output_is_zero() {
        let runner = FakeCommandRunner::new();
        let mgr = manager(&runner);
        assert_eq!(mgr.get_usage(1).unwrap(), DiskStat::default());
    }

    #[test]
    fn malformed_repquota_output_is_an_error() {
        let runner = FakeCommandRunner::new();
        runner.when_running("repquota", |p| {
            p.write_stdout("1234 abc\n");
            Some(0)
        });
        let mgr = manager(&runner);
        assert!(matches!(mgr.get_limits(1), Err(EnclaveError::Parse { .. })));
    }

    #[test]
    fn disabled_manager_does_nothing() {
        let runner = FakeCommandRunner::new();
        let mgr = manager(&runner);
        mgr.disable();
        assert!(!mgr.is_enabled());
        mgr.set_limits(1, DiskLimits::default()).unwrap();
        assert_eq!(mgr.get_limits(1).unwrap(), DiskLimits::default());
        assert!(runner.executed().is_empty());
    }
}
