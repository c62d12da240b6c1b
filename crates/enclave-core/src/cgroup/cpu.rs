//! Parsing of the cpuacct subsystem's usage counters.

use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::CpuStat;

/// Builds a [`CpuStat`] from `cpuacct.usage` and `cpuacct.stat`.
///
/// `cpuacct.stat` holds `user <ticks>` and `system <ticks>` lines; either
/// may be missing, in which case it is zero.
///
/// # Errors
///
/// Returns [`EnclaveError::Parse`] if the usage or a present tick count
/// is not an unsigned integer.
pub fn parse_cpu_stat(usage: &str, stat: &str) -> Result<CpuStat> {
    let usage = usage
        .trim()
        .parse()
        .map_err(|_| EnclaveError::parse("cpuacct.usage", format!("{:?}", usage.trim())))?;

    let mut cpu = CpuStat {
        usage,
        ..CpuStat::default()
    };
    for line in stat.lines() {
        let mut fields = line.split_whitespace();
        let slot = match fields.next() {
            Some("user") => &mut cpu.user,
            Some("system") => &mut cpu.system,
            _ => continue,
        };
        let raw = fields.next().unwrap_or_default();
        *slot = raw
            .parse()
            .map_err(|_| EnclaveError::parse("cpuacct.stat", format!("{line:?}")))?;
    }
    Ok(cpu)
}
