//! Parsing of the memory subsystem's `memory.stat`.

use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::MemoryStat;

/// Parses `memory.stat` content.
///
/// Each line is `<key> <value>`. Unknown keys are skipped; keys that are
/// not reported stay zero.
///
/// # Errors
///
/// Returns [`EnclaveError::Parse`] if a known key carries a value that is
/// missing or not an unsigned integer.
pub fn parse_memory_stat(content: &str) -> Result<MemoryStat> {
    let mut stat = MemoryStat::default();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else {
            continue;
        };
        let Some(slot) = field_mut(&mut stat, key) else {
            continue;
        };
        let Some(raw) = fields.next() else {
            return Err(EnclaveError::parse("memory.stat", format!("{key}: missing value")));
        };
        *slot = raw
            .parse()
            .map_err(|_| EnclaveError::parse("memory.stat", format!("{key}: {raw:?}")))?;
    }
    Ok(stat)
}

fn field_mut<'a>(stat: &'a mut MemoryStat, key: &str) -> Option<&'a mut u64> {
    Some(match key {
        "cache" => &mut stat.cache,
        "rss" => &mut stat.rss,
        "mapped_file" => &mut stat.mapped_file,
        "pgpgin" => &mut stat.pgpgin,
        "pgpgout" => &mut stat.pgpgout,
        "swap" => &mut stat.swap,
        "pgfault" => &mut stat.pgfault,
        "pgmajfault" => &mut stat.pgmajfault,
        "inactive_anon" => &mut stat.inactive_anon,
        "active_anon" => &mut stat.active_anon,
        "inactive_file" => &mut stat.inactive_file,
        "active_file" => &mut stat.active_file,
        "unevictable" => &mut stat.unevictable,
        "hierarchical_memory_limit" => &mut stat.hierarchical_memory_limit,
        "hierarchical_memsw_limit" => &mut stat.hierarchical_memsw_limit,
        "total_cache" => &mut stat.total_cache,
        "total_rss" => &mut stat.total_rss,
        "total_mapped_file" => &mut stat.total_mapped_file,
        "total_pgpgin" => &mut stat.total_pgpgin,
        "total_pgpgout" => &mut stat.total_pgpgout,
        "total_swap" => &mut stat.total_swap,
        "total_pgfault" => &mut stat.total_pgfault,
        "total_pgmajfault" => &mut stat.total_pgmajfault,
        "total_inactive_anon" => &mut stat.total_inactive_anon,
        "total_active_anon" => &mut stat.total_active_anon,
        "total_inactive_file" => &mut stat.total_inactive_file,
        "total_active_file" => &mut stat.total_active_file,
        "total_unevictable" => &mut stat.total_unevictable,
        _ => return None,
    })
}
