//! Recording cgroups manager for tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use enclave_common::error::{EnclaveError, Result};

use super::CgroupsManager;

/// One recorded `set` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetValue {
    /// Subsystem written to.
    pub subsystem: String,
    /// Entry name.
    pub name: String,
    /// Value written.
    pub value: String,
}

/// In-memory [`CgroupsManager`].
///
/// Writes are recorded in order and become visible to `get`. Specific
/// entries can be made to fail on write.
#[derive(Debug, Default)]
pub struct FakeCgroupsManager {
    root: PathBuf,
    set_values: Mutex<Vec<SetValue>>,
    values: Mutex<HashMap<(String, String), String>>,
    failing: Mutex<HashSet<(String, String)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(subsystem: &str, name: &str) -> (String, String) {
    (subsystem.to_string(), name.to_string())
}

impl FakeCgroupsManager {
    /// Creates a manager whose subsystem paths live under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Seeds the value returned by `get`.
    pub fn when_getting(&self, subsystem: &str, name: &str, value: impl Into<String>) {
        let _ = lock(&self.values).insert(key(subsystem, name), value.into());
    }

    /// Makes every `set` of the entry fail.
    pub fn fail_set(&self, subsystem: &str, name: &str) {
        let _ = lock(&self.failing).insert(key(subsystem, name));
    }

    /// Every successful `set`, in order.
    #[must_use]
    pub fn set_values(&self) -> Vec<SetValue> {
        lock(&self.set_values).clone()
    }
}

impl CgroupsManager for FakeCgroupsManager {
    fn set(&self, subsystem: &str, name: &str, value: &str) -> Result<()> {
        if lock(&self.failing).contains(&key(subsystem, name)) {
            return Err(EnclaveError::io(
                self.subsystem_path(subsystem).join(name),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "write rejected"),
            ));
        }
        lock(&self.set_values).push(SetValue {
            subsystem: subsystem.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
        let _ = lock(&self.values).insert(key(subsystem, name), value.to_string());
        Ok(())
    }

    fn get(&self, subsystem: &str, name: &str) -> Result<String> {
        lock(&self.values)
            .get(&key(subsystem, name))
            .cloned()
            .ok_or_else(|| {
                EnclaveError::io(
                    self.subsystem_path(subsystem).join(name),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                )
            })
    }

    fn subsystem_path(&self, subsystem: &str) -> PathBuf {
        self.root.join(subsystem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_writes_and_serves_reads() {
        let fake = FakeCgroupsManager::new("/cg");
        fake.set("cpu", "cpu.shares", "512").unwrap();
        assert_eq!(fake.get("cpu", "cpu.shares").unwrap(), "512");
        assert_eq!(fake.set_values().len(), 1);
    }

    #[test]
    fn failing_entries_are_not_recorded() {
        let fake = FakeCgroupsManager::new("/cg");
        fake.fail_set("memory", "memory.memsw.limit_in_bytes");
        assert!(fake.set("memory", "memory.memsw.limit_in_bytes", "1").is_err());
        assert!(fake.set_values().is_empty());
    }
}
