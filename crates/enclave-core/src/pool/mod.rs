//! Pools of host resources handed out to containers.
//!
//! Every pool is FIFO: released values go to the back, so a value just
//! given up is the last to be reused.

pub mod network;

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use enclave_common::error::{EnclaveError, Result};

pub use network::{ContainerNetwork, NetworkPool};

/// Contiguous range of integers handed out first-in, first-out.
#[derive(Debug)]
pub struct RangePool {
    kind: &'static str,
    start: u32,
    size: u32,
    free: Mutex<VecDeque<u32>>,
}

/// Pool of user IDs.
pub type UidPool = RangePool;

/// Pool of host ports.
pub type PortPool = RangePool;

impl RangePool {
    fn new(kind: &'static str, start: u32, size: u32) -> Self {
        let end = start.saturating_add(size);
        Self {
            kind,
            start,
            size: end - start,
            free: Mutex::new((start..end).collect()),
        }
    }

    /// Pool of user IDs `start..start + size`.
    #[must_use]
    pub fn uids(start: u32, size: u32) -> Self {
        Self::new("uid", start, size)
    }

    /// Pool of ports `start..start + size`.
    #[must_use]
    pub fn ports(start: u32, size: u32) -> Self {
        Self::new("port", start, size)
    }

    /// Removes and returns the oldest free value.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::PoolExhausted`] when nothing is free.
    pub fn acquire(&self) -> Result<u32> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or(EnclaveError::PoolExhausted { pool: self.kind })
    }

    /// Returns a value to the pool.
    ///
    /// Values outside the range or already free are ignored.
    pub fn release(&self, value: u32) {
        if !self.contains(value) {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if !free.contains(&value) {
            free.push_back(value);
        }
    }

    /// Claims a specific value, as when restoring a container.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::ResourceTaken`] if the value is not free.
    pub fn remove(&self, value: u32) -> Result<()> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        match free.iter().position(|v| *v == value) {
            Some(idx) => {
                let _ = free.remove(idx);
                Ok(())
            }
            None => Err(EnclaveError::ResourceTaken {
                kind: self.kind,
                value: value.to_string(),
            }),
        }
    }

    /// First value of the range.
    #[must_use]
    pub const fn start(&self) -> u32 {
        self.start
    }

    /// Number of values the pool manages.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Number of values currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    const fn contains(&self, value: u32) -> bool {
        value >= self.start && value - self.start < self.size
    }
}
