//! Pool of `/30` subnet blocks, one per container.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use enclave_common::constants::{CONTAINER_NETMASK, CONTAINER_NETWORK_PREFIX};
use enclave_common::error::{EnclaveError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// A container's point-to-point link: network address, host side
/// (`+1`) and container side (`+2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerNetwork(Ipv4Network);

impl ContainerNetwork {
    /// Wraps the `/30` block starting at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::InvalidArgument`] if `base` is not aligned
    /// to a `/30` boundary.
    pub fn new(base: Ipv4Addr) -> Result<Self> {
        let net = Ipv4Network::new(base, CONTAINER_NETWORK_PREFIX).map_err(|e| {
            EnclaveError::InvalidArgument {
                message: e.to_string(),
            }
        })?;
        if net.network() != base {
            return Err(EnclaveError::InvalidArgument {
                message: format!("{base} is not a /{CONTAINER_NETWORK_PREFIX} boundary"),
            });
        }
        Ok(Self(net))
    }

    /// First address of the block.
    #[must_use]
    pub fn ip(&self) -> Ipv4Addr {
        self.0.network()
    }

    /// Address of the host end of the link.
    #[must_use]
    pub fn host_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip()) + 1)
    }

    /// Address of the container end of the link.
    #[must_use]
    pub fn container_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip()) + 2)
    }

    /// Netmask of the block in dotted form.
    #[must_use]
    pub const fn netmask(&self) -> &'static str {
        CONTAINER_NETMASK
    }
}

impl fmt::Display for ContainerNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerNetwork {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self> {
        let net: Ipv4Network = s
            .parse()
            .map_err(|e: ipnetwork::IpNetworkError| EnclaveError::parse("network", e.to_string()))?;
        Self::new(net.ip())
    }
}

/// Hands out consecutive `/30` blocks of a larger network.
#[derive(Debug)]
pub struct NetworkPool {
    network: Ipv4Network,
    free: Mutex<VecDeque<ContainerNetwork>>,
}

impl NetworkPool {
    /// Builds a pool over every `/30` block of `network`, in address order.
    #[must_use]
    pub fn new(network: Ipv4Network) -> Self {
        let start = u32::from(network.network());
        let free = (0u32..)
            .map_while(|i| i.checked_mul(4).and_then(|off| start.checked_add(off)))
            .map(Ipv4Addr::from)
            .take_while(|addr| network.contains(*addr))
            .filter_map(|addr| ContainerNetwork::new(addr).ok())
            .collect();
        Self {
            network,
            free: Mutex::new(free),
        }
    }

    /// Parses a CIDR string such as `10.254.0.0/22` and builds a pool.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::Config`] if the CIDR is invalid.
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let network: Ipv4Network = cidr.parse().map_err(|e: ipnetwork::IpNetworkError| {
            EnclaveError::Config {
                message: format!("invalid network pool {cidr}: {e}"),
            }
        })?;
        Ok(Self::new(network))
    }

    /// The network the pool carves blocks from.
    #[must_use]
    pub const fn network(&self) -> Ipv4Network {
        self.network
    }

    /// Takes the oldest free block.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::PoolExhausted`] when nothing is free.
    pub fn acquire(&self) -> Result<ContainerNetwork> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or(EnclaveError::PoolExhausted { pool: "network" })
    }

    /// Returns a block to the pool. Foreign or already-free blocks are
    /// ignored.
    pub fn release(&self, block: ContainerNetwork) {
        if !self.network.contains(block.ip()) {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if !free.contains(&block) {
            free.push_back(block);
        }
    }

    /// Claims a specific block.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::ResourceTaken`] if the block is not free.
    pub fn remove(&self, block: ContainerNetwork) -> Result<()> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        match free.iter().position(|b| *b == block) {
            Some(idx) => {
                let _ = free.remove(idx);
                Ok(())
            }
            None => Err(EnclaveError::ResourceTaken {
                kind: "network",
                value: block.to_string(),
            }),
        }
    }

    /// Number of blocks currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> NetworkPool {
        NetworkPool::from_cidr(cidr).unwrap()
    }

    #[test]
    fn slash_22_yields_256_blocks() {
        assert_eq!(pool("10.254.0.0/22").available(), 256);
    }

    #[test]
    fn slash_32_yields_single_block() {
        assert_eq!(pool("10.0.0.0/32").available(), 1);
    }

    #[test]
    fn blocks_come_out_in_address_order() {
        let p = pool("10.254.0.0/29");
        let first = p.acquire().unwrap();
        let second = p.acquire().unwrap();
        assert_eq!(first.to_string(), "10.254.0.0/30");
        assert_eq!(second.to_string(), "10.254.0.4/30");
        assert!(matches!(
            p.acquire(),
            Err(EnclaveError::PoolExhausted { pool: "network" })
        ));
    }

    #[test]
    fn host_and_container_addresses() {
        let net: ContainerNetwork = "10.254.0.8/30".parse().unwrap();
        assert_eq!(net.host_ip(), Ipv4Addr::new(10, 254, 0, 9));
        assert_eq!(net.container_ip(), Ipv4Addr::new(10, 254, 0, 10));
        assert_eq!(net.netmask(), "255.255.255.252");
    }

    #[test]
    fn release_then_remove() {
        let p = pool("10.254.0.0/29");
        let a = p.acquire().unwrap();
        assert!(p.remove(a).is_err());
        p.release(a);
        p.release(a);
        assert_eq!(p.available(), 2);
        p.remove(a).unwrap();
        assert_eq!(p.available(), 1);
    }

    #[test]
    fn foreign_blocks_are_ignored_on_release() {
        let p = pool("10.254.0.0/30");
        let outside: ContainerNetwork = "192.168.0.0/30".parse().unwrap();
        p.release(outside);
        assert_eq!(p.available(), 1);
    }

    #[test]
    fn unaligned_block_is_rejected() {
        assert!(ContainerNetwork::new(Ipv4Addr::new(10, 0, 0, 1)).is_err());
    }

    #[test]
    fn serializes_as_cidr_string() {
        let net: ContainerNetwork = "10.254.0.4/30".parse().unwrap();
        assert_eq!(serde_json::to_string(&net).unwrap(), r#""10.254.0.4/30""#);
    }
}
