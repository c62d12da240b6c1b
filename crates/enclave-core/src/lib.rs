//! # enclave-core
//!
//! Building blocks underneath the container runtime:
//! - **Command runner**: the seam through which every lifecycle script and
//!   execution helper is launched, with a recording fake for tests.
//! - **Pools**: exclusive allocation of container UIDs, host ports, and
//!   `/30` network blocks.
//! - **Resource control**: typed access to cgroup values, disk quotas, and
//!   bandwidth shaping, plus parsers for the text those tools emit.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bandwidth;
pub mod cgroup;
pub mod command;
pub mod pool;
pub mod quota;
