//! Container supervision for the Enclave daemon.
//!
//! A [`backend::Backend`] owns the handle-keyed registry of live
//! containers and persists them across restarts. Containers are built and
//! torn down by a [`container_pool::ContainerPool`]; each one supervises
//! its jobs through a [`job::JobTracker`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod container_pool;
pub mod job;
pub mod snapshot;
