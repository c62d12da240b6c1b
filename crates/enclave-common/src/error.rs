//! Unified error types for the Enclave workspace.
//!
//! Every layer (pools, resource-control accessors, job supervision,
//! containers, backend) reports failures through [`EnclaveError`].
//! External-process failures keep the program name and exit status so
//! callers see them unchanged.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ContainerState;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum EnclaveError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("unknown {kind}: {id}")]
    NotFound {
        /// Type of the missing resource (`handle`, `job`, ...).
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A pool has no free values left.
    #[error("{pool} pool is exhausted")]
    PoolExhausted {
        /// Name of the exhausted pool.
        pool: &'static str,
    },

    /// A pooled value could not be claimed because it is already in use.
    #[error("{kind} already acquired: {value}")]
    ResourceTaken {
        /// Type of the pooled resource.
        kind: &'static str,
        /// The contested value.
        value: String,
    },

    /// A container with the requested handle is already registered.
    #[error("handle already in use: {handle}")]
    HandleTaken {
        /// The duplicate handle.
        handle: String,
    },

    /// A container lifecycle transition was rejected.
    #[error("container {id} cannot move from {from} to {to}")]
    InvalidState {
        /// Container identifier.
        id: String,
        /// Current state.
        from: ContainerState,
        /// Requested state.
        to: ContainerState,
    },

    /// A request argument failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// An external helper or script could not be launched.
    #[error("failed to launch {program}: {source}")]
    CommandLaunch {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An external helper or script exited unsuccessfully.
    #[error("{program} exited with {}: {stderr}", describe_status(.status))]
    CommandFailed {
        /// Program that failed.
        program: String,
        /// Exit status, or `None` when terminated by a signal.
        status: Option<i32>,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// Output of an external tool could not be parsed.
    #[error("malformed {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// A container snapshot could not be saved.
    #[error("failed to save snapshot: {message}")]
    Snapshot {
        /// Description of the underlying failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl EnclaveError {
    /// Builds an [`EnclaveError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds an [`EnclaveError::Parse`] error.
    pub fn parse(what: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            what,
            message: message.into(),
        }
    }
}

fn describe_status(status: &Option<i32>) -> String {
    status.map_or_else(|| "signal".to_string(), |s| format!("status {s}"))
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EnclaveError>;
