//! On-disk record of a container, used to survive daemon restarts.

use std::io::{Read, Write};
use std::time::Duration;

use enclave_common::error::Result;
use enclave_common::types::{BandwidthLimits, ContainerState, CpuLimits, DiskLimits, MemoryLimits};
use enclave_core::pool::ContainerNetwork;
use serde::{Deserialize, Serialize};

/// Everything needed to rebuild a container after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSnapshot {
    /// Internal container ID.
    #[serde(rename = "ID")]
    pub id: String,
    /// Client-facing handle.
    pub handle: String,
    /// Grace time, stored as nanoseconds.
    #[serde(with = "duration_nanos")]
    pub grace_time: Duration,
    /// Lifecycle state at snapshot time.
    pub state: ContainerState,
    /// Events recorded so far.
    pub events: Vec<String>,
    /// Limits that were successfully applied.
    pub limits: LimitsSnapshot,
    /// Pool allocations held by the container.
    pub resources: ResourcesSnapshot,
    /// Inbound port mappings, in the order they were applied.
    pub net_ins: Vec<NetInSpec>,
    /// Outbound rules, in the order they were applied.
    pub net_outs: Vec<NetOutSpec>,
    /// Jobs that had not completed.
    pub jobs: Vec<JobSnapshot>,
}

impl ContainerSnapshot {
    /// Decodes a snapshot document.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::Serialization`](enclave_common::error::EnclaveError::Serialization)
    /// for malformed JSON.
    pub fn read_from(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Encodes the snapshot as one JSON document followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns a serialization or write error.
    pub fn write_to(&self, mut writer: impl Write) -> Result<()> {
        serde_json::to_writer(&mut writer, self)?;
        writer
            .write_all(b"\n")
            .map_err(|e| enclave_common::error::EnclaveError::Snapshot {
                message: e.to_string(),
            })
    }
}

/// Applied limits; each is absent until first set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[allow(missing_docs)]
pub struct LimitsSnapshot {
    pub memory: Option<MemoryLimits>,
    pub disk: Option<DiskLimits>,
    pub bandwidth: Option<BandwidthLimits>,
    #[serde(rename = "CPU")]
    pub cpu: Option<CpuLimits>,
}

/// Pool allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourcesSnapshot {
    /// Container user ID.
    #[serde(rename = "UID")]
    pub uid: u32,
    /// Container network block, as CIDR.
    pub network: ContainerNetwork,
    /// Host ports acquired from the port pool.
    pub ports: Vec<u32>,
}

/// An applied inbound port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetInSpec {
    /// Port on the host.
    pub host_port: u32,
    /// Port inside the container.
    pub container_port: u32,
}

/// An applied outbound rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetOutSpec {
    /// Destination network; may be empty when a port is given.
    pub network: String,
    /// Destination port; zero means any.
    pub port: u32,
}

/// A job still running at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobSnapshot {
    /// Job ID.
    #[serde(rename = "ID")]
    pub id: u32,
    /// Whether the job's output is discarded.
    pub discard_output: bool,
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContainerSnapshot {
        ContainerSnapshot {
            id: "some-id".into(),
            handle: "some-handle".into(),
            grace_time: Duration::from_secs(1),
            state: ContainerState::Active,
            events: vec!["out of memory".into()],
            limits: LimitsSnapshot {
                memory: Some(MemoryLimits { limit_in_bytes: 1024 }),
                ..LimitsSnapshot::default()
            },
            resources: ResourcesSnapshot {
                uid: 10_000,
                network: "10.254.0.0/30".parse().unwrap(),
                ports: vec![61_000],
            },
            net_ins: vec![NetInSpec {
                host_port: 1,
                container_port: 2,
            }],
            net_outs: vec![NetOutSpec {
                network: "1.2.3.4/30".into(),
                port: 12,
            }],
            jobs: vec![JobSnapshot {
                id: 0,
                discard_output: true,
            }],
        }
    }

    #[test]
    fn uses_document_field_names() {
        let json: serde_json::Value = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["ID"], "some-id");
        assert_eq!(json["GraceTime"], 1_000_000_000u64);
        assert_eq!(json["State"], "active");
        assert_eq!(json["Limits"]["Memory"]["LimitInBytes"], 1024);
        assert!(json["Limits"]["CPU"].is_null());
        assert_eq!(json["Resources"]["UID"], 10_000);
        assert_eq!(json["Resources"]["Network"], "10.254.0.0/30");
        assert_eq!(json["NetIns"][0]["HostPort"], 1);
        assert_eq!(json["NetOuts"][0]["Network"], "1.2.3.4/30");
        assert_eq!(json["Jobs"][0]["DiscardOutput"], true);
    }

    #[test]
    fn write_then_read_preserves_snapshot() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf).unwrap();
        assert_eq!(ContainerSnapshot::read_from(buf.as_slice()).unwrap(), sample());
    }

    #[test]
    fn malformed_document_is_rejected() {
        assert!(ContainerSnapshot::read_from(&b"{\"ID\":"[..]).is_err());
    }
}
