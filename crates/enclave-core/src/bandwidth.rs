//! Network bandwidth shaping for a container.
//!
//! Shaping is applied by the container's `net_rate.sh` script and read
//! back from the traffic-control listings `net.sh` prints. Egress shaping
//! shows up as a token-bucket qdisc:
//!
//! ```text
//! qdisc tbf 8010: root refcnt 2 rate 8192bit burst 64Kb lat 24.4ms
//! ```
//!
//! and ingress policing as a filter action:
//!
//! ```text
//!  police 0x10 rate 8192bit burst 64Kb mtu 2Kb action drop overhead 0b
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::{BandwidthLimits, BandwidthStat};

use crate::command::{CommandRunner, HelperCommand};

/// Bandwidth limits of one container.
pub trait BandwidthManager: Send + Sync {
    /// Applies rate and burst limits.
    ///
    /// # Errors
    ///
    /// Returns the script failure.
    fn set_limits(&self, limits: BandwidthLimits) -> Result<()>;

    /// Reads the shaping currently in force.
    ///
    /// # Errors
    ///
    /// Returns the script failure, or a parse error for a malformed
    /// rate or burst value.
    fn get_limits(&self) -> Result<BandwidthStat>;
}

/// Bandwidth manager driving the container's network scripts.
pub struct ContainerBandwidthManager {
    container_path: PathBuf,
    container_id: String,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerBandwidthManager {
    /// Creates a manager for the container at `container_path`.
    pub fn new(
        container_path: impl Into<PathBuf>,
        container_id: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            container_path: container_path.into(),
            container_id: container_id.into(),
            runner,
        }
    }

    fn net_info(&self, action: &str) -> Result<String> {
        let out = self.runner.run(
            &HelperCommand::new(self.container_path.join("net.sh"))
                .arg(action)
                .env("ID", &self.container_id),
        )?;
        let mut text = out.stdout_lossy();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(text)
    }
}

impl BandwidthManager for ContainerBandwidthManager {
    fn set_limits(&self, limits: BandwidthLimits) -> Result<()> {
        let _ = self.runner.run(
            &HelperCommand::new(self.container_path.join("net_rate.sh"))
                .env("BURST", limits.burst_rate_in_bytes_per_second.to_string())
                .env("RATE", limits.rate_in_bytes_per_second.saturating_mul(8).to_string()),
        )?;
        tracing::debug!(
            id = %self.container_id,
            rate = limits.rate_in_bytes_per_second,
            burst = limits.burst_rate_in_bytes_per_second,
            "bandwidth limits set"
        );
        Ok(())
    }

    fn get_limits(&self) -> Result<BandwidthStat> {
        let mut stat = BandwidthStat::default();

        let egress = self.net_info("get_egress_info")?;
        if let Some((rate, burst)) = parse_shaping(&egress, is_tbf_line)? {
            stat.in_rate = rate;
            stat.in_burst = burst;
        }

        let ingress = self.net_info("get_ingress_info")?;
        if let Some((rate, burst)) = parse_shaping(&ingress, is_police_line)? {
            stat.out_rate = rate;
            stat.out_burst = burst;
        }

        Ok(stat)
    }
}

fn is_tbf_line(tokens: &[&str]) -> bool {
    matches!(tokens, ["qdisc", "tbf", ..])
}

fn is_police_line(tokens: &[&str]) -> bool {
    matches!(tokens, ["police", ..])
}

/// Finds the first line accepted by `select` and returns its rate in
/// bytes per second and its burst in bytes. `None` when no line matches.
fn parse_shaping(output: &str, select: fn(&[&str]) -> bool) -> Result<Option<(u64, u64)>> {
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if !select(&tokens) {
            continue;
        }
        let rate = value_after(&tokens, "rate")
            .ok_or_else(|| EnclaveError::parse("traffic control rate", line.trim().to_string()))?;
        let burst = value_after(&tokens, "burst")
            .ok_or_else(|| EnclaveError::parse("traffic control burst", line.trim().to_string()))?;
        let rate = parse_quantity(rate, "bit")?;
        let burst = parse_quantity(burst, "b")?;
        return Ok(Some((rate / 8, burst)));
    }
    Ok(None)
}

fn value_after<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == key)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

/// Parses values like `8192bit`, `64Kb` or `2Mbit`. Unit prefixes are
/// binary multiples.
fn parse_quantity(raw: &str, suffix: &str) -> Result<u64> {
    let malformed = || EnclaveError::parse("traffic control value", raw.to_string());
    let body = raw.strip_suffix(suffix).ok_or_else(malformed)?;
    let (digits, multiplier) = match body.as_bytes().last() {
        Some(b'K') => (&body[..body.len() - 1], 1u64 << 10),
        Some(b'M') => (&body[..body.len() - 1], 1 << 20),
        Some(b'G') => (&body[..body.len() - 1], 1 << 30),
        _ => (body, 1),
    };
    let n: u64 = digits.parse().map_err(|_| malformed())?;
    n.checked_mul(multiplier).ok_or_else(malformed)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::command::fake::FakeCommandRunner;

    const EGRESS: &str = "qdisc tbf 8010: root refcnt 2 rate 8192bit burst 64Kb lat 24.4ms\n\
        qdisc ingress ffff: parent ffff:fff1 ----------------\n";
    const INGRESS: &str = "filter parent ffff: protocol ip pref 1 u32\n\
        filter parent ffff: protocol ip pref 1 u32 fh 800: ht divisor 1\n \
        police 0x10 rate 8192bit burst 64Kb mtu 2Kb action drop overhead 0b\n";

    fn manager(runner: &FakeCommandRunner) -> ContainerBandwidthManager {
        ContainerBandwidthManager::new("/depot/some-id", "some-id", Arc::new(runner.clone()))
    }

    fn script_net_info(runner: &FakeCommandRunner, egress: &'static str, ingress: &'static str) {
        runner.when_running("net.sh", move |p| {
            assert_eq!(p.command().env_value("ID"), Some("some-id"));
            match p.command().get_args().first().map(String::as_str) {
                Some("get_egress_info") => p.write_stdout(egress),
                Some("get_ingress_info") => p.write_stdout(ingress),
                other => panic!("unexpected net.sh action {other:?}"),
            }
            Some(0)
        });
    }

    #[test]
    fn set_limits_runs_net_rate_with_bits() {
        let runner = FakeCommandRunner::new();
        manager(&runner)
            .set_limits(BandwidthLimits {
                rate_in_bytes_per_second: 128,
                burst_rate_in_bytes_per_second: 256,
            })
            .unwrap();

        let cmd = &runner.executed()[0];
        assert_eq!(cmd.program(), Path::new("/depot/some-id/net_rate.sh"));
        assert_eq!(cmd.env_value("BURST"), Some("256"));
        assert_eq!(cmd.env_value("RATE"), Some("1024"));
    }

    #[test]
    fn set_limits_propagates_failure() {
        let runner = FakeCommandRunner::new();
        runner.when_running("net_rate.sh", |_| Some(1));
        assert!(manager(&runner).set_limits(BandwidthLimits::default()).is_err());
    }

    #[test]
    fn get_limits_parses_both_directions() {
        let runner = FakeCommandRunner::new();
        script_net_info(&runner, EGRESS, INGRESS);
        let stat = manager(&runner).get_limits().unwrap();
        assert_eq!(
            stat,
            BandwidthStat {
                in_rate: 1024,
                in_burst: 65_536,
                out_rate: 1024,
                out_burst: 65_536,
            }
        );
    }

    #[test]
    fn missing_shaping_reads_as_zero() {
        let runner = FakeCommandRunner::new();
        script_net_info(
            &runner,
            "qdisc pfifo_fast 0: root refcnt 2 bands 3\n",
            INGRESS,
        );
        let stat = manager(&runner).get_limits().unwrap();
        assert_eq!(stat.in_rate, 0);
        assert_eq!(stat.in_burst, 0);
        assert_eq!(stat.out_rate, 1024);
    }

    #[test]
    fn malformed_rate_is_an_error() {
        let runner = FakeCommandRunner::new();
        script_net_info(&runner, "qdisc tbf 1: root refcnt 2 rate fastbit burst 1b\n", "");
        assert!(matches!(
            manager(&runner).get_limits(),
            Err(EnclaveError::Parse { .. })
        ));
    }

    #[test]
    fn unit_prefixes_are_binary() {
        assert_eq!(parse_quantity("2Mbit", "bit").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_quantity("1Gb", "b").unwrap(), 1 << 30);
        assert_eq!(parse_quantity("7b", "b").unwrap(), 7);
    }
}
