//! Per-instance run environment.
//!
//! Every container launched for a run receives its `RunParams` serialised
//! into environment variables. The variable names and their order are part
//! of the runner's external contract and must stay stable across releases.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// In-container path where instance outputs must be written.
pub const OUTPUTS_MOUNT_PATH: &str = "/outputs";

/// An IPv4 subnet in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Subnet {
    pub const fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Subnet { addr, prefix_len }
    }

    fn range(&self) -> (u32, u32) {
        let base = u32::from(self.addr);
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        };
        let start = base & mask;
        (start, start | !mask)
    }

    /// Whether `ip` falls inside this subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let (start, end) = self.range();
        let ip = u32::from(ip);
        start <= ip && ip <= end
    }

    /// Whether two subnets share any address.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        let (a0, a1) = self.range();
        let (b0, b1) = other.range();
        a0 <= b1 && b0 <= a1
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// The environment handed to a single test instance.
///
/// A run builds one template shared by all instances (plan, case, run id,
/// totals, subnet) and specialises the group fields per group.
#[derive(Debug, Clone, Default)]
pub struct RunParams {
    pub test_plan: String,
    pub test_case: String,
    pub test_run: String,
    pub test_case_seq: usize,
    pub test_instance_count: usize,
    pub test_group_id: String,
    pub test_group_instance_count: usize,
    pub test_instance_params: BTreeMap<String, String>,
    pub test_sidecar: bool,
    pub test_outputs_path: String,
    pub test_subnet: Option<Subnet>,
}

impl RunParams {
    /// Serialise into `KEY=value` pairs for the container environment.
    ///
    /// Order is fixed; `TEST_INSTANCE_PARAMS` is pipe-separated `key=value`
    /// pairs in key order, so the serialised environment is identical for
    /// identical inputs.
    pub fn to_env_vars(&self) -> Vec<String> {
        let mut env = vec![
            format!("TEST_PLAN={}", self.test_plan),
            format!("TEST_CASE={}", self.test_case),
            format!("TEST_RUN={}", self.test_run),
            format!("TEST_CASE_SEQ={}", self.test_case_seq),
            format!("TEST_INSTANCE_COUNT={}", self.test_instance_count),
            format!("TEST_GROUP_ID={}", self.test_group_id),
            format!(
                "TEST_GROUP_INSTANCE_COUNT={}",
                self.test_group_instance_count
            ),
            format!(
                "TEST_INSTANCE_PARAMS={}",
                encode_params(&self.test_instance_params)
            ),
            format!("TEST_SIDECAR={}", self.test_sidecar),
            format!("TEST_OUTPUTS_PATH={}", self.test_outputs_path),
        ];
        if let Some(subnet) = &self.test_subnet {
            env.push(format!("TEST_SUBNET={subnet}"));
        }
        env
    }
}

fn encode_params(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunParams {
        let mut params = BTreeMap::new();
        params.insert("timeout_secs".to_string(), "30".to_string());
        params.insert("bucket_size".to_string(), "20".to_string());
        RunParams {
            test_plan: "dht".to_string(),
            test_case: "find-peers".to_string(),
            test_run: "run-1".to_string(),
            test_case_seq: 0,
            test_instance_count: 50,
            test_group_id: "bootstrappers".to_string(),
            test_group_instance_count: 5,
            test_instance_params: params,
            test_sidecar: true,
            test_outputs_path: OUTPUTS_MOUNT_PATH.to_string(),
            test_subnet: Some(Subnet::new(Ipv4Addr::new(16, 0, 0, 0), 16)),
        }
    }

    #[test]
    fn env_vars_are_stable_and_ordered() {
        let env = sample().to_env_vars();
        assert_eq!(
            env,
            vec![
                "TEST_PLAN=dht",
                "TEST_CASE=find-peers",
                "TEST_RUN=run-1",
                "TEST_CASE_SEQ=0",
                "TEST_INSTANCE_COUNT=50",
                "TEST_GROUP_ID=bootstrappers",
                "TEST_GROUP_INSTANCE_COUNT=5",
                "TEST_INSTANCE_PARAMS=bucket_size=20|timeout_secs=30",
                "TEST_SIDECAR=true",
                "TEST_OUTPUTS_PATH=/outputs",
                "TEST_SUBNET=16.0.0.0/16",
            ]
        );
    }

    #[test]
    fn subnet_omitted_until_known() {
        let mut params = sample();
        params.test_subnet = None;
        let env = params.to_env_vars();
        assert!(!env.iter().any(|e| e.starts_with("TEST_SUBNET=")));
    }

    #[test]
    fn params_encoding_is_sorted_by_key() {
        let mut params = BTreeMap::new();
        params.insert("zeta".to_string(), "1".to_string());
        params.insert("alpha".to_string(), "2".to_string());
        assert_eq!(encode_params(&params), "alpha=2|zeta=1");
        assert_eq!(encode_params(&BTreeMap::new()), "");
    }

    #[test]
    fn subnet_display_and_contains() {
        let subnet = Subnet::new(Ipv4Addr::new(16, 3, 0, 0), 16);
        assert_eq!(subnet.to_string(), "16.3.0.0/16");
        assert!(subnet.contains(Ipv4Addr::new(16, 3, 200, 9)));
        assert!(!subnet.contains(Ipv4Addr::new(16, 4, 0, 1)));
    }

    #[test]
    fn subnet_overlap_detection() {
        let a = Subnet::new(Ipv4Addr::new(16, 0, 0, 0), 16);
        let b = Subnet::new(Ipv4Addr::new(16, 0, 128, 0), 24);
        let c = Subnet::new(Ipv4Addr::new(16, 1, 0, 0), 16);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }
}
