//! URL check configuration and probe outcome records.

pub mod probe;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::node::Node;

/// Configuration for one HTTP probe, with its pass conditions and alerting
/// wiring. Loaded once from the `urls` section; immutable afterwards. `name`
/// is the stable identifier shared across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Check {
    /// The URL to probe.
    pub url: String,
    /// Stable cross-node identifier for this check.
    pub name: String,
    /// HTTP status codes counted as success.
    #[serde(rename = "ok-statuses")]
    pub ok_status: Vec<u16>,
    /// Minimum acceptable fleet-wide pass percentage.
    #[serde(rename = "alert-below")]
    pub alert_threshold: u8,
    /// Minimum seconds between alerts for this check.
    #[serde(rename = "alert-interval")]
    pub alert_interval: u64,
    /// Desired seconds between probes. Carried in configuration but not yet
    /// consulted by the probe loop, which relaunches on a fixed gate.
    #[serde(rename = "test-interval")]
    pub test_interval: u64,
    /// Names of the contacts to alert, in order.
    pub contacts: Vec<String>,
}

/// Finds a check by its stable name.
pub fn by_name<'a>(checks: &'a [Check], name: &str) -> Option<&'a Check> {
    checks.iter().find(|check| check.name == name)
}

/// Outcome of one probe of one check by one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The probing node.
    pub node: Node,
    /// The check that was probed.
    pub check: Check,
    /// Milliseconds from request start to response (or error).
    pub rtime: u64,
    /// HTTP status code, or 0 when the transport failed before a response.
    pub status_code: u16,
    /// Human-readable diagnostic: the status line, or the transport error.
    pub status_txt: String,
    /// Seconds since the epoch at probe completion.
    pub timestamp: i64,
}

impl Status {
    /// Whether the received status code is one the check accepts.
    pub fn passed(&self) -> bool {
        self.check.ok_status.contains(&self.status_code)
    }
}

/// Retains, per `(node, check name)` pair, only the most recent status.
/// Idempotent; the output carries exactly one status per pair present in the
/// input.
pub fn dedupe(statuses: Vec<Status>) -> Vec<Status> {
    let mut latest: HashMap<(i64, String), Status> = HashMap::new();
    for status in statuses {
        match latest.entry((status.node.id, status.check.name.clone())) {
            Entry::Occupied(mut entry) => {
                if entry.get().timestamp < status.timestamp {
                    entry.insert(status);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(status);
            }
        }
    }
    latest.into_values().collect()
}

/// The statuses that did not receive an acceptable response.
pub fn failed(statuses: &[Status]) -> Vec<&Status> {
    statuses.iter().filter(|status| !status.passed()).collect()
}

/// Aggregation of one check's statuses across the fleet within one consensus
/// window. Ephemeral; recomputed every tick and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Mean response time in milliseconds.
    pub average_response: u64,
    /// Distinct status codes seen, sorted.
    pub status_codes: Vec<u16>,
    /// Number of failed probes.
    pub failed: u32,
    /// Number of passed probes.
    pub passed: u32,
    /// Total probes in the window.
    pub total: u32,
    /// `passed / total` as an integer percentage in `[0, 100]`.
    pub pass_percent: u8,
    /// Addresses of the nodes that reported failures.
    pub fail_node_ips: Vec<IpAddr>,
    /// Names of the nodes that reported failures.
    pub fail_node_names: Vec<String>,
}

impl CheckResult {
    /// Aggregates a group of statuses for a single check. Empty groups yield
    /// nothing.
    pub fn from_group(group: &[Status]) -> Option<CheckResult> {
        if group.is_empty() {
            return None;
        }
        let total = group.len() as u32;
        let failures = failed(group);
        let failed = failures.len() as u32;
        let average_response = group.iter().map(|s| s.rtime).sum::<u64>() / u64::from(total);
        let mut status_codes: Vec<u16> = group.iter().map(|s| s.status_code).collect();
        status_codes.sort_unstable();
        status_codes.dedup();
        Some(CheckResult {
            average_response,
            status_codes,
            failed,
            passed: total - failed,
            total,
            pass_percent: ((total - failed) * 100 / total) as u8,
            fail_node_ips: failures.iter().map(|s| s.node.eip).collect(),
            fail_node_names: failures.iter().map(|s| s.node.name.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(id: i64) -> Node {
        Node {
            id,
            eip: format!("10.0.0.{id}").parse().unwrap(),
            name: format!("test_node_{id}"),
        }
    }

    fn check() -> Check {
        Check {
            url: "https://example.com".to_owned(),
            name: "Example".to_owned(),
            ok_status: vec![200],
            alert_threshold: 80,
            alert_interval: 600,
            test_interval: 60,
            contacts: vec!["ops1".to_owned(), "ops2".to_owned()],
        }
    }

    fn status(node_id: i64, status_code: u16, timestamp: i64) -> Status {
        Status {
            node: node(node_id),
            check: check(),
            rtime: 20,
            status_code,
            status_txt: format!("{status_code}"),
            timestamp,
        }
    }

    #[test]
    fn check_json_round_trips() {
        let original = check();
        let encoded = serde_json::to_string(&original).unwrap();
        assert!(encoded.contains("ok-statuses"));
        assert!(encoded.contains("alert-below"));
        let decoded: Check = serde_json::from_str(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn check_parses_with_missing_fields() {
        let decoded: Check =
            serde_json::from_str(r#"{"url": "https://example.com", "name": "Example"}"#).unwrap();
        assert_eq!(decoded.alert_threshold, 0);
        assert!(decoded.ok_status.is_empty());
    }

    #[test]
    fn status_json_round_trips() {
        let original = status(1, 200, 1_700_000_000);
        let decoded: Status =
            serde_json::from_str(&serde_json::to_string(&original).unwrap()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn by_name_finds_checks() {
        let checks = vec![check()];
        assert!(by_name(&checks, "Example").is_some());
        assert!(by_name(&checks, "absent").is_none());
    }

    #[test]
    fn dedupe_keeps_the_most_recent_per_node_and_check() {
        let input = vec![
            status(1, 200, 100),
            status(1, 500, 200),
            status(2, 200, 100),
        ];
        let mut deduped = dedupe(input);
        deduped.sort_by_key(|s| s.node.id);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].status_code, 500);
        assert_eq!(deduped[1].status_code, 200);
    }

    #[test]
    fn dedupe_is_idempotent() {
        let input = vec![
            status(1, 200, 100),
            status(1, 500, 200),
            status(2, 200, 100),
        ];
        let once = dedupe(input);
        let mut twice = dedupe(once.clone());
        let mut once = once;
        once.sort_by_key(|s| s.node.id);
        twice.sort_by_key(|s| s.node.id);
        assert_eq!(once, twice);
    }

    #[test]
    fn failed_filters_unacceptable_statuses() {
        let statuses = vec![status(1, 200, 100), status(1, 500, 100)];
        let failures = failed(&statuses);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status_code, 500);
    }

    #[test]
    fn result_aggregates_a_group() {
        let group = vec![
            status(1, 200, 100),
            status(2, 200, 100),
            status(3, 500, 100),
        ];
        let result = CheckResult::from_group(&group).unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.passed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.passed + result.failed, result.total);
        assert_eq!(result.pass_percent, 66);
        assert_eq!(result.average_response, 20);
        assert_eq!(result.status_codes, vec![200, 500]);
        assert_eq!(result.fail_node_ips, vec!["10.0.0.3".parse::<IpAddr>().unwrap()]);
        assert_eq!(result.fail_node_names, vec!["test_node_3".to_owned()]);
    }

    #[test]
    fn pass_percent_stays_in_bounds() {
        let all_pass = vec![status(1, 200, 100)];
        assert_eq!(CheckResult::from_group(&all_pass).unwrap().pass_percent, 100);
        let all_fail = vec![status(1, 0, 100)];
        assert_eq!(CheckResult::from_group(&all_fail).unwrap().pass_percent, 0);
    }

    #[test]
    fn empty_groups_yield_nothing() {
        assert!(CheckResult::from_group(&[]).is_none());
    }
}
