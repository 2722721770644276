//! The consensus task: aggregates the fleet's probe results and gates
//! alerts.
//!
//! Every node drains the status stream to keep senders unblocked, but only
//! the Coordinator evaluates the window: duplicate reports are collapsed,
//! results grouped per check, and any check whose fleet-wide pass rate falls
//! below its threshold is handed to the alert dispatcher. The buffer is
//! cleared every tick either way.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info};

use crate::alert::Alerts;
use crate::check::{dedupe, Check, CheckResult, Status};
use crate::heartbeat::{Roles, RoutineStatus};

/// Evaluation window length.
const TICK: Duration = Duration::from_secs(60);

/// Spawns the consensus task and returns its status channel.
pub fn spawn(
    statuses: mpsc::Receiver<Status>,
    roles: Arc<Roles>,
    alerts: Alerts,
) -> mpsc::Receiver<RoutineStatus> {
    let (status_tx, status_rx) = mpsc::channel(10);
    tokio::spawn(run(statuses, roles, alerts, status_tx));
    status_rx
}

async fn run(
    mut statuses: mpsc::Receiver<Status>,
    roles: Arc<Roles>,
    mut alerts: Alerts,
    status_tx: mpsc::Sender<RoutineStatus>,
) {
    loop {
        let mut buffer: Vec<Status> = Vec::new();
        let tick = time::sleep(TICK);
        tokio::pin!(tick);
        loop {
            tokio::select! {
                () = &mut tick => break,
                received = statuses.recv() => match received {
                    Some(status) => buffer.push(status),
                    None => {
                        let _ = status_tx
                            .send(RoutineStatus::failed(anyhow::anyhow!(
                                "status stream closed"
                            )))
                            .await;
                        return;
                    }
                },
            }
        }

        if roles.coordinator() {
            debug!(buffered = buffer.len(), "evaluating status window");
            for (check, result) in aggregate(buffer) {
                if result.pass_percent < check.alert_threshold {
                    info!(
                        check = %check.name,
                        pass_percent = result.pass_percent,
                        threshold = check.alert_threshold,
                        "check fell below its alert threshold"
                    );
                    alerts.send(&check.name, &result).await;
                }
            }
        }
        // Non-coordinators reach here too; their window is simply dropped.

        if status_tx.send(RoutineStatus::normal()).await.is_err() {
            return;
        }
    }
}

/// Collapses a window of statuses into one result per check. Duplicate
/// reports (same node, same check) keep only the most recent; empty groups
/// produce nothing.
pub fn aggregate(window: Vec<Status>) -> Vec<(Check, CheckResult)> {
    let mut groups: BTreeMap<String, Vec<Status>> = BTreeMap::new();
    for status in dedupe(window) {
        groups
            .entry(status.check.name.clone())
            .or_default()
            .push(status);
    }
    groups
        .into_values()
        .filter_map(|group| {
            let check = group.first()?.check.clone();
            let result = CheckResult::from_group(&group)?;
            Some((check, result))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::Node;

    fn node(id: i64) -> Node {
        Node {
            id,
            eip: format!("10.0.0.{id}").parse().unwrap(),
            name: format!("test_node_{id}"),
        }
    }

    fn check(name: &str) -> Check {
        Check {
            url: "https://example.com".to_owned(),
            name: name.to_owned(),
            ok_status: vec![200],
            alert_threshold: 80,
            alert_interval: 600,
            test_interval: 60,
            contacts: vec!["ops1".to_owned()],
        }
    }

    fn status(node_id: i64, name: &str, code: u16, timestamp: i64) -> Status {
        Status {
            node: node(node_id),
            check: check(name),
            rtime: 20,
            status_code: code,
            status_txt: format!("{code}"),
            timestamp,
        }
    }

    #[test]
    fn aggregate_groups_by_check_name() {
        let window = vec![
            status(1, "Example", 200, 100),
            status(2, "Example", 200, 100),
            status(3, "Example", 500, 100),
            status(1, "Other", 200, 100),
        ];
        let results = aggregate(window);
        assert_eq!(results.len(), 2);

        let (check, result) = &results[0];
        assert_eq!(check.name, "Example");
        assert_eq!(result.total, 3);
        assert_eq!(result.pass_percent, 66);
        assert!(result.pass_percent < check.alert_threshold);

        let (check, result) = &results[1];
        assert_eq!(check.name, "Other");
        assert_eq!(result.pass_percent, 100);
    }

    #[test]
    fn aggregate_collapses_duplicate_reports() {
        let window = vec![
            status(1, "Example", 500, 100),
            status(1, "Example", 200, 200),
        ];
        let results = aggregate(window);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.total, 1);
        assert_eq!(results[0].1.pass_percent, 100);
    }

    #[test]
    fn aggregate_of_nothing_is_nothing() {
        assert!(aggregate(Vec::new()).is_empty());
    }
}
