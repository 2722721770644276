//! Probe execution and the scheduling loop that spreads probes over time.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, info};

use super::{Check, Status};
use crate::heartbeat::RoutineStatus;
use crate::node::Node;
use crate::publish::{Message, Publish};

/// Establishing a connection, including any TLS handshake, must finish
/// within this bound.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Whole-request bound, from connect to body.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Number of startup slices the initial launches are spread across.
const LAUNCH_SLICES: usize = 5;
/// Gap between startup slices.
const SLICE_GAP: Duration = Duration::from_secs(12);
/// Main loop cadence.
const TICK: Duration = Duration::from_secs(15);
/// A check is relaunched once its last launch is older than this.
const RELAUNCH_AFTER: Duration = Duration::from_secs(60);
/// Deadline handed to the publish dispatcher per result.
const PUBLISH_DEADLINE: Duration = Duration::from_secs(10);

/// Runs one probe and records the outcome. Transport failures are results
/// too: code 0 with the error text.
async fn run_check(client: &reqwest::Client, check: Check, node: Node) -> Status {
    let started = Instant::now();
    let outcome = client.get(&check.url).send().await;
    let rtime = started.elapsed().as_millis() as u64;
    let timestamp = Utc::now().timestamp();
    match outcome {
        Ok(response) => Status {
            node,
            check,
            rtime,
            status_code: response.status().as_u16(),
            status_txt: response.status().to_string(),
            timestamp,
        },
        Err(error) => Status {
            node,
            check,
            rtime,
            status_code: 0,
            status_txt: error.to_string(),
            timestamp,
        },
    }
}

/// One scheduled check: its configuration, when it last launched, and the
/// single-use channel its in-flight probe will answer on.
struct CheckRun {
    check: Check,
    last_ran: Instant,
    result: Option<oneshot::Receiver<Status>>,
}

impl CheckRun {
    fn new(check: Check) -> Self {
        CheckRun {
            check,
            last_ran: Instant::now(),
            result: None,
        }
    }

    /// Launches a probe, replacing any previous result channel.
    fn launch(&mut self, client: &reqwest::Client, node: &Node) {
        let (result_tx, result_rx) = oneshot::channel();
        let client = client.clone();
        let check = self.check.clone();
        let node = node.clone();
        tokio::spawn(async move {
            let _ = result_tx.send(run_check(&client, check, node).await);
        });
        self.last_ran = Instant::now();
        self.result = Some(result_rx);
    }

    /// Takes the probe outcome if one is waiting.
    fn take_ready(&mut self) -> Option<Status> {
        let result = self.result.as_mut()?;
        match result.try_recv() {
            Ok(status) => {
                self.result = None;
                Some(status)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.result = None;
                None
            }
        }
    }
}

/// Which checks launch in each startup slice: slice `i` takes the checks
/// whose index is congruent to `i` modulo the slice count.
fn launch_slices(count: usize) -> Vec<Vec<usize>> {
    let mut slices = vec![Vec::new(); LAUNCH_SLICES];
    for index in 0..count {
        slices[index % LAUNCH_SLICES].push(index);
    }
    slices
}

/// Spawns the probe scheduler task and returns its status channel.
pub fn spawn(
    checks: Vec<Check>,
    node: Node,
    publish: Publish,
) -> reqwest::Result<mpsc::Receiver<RoutineStatus>> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let (status_tx, status_rx) = mpsc::channel(10);
    info!(checks = checks.len(), "starting URL probing");
    tokio::spawn(run(checks, node, publish, client, status_tx));
    Ok(status_rx)
}

async fn run(
    checks: Vec<Check>,
    node: Node,
    publish: Publish,
    client: reqwest::Client,
    status_tx: mpsc::Sender<RoutineStatus>,
) {
    let mut runs: Vec<CheckRun> = checks.into_iter().map(CheckRun::new).collect();

    // Stagger the initial launches so a freshly started fleet does not hit
    // every endpoint at once.
    for (slice, indices) in launch_slices(runs.len()).into_iter().enumerate() {
        if slice > 0 {
            time::sleep(SLICE_GAP).await;
        }
        for index in indices {
            debug!(check = %runs[index].check.name, slice, "launching initial probe");
            runs[index].launch(&client, &node);
        }
    }

    loop {
        time::sleep(TICK).await;
        for run in &mut runs {
            if let Some(status) = run.take_ready() {
                let deadline = Instant::now() + PUBLISH_DEADLINE;
                match publish.publish(deadline, Message::Status(status)).await {
                    Ok(()) => debug!(check = %run.check.name, "published probe result"),
                    Err(error) => {
                        let error = anyhow::Error::new(error)
                            .context(format!("failed to publish result for {}", run.check.name));
                        let _ = status_tx.send(RoutineStatus::failed(error)).await;
                        return;
                    }
                }
            }
            if run.last_ran.elapsed() > RELAUNCH_AFTER {
                run.launch(&client, &node);
            }
        }
        if status_tx.send(RoutineStatus::normal()).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn launch_slices_spread_checks_evenly() {
        let slices = launch_slices(50);
        assert_eq!(slices.len(), 5);
        for (slice, indices) in slices.iter().enumerate() {
            assert_eq!(indices.len(), 10, "slice {slice} launches 10 checks");
            assert!(indices.iter().all(|index| index % 5 == slice));
        }
    }

    #[test]
    fn launch_slices_handle_uneven_counts() {
        let slices = launch_slices(7);
        let counts: Vec<usize> = slices.iter().map(Vec::len).collect();
        assert_eq!(counts, vec![2, 2, 1, 1, 1]);
    }

    fn test_check(url: String) -> Check {
        Check {
            url,
            name: "local".to_owned(),
            ok_status: vec![200],
            ..Check::default()
        }
    }

    fn test_node() -> Node {
        Node {
            id: 1,
            eip: "127.0.0.1".parse().unwrap(),
            name: "probe_test".to_owned(),
        }
    }

    #[tokio::test]
    async fn run_check_records_a_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 1024];
            let _ = socket.read(&mut buffer).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let client = reqwest::Client::new();
        let status = run_check(
            &client,
            test_check(format!("http://{addr}/")),
            test_node(),
        )
        .await;
        assert_eq!(status.status_code, 200);
        assert!(status.passed());
        assert!(status.timestamp > 0);
    }

    #[tokio::test]
    async fn run_check_reports_transport_failures_as_code_zero() {
        // Bind and drop a listener so the port is known to refuse connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let status = run_check(
            &client,
            test_check(format!("http://{addr}/")),
            test_node(),
        )
        .await;
        assert_eq!(status.status_code, 0);
        assert!(!status.passed());
        assert!(!status.status_txt.is_empty());
    }
}
