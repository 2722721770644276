//! Broadcasting beats and statuses to the message bus.
//!
//! Publishers are pluggable by transport name, like listeners. The front-end
//! fans every message out to all bound publishers in parallel under the
//! caller's deadline, and mirrors it onto the local stream first so this
//! node's own consumers see it without a bus round-trip. A publisher is
//! expected to reach every other node, though it may not connect to each.

pub mod nats;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::check::Status;
use crate::heartbeat::Beat;

/// Time reserved from every publish deadline so sender outcomes can be
/// aggregated before the caller's deadline passes.
const AGGREGATION_RESERVE: Duration = Duration::from_millis(250);

/// A message to broadcast to the fleet.
#[derive(Debug, Clone)]
pub enum Message {
    /// This node's liveness beat.
    Beat(Beat),
    /// One probe outcome.
    Status(Status),
}

/// One bound publisher transport. Implementations own their reconnection;
/// callers only observe success or failure within the deadline.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Broadcasts a beat, returning once it is handed to the bus.
    async fn send_heartbeat(&self, deadline: Instant, beat: &Beat) -> Result<(), PublishError>;
    /// Broadcasts a status, returning once it is handed to the bus.
    async fn send_status(&self, deadline: Instant, status: &Status) -> Result<(), PublishError>;
}

/// Failure to configure publishers or to publish a message.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The `publishers` section is not an object of per-plugin configs.
    #[error("publisher configuration is not an object")]
    InvalidConfig,
    /// Nothing in the section matched a registered publisher, or everything
    /// that matched failed to bind.
    #[error("no configuration matched a known publisher")]
    NoPublisherBound,
    /// The deadline passed before any publisher returned.
    #[error("no publisher succeeded before the deadline")]
    NoneSucceeded,
    /// One publisher did not return before its deadline.
    #[error("publisher did not return before the deadline")]
    Timeout,
    /// The record could not be serialised.
    #[error("could not serialise message: {0}")]
    Encode(#[from] serde_json::Error),
    /// The transport rejected the message.
    #[error("{0}")]
    Transport(String),
    /// Some publishers failed; the message may have reached only part of the
    /// fleet.
    #[error("some publishers failed: {}", .0.join("; "))]
    Aggregate(Vec<String>),
    /// The local mirror stream is gone, so the process is shutting down.
    #[error("local stream closed")]
    StreamClosed,
}

type BinderFuture = Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn Publisher>>> + Send>>;
type Binder = fn(Value) -> BinderFuture;

/// The registry of known publisher transports, built at startup.
fn registry() -> HashMap<&'static str, Binder> {
    let mut publishers: HashMap<&'static str, Binder> = HashMap::new();
    publishers.insert("nats", |config| Box::pin(nats::bind(config)));
    publishers
}

/// Handle to the bound publishers plus the local mirror streams. Cheap to
/// clone; shared by the supervisor and the probe scheduler.
#[derive(Clone)]
pub struct Publish {
    inner: Arc<Inner>,
}

struct Inner {
    publishers: Vec<(String, Arc<dyn Publisher>)>,
    beat_tx: mpsc::Sender<Beat>,
    status_tx: mpsc::Sender<Status>,
}

/// Distributes configuration to the registered publishers. The node can run
/// as long as at least one binds.
pub async fn initialise(
    config: &Value,
    beat_tx: mpsc::Sender<Beat>,
    status_tx: mpsc::Sender<Status>,
) -> Result<Publish, PublishError> {
    let sections = config.as_object().ok_or(PublishError::InvalidConfig)?;
    let mut registry = registry();
    let mut publishers = Vec::new();

    for (name, section) in sections {
        let Some(binder) = registry.remove(name.as_str()) else {
            warn!(%name, "found unused publisher config");
            continue;
        };
        debug!(%name, "configuring publisher");
        match binder(section.clone()).await {
            Ok(publisher) => publishers.push((name.clone(), publisher)),
            Err(error) => warn!(%name, %error, "publisher failed to bind"),
        }
    }

    for name in registry.keys() {
        warn!(%name, "publisher found no config");
    }

    if publishers.is_empty() {
        return Err(PublishError::NoPublisherBound);
    }
    debug!(bound = publishers.len(), "configured publishers");
    Ok(Publish {
        inner: Arc::new(Inner {
            publishers,
            beat_tx,
            status_tx,
        }),
    })
}

impl Publish {
    /// Broadcasts `message` to every bound publisher, mirroring it onto the
    /// local stream first.
    ///
    /// Senders run in parallel against a child deadline 250 ms before the
    /// caller's, leaving room to aggregate their outcomes. If the caller's
    /// deadline passes before any sender returns, the whole call fails; if
    /// some senders fail, the error lists them — the supervisor decides how
    /// much partial delivery is worth.
    pub async fn publish(&self, deadline: Instant, message: Message) -> Result<(), PublishError> {
        match &message {
            Message::Beat(beat) => {
                debug!(id = beat.id(), "publishing a heartbeat");
                self.inner
                    .beat_tx
                    .send(beat.clone())
                    .await
                    .map_err(|_| PublishError::StreamClosed)?;
            }
            Message::Status(status) => {
                debug!(check = %status.check.name, "publishing a status");
                self.inner
                    .status_tx
                    .send(status.clone())
                    .await
                    .map_err(|_| PublishError::StreamClosed)?;
            }
        }

        let child_deadline = deadline
            .checked_sub(AGGREGATION_RESERVE)
            .unwrap_or_else(Instant::now);
        let message = Arc::new(message);
        let mut senders = JoinSet::new();
        for (name, publisher) in &self.inner.publishers {
            let name = name.clone();
            let publisher = Arc::clone(publisher);
            let message = Arc::clone(&message);
            senders.spawn(async move {
                let send = async {
                    match &*message {
                        Message::Beat(beat) => publisher.send_heartbeat(child_deadline, beat).await,
                        Message::Status(status) => {
                            publisher.send_status(child_deadline, status).await
                        }
                    }
                };
                let outcome = match time::timeout_at(child_deadline, send).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PublishError::Timeout),
                };
                (name, outcome)
            });
        }

        let mut failures = Vec::new();
        let mut returned = 0usize;
        let lapse = time::sleep_until(deadline);
        tokio::pin!(lapse);
        loop {
            tokio::select! {
                joined = senders.join_next() => match joined {
                    None => break,
                    Some(Ok((_, Ok(())))) => returned += 1,
                    Some(Ok((name, Err(error)))) => {
                        returned += 1;
                        warn!(publisher = %name, %error, "received publisher error");
                        failures.push(format!("{name}: {error}"));
                    }
                    Some(Err(join_error)) => {
                        returned += 1;
                        failures.push(format!("publisher task failed: {join_error}"));
                    }
                },
                () = &mut lapse => {
                    if returned == 0 {
                        return Err(PublishError::NoneSucceeded);
                    }
                    warn!("not all publishers returned before the deadline");
                    break;
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError::Aggregate(failures))
        }
    }

    #[cfg(test)]
    pub(crate) fn with_publishers(
        publishers: Vec<(String, Arc<dyn Publisher>)>,
        beat_tx: mpsc::Sender<Beat>,
        status_tx: mpsc::Sender<Status>,
    ) -> Publish {
        Publish {
            inner: Arc::new(Inner {
                publishers,
                beat_tx,
                status_tx,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::node::Node;

    struct StubPublisher {
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubPublisher {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(StubPublisher {
                delay,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Publisher for StubPublisher {
        async fn send_heartbeat(
            &self,
            _deadline: Instant,
            _beat: &Beat,
        ) -> Result<(), PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(self.delay).await;
            if self.fail {
                Err(PublishError::Transport("stub failure".to_owned()))
            } else {
                Ok(())
            }
        }

        async fn send_status(
            &self,
            deadline: Instant,
            _status: &Status,
        ) -> Result<(), PublishError> {
            self.send_heartbeat(deadline, &test_beat()).await
        }
    }

    fn test_beat() -> Beat {
        Beat {
            node: Node {
                id: 9,
                eip: "10.0.0.9".parse().unwrap(),
                name: "publish_test".to_owned(),
            },
            coordinator: false,
            feasible: false,
            timestamp: Utc::now(),
        }
    }

    fn harness(
        publishers: Vec<(String, Arc<dyn Publisher>)>,
    ) -> (Publish, mpsc::Receiver<Beat>, mpsc::Receiver<Status>) {
        let (beat_tx, beat_rx) = mpsc::channel(4);
        let (status_tx, status_rx) = mpsc::channel(4);
        (
            Publish::with_publishers(publishers, beat_tx, status_tx),
            beat_rx,
            status_rx,
        )
    }

    #[tokio::test]
    async fn mirrors_beats_locally_before_broadcasting() {
        let stub = StubPublisher::new(Duration::ZERO, false);
        let (publish, mut beat_rx, _status_rx) =
            harness(vec![("stub".to_owned(), stub.clone() as Arc<dyn Publisher>)]);

        publish
            .publish(Instant::now() + Duration::from_secs(1), Message::Beat(test_beat()))
            .await
            .unwrap();

        assert_eq!(beat_rx.recv().await.unwrap().id(), 9);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runs_every_publisher() {
        let first = StubPublisher::new(Duration::ZERO, false);
        let second = StubPublisher::new(Duration::ZERO, false);
        let (publish, _beat_rx, _status_rx) = harness(vec![
            ("first".to_owned(), first.clone() as Arc<dyn Publisher>),
            ("second".to_owned(), second.clone() as Arc<dyn Publisher>),
        ]);

        publish
            .publish(Instant::now() + Duration::from_secs(1), Message::Beat(test_beat()))
            .await
            .unwrap();

        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reports_partial_failures() {
        let good = StubPublisher::new(Duration::ZERO, false);
        let bad = StubPublisher::new(Duration::ZERO, true);
        let (publish, _beat_rx, _status_rx) = harness(vec![
            ("good".to_owned(), good as Arc<dyn Publisher>),
            ("bad".to_owned(), bad as Arc<dyn Publisher>),
        ]);

        let error = publish
            .publish(Instant::now() + Duration::from_secs(1), Message::Beat(test_beat()))
            .await
            .unwrap_err();
        match error {
            PublishError::Aggregate(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("bad:"));
            }
            other => panic!("expected an aggregate error, got {other}"),
        }
    }

    #[tokio::test]
    async fn slow_publishers_fail_within_the_deadline() {
        let slow = StubPublisher::new(Duration::from_secs(30), false);
        let (publish, _beat_rx, _status_rx) =
            harness(vec![("slow".to_owned(), slow as Arc<dyn Publisher>)]);

        let started = Instant::now();
        let error = publish
            .publish(
                Instant::now() + Duration::from_millis(500),
                Message::Beat(test_beat()),
            )
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match error {
            PublishError::Aggregate(failures) => {
                assert!(failures[0].contains("deadline"), "got {failures:?}");
            }
            other => panic!("expected an aggregate error, got {other}"),
        }
    }

    #[tokio::test]
    async fn statuses_are_mirrored_onto_the_status_stream() {
        let stub = StubPublisher::new(Duration::ZERO, false);
        let (publish, _beat_rx, mut status_rx) =
            harness(vec![("stub".to_owned(), stub as Arc<dyn Publisher>)]);

        let status = Status {
            node: test_beat().node,
            check: crate::check::Check {
                name: "Example".to_owned(),
                ..Default::default()
            },
            rtime: 5,
            status_code: 200,
            status_txt: "200 OK".to_owned(),
            timestamp: 1_700_000_000,
        };
        publish
            .publish(
                Instant::now() + Duration::from_secs(1),
                Message::Status(status.clone()),
            )
            .await
            .unwrap();
        assert_eq!(status_rx.recv().await.unwrap(), status);
    }
}
