//! Receiving beats and statuses from the message bus.
//!
//! A listener is a pluggable component keyed by a transport name. Each bound
//! listener contributes its streams to the aggregate H- and S-streams via
//! relayer tasks, and reports its own liveness like any other routine. A
//! listener is expected to hear from every other node, though it need not
//! connect to each of them directly.

pub mod nats;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::check::Status;
use crate::heartbeat::{Beat, RoutineStatus};

/// Envelope tag for beats.
pub(crate) const TYPE_HEARTBEAT: &str = "heartbeat";
/// Envelope tag for statuses.
pub(crate) const TYPE_STATUS: &str = "status";
/// Header carrying the envelope tag.
pub(crate) const TYPE_HEADER: &str = "type";
/// Header carrying the sender's ISO-8601 send time.
pub(crate) const TIMESTAMP_HEADER: &str = "timestamp";

/// Streams produced by one successfully bound listener.
pub struct BoundListener {
    /// The listener's own liveness reports.
    pub status: mpsc::Receiver<RoutineStatus>,
    /// Beats decoded from the bus.
    pub beats: mpsc::Receiver<Beat>,
    /// Statuses decoded from the bus.
    pub statuses: mpsc::Receiver<Status>,
}

type BinderFuture = Pin<Box<dyn Future<Output = anyhow::Result<BoundListener>> + Send>>;
type Binder = fn(Value) -> BinderFuture;

/// The registry of known listener transports, built at startup.
fn registry() -> HashMap<&'static str, Binder> {
    let mut listeners: HashMap<&'static str, Binder> = HashMap::new();
    listeners.insert("nats", |config| Box::pin(nats::bind(config)));
    listeners
}

/// No listener could be bound from the configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    /// The `listeners` section is not an object of per-plugin configs.
    #[error("listener configuration is not an object")]
    InvalidConfig,
    /// Nothing in the section matched a registered listener, or everything
    /// that matched failed to bind.
    #[error("no configuration matched a known listener")]
    NoListenerBound,
}

/// Distributes configuration to the registered listeners and fans the bound
/// streams into the provided aggregate channels. Returns the combined
/// routine-status stream. The node can run as long as at least one listener
/// binds.
pub async fn initialise(
    config: &Value,
    beat_tx: mpsc::Sender<Beat>,
    status_tx: mpsc::Sender<Status>,
) -> Result<mpsc::Receiver<RoutineStatus>, ListenError> {
    let sections = config.as_object().ok_or(ListenError::InvalidConfig)?;
    let mut registry = registry();
    let (watchdog_tx, watchdog_rx) = mpsc::channel(10);
    let mut bound = 0usize;

    for (name, section) in sections {
        let Some(binder) = registry.remove(name.as_str()) else {
            warn!(%name, "found unused listener config");
            continue;
        };
        debug!(%name, "configuring listener");
        match binder(section.clone()).await {
            Ok(listener) => {
                relay(listener.status, watchdog_tx.clone());
                relay(listener.beats, beat_tx.clone());
                relay(listener.statuses, status_tx.clone());
                bound += 1;
            }
            Err(error) => warn!(%name, %error, "listener failed to bind"),
        }
    }

    // Anything still in the registry never saw configuration.
    for name in registry.keys() {
        warn!(%name, "listener found no config");
    }

    if bound == 0 {
        return Err(ListenError::NoListenerBound);
    }
    debug!(bound, "configured listeners");
    Ok(watchdog_rx)
}

/// Forwards forever from one listener's stream into an aggregate stream.
fn relay<T: Send + 'static>(mut from: mpsc::Receiver<T>, to: mpsc::Sender<T>) {
    tokio::spawn(async move {
        while let Some(item) = from.recv().await {
            if to.send(item).await.is_err() {
                break;
            }
        }
    });
}

/// A decoded bus delivery.
#[derive(Debug)]
pub(crate) enum BusMessage {
    /// A peer's liveness beat.
    Beat(Beat),
    /// A peer's probe outcome.
    Status(Status),
}

/// Decodes a type-tagged delivery. Unknown tags and malformed payloads are
/// logged and dropped, never fatal.
pub(crate) fn decode(kind: Option<&str>, payload: &[u8]) -> Option<BusMessage> {
    match kind {
        Some(TYPE_HEARTBEAT) => match serde_json::from_slice::<Beat>(payload) {
            Ok(beat) => {
                debug!(id = beat.id(), "decoded a heartbeat delivery");
                Some(BusMessage::Beat(beat))
            }
            Err(error) => {
                warn!(%error, "failed to decode a heartbeat delivery, skipping");
                None
            }
        },
        Some(TYPE_STATUS) => match serde_json::from_slice::<Status>(payload) {
            Ok(status) => {
                debug!(check = %status.check.name, "decoded a status delivery");
                Some(BusMessage::Status(status))
            }
            Err(error) => {
                warn!(%error, "failed to decode a status delivery, skipping");
                None
            }
        },
        other => {
            warn!(kind = ?other, "received unknown delivery type");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;
    use crate::check::Check;
    use crate::node::Node;

    fn node() -> Node {
        Node {
            id: 42,
            eip: "10.0.0.1".parse().unwrap(),
            name: "listen_test".to_owned(),
        }
    }

    #[test]
    fn decodes_heartbeat_deliveries() {
        let beat = Beat {
            node: node(),
            coordinator: false,
            feasible: true,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&beat).unwrap();
        match decode(Some(TYPE_HEARTBEAT), &payload) {
            Some(BusMessage::Beat(decoded)) => assert_eq!(decoded, beat),
            other => panic!("expected a beat, got {other:?}"),
        }
    }

    #[test]
    fn decodes_status_deliveries() {
        let status = Status {
            node: node(),
            check: Check {
                name: "Example".to_owned(),
                ..Check::default()
            },
            rtime: 12,
            status_code: 200,
            status_txt: "200 OK".to_owned(),
            timestamp: 1_700_000_000,
        };
        let payload = serde_json::to_vec(&status).unwrap();
        match decode(Some(TYPE_STATUS), &payload) {
            Some(BusMessage::Status(decoded)) => assert_eq!(decoded, status),
            other => panic!("expected a status, got {other:?}"),
        }
    }

    #[test]
    fn drops_unknown_tags_and_garbage() {
        assert!(decode(Some("gossip"), b"{}").is_none());
        assert!(decode(None, b"{}").is_none());
        assert!(decode(Some(TYPE_HEARTBEAT), b"not json").is_none());
        assert!(decode(Some(TYPE_STATUS), b"\xff\xfe").is_none());
    }

    #[tokio::test]
    async fn relay_forwards_everything() {
        let (from_tx, from_rx) = mpsc::channel(4);
        let (to_tx, mut to_rx) = mpsc::channel(4);
        relay(from_rx, to_tx);
        for n in 0..3 {
            from_tx.send(n).await.unwrap();
        }
        for n in 0..3 {
            assert_eq!(to_rx.recv().await, Some(n));
        }
    }
}
