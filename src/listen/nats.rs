//! NATS-backed listener.

use std::time::Duration;

use anyhow::{bail, Context as _};
use futures::StreamExt as _;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;
use tracing::debug;

use super::{decode, BoundListener, BusMessage, TYPE_HEADER};
use crate::check::Status;
use crate::heartbeat::{Beat, RoutineStatus};

/// How often the receive loop reports that it is alive.
const CHECKIN_INTERVAL: Duration = Duration::from_secs(15);

/// Connection details for the NATS bus.
#[derive(Debug, Clone, Deserialize)]
struct NatsConfig {
    /// Server URL, credentials included if needed.
    url: String,
    /// Subject all fleet traffic is published on.
    #[serde(default = "default_subject")]
    subject: String,
}

fn default_subject() -> String {
    "dpoller".to_owned()
}

impl NatsConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            bail!("missing url field");
        }
        if self.subject.is_empty() {
            bail!("invalid subject field");
        }
        Ok(())
    }
}

/// Connects, subscribes, and spawns the receive loop. Connecting here, at
/// bind time, surfaces broker issues early.
pub(super) async fn bind(config: Value) -> anyhow::Result<BoundListener> {
    let config: NatsConfig =
        serde_json::from_value(config).context("unable to parse nats listener config")?;
    config.validate()?;

    let client = async_nats::connect(&config.url)
        .await
        .with_context(|| format!("could not connect to nats at {}", config.url))?;
    let subscriber = client
        .subscribe(config.subject.clone())
        .await
        .with_context(|| format!("could not subscribe to {}", config.subject))?;
    debug!(subject = %config.subject, "nats listener bound");

    let (status_tx, status) = mpsc::channel(10);
    let (beat_tx, beats) = mpsc::channel(1);
    let (s_tx, statuses) = mpsc::channel(1);
    tokio::spawn(receive(subscriber, status_tx, beat_tx, s_tx));

    Ok(BoundListener {
        status,
        beats,
        statuses,
    })
}

/// Decodes deliveries until the subscription ends, checking in every 15
/// seconds. The client reconnects underneath us; the subscription stream
/// survives reconnects.
async fn receive(
    mut subscriber: async_nats::Subscriber,
    status_tx: mpsc::Sender<RoutineStatus>,
    beat_tx: mpsc::Sender<Beat>,
    s_tx: mpsc::Sender<Status>,
) {
    loop {
        let checkin = time::sleep(CHECKIN_INTERVAL);
        tokio::pin!(checkin);
        loop {
            tokio::select! {
                () = &mut checkin => {
                    if status_tx.send(RoutineStatus::normal()).await.is_err() {
                        return;
                    }
                    break;
                }
                delivery = subscriber.next() => {
                    let Some(message) = delivery else {
                        let _ = status_tx
                            .send(RoutineStatus::failed(anyhow::anyhow!(
                                "nats subscription ended"
                            )))
                            .await;
                        return;
                    };
                    let kind = message
                        .headers
                        .as_ref()
                        .and_then(|headers| headers.get(TYPE_HEADER))
                        .map(|value| value.as_str());
                    match decode(kind, &message.payload) {
                        Some(BusMessage::Beat(beat)) => {
                            if beat_tx.send(beat).await.is_err() {
                                return;
                            }
                        }
                        Some(BusMessage::Status(status)) => {
                            if s_tx.send(status).await.is_err() {
                                return;
                            }
                        }
                        None => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_requires_a_url() {
        let config: NatsConfig = serde_json::from_value(serde_json::json!({"url": ""})).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_defaults_the_subject() {
        let config: NatsConfig =
            serde_json::from_value(serde_json::json!({"url": "nats://localhost:4222"})).unwrap();
        assert_eq!(config.subject, "dpoller");
        config.validate().unwrap();
    }
}
