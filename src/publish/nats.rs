//! NATS-backed publisher.

use std::sync::Arc;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{self, Instant};
use tracing::debug;

use super::{PublishError, Publisher};
use crate::check::Status;
use crate::heartbeat::Beat;
use crate::listen::{TIMESTAMP_HEADER, TYPE_HEADER, TYPE_HEARTBEAT, TYPE_STATUS};

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

struct NatsPublisher {
    client: async_nats::Client,
    subject: String,
}

/// Connects and wraps the client. Connecting here, at bind time, surfaces
/// broker issues early; afterwards the client reconnects on its own and the
/// next publish transparently uses the re-established connection.
pub(super) async fn bind(config: Value) -> anyhow::Result<Arc<dyn Publisher>> {
    let config: NatsConfig =
        serde_json::from_value(config).context("unable to parse nats publisher config")?;
    config.validate()?;

    let client = async_nats::connect(&config.url)
        .await
        .with_context(|| format!("could not connect to nats at {}", config.url))?;
    debug!(subject = %config.subject, "nats publisher bound");
    Ok(Arc::new(NatsPublisher {
        client,
        subject: config.subject,
    }))
}

impl NatsPublisher {
    /// Publishes one envelope: the JSON record as the payload, with the type
    /// tag and send time as headers. The flush bounds delivery within the
    /// deadline rather than leaving the message in the client's buffer.
    async fn send(&self, deadline: Instant, kind: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(TYPE_HEADER, kind);
        headers.insert(TIMESTAMP_HEADER, Utc::now().to_rfc3339().as_str());

        let attempt = async {
            self.client
                .publish_with_headers(self.subject.clone(), headers, Bytes::from(payload))
                .await
                .map_err(|error| PublishError::Transport(error.to_string()))?;
            self.client
                .flush()
                .await
                .map_err(|error| PublishError::Transport(error.to_string()))
        };
        match time::timeout_at(deadline, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublishError::Timeout),
        }
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn send_heartbeat(&self, deadline: Instant, beat: &Beat) -> Result<(), PublishError> {
        self.send(deadline, TYPE_HEARTBEAT, serde_json::to_vec(beat)?)
            .await
    }

    async fn send_status(&self, deadline: Instant, status: &Status) -> Result<(), PublishError> {
        self.send(deadline, TYPE_STATUS, serde_json::to_vec(status)?)
            .await
    }
}
