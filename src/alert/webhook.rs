//! Webhook alert mechanism: posts rendered alerts to per-contact URLs.

use std::time::Duration;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{body, subject, Contact, ContactParser};
use crate::check::{Check, CheckResult};

/// Mechanism-wide settings, shared by every webhook contact.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct WebhookConfig {
    /// Seconds before a delivery attempt is abandoned.
    timeout: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig { timeout: 10 }
    }
}

/// One alertable endpoint.
#[derive(Debug, Deserialize)]
struct WebhookContact {
    name: String,
    url: String,
}

struct Webhook {
    name: String,
    url: String,
    client: reqwest::Client,
}

/// The JSON document delivered to the endpoint.
#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    contact: &'a str,
    check: &'a str,
    url: &'a str,
    subject: String,
    message: String,
    pass_percent: u8,
    failed: u32,
    total: u32,
}

/// Binds the mechanism configuration and returns the contact parser.
pub(super) fn bind(config: &Value) -> anyhow::Result<ContactParser> {
    let config: WebhookConfig =
        serde_json::from_value(config.clone()).context("unable to parse webhook config")?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout))
        .build()
        .context("could not build webhook client")?;

    Ok(Box::new(move |entry| {
        let contact: WebhookContact =
            serde_json::from_value(entry.clone()).context("unable to parse webhook contact")?;
        if contact.name.is_empty() {
            bail!("missing name field");
        }
        if contact.url.is_empty() {
            bail!("missing url field");
        }
        Ok(Box::new(Webhook {
            name: contact.name,
            url: contact.url,
            client: client.clone(),
        }))
    }))
}

#[async_trait]
impl Contact for Webhook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_alert(&self, check: &Check, result: &CheckResult) -> anyhow::Result<()> {
        let payload = AlertPayload {
            contact: &self.name,
            check: &check.name,
            url: &check.url,
            subject: subject(check, result),
            message: body(check, result),
            pass_percent: result.pass_percent,
            failed: result.failed,
            total: result.total,
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("could not reach {}", self.url))?
            .error_for_status()
            .context("webhook endpoint rejected the alert")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_parses_contacts() {
        let parser = bind(&serde_json::json!({})).unwrap();
        let contact = parser(&serde_json::json!({
            "name": "ops1",
            "url": "https://hooks.invalid/ops1"
        }))
        .unwrap();
        assert_eq!(contact.name(), "ops1");
    }

    #[test]
    fn bind_rejects_incomplete_contacts() {
        let parser = bind(&serde_json::json!({"timeout": 3})).unwrap();
        assert!(parser(&serde_json::json!({"name": "ops1"})).is_err());
        assert!(parser(&serde_json::json!({"name": "", "url": "https://x"})).is_err());
        assert!(parser(&serde_json::json!({"url": "https://x"})).is_err());
    }

    #[tokio::test]
    async fn delivers_the_rendered_alert() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            // The whole request is in flight before the client awaits the
            // response, so read until the JSON payload closes.
            loop {
                let read = socket.read(&mut buffer).await.unwrap();
                request.extend_from_slice(&buffer[..read]);
                if read == 0 || request.ends_with(b"}") {
                    break;
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        let parser = bind(&serde_json::json!({})).unwrap();
        let contact = parser(&serde_json::json!({
            "name": "ops1",
            "url": format!("http://{addr}/alerts")
        }))
        .unwrap();

        let check = Check {
            url: "https://example.com".to_owned(),
            name: "Example".to_owned(),
            ok_status: vec![200],
            alert_threshold: 80,
            alert_interval: 600,
            test_interval: 60,
            contacts: vec!["ops1".to_owned()],
        };
        let result = CheckResult {
            average_response: 20,
            status_codes: vec![200, 500],
            failed: 1,
            passed: 2,
            total: 3,
            pass_percent: 66,
            fail_node_ips: vec!["10.0.0.3".parse().unwrap()],
            fail_node_names: vec!["test_node_3".to_owned()],
        };
        contact.send_alert(&check, &result).await.unwrap();

        let request = received.await.unwrap();
        assert!(request.starts_with("POST /alerts"));
        assert!(request.contains("Alert from dpoller: Example failed 1 of 3 checks"));
    }
}
