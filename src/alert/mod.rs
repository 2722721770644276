//! Alert dispatch: mapping contact names to delivery channels, with
//! per-check rate limiting. New alert mechanisms plug in by name without
//! touching the rest of the program.

pub mod webhook;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::check::{by_name, Check, CheckResult};

/// A generic alertable endpoint; any alert mechanism can provide one.
#[async_trait]
pub trait Contact: Send + Sync {
    /// The name checks refer to this contact by.
    fn name(&self) -> &str;
    /// Delivers one alert for a failing check.
    async fn send_alert(&self, check: &Check, result: &CheckResult) -> anyhow::Result<()>;
}

/// Turns one contact configuration entry into a live contact.
pub type ContactParser = Box<dyn Fn(&Value) -> anyhow::Result<Box<dyn Contact>> + Send>;

type MechanismBinder = fn(&Value) -> anyhow::Result<ContactParser>;

/// The registry of known alert mechanisms, built at startup.
fn registry() -> HashMap<&'static str, MechanismBinder> {
    let mut mechanisms: HashMap<&'static str, MechanismBinder> = HashMap::new();
    mechanisms.insert("webhook", webhook::bind);
    mechanisms
}

/// Failure to configure alerting. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// The `alerters` section is not an object of per-mechanism configs.
    #[error("alert configuration is not an object")]
    InvalidConfig,
    /// The `contacts` section is not an object of per-mechanism lists.
    #[error("contact configuration is not an object")]
    InvalidContacts,
    /// A configured mechanism rejected its configuration.
    #[error("while configuring alert mechanism {0}: {1}")]
    Mechanism(String, String),
}

/// Dispatches alerts to named contacts, no more often than each check's
/// alert interval. Owned by the consensus task. Alerting configuration is
/// resolved against this node's own check list, not the copy a remote
/// prober embedded in its status.
pub struct Alerts {
    checks: Vec<Check>,
    contacts: Vec<Box<dyn Contact>>,
    not_before: HashMap<String, Instant>,
}

/// Binds the configured alert mechanisms and parses the contact lists. A
/// contact entry that fails to parse is skipped; a mechanism that rejects
/// its configuration is fatal.
pub fn initialise(
    alerters: &Value,
    contacts: &Value,
    checks: Vec<Check>,
) -> Result<Alerts, AlertError> {
    let mechanisms = registry();
    let sections = alerters.as_object().ok_or(AlertError::InvalidConfig)?;
    let mut parsers: HashMap<String, ContactParser> = HashMap::new();

    for (name, section) in sections {
        match mechanisms.get(name.as_str()) {
            Some(binder) => {
                debug!(%name, "configuring alert mechanism");
                let parser = binder(section)
                    .map_err(|error| AlertError::Mechanism(name.clone(), error.to_string()))?;
                parsers.insert(name.clone(), parser);
            }
            None => warn!(%name, "found unused alerter config"),
        }
    }

    let mut list: Vec<Box<dyn Contact>> = Vec::new();
    let groups = contacts.as_object().ok_or(AlertError::InvalidContacts)?;
    for (mechanism, entries) in groups {
        let Some(parser) = parsers.get(mechanism.as_str()) else {
            warn!(%mechanism, "contacts reference an unconfigured alert mechanism");
            continue;
        };
        let Some(entries) = entries.as_array() else {
            warn!(%mechanism, "contact list is not an array, ignoring");
            continue;
        };
        for entry in entries {
            match parser(entry) {
                Ok(contact) => list.push(contact),
                Err(error) => {
                    warn!(%mechanism, %error, "error while trying to process a contact object, ignoring");
                }
            }
        }
    }

    info!(contact_count = list.len(), "finished parsing contacts");
    Ok(Alerts {
        checks,
        contacts: list,
        not_before: HashMap::new(),
    })
}

impl Alerts {
    /// Sends an alert for the named check to each of its configured
    /// contacts, unless one already went out within the check's alert
    /// interval. A contact that fails only costs its own delivery.
    pub async fn send(&mut self, name: &str, result: &CheckResult) {
        let Some(check) = by_name(&self.checks, name) else {
            warn!(check = %name, "no local configuration for alerting check");
            return;
        };
        let now = Instant::now();
        if let Some(not_before) = self.not_before.get(&check.name) {
            if now < *not_before {
                debug!(check = %check.name, "alert suppressed inside the alert interval");
                return;
            }
        }
        self.not_before.insert(
            check.name.clone(),
            now + Duration::from_secs(check.alert_interval),
        );

        for name in &check.contacts {
            match self.contacts.iter().find(|contact| contact.name() == name) {
                Some(contact) => {
                    if let Err(error) = contact.send_alert(check, result).await {
                        warn!(contact = %name, %error, "couldn't send alert message");
                    }
                }
                None => warn!(contact = %name, "check references an unknown contact"),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_contacts(checks: Vec<Check>, contacts: Vec<Box<dyn Contact>>) -> Alerts {
        Alerts {
            checks,
            contacts,
            not_before: HashMap::new(),
        }
    }
}

/// Renders the alert subject line.
pub fn subject(check: &Check, result: &CheckResult) -> String {
    format!(
        "Alert from dpoller: {} failed {} of {} checks",
        check.name, result.failed, result.total
    )
}

/// Renders the alert body.
pub fn body(check: &Check, result: &CheckResult) -> String {
    let addresses = result
        .fail_node_ips
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Dpoller reports that {} of {} checks failed when testing {} at {}\r\n\
         IP Addresses reporting fail: {}",
        result.failed, result.total, check.name, check.url, addresses
    )
}
