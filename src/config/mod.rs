//! Layered configuration loading.
//!
//! One document, JSON or YAML, assembled from up to three layers: the first
//! config file found in the working directory, a document fetched from
//! `config.url`, and an encrypted blob carried in `config.encrypted`. Later
//! layers override earlier ones key by key. A broken overlay is logged and
//! skipped; only a missing required section is fatal.

use anyhow::{anyhow, Context as _};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::check::Check;
use crate::crypto;

/// Failure to assemble a usable configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A layer could not be read or the merged document could not be parsed.
    #[error("could not assemble configuration: {0}")]
    Build(#[from] config::ConfigError),
    /// A required top-level section is absent after all layers.
    #[error("undefined {0} block")]
    MissingSection(&'static str),
}

/// First-level split of the configuration document. Plugin sections stay
/// opaque here; each subsystem parses its own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Skeleton {
    /// Listener configurations, keyed by plugin name.
    pub listeners: Option<Value>,
    /// Publisher configurations, keyed by plugin name.
    pub publishers: Option<Value>,
    /// Alert mechanism configurations, keyed by plugin name.
    pub alerters: Option<Value>,
    /// Contact lists, keyed by alert mechanism name.
    pub contacts: Option<Value>,
    /// The checks this fleet probes.
    pub urls: Vec<Check>,
    /// Pointers to further configuration.
    pub config: Sources,
}

/// The `config` object: where to find and how to unlock further layers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Sources {
    /// URL of a document to fetch and overlay.
    pub url: Option<String>,
    /// Passphrase for the encrypted overlay.
    pub key: Option<String>,
    /// Base64 AES-256-GCM blob holding another overlay.
    pub encrypted: Option<String>,
}

impl Skeleton {
    /// Every subsystem needs its section; fail fast if one is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_none() {
            return Err(ConfigError::MissingSection("listeners"));
        }
        if self.publishers.is_none() {
            return Err(ConfigError::MissingSection("publishers"));
        }
        if self.alerters.is_none() {
            return Err(ConfigError::MissingSection("alerters"));
        }
        if self.contacts.is_none() {
            return Err(ConfigError::MissingSection("contacts"));
        }
        Ok(())
    }
}

/// Loads and validates the full configuration.
pub async fn load() -> Result<Skeleton, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::with_name("config").required(false));

    debug!("loading file configuration");
    let skeleton: Skeleton = builder.build_cloned()?.try_deserialize()?;

    if let Some(url) = &skeleton.config.url {
        debug!(%url, "loading http configuration");
        match fetch_overlay(url).await {
            Ok(body) => match checked_layer(&body) {
                Some(layer) => builder = builder.add_source(layer),
                None => warn!(%url, "ignoring config overlay that failed to parse"),
            },
            Err(error) => warn!(%url, %error, "couldn't read config from URL"),
        }
    }

    // The passphrase and blob may come from different layers, so consult the
    // merged view before attempting decryption.
    let merged: Skeleton = builder.build_cloned()?.try_deserialize()?;
    if let (Some(key), Some(encrypted)) = (&merged.config.key, &merged.config.encrypted) {
        debug!("loading encrypted configuration");
        match decrypt_overlay(key, encrypted) {
            Ok(layer) => builder = builder.add_source(layer),
            Err(error) => warn!(%error, "ignoring encrypted config overlay"),
        }
    }

    let skeleton: Skeleton = builder.build()?.try_deserialize()?;
    skeleton.validate()?;
    Ok(skeleton)
}

async fn fetch_overlay(url: &str) -> reqwest::Result<String> {
    reqwest::get(url).await?.error_for_status()?.text().await
}

/// Returns a layer for `body` only if it parses on its own, which keeps one
/// bad overlay from poisoning the whole build. YAML is a superset of JSON,
/// so one format handles both.
fn checked_layer(body: &str) -> Option<File<config::FileSourceString, FileFormat>> {
    Config::builder()
        .add_source(File::from_str(body, FileFormat::Yaml))
        .build()
        .ok()?;
    Some(File::from_str(body, FileFormat::Yaml))
}

fn decrypt_overlay(
    key: &str,
    encrypted: &str,
) -> anyhow::Result<File<config::FileSourceString, FileFormat>> {
    let key = crypto::stretch(key).context("could not stretch config key")?;
    let plaintext = crypto::decrypt64(encrypted, &key).context("could not decrypt config")?;
    let body = String::from_utf8(plaintext).context("decrypted config is not UTF-8")?;
    checked_layer(&body).ok_or_else(|| anyhow!("decrypted config failed to parse"))
}
