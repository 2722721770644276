//! Entry point: parse flags, load configuration, wire the tasks together,
//! and supervise them until something fatal happens.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use dpoller::heartbeat::Roles;
use dpoller::logger::{self, LogLevel, RoutineLevels};
use dpoller::supervisor::{self, Routine};
use dpoller::{alert, check, config, consensus, coordinate, listen, node, publish};

/// Distributed URL availability prober.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Opts {
    /// Log level for any routine without its own flag.
    #[arg(long, value_enum, default_value = "warn", env = "DPOLLER_MAIN_LOG_LEVEL")]
    main_log_level: LogLevel,
    /// Log level for the alert routine.
    #[arg(long, value_enum, env = "DPOLLER_ALERT_LOG_LEVEL")]
    alert_log_level: Option<LogLevel>,
    /// Log level for the config routine.
    #[arg(long, value_enum, env = "DPOLLER_CONFIG_LOG_LEVEL")]
    config_log_level: Option<LogLevel>,
    /// Log level for the consensus routine.
    #[arg(long, value_enum, env = "DPOLLER_CONSENSUS_LOG_LEVEL")]
    consensus_log_level: Option<LogLevel>,
    /// Log level for the coordinator routine.
    #[arg(long, value_enum, env = "DPOLLER_COORDINATOR_LOG_LEVEL")]
    coordinator_log_level: Option<LogLevel>,
    /// Log level for the heartbeat routine.
    #[arg(long, value_enum, env = "DPOLLER_HEARTBEAT_LOG_LEVEL")]
    heartbeat_log_level: Option<LogLevel>,
    /// Log level for the listen routine.
    #[arg(long, value_enum, env = "DPOLLER_LISTEN_LOG_LEVEL")]
    listen_log_level: Option<LogLevel>,
    /// Log level for the publish routine.
    #[arg(long, value_enum, env = "DPOLLER_PUBLISH_LOG_LEVEL")]
    publish_log_level: Option<LogLevel>,
    /// Log level for the url probing routine.
    #[arg(long, value_enum, env = "DPOLLER_URL_LOG_LEVEL")]
    url_log_level: Option<LogLevel>,
}

impl Opts {
    fn levels(&self) -> RoutineLevels {
        let main = self.main_log_level;
        RoutineLevels {
            main,
            alert: self.alert_log_level.unwrap_or(main),
            config: self.config_log_level.unwrap_or(main),
            consensus: self.consensus_log_level.unwrap_or(main),
            coordinate: self.coordinator_log_level.unwrap_or(main),
            heartbeat: self.heartbeat_log_level.unwrap_or(main),
            listen: self.listen_log_level.unwrap_or(main),
            publish: self.publish_log_level.unwrap_or(main),
            url: self.url_log_level.unwrap_or(main),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    logger::init(&opts.levels());

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = config::load().await.context("could not load config")?;
    let node = node::initialise().context("could not initialise node data")?;
    info!(id = node.id, name = %node.name, eip = %node.eip, "node initialised");

    let roles = Arc::new(Roles::default());

    // The aggregate streams: beats on one, statuses on the other. Listeners
    // and the publish mirror feed them; coordinate and consensus drain them.
    let (beat_tx, beat_rx) = mpsc::channel(1);
    let (status_tx, status_rx) = mpsc::channel(1);

    let listeners = config.listeners.as_ref().context("undefined listeners block")?;
    let listen_status = listen::initialise(listeners, beat_tx.clone(), status_tx.clone())
        .await
        .context("could not initialise listen functions")?;

    let coordinate_status = coordinate::spawn(beat_rx, node.clone(), Arc::clone(&roles));

    let alerters = config.alerters.as_ref().context("undefined alerters block")?;
    let contacts = config.contacts.as_ref().context("undefined contacts block")?;
    let alerts = alert::initialise(alerters, contacts, config.urls.clone())
        .context("could not initialise alert function")?;

    let consensus_status = consensus::spawn(status_rx, Arc::clone(&roles), alerts);

    let publishers = config.publishers.as_ref().context("undefined publishers block")?;
    let publish = publish::initialise(publishers, beat_tx, status_tx)
        .await
        .context("could not initialise publish functions")?;

    let probe_status = check::probe::spawn(config.urls.clone(), node.clone(), publish.clone())
        .context("could not initialise URL testing functions")?;

    let routines = vec![
        Routine::new("listen", listen_status),
        Routine::new("coordinate", coordinate_status),
        Routine::new("consensus", consensus_status),
        Routine::new("url", probe_status),
    ];

    Err(supervisor::run(routines, node, roles, publish).await)
}
