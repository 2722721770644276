//! Per-routine log filtering.
//!
//! Each routine logs under its own module target, so the per-routine CLI
//! flags translate directly into filter directives.

use clap::ValueEnum;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Log verbosity accepted by the per-routine CLI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Everything, including per-message traffic.
    Debug,
    /// Normal operational events.
    Info,
    /// Only problems.
    Warn,
    /// Only errors that end the process.
    Fatal,
}

impl LogLevel {
    fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

/// Effective level per routine, after defaulting unset flags to the main
/// level.
#[derive(Debug, Clone, Copy)]
pub struct RoutineLevels {
    /// Fallback for everything without its own flag.
    pub main: LogLevel,
    /// The alert dispatcher.
    pub alert: LogLevel,
    /// Configuration loading.
    pub config: LogLevel,
    /// The consensus task.
    pub consensus: LogLevel,
    /// The coordinate task.
    pub coordinate: LogLevel,
    /// Beat and election calculations.
    pub heartbeat: LogLevel,
    /// Listeners and their relayers.
    pub listen: LogLevel,
    /// Publishers and the publish front-end.
    pub publish: LogLevel,
    /// The probe scheduler.
    pub url: LogLevel,
}

impl RoutineLevels {
    /// Builds the filter, one directive per routine module.
    pub fn filter(&self) -> EnvFilter {
        let directives = [
            ("dpoller::alert", self.alert),
            ("dpoller::config", self.config),
            ("dpoller::consensus", self.consensus),
            ("dpoller::coordinate", self.coordinate),
            ("dpoller::heartbeat", self.heartbeat),
            ("dpoller::listen", self.listen),
            ("dpoller::publish", self.publish),
            ("dpoller::check", self.url),
        ];
        let mut filter = EnvFilter::new(format!("warn,dpoller={}", self.main.as_filter()));
        for (target, level) in directives {
            filter = filter.add_directive(
                format!("{target}={}", level.as_filter())
                    .parse()
                    .expect("directive built from known target and level"),
            );
        }
        filter
    }
}

/// Installs the global subscriber.
pub fn init(levels: &RoutineLevels) {
    tracing_subscriber::fmt()
        .with_env_filter(levels.filter())
        .init();
}
