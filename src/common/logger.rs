use tracing::level_filters::LevelFilter as Level;
use tracing_subscriber::filter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;

use crate::config::ServiceType;

/// Represents the role of the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    /// Only the identity service runs.
    Identity,
    /// Controller service, with or without identity.
    Controller,
    /// Node service, with or without identity.
    Node,
    /// Every service in one process.
    Plugin,
    /// For testing purpose.
    #[cfg(test)]
    Test,
}

impl From<ServiceType> for LogRole {
    #[inline]
    fn from(service: ServiceType) -> Self {
        match service {
            ServiceType::Identity => LogRole::Identity,
            ServiceType::Controller | ServiceType::ControllerIdentity => LogRole::Controller,
            ServiceType::Node | ServiceType::NodeIdentity => LogRole::Node,
            ServiceType::All => LogRole::Plugin,
        }
    }
}

impl LogRole {
    /// Returns the string representation of the log role.
    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            LogRole::Identity => "identity",
            LogRole::Controller => "controller",
            LogRole::Node => "node",
            LogRole::Plugin => "plugin",
            #[cfg(test)]
            LogRole::Test => "test",
        }
    }
}

/// Initialize the logger with the default settings.
/// The log file is located at `./datera_csi_<role>.log`.
#[allow(clippy::let_underscore_must_use)]
#[inline]
pub fn init_logger(role: LogRole, level: Level) {
    let filter = filter::Targets::new()
        .with_target("hyper", Level::WARN)
        .with_target("h2", Level::WARN)
        .with_target("reqwest", Level::WARN)
        .with_target("rustls", Level::WARN)
        .with_target("", level);

    let log_path = format!("./datera_csi_{}.log", role.as_str());
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap_or_else(|err| panic!("Failed to open log file ,err {err}"));

    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_file(false)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(filter);

    let subscriber = tracing_subscriber::Registry::default().with(layer);

    if cfg!(test) {
        let _: Result<(), tracing::subscriber::SetGlobalDefaultError> =
            tracing::subscriber::set_global_default(subscriber);
    } else {
        tracing::subscriber::set_global_default(subscriber)
            .unwrap_or_else(|error| panic!("Could not set logger ,err {error}"));
    }
}

/// Parse a textual level such as `debug`, falling back to `INFO`.
#[must_use]
#[inline]
pub fn parse_level(level: &str) -> Level {
    level.parse::<Level>().unwrap_or(Level::INFO)
}
