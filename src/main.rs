//! Datera CSI plugin

use std::sync::Arc;

use clap::Parser;
use datera_csi::backend::http::HttpBackend;
use datera_csi::backend::Backend;
use datera_csi::common::logger::{init_logger, parse_level, LogRole};
use datera_csi::common::util::format_anyhow_error;
use datera_csi::config::{Config, InnerConfig};
use datera_csi::csi::{self, heartbeat::Health};
use datera_csi::exec::{Executor, HostExecutor};
use tracing::{error, info};

/// Build the services and run until a shutdown signal
async fn run(config: InnerConfig) -> anyhow::Result<()> {
    info!("starting datera CSI plugin with {:?}", config);
    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(config.backend.clone())?);
    let exec: Arc<dyn Executor> = Arc::new(HostExecutor);
    let health = Arc::new(Health::new());

    csi::remove_socket_file(&config.socket_path)?;
    let services = csi::build_services(&config, &backend, &exec, &health);
    let tasks = csi::spawn_background_tasks(&config, &backend, &exec, &health);
    info!(
        "CSI services ready at {:?}: {:?}",
        config.socket_path, services
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InnerConfig::try_from(Config::parse())?;
    init_logger(
        LogRole::from(config.service_type),
        parse_level(&config.log_level),
    );

    if let Err(e) = run(config).await {
        error!("datera CSI plugin failed, the error is: {}", format_anyhow_error(&e));
        return Err(e);
    }
    Ok(())
}
