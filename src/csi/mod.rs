//! K8S CSI services backed by a Datera cluster
pub mod attach;
pub mod controller;
pub mod coordinator;
pub mod heartbeat;
pub mod identity;
pub mod meta_data;
pub mod node;
pub mod params;
/// Proto definition
pub mod proto;
pub mod snapshot;
pub mod util;
pub mod volume;

use std::path::Path;
use std::sync::Arc;

use attach::{Attacher, HostPaths};
use controller::ControllerImpl;
use heartbeat::{Health, LogPusher};
use identity::IdentityImpl;
use meta_data::MetadataStore;
use node::NodeImpl;
use snapshot::SnapshotManager;
use tokio::task::JoinHandle;
use tracing::info;
use volume::VolumeManager;

use crate::backend::Backend;
use crate::common::error::{Context, DateraResult};
use crate::config::InnerConfig;
use crate::exec::Executor;

/// The services selected by the service type
#[derive(Debug)]
pub struct CsiServices {
    /// Identity service
    pub identity: Option<IdentityImpl>,
    /// Controller service
    pub controller: Option<ControllerImpl>,
    /// Node service
    pub node: Option<NodeImpl>,
}

/// Build the services selected by `config.service_type`
pub fn build_services(
    config: &InnerConfig,
    backend: &Arc<dyn Backend>,
    exec: &Arc<dyn Executor>,
    health: &Arc<Health>,
) -> CsiServices {
    let service_type = config.service_type;
    let metadata = Arc::new(MetadataStore::new(
        Arc::clone(backend),
        config.metadata_debug,
    ));
    let volumes = Arc::new(VolumeManager::new(
        Arc::clone(backend),
        Arc::clone(&metadata),
        config.replica_override,
    ));

    let identity = service_type.runs_identity().then(|| {
        IdentityImpl::new(
            util::CSI_PLUGIN_NAME.to_owned(),
            util::CSI_PLUGIN_VERSION.to_owned(),
            Arc::clone(backend),
            Arc::clone(health),
        )
    });
    let controller = service_type.runs_controller().then(|| {
        ControllerImpl::new(
            Arc::clone(&volumes),
            SnapshotManager::new(Arc::clone(backend)),
            Arc::clone(&metadata),
        )
    });
    let node = service_type.runs_node().then(|| {
        let attacher = Attacher::new(
            Arc::clone(backend),
            Arc::clone(exec),
            Arc::clone(&metadata),
            HostPaths::system(config.host.initiator_file.clone()),
            !config.disable_multipath,
            config.format_timeout,
        );
        NodeImpl::new(
            config.node_id.clone(),
            config.vol_per_node,
            attacher,
            Arc::clone(&volumes),
        )
    });
    info!(
        "built services for {:?}: identity={}, controller={}, node={}",
        service_type,
        identity.is_some(),
        controller.is_some(),
        node.is_some(),
    );
    CsiServices {
        identity,
        controller,
        node,
    }
}

/// Start the heartbeat, and the log push unless disabled
pub fn spawn_background_tasks(
    config: &InnerConfig,
    backend: &Arc<dyn Backend>,
    exec: &Arc<dyn Executor>,
    health: &Arc<Health>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![tokio::spawn(heartbeat::run_heartbeat(
        Arc::clone(backend),
        Arc::clone(health),
        config.heartbeat,
    ))];
    if config.logpush {
        let pusher = LogPusher::new(
            Arc::clone(backend),
            Arc::clone(exec),
            config.host.logrotate_rule.clone(),
            config.host.rotated_log.clone(),
        );
        tasks.push(tokio::spawn(pusher.run(config.logpush_interval)));
    } else {
        info!("log push is disabled");
    }
    tasks
}

/// Remove existing socket file before the transport binds it
pub fn remove_socket_file(sock: &Path) -> DateraResult<()> {
    if sock.exists() {
        std::fs::remove_file(sock)
            .with_context(|| format!("failed to remove existing socket file {sock:?}"))?;
    }
    Ok(())
}
