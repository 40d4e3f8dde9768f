use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::common::error::DateraError;
use crate::common::util;
use crate::config::config::{
    BackendConfig as SuperBackendConfig, Config as SuperConfig, HostConfig as SuperHostConfig,
};

/// The services a process exposes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceType {
    /// Identity service only
    Identity,
    /// Controller service only
    Controller,
    /// Node service only
    Node,
    /// Node and identity services
    NodeIdentity,
    /// Controller and identity services
    ControllerIdentity,
    /// Every service
    All,
}

impl ServiceType {
    /// Whether the controller service is served
    #[must_use]
    pub fn runs_controller(self) -> bool {
        matches!(self, Self::Controller | Self::ControllerIdentity | Self::All)
    }

    /// Whether the node service is served
    #[must_use]
    pub fn runs_node(self) -> bool {
        matches!(self, Self::Node | Self::NodeIdentity | Self::All)
    }

    /// Whether the identity service is served
    #[must_use]
    pub fn runs_identity(self) -> bool {
        matches!(
            self,
            Self::Identity | Self::NodeIdentity | Self::ControllerIdentity | Self::All
        )
    }
}

impl FromStr for ServiceType {
    type Err = DateraError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "controller" => Ok(Self::Controller),
            "node" => Ok(Self::Node),
            "nodeident" => Ok(Self::NodeIdentity),
            "conident" => Ok(Self::ControllerIdentity),
            "all" => Ok(Self::All),
            _ => Err(DateraError::ArgumentInvalid {
                context: vec![format!("service type {s} is not supported")],
            }),
        }
    }
}

/// Inner config struct
/// This struct is used to store the parsed config
/// and will be used to initialize the driver
#[derive(Clone, Debug)]
pub struct InnerConfig {
    /// Path of the unix socket
    pub socket_path: PathBuf,
    /// Services to run
    pub service_type: ServiceType,
    /// Interval between health checks
    pub heartbeat: Duration,
    /// Max volumes per node
    pub vol_per_node: i64,
    /// Login to a single portal only
    pub disable_multipath: bool,
    /// Force replica count 1
    pub replica_override: bool,
    /// Log metadata size on every write
    pub metadata_debug: bool,
    /// Push logs to the backend
    pub logpush: bool,
    /// Interval between log pushes
    pub logpush_interval: Duration,
    /// Format attempts, one per second
    pub format_timeout: u32,
    /// Node id reported to the orchestrator
    pub node_id: String,
    /// Log level
    pub log_level: String,
    /// Backend connection
    pub backend: BackendConfig,
    /// Host paths
    pub host: HostConfig,
}

/// Parse a `unix://` endpoint into its filesystem path
fn parse_socket(endpoint: &str) -> Result<PathBuf, DateraError> {
    match endpoint.strip_prefix("unix://") {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(DateraError::ArgumentInvalid {
            context: vec![format!(
                "socket {endpoint} is invalid, only unix sockets are supported by CSI"
            )],
        }),
    }
}

impl TryFrom<SuperConfig> for InnerConfig {
    type Error = DateraError;

    #[inline]
    fn try_from(value: SuperConfig) -> Result<Self, Self::Error> {
        let socket_path = parse_socket(&value.socket)?;
        let service_type = ServiceType::from_str(value.service_type.as_str())?;
        if value.heartbeat == 0 {
            return Err(DateraError::ArgumentInvalid {
                context: vec!["heartbeat interval must be positive".to_owned()],
            });
        }
        let node_id = if value.node_id.is_empty() {
            util::get_hostname()?
        } else {
            value.node_id
        };
        let logpush = value.disable_logpush.is_empty() || value.disable_logpush == "false";
        Ok(InnerConfig {
            socket_path,
            service_type,
            heartbeat: Duration::from_secs(value.heartbeat),
            vol_per_node: value.vol_per_node,
            disable_multipath: !value.disable_multipath.is_empty(),
            replica_override: !value.replica_override.is_empty(),
            metadata_debug: !value.metadata_debug.is_empty(),
            logpush,
            logpush_interval: Duration::from_secs(value.logpush_interval),
            format_timeout: value.format_timeout,
            node_id,
            log_level: value.log_level,
            backend: value.backend.try_into()?,
            host: value.host.into(),
        })
    }
}

/// Backend connection config
#[derive(Clone)]
pub struct BackendConfig {
    /// Management address
    pub mgmt_ip: String,
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// Tenant
    pub tenant: String,
    /// API version
    pub api_version: String,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("mgmt_ip", &self.mgmt_ip)
            .field("username", &self.username)
            .field("password", &"***stripped***")
            .field("tenant", &self.tenant)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl TryFrom<SuperBackendConfig> for BackendConfig {
    type Error = DateraError;

    #[inline]
    fn try_from(value: SuperBackendConfig) -> Result<Self, Self::Error> {
        if value.mgmt_ip.is_empty() {
            return Err(DateraError::ArgumentInvalid {
                context: vec!["backend management address is empty".to_owned()],
            });
        }
        if value.username.is_empty() {
            return Err(DateraError::ArgumentInvalid {
                context: vec!["backend user is empty".to_owned()],
            });
        }
        Ok(BackendConfig {
            mgmt_ip: value.mgmt_ip,
            username: value.username,
            password: value.password,
            tenant: value.tenant,
            api_version: value.api_version,
        })
    }
}

/// Host paths
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// iSCSI initiator name file
    pub initiator_file: PathBuf,
    /// Logrotate rule
    pub logrotate_rule: PathBuf,
    /// Rotated log archive
    pub rotated_log: PathBuf,
}

impl From<SuperHostConfig> for HostConfig {
    #[inline]
    fn from(value: SuperHostConfig) -> Self {
        HostConfig {
            initiator_file: PathBuf::from(value.initiator_file),
            logrotate_rule: PathBuf::from(value.logrotate_rule),
            rotated_log: PathBuf::from(value.rotated_log),
        }
    }
}
