use clap::Parser;

/// Default socket the orchestrator connects to
pub const DEFAULT_SOCKET: &str = "unix:///var/lib/kubelet/plugins/dsp.csi.daterainc.io/csi.sock";

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
/// A config
pub struct Config {
    #[clap(long = "socket", env = "DAT_SOCKET", value_name = "VALUE", default_value = DEFAULT_SOCKET)]
    /// CSI endpoint, only unix sockets are accepted
    pub socket: String,
    #[clap(long = "type", env = "DAT_TYPE", value_name = "VALUE", default_value = "all")]
    /// Services to run: identity, controller, node, nodeident, conident, all
    pub service_type: String,
    #[clap(long = "heartbeat", env = "DAT_HEARTBEAT", value_name = "SECONDS", default_value = "60")]
    /// Interval between backend health checks
    pub heartbeat: u64,
    #[clap(long = "vol-per-node", env = "DAT_VOL_PER_NODE", value_name = "VALUE", default_value = "256")]
    /// Max volumes reported per node
    pub vol_per_node: i64,
    #[clap(long = "disable-multipath", env = "DAT_DISABLE_MULTIPATH", value_name = "VALUE", default_value_t)]
    /// Any non-empty value disables multipath login
    pub disable_multipath: String,
    #[clap(long = "replica-override", env = "DAT_REPLICA_OVERRIDE", value_name = "VALUE", default_value_t)]
    /// Any non-empty value forces a single replica
    pub replica_override: String,
    #[clap(long = "metadata-debug", env = "DAT_METADATA_DEBUG", value_name = "VALUE", default_value_t)]
    /// Any non-empty value logs metadata size on every write
    pub metadata_debug: String,
    #[clap(long = "disable-logpush", env = "DAT_DISABLE_LOGPUSH", value_name = "VALUE", default_value_t)]
    /// Any non-empty value other than `false` disables log push
    pub disable_logpush: String,
    #[clap(long = "logpush-interval", env = "DAT_LOGPUSH_INTERVAL", value_name = "SECONDS", default_value = "7200")]
    /// Interval between log pushes
    pub logpush_interval: u64,
    #[clap(long = "format-timeout", env = "DAT_FORMAT_TIMEOUT", value_name = "SECONDS", default_value = "60")]
    /// Budget of one second format attempts
    pub format_timeout: u32,
    #[clap(long = "node-id", env = "DAT_NODE_ID", value_name = "VALUE", default_value_t)]
    /// Node id, the host name when empty
    pub node_id: String,
    #[clap(long = "log-level", env = "DAT_LOG_LEVEL", value_name = "VALUE", default_value = "info")]
    /// Log level
    pub log_level: String,
    #[clap(flatten)]
    /// Backend connection config
    pub backend: BackendConfig,
    #[clap(flatten)]
    /// Host paths used by the node service
    pub host: HostConfig,
}

#[derive(Debug, Parser)]
/// Backend connection config
pub struct BackendConfig {
    #[clap(long = "mgmt-ip", env = "DAT_MGMT", value_name = "VALUE")]
    /// Management address of the backend
    pub mgmt_ip: String,
    #[clap(long = "username", env = "DAT_USER", value_name = "VALUE")]
    /// Backend user
    pub username: String,
    #[clap(long = "password", env = "DAT_PASS", value_name = "VALUE", hide_env_values = true)]
    /// Backend password
    pub password: String,
    #[clap(long = "tenant", env = "DAT_TENANT", value_name = "VALUE", default_value = "/root")]
    /// Backend tenant
    pub tenant: String,
    #[clap(long = "api-version", env = "DAT_API", value_name = "VALUE", default_value = "2.2")]
    /// Backend API version
    pub api_version: String,
}

#[derive(Debug, Parser)]
/// Host paths used by the node service
pub struct HostConfig {
    #[clap(long = "initiator-file", value_name = "PATH", default_value = "/etc/iscsi/initiatorname.iscsi")]
    /// File holding the iSCSI initiator name
    pub initiator_file: String,
    #[clap(long = "logrotate-rule", value_name = "PATH", default_value = "/etc/logrotate.d/driver-logrotate")]
    /// Logrotate rule forced before each log push
    pub logrotate_rule: String,
    #[clap(long = "rotated-log", value_name = "PATH", default_value = "/var/log/driver.log.1.gz")]
    /// Archive produced by the logrotate rule
    pub rotated_log: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::inner::{InnerConfig, ServiceType};

    /// The minimal command line
    fn base_args() -> Vec<&'static str> {
        vec![
            "dat-csi-plugin",
            "--mgmt-ip",
            "172.16.0.10",
            "--username",
            "admin",
            "--password",
            "secret",
            "--node-id",
            "node1",
        ]
    }

    #[test]
    fn test_default_config() {
        let config = Config::parse_from(base_args());
        assert_eq!(config.socket, DEFAULT_SOCKET);
        assert_eq!(config.service_type, "all");
        assert_eq!(config.heartbeat, 60);
        assert_eq!(config.vol_per_node, 256);
        assert_eq!(config.logpush_interval, 7200);
        assert_eq!(config.format_timeout, 60);
        assert_eq!(config.backend.tenant, "/root");
        assert_eq!(config.backend.api_version, "2.2");
        assert_eq!(config.host.initiator_file, "/etc/iscsi/initiatorname.iscsi");

        let inner_config: InnerConfig = config.try_into().unwrap();
        assert_eq!(inner_config.service_type, ServiceType::All);
        assert_eq!(inner_config.node_id, "node1");
        assert_eq!(inner_config.socket_path.to_str(), Some("/var/lib/kubelet/plugins/dsp.csi.daterainc.io/csi.sock"));
        assert!(!inner_config.disable_multipath);
        assert!(!inner_config.replica_override);
        assert!(!inner_config.metadata_debug);
        assert!(inner_config.logpush);
    }

    #[test]
    fn test_flag_values() {
        let mut args = base_args();
        args.extend([
            "--type",
            "nodeident",
            "--disable-multipath",
            "1",
            "--replica-override",
            "yes",
            "--disable-logpush",
            "false",
        ]);
        let inner_config: InnerConfig = Config::parse_from(args).try_into().unwrap();
        assert_eq!(inner_config.service_type, ServiceType::NodeIdentity);
        assert!(inner_config.disable_multipath);
        assert!(inner_config.replica_override);
        assert!(inner_config.logpush, "`false` keeps log push enabled");

        let mut args = base_args();
        args.extend(["--disable-logpush", "true"]);
        let inner_config: InnerConfig = Config::parse_from(args).try_into().unwrap();
        assert!(!inner_config.logpush);
    }

    #[test]
    fn test_invalid_config() {
        let mut args = base_args();
        args.extend(["--socket", "tcp://127.0.0.1:10000"]);
        assert!(InnerConfig::try_from(Config::parse_from(args)).is_err());

        let mut args = base_args();
        args.extend(["--type", "scheduler"]);
        assert!(InnerConfig::try_from(Config::parse_from(args)).is_err());
    }
}
