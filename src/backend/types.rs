//! Resources exposed by the backend control plane

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the only storage instance the driver creates
pub const STORAGE_INSTANCE_NAME: &str = "storage-1";
/// Name of the only volume the driver creates
pub const VOLUME_NAME: &str = "volume-1";
/// `create_mode` sent on every app instance creation
pub const CREATE_MODE: &str = "kubernetes";

/// Path of an app instance
#[must_use]
pub fn app_instance_path(name: &str) -> String {
    format!("/app_instances/{name}")
}

/// Path of the storage instance of an app instance
#[must_use]
pub fn storage_instance_path(name: &str) -> String {
    format!(
        "{}/storage_instances/{STORAGE_INSTANCE_NAME}",
        app_instance_path(name)
    )
}

/// Path of the volume of an app instance
#[must_use]
pub fn volume_path(name: &str) -> String {
    format!("{}/volumes/{VOLUME_NAME}", storage_instance_path(name))
}

/// Reference to another resource by path
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathRef {
    /// Resource path, e.g. `/initiators/iqn.1993-08.org.debian:01:abc`
    pub path: String,
}

impl PathRef {
    /// Build a reference from a path
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Target access information of a storage instance
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Access {
    /// Portal addresses
    #[serde(default)]
    pub ips: Vec<String>,
    /// Target IQN
    #[serde(default)]
    pub iqn: String,
}

/// ACL of a storage instance
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclPolicy {
    /// Initiators allowed to log in
    #[serde(default)]
    pub initiators: Vec<PathRef>,
}

/// A volume inside a storage instance
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeResource {
    /// Volume name
    pub name: String,
    /// Size in GiB
    #[serde(default)]
    pub size: u64,
    /// Used capacity in GiB
    #[serde(default)]
    pub capacity_in_use: u64,
    /// Number of replicas
    #[serde(default)]
    pub replica_count: u32,
    /// `hybrid`, `single_flash` or `all_flash`
    #[serde(default)]
    pub placement_mode: String,
    /// Placement policy reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_policy: Option<PathRef>,
    /// Resource path
    #[serde(default)]
    pub path: String,
}

/// A storage instance, the iSCSI target of an app instance
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageInstance {
    /// Storage instance name
    pub name: String,
    /// Operational state
    #[serde(default)]
    pub op_state: String,
    /// Target access
    #[serde(default)]
    pub access: Access,
    /// ACL
    #[serde(default)]
    pub acl_policy: AclPolicy,
    /// IP pool the target is exposed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_pool: Option<PathRef>,
    /// Volumes
    #[serde(default)]
    pub volumes: Vec<VolumeResource>,
    /// Resource path
    #[serde(default)]
    pub path: String,
}

/// An app instance, the unit the driver calls a volume
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppInstance {
    /// App instance name
    pub name: String,
    /// `online` or `offline`
    #[serde(default)]
    pub admin_state: String,
    /// Repair priority
    #[serde(default)]
    pub repair_priority: String,
    /// Template the instance was created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_template: Option<PathRef>,
    /// Storage instances
    #[serde(default)]
    pub storage_instances: Vec<StorageInstance>,
    /// Resource path
    #[serde(default)]
    pub path: String,
}

impl AppInstance {
    /// The first storage instance
    #[must_use]
    pub fn storage_instance(&self) -> Option<&StorageInstance> {
        self.storage_instances.first()
    }

    /// The first volume of the first storage instance
    #[must_use]
    pub fn volume(&self) -> Option<&VolumeResource> {
        self.storage_instance().and_then(|si| si.volumes.first())
    }
}

/// Request body used to create an app instance
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct AppInstanceCreate {
    /// App instance name
    pub name: String,
    /// Always `kubernetes`
    pub create_mode: String,
    /// Template reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_template: Option<PathRef>,
    /// Overrides applied on top of the template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_override: Option<serde_json::Value>,
    /// Volume to clone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_volume_src: Option<PathRef>,
    /// Snapshot to clone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_snapshot_src: Option<PathRef>,
    /// Explicit layout for a fresh instance
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub storage_instances: Vec<StorageInstanceCreate>,
}

/// Storage instance part of `AppInstanceCreate`
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StorageInstanceCreate {
    /// Storage instance name
    pub name: String,
    /// IP pool reference
    pub ip_pool: PathRef,
    /// Volumes
    pub volumes: Vec<VolumeCreate>,
}

/// Volume part of `StorageInstanceCreate`
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct VolumeCreate {
    /// Volume name
    pub name: String,
    /// Size in GiB
    pub size: u64,
    /// Replica count
    pub replica_count: u32,
    /// Placement mode
    pub placement_mode: String,
    /// Placement policy reference
    pub placement_policy: PathRef,
}

/// QoS limits of a volume, zero is unlimited
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerformancePolicy {
    /// Read IOPS limit
    #[serde(default)]
    pub read_iops_max: u64,
    /// Write IOPS limit
    #[serde(default)]
    pub write_iops_max: u64,
    /// Total IOPS limit
    #[serde(default)]
    pub total_iops_max: u64,
    /// Read bandwidth limit
    #[serde(default)]
    pub read_bandwidth_max: u64,
    /// Write bandwidth limit
    #[serde(default)]
    pub write_bandwidth_max: u64,
    /// Total bandwidth limit
    #[serde(default)]
    pub total_bandwidth_max: u64,
}

impl PerformancePolicy {
    /// Flatten into a name keyed map for display
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        [
            ("read_iops_max", self.read_iops_max),
            ("write_iops_max", self.write_iops_max),
            ("total_iops_max", self.total_iops_max),
            ("read_bandwidth_max", self.read_bandwidth_max),
            ("write_bandwidth_max", self.write_bandwidth_max),
            ("total_bandwidth_max", self.total_bandwidth_max),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
    }
}

/// A point in time copy of a volume
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotResource {
    /// Resource path
    #[serde(default)]
    pub path: String,
    /// Identity supplied at creation
    #[serde(default)]
    pub uuid: String,
    /// Backend id, `<secs>.<nanos>` of creation
    #[serde(default)]
    pub utc_ts: String,
    /// `creating`, `available` or another state
    #[serde(default)]
    pub op_state: String,
}

/// Request body used to create a snapshot
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct SnapshotCreate {
    /// Identity derived from the orchestrator name
    pub uuid: String,
    /// Remote provider to send the snapshot to
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_provider: String,
}

/// A host initiator known by the backend
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Initiator {
    /// IQN
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Resource path
    #[serde(default)]
    pub path: String,
}

/// An access network IP pool
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpPool {
    /// Pool name
    pub name: String,
    /// Resource path
    #[serde(default)]
    pub path: String,
}

/// The backend cluster
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct System {
    /// Cluster name
    #[serde(default)]
    pub name: String,
    /// Cluster uuid
    #[serde(default)]
    pub uuid: String,
    /// Build version, e.g. `3.3.5`
    #[serde(default)]
    pub build_version: String,
    /// Software version
    #[serde(default)]
    pub sw_version: String,
    /// Health summary
    #[serde(default)]
    pub health: String,
    /// Operational state
    #[serde(default)]
    pub op_state: String,
    /// Time zone
    #[serde(default)]
    pub timezone: String,
    /// Call home
    #[serde(default)]
    pub callhome_enabled: bool,
    /// Compression
    #[serde(default)]
    pub compression_enabled: bool,
    /// L3 networking
    #[serde(default)]
    pub l3_enabled: bool,
    /// Total raw capacity in bytes
    #[serde(default)]
    pub total_capacity: u64,
    /// Provisioned capacity in bytes
    #[serde(default)]
    pub total_provisioned_capacity: u64,
    /// All flash raw capacity in bytes
    #[serde(default)]
    pub all_flash_total_capacity: u64,
    /// All flash provisioned capacity in bytes
    #[serde(default)]
    pub all_flash_provisioned_capacity: u64,
}
