//! Messages of the CSI v1 lifecycle protocol, written by hand to mirror
//! the `csi.proto` v1 schema while no gRPC transport is wired in. Field and
//! enum names follow the schema, enum values keep its numbering.
//!
//! Maps are `BTreeMap` so the `Debug` rendering of a request is stable,
//! the in-flight registry keys requests by it.

use std::collections::BTreeMap;
use std::fmt;

/// Replacement shown for secret values
const STRIPPED: &str = "***stripped***";

/// Secrets passed along a request, never rendered by `Debug`
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets(pub BTreeMap<String, String>);

impl Secrets {
    /// Get a secret value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether no secret is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, STRIPPED)))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Secrets {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Point in time, seconds and nanos since the epoch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetPluginInfoRequest {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetPluginInfoResponse {
    pub name: String,
    pub vendor_version: String,
    pub manifest: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetPluginCapabilitiesRequest {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetPluginCapabilitiesResponse {
    pub capabilities: Vec<PluginCapability>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginCapability {
    Service(PluginServiceType),
    VolumeExpansion(VolumeExpansionType),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginServiceType {
    Unknown,
    ControllerService,
    VolumeAccessibilityConstraints,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeExpansionType {
    Unknown,
    Online,
    Offline,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeRequest {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    pub ready: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapacityRange {
    pub required_bytes: i64,
    pub limit_bytes: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountVolume {
    pub fs_type: String,
    pub mount_flags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessType {
    Block,
    Mount(MountVolume),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(i32)]
pub enum AccessMode {
    #[default]
    Unknown = 0,
    SingleNodeWriter = 1,
    SingleNodeReaderOnly = 2,
    MultiNodeReaderOnly = 3,
    MultiNodeSingleWriter = 4,
    MultiNodeMultiWriter = 5,
}

impl AccessMode {
    /// Protocol name of the mode
    pub fn as_str_name(self) -> &'static str {
        match self {
            AccessMode::Unknown => "UNKNOWN",
            AccessMode::SingleNodeWriter => "SINGLE_NODE_WRITER",
            AccessMode::SingleNodeReaderOnly => "SINGLE_NODE_READER_ONLY",
            AccessMode::MultiNodeReaderOnly => "MULTI_NODE_READER_ONLY",
            AccessMode::MultiNodeSingleWriter => "MULTI_NODE_SINGLE_WRITER",
            AccessMode::MultiNodeMultiWriter => "MULTI_NODE_MULTI_WRITER",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_type: Option<AccessType>,
    pub access_mode: Option<AccessMode>,
}

impl VolumeCapability {
    /// A mount capability
    pub fn mount(fs_type: &str, mount_flags: &[&str], mode: AccessMode) -> Self {
        Self {
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: fs_type.to_owned(),
                mount_flags: mount_flags.iter().map(|f| (*f).to_owned()).collect(),
            })),
            access_mode: Some(mode),
        }
    }

    /// A raw block capability
    pub fn block(mode: AccessMode) -> Self {
        Self {
            access_type: Some(AccessType::Block),
            access_mode: Some(mode),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeContentSource {
    Snapshot { snapshot_id: String },
    Volume { volume_id: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    pub segments: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyRequirement {
    pub requisite: Vec<Topology>,
    pub preferred: Vec<Topology>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Volume {
    pub capacity_bytes: i64,
    pub volume_id: String,
    pub volume_context: BTreeMap<String, String>,
    pub content_source: Option<VolumeContentSource>,
    pub accessible_topology: Vec<Topology>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_range: Option<CapacityRange>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
    pub secrets: Secrets,
    pub volume_content_source: Option<VolumeContentSource>,
    pub accessibility_requirements: Option<TopologyRequirement>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateVolumeResponse {
    pub volume: Option<Volume>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    pub volume_capability: Option<VolumeCapability>,
    pub readonly: bool,
    pub secrets: Secrets,
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerPublishVolumeResponse {
    pub publish_context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerUnpublishVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    pub volume_context: BTreeMap<String, String>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidateVolumeCapabilitiesConfirmed {
    pub volume_context: BTreeMap<String, String>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidateVolumeCapabilitiesResponse {
    pub confirmed: Option<ValidateVolumeCapabilitiesConfirmed>,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListVolumesRequest {
    pub max_entries: i32,
    pub starting_token: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListVolumesEntry {
    pub volume: Option<Volume>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListVolumesResponse {
    pub entries: Vec<ListVolumesEntry>,
    pub next_token: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetCapacityRequest {
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
    pub accessible_topology: Option<Topology>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetCapacityResponse {
    pub available_capacity: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerGetCapabilitiesRequest {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerServiceCapability {
    Unknown,
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    CreateDeleteSnapshot,
    ListSnapshots,
    CloneVolume,
    PublishReadonly,
    ExpandVolume,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerGetCapabilitiesResponse {
    pub capabilities: Vec<ControllerServiceCapability>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub size_bytes: i64,
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub creation_time: Option<Timestamp>,
    pub ready_to_use: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    pub secrets: Secrets,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateSnapshotResponse {
    pub snapshot: Option<Snapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteSnapshotResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListSnapshotsRequest {
    pub max_entries: i32,
    pub starting_token: String,
    pub source_volume_id: String,
    pub snapshot_id: String,
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListSnapshotsEntry {
    pub snapshot: Option<Snapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListSnapshotsResponse {
    pub entries: Vec<ListSnapshotsEntry>,
    pub next_token: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_range: Option<CapacityRange>,
    pub secrets: Secrets,
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: i64,
    pub node_expansion_required: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub publish_context: BTreeMap<String, String>,
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub secrets: Secrets,
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStageVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeUnstageVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub publish_context: BTreeMap<String, String>,
    pub staging_target_path: String,
    pub target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub readonly: bool,
    pub secrets: Secrets,
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePublishVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeUnpublishVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub staging_target_path: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VolumeUsageUnit {
    #[default]
    Unknown,
    Bytes,
    Inodes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeUsage {
    pub available: i64,
    pub total: i64,
    pub used: i64,
    pub unit: VolumeUsageUnit,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeGetVolumeStatsResponse {
    pub usage: Vec<VolumeUsage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub capacity_range: Option<CapacityRange>,
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeGetCapabilitiesRequest {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeServiceCapability {
    Unknown,
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<NodeServiceCapability>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeGetInfoRequest {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    pub max_volumes_per_node: i64,
    pub accessible_topology: Option<Topology>,
}
