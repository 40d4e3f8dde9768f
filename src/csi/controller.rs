//! The implementation for CSI controller service

use std::sync::Arc;

use async_trait::async_trait;
use clippy_utilities::OverflowArithmetic;
use tonic::Status;
use tracing::{debug, info, warn};

use super::coordinator::InFlight;
use super::meta_data::{MetadataStore, VolMetadata};
use super::params::{SnapshotParams, VolumeParams, PVC_NAME, PVC_NAMESPACE, PV_NAME};
use super::proto::csi::{
    AccessMode, CapacityRange, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ListSnapshotsEntry, ListSnapshotsRequest, ListSnapshotsResponse,
    ListVolumesEntry, ListVolumesRequest, ListVolumesResponse, Snapshot as CsiSnapshot,
    ValidateVolumeCapabilitiesConfirmed, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume as CsiVolume, VolumeCapability,
    VolumeContentSource,
};
use super::proto::csi_grpc::Controller;
use super::snapshot::{Snapshot, SnapshotManager};
use super::util;
use super::volume::{Volume, VolumeManager, VolumeOptions, VolumeSource};
use crate::backend::types::volume_path;
use crate::common::error::DateraError::{
    ArgumentInvalid, SnapshotNotFound, Unimplemented, VolumeNotFound,
};
use crate::common::error::{DateraError, DateraResult};
use crate::common::util as common_util;

/// Component name used in request fingerprints
const COMPONENT: &str = "controller";

/// for `ControllerService` implementation
#[derive(Clone, Debug)]
pub struct ControllerImpl {
    /// Inner data
    inner: Arc<ControllerImplInner>,
}

/// Holding `ControllerImpl` inner data
#[derive(Debug)]
struct ControllerImplInner {
    /// Controller capabilities
    caps: Vec<ControllerServiceCapability>,
    /// Volume lifecycle
    volumes: Arc<VolumeManager>,
    /// Snapshot lifecycle
    snapshots: SnapshotManager,
    /// Volume metadata
    metadata: Arc<MetadataStore>,
    /// Requests being served
    inflight: InFlight,
}

impl ControllerImpl {
    /// Create `ControllerImpl`
    pub fn new(
        volumes: Arc<VolumeManager>,
        snapshots: SnapshotManager,
        metadata: Arc<MetadataStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerImplInner::new(volumes, snapshots, metadata)),
        }
    }
}

/// Map a backend not-found on a volume to `VolumeNotFound`
fn volume_not_found(volume_id: &str) -> impl FnOnce(DateraError) -> DateraError + '_ {
    move |e| {
        if e.is_not_found() {
            VolumeNotFound {
                volume_id: volume_id.to_owned(),
                context: vec![e.to_string()],
            }
        } else {
            e
        }
    }
}

/// Sizes in GiB derived from a capacity range: size to provision, and the
/// required and limit bounds, 0 when unset
fn capacity_gib(range: Option<&CapacityRange>) -> DateraResult<(u64, u64, u64)> {
    let Some(range) = range else {
        return Ok((util::DEFAULT_SIZE_GIB, 0, 0));
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(ArgumentInvalid {
            context: vec![format!("capacity range {range:?} is negative")],
        });
    }
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(ArgumentInvalid {
            context: vec![format!(
                "required bytes {} exceed limit bytes {}",
                range.required_bytes, range.limit_bytes
            )],
        });
    }
    let required = if range.required_bytes > 0 {
        util::bytes_to_gib(range.required_bytes)
    } else {
        0
    };
    let limit = if range.limit_bytes > 0 {
        util::whole_gib(range.limit_bytes)
    } else {
        0
    };
    if range.limit_bytes > 0 && (limit == 0 || required > limit) {
        return Err(ArgumentInvalid {
            context: vec![format!("capacity range {range:?} holds no whole GiB")],
        });
    }
    let size = match (required, limit) {
        (0, 0) => util::DEFAULT_SIZE_GIB,
        (0, l) => l,
        (r, _) => r,
    };
    Ok((size, required, limit))
}

/// Why a capability cannot be served, `None` when it can
fn unsupported_reason(cap: &VolumeCapability) -> Option<String> {
    if let Err(e) = VolMetadata::default().register_volume_capability(cap) {
        return Some(e.to_string());
    }
    match cap.access_mode {
        None | Some(AccessMode::Unknown) => Some("access mode is missing".to_owned()),
        Some(mode @ (AccessMode::MultiNodeMultiWriter | AccessMode::MultiNodeSingleWriter)) => {
            Some(format!("access mode {} is not supported", mode.as_str_name()))
        }
        Some(_) => None,
    }
}

/// Convert to the CSI volume
fn to_csi_volume(vol: &Volume, params: &VolumeParams, source: Option<VolumeContentSource>) -> CsiVolume {
    CsiVolume {
        capacity_bytes: util::gib_to_bytes(vol.size_gib),
        volume_id: vol.name.clone(),
        volume_context: params.to_map(vol.size_gib),
        content_source: source,
        accessible_topology: vec![],
    }
}

/// Convert to the CSI snapshot
fn to_csi_snapshot(snap: &Snapshot) -> CsiSnapshot {
    CsiSnapshot {
        size_bytes: util::gib_to_bytes(snap.size_gib),
        snapshot_id: snap.composite_id(),
        source_volume_id: snap.volume.clone(),
        creation_time: util::parse_utc_ts(&snap.id),
        ready_to_use: snap.is_available(),
    }
}

impl ControllerImplInner {
    /// Create `ControllerImplInner`
    fn new(
        volumes: Arc<VolumeManager>,
        snapshots: SnapshotManager,
        metadata: Arc<MetadataStore>,
    ) -> Self {
        let caps = vec![
            ControllerServiceCapability::ListVolumes,
            ControllerServiceCapability::CreateDeleteVolume,
            ControllerServiceCapability::GetCapacity,
            ControllerServiceCapability::CreateDeleteSnapshot,
            ControllerServiceCapability::ListSnapshots,
            ControllerServiceCapability::CloneVolume,
            ControllerServiceCapability::ExpandVolume,
        ];
        Self {
            caps,
            volumes,
            snapshots,
            metadata,
            inflight: InFlight::new(),
        }
    }

    /// Validate request with controller capabilities
    fn validate_request_capability(&self, rpc_type: ControllerServiceCapability) -> DateraResult<()> {
        if rpc_type == ControllerServiceCapability::Unknown || self.caps.contains(&rpc_type) {
            Ok(())
        } else {
            Err(ArgumentInvalid {
                context: vec![format!("unsupported capability {rpc_type:?}")],
            })
        }
    }

    /// The pre-check helper function for `create_volume`
    fn create_volume_pre_check(req: &CreateVolumeRequest) -> DateraResult<()> {
        if req.name.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["name missing in request".to_owned()],
            });
        }
        if req.volume_capabilities.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["volume capabilities missing in request".to_owned()],
            });
        }
        if let Some(reason) = req.volume_capabilities.iter().find_map(unsupported_reason) {
            return Err(ArgumentInvalid {
                context: vec![reason],
            });
        }
        if let Some(ref topology) = req.accessibility_requirements {
            if !topology.requisite.is_empty() || !topology.preferred.is_empty() {
                return Err(ArgumentInvalid {
                    context: vec!["accessibility requirements are not supported".to_owned()],
                });
            }
        }
        Ok(())
    }

    /// Resolve where the new volume comes from
    async fn volume_source(
        &self,
        req: &CreateVolumeRequest,
        params: &VolumeParams,
    ) -> DateraResult<VolumeSource> {
        let template = params.template_name();
        let clone_volume = match req.volume_content_source {
            _ if !params.clone_volume_src.is_empty() => params.clone_volume_src.clone(),
            Some(VolumeContentSource::Volume { ref volume_id }) => volume_path(volume_id),
            _ => String::new(),
        };
        let clone_snapshot = match req.volume_content_source {
            Some(VolumeContentSource::Snapshot { ref snapshot_id })
                if template.is_empty() && clone_volume.is_empty() =>
            {
                self.snapshots
                    .path_from_id(snapshot_id)
                    .await
                    .map_err(|e| match e {
                        SnapshotNotFound { .. } => e,
                        e if e.is_not_found() => SnapshotNotFound {
                            snapshot_id: snapshot_id.clone(),
                            context: vec![e.to_string()],
                        },
                        e => e,
                    })?
            }
            _ => String::new(),
        };
        Ok(VolumeSource::select(template, &clone_volume, &clone_snapshot))
    }

    /// Record the request on the volume, failures are only logged
    async fn record_create(
        &self,
        name: &str,
        req: &CreateVolumeRequest,
        params: &VolumeParams,
        size_gib: u64,
    ) {
        let res = self
            .metadata
            .update(name, |m| {
                m.set_display_name(&req.name);
                if let Some(cap) = req.volume_capabilities.first() {
                    if let Err(e) = m.register_volume_capability(cap) {
                        warn!("failed to record capability of volume {}: {}", name, e);
                    }
                }
                m.delete_on_unmount = params.delete_on_unmount;
                m.ip_pool = params.ip_pool.clone();
                m.round_robin = params.round_robin;
                if !params.fs_args.is_empty() {
                    m.fs_args = params.fs_args.clone();
                }
                m.extra.extend(params.to_map(size_gib));
                for (param, key) in [
                    (PVC_NAME, "pvc_name"),
                    (PVC_NAMESPACE, "pvc_namespace"),
                    (PV_NAME, "pv_name"),
                ] {
                    if let Some(value) = req.parameters.get(param) {
                        m.extra.insert(key.to_owned(), value.clone());
                    }
                }
            })
            .await;
        if let Err(e) = res {
            warn!("failed to set metadata of volume {}, the error is: {}", name, e);
        }
    }

    /// Handle `create_volume`
    async fn create_volume(&self, req: &CreateVolumeRequest) -> DateraResult<CreateVolumeResponse> {
        self.validate_request_capability(ControllerServiceCapability::CreateDeleteVolume)?;
        Self::create_volume_pre_check(req)?;

        let params = VolumeParams::parse(&req.parameters)?;
        let (size_gib, required_gib, limit_gib) = capacity_gib(req.capacity_range.as_ref())?;
        let name = common_util::gen_name(&req.name);
        let source = self.volume_source(req, &params).await?;
        let opts = VolumeOptions {
            size_gib,
            required_gib,
            limit_gib,
            params,
            source,
        };
        let vol = self.volumes.create(&name, &opts).await?;
        self.record_create(&name, req, &opts.params, vol.size_gib).await;
        info!("volume {} ready for {}", vol.name, req.name);
        Ok(CreateVolumeResponse {
            volume: Some(to_csi_volume(
                &vol,
                &opts.params,
                req.volume_content_source.clone(),
            )),
        })
    }

    /// Handle `delete_volume`
    async fn delete_volume(&self, req: &DeleteVolumeRequest) -> DateraResult<DeleteVolumeResponse> {
        self.validate_request_capability(ControllerServiceCapability::CreateDeleteVolume)?;
        if req.volume_id.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["volume ID missing in request".to_owned()],
            });
        }
        self.volumes.delete(&req.volume_id).await?;
        Ok(DeleteVolumeResponse {})
    }

    /// Handle `validate_volume_capabilities`
    async fn validate_volume_capabilities(
        &self,
        req: &ValidateVolumeCapabilitiesRequest,
    ) -> DateraResult<ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["volume ID missing in request".to_owned()],
            });
        }
        if req.volume_capabilities.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["volume capabilities missing in request".to_owned()],
            });
        }
        self.volumes
            .get(&req.volume_id)
            .await
            .map_err(volume_not_found(&req.volume_id))?;
        let reasons: Vec<String> = req
            .volume_capabilities
            .iter()
            .filter_map(unsupported_reason)
            .collect();
        if reasons.is_empty() {
            Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: Some(ValidateVolumeCapabilitiesConfirmed {
                    volume_context: req.volume_context.clone(),
                    volume_capabilities: req.volume_capabilities.clone(),
                    parameters: req.parameters.clone(),
                }),
                message: String::new(),
            })
        } else {
            Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: reasons.join("; "),
            })
        }
    }

    /// Handle `list_volumes`
    async fn list_volumes(&self, req: &ListVolumesRequest) -> DateraResult<ListVolumesResponse> {
        self.validate_request_capability(ControllerServiceCapability::ListVolumes)?;
        let max = util::parse_max_entries(req.max_entries)?;
        let start = util::parse_starting_token(&req.starting_token)?;
        let (vols, read) = self.volumes.list(max, start).await?;
        let next_token = if max > 0 && read == max {
            start.overflow_add(max).to_string()
        } else {
            String::new()
        };
        let params = VolumeParams::default();
        Ok(ListVolumesResponse {
            entries: vols
                .iter()
                .map(|vol| ListVolumesEntry {
                    volume: Some(to_csi_volume(vol, &params, None)),
                })
                .collect(),
            next_token,
        })
    }

    /// Handle `get_capacity`
    async fn get_capacity(&self, req: &GetCapacityRequest) -> DateraResult<GetCapacityResponse> {
        self.validate_request_capability(ControllerServiceCapability::GetCapacity)?;
        let params = VolumeParams::parse(&req.parameters)?;
        Ok(GetCapacityResponse {
            available_capacity: self.volumes.capacity(&params).await?,
        })
    }

    /// Handle `create_snapshot`
    async fn create_snapshot(
        &self,
        req: &CreateSnapshotRequest,
    ) -> DateraResult<CreateSnapshotResponse> {
        self.validate_request_capability(ControllerServiceCapability::CreateDeleteSnapshot)?;
        if req.source_volume_id.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["source volume ID missing in request".to_owned()],
            });
        }
        if req.name.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["snapshot name missing in request".to_owned()],
            });
        }
        let params = SnapshotParams::parse(&req.parameters);
        debug!("snapshot parameters: {:?}", params);
        let snap = self
            .snapshots
            .create(&req.source_volume_id, &req.name, &params.remote_provider_uuid)
            .await
            .map_err(volume_not_found(&req.source_volume_id))?;
        Ok(CreateSnapshotResponse {
            snapshot: Some(to_csi_snapshot(&snap)),
        })
    }

    /// Handle `delete_snapshot`
    async fn delete_snapshot(
        &self,
        req: &DeleteSnapshotRequest,
    ) -> DateraResult<DeleteSnapshotResponse> {
        self.validate_request_capability(ControllerServiceCapability::CreateDeleteSnapshot)?;
        if req.snapshot_id.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["snapshot ID missing in request".to_owned()],
            });
        }
        self.snapshots.delete(&req.snapshot_id).await?;
        Ok(DeleteSnapshotResponse {})
    }

    /// Handle `list_snapshots`
    async fn list_snapshots(
        &self,
        req: &ListSnapshotsRequest,
    ) -> DateraResult<ListSnapshotsResponse> {
        self.validate_request_capability(ControllerServiceCapability::ListSnapshots)?;
        let max = util::parse_max_entries(req.max_entries)?;
        let start = util::parse_starting_token(&req.starting_token)?;
        let (page, next) = self
            .snapshots
            .list(&req.source_volume_id, &req.snapshot_id, start, max)
            .await?;
        Ok(ListSnapshotsResponse {
            entries: page
                .iter()
                .map(|snap| ListSnapshotsEntry {
                    snapshot: Some(to_csi_snapshot(snap)),
                })
                .collect(),
            next_token: if next > 0 { next.to_string() } else { String::new() },
        })
    }

    /// Handle `controller_expand_volume`
    async fn controller_expand_volume(
        &self,
        req: &ControllerExpandVolumeRequest,
    ) -> DateraResult<ControllerExpandVolumeResponse> {
        self.validate_request_capability(ControllerServiceCapability::ExpandVolume)?;
        if req.volume_id.is_empty() {
            return Err(ArgumentInvalid {
                context: vec!["volume ID missing in request".to_owned()],
            });
        }
        let range = req.capacity_range.as_ref().ok_or_else(|| ArgumentInvalid {
            context: vec!["capacity range missing in request".to_owned()],
        })?;
        let new_gib = util::bytes_to_gib(range.required_bytes);
        let vol = self
            .volumes
            .get(&req.volume_id)
            .await
            .map_err(volume_not_found(&req.volume_id))?;
        let size_gib = if new_gib > vol.size_gib {
            self.volumes.resize(&vol.name, new_gib).await?.size_gib
        } else {
            info!(
                "volume {} is {}GiB, no need to expand to {}GiB",
                vol.name, vol.size_gib, new_gib
            );
            vol.size_gib
        };
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: util::gib_to_bytes(size_gib),
            node_expansion_required: true,
        })
    }
}

#[async_trait]
impl Controller for ControllerImpl {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse, Status> {
        debug!("create_volume request: {:?}", req);
        let method = "create_volume";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .create_volume(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<DeleteVolumeResponse, Status> {
        debug!("delete_volume request: {:?}", req);
        let method = "delete_volume";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .delete_volume(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status> {
        debug!("controller_publish_volume request: {:?}", req);
        Err(util::into_status(
            "controller_publish_volume",
            Unimplemented {
                context: vec!["attach happens on node stage".to_owned()],
            },
        ))
    }

    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status> {
        debug!("controller_unpublish_volume request: {:?}", req);
        Err(util::into_status(
            "controller_unpublish_volume",
            Unimplemented {
                context: vec!["detach happens on node unstage".to_owned()],
            },
        ))
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status> {
        debug!("validate_volume_capabilities request: {:?}", req);
        let method = "validate_volume_capabilities";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .validate_volume_capabilities(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, Status> {
        debug!("list_volumes request: {:?}", req);
        let method = "list_volumes";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .list_volumes(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<GetCapacityResponse, Status> {
        debug!("get_capacity request: {:?}", req);
        let method = "get_capacity";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .get_capacity(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn controller_get_capabilities(
        &self,
        req: ControllerGetCapabilitiesRequest,
    ) -> Result<ControllerGetCapabilitiesResponse, Status> {
        debug!("controller_get_capabilities request: {:?}", req);
        Ok(ControllerGetCapabilitiesResponse {
            capabilities: self.inner.caps.clone(),
        })
    }

    async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, Status> {
        debug!("create_snapshot request: {:?}", req);
        let method = "create_snapshot";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .create_snapshot(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn delete_snapshot(
        &self,
        req: DeleteSnapshotRequest,
    ) -> Result<DeleteSnapshotResponse, Status> {
        debug!("delete_snapshot request: {:?}", req);
        let method = "delete_snapshot";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .delete_snapshot(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, Status> {
        debug!("list_snapshots request: {:?}", req);
        let method = "list_snapshots";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .list_snapshots(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, Status> {
        debug!("controller_expand_volume request: {:?}", req);
        let method = "controller_expand_volume";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .controller_expand_volume(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }
}
