//! Service definitions of the CSI v1 lifecycle protocol.
//! The transport binds these to the gRPC listener.

use async_trait::async_trait;
use tonic::Status;

use super::csi::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
    GetPluginInfoRequest, GetPluginInfoResponse, ListSnapshotsRequest, ListSnapshotsResponse,
    ListVolumesRequest, ListVolumesResponse, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse,
    NodePublishVolumeRequest, NodePublishVolumeResponse, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, ProbeRequest, ProbeResponse,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
};

#[async_trait]
pub trait Identity: Send + Sync {
    async fn get_plugin_info(
        &self,
        req: GetPluginInfoRequest,
    ) -> Result<GetPluginInfoResponse, Status>;
    async fn get_plugin_capabilities(
        &self,
        req: GetPluginCapabilitiesRequest,
    ) -> Result<GetPluginCapabilitiesResponse, Status>;
    async fn probe(&self, req: ProbeRequest) -> Result<ProbeResponse, Status>;
}

#[async_trait]
pub trait Controller: Send + Sync {
    async fn create_volume(&self, req: CreateVolumeRequest)
        -> Result<CreateVolumeResponse, Status>;
    async fn delete_volume(&self, req: DeleteVolumeRequest)
        -> Result<DeleteVolumeResponse, Status>;
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status>;
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status>;
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status>;
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, Status>;
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<GetCapacityResponse, Status>;
    async fn controller_get_capabilities(
        &self,
        req: ControllerGetCapabilitiesRequest,
    ) -> Result<ControllerGetCapabilitiesResponse, Status>;
    async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, Status>;
    async fn delete_snapshot(
        &self,
        req: DeleteSnapshotRequest,
    ) -> Result<DeleteSnapshotResponse, Status>;
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, Status>;
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, Status>;
}

#[async_trait]
pub trait Node: Send + Sync {
    async fn node_stage_volume(
        &self,
        req: NodeStageVolumeRequest,
    ) -> Result<NodeStageVolumeResponse, Status>;
    async fn node_unstage_volume(
        &self,
        req: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, Status>;
    async fn node_publish_volume(
        &self,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status>;
    async fn node_unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status>;
    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, Status>;
    async fn node_expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, Status>;
    async fn node_get_capabilities(
        &self,
        req: NodeGetCapabilitiesRequest,
    ) -> Result<NodeGetCapabilitiesResponse, Status>;
    async fn node_get_info(&self, req: NodeGetInfoRequest)
        -> Result<NodeGetInfoResponse, Status>;
}
