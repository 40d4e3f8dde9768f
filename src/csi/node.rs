//! The implementation for CSI node service

use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;
use tracing::{debug, error, info, warn};

use super::attach::Attacher;
use super::coordinator::InFlight;
use super::meta_data::VolMetadata;
use super::params::{POD_NAME, POD_NAMESPACE, POD_UID, SERVICE_ACCOUNT};
use super::proto::csi::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, VolumeUsage, VolumeUsageUnit,
};
use super::proto::csi_grpc::Node;
use super::util;
use super::volume::VolumeManager;
use crate::common::error::DateraError::{ArgumentInvalid, VolumeNotFound};
use crate::common::error::DateraResult;

/// Component name used in request fingerprints
const COMPONENT: &str = "node";

/// for `NodeService` implementation
#[derive(Clone, Debug)]
pub struct NodeImpl {
    /// Inner data
    inner: Arc<NodeImplInner>,
}

/// Holding `NodeImpl` inner data
#[derive(Debug)]
struct NodeImplInner {
    /// Node capabilities
    caps: Vec<NodeServiceCapability>,
    /// Node id reported to the orchestrator
    node_id: String,
    /// Max volumes reported to the orchestrator
    max_volumes_per_node: i64,
    /// Attach state machine
    attacher: Attacher,
    /// Volume lifecycle, used by delete on unmount
    volumes: Arc<VolumeManager>,
    /// Requests being served
    inflight: InFlight,
}

impl NodeImpl {
    /// Create `NodeImpl`
    pub fn new(
        node_id: String,
        max_volumes_per_node: i64,
        attacher: Attacher,
        volumes: Arc<VolumeManager>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeImplInner::new(
                node_id,
                max_volumes_per_node,
                attacher,
                volumes,
            )),
        }
    }
}

/// Fail with `ArgumentInvalid` when `value` is empty
fn require(value: &str, what: &str) -> DateraResult<()> {
    if value.is_empty() {
        return Err(ArgumentInvalid {
            context: vec![format!("{what} missing in request")],
        });
    }
    Ok(())
}

impl NodeImplInner {
    /// Create `NodeImplInner`
    fn new(
        node_id: String,
        max_volumes_per_node: i64,
        attacher: Attacher,
        volumes: Arc<VolumeManager>,
    ) -> Self {
        let caps = vec![
            NodeServiceCapability::StageUnstageVolume,
            NodeServiceCapability::GetVolumeStats,
            NodeServiceCapability::ExpandVolume,
        ];
        Self {
            caps,
            node_id,
            max_volumes_per_node,
            attacher,
            volumes,
            inflight: InFlight::new(),
        }
    }

    /// Validate request with node capabilities
    fn validate_request_capability(&self, rpc_type: NodeServiceCapability) -> DateraResult<()> {
        if rpc_type == NodeServiceCapability::Unknown || self.caps.contains(&rpc_type) {
            Ok(())
        } else {
            Err(ArgumentInvalid {
                context: vec![format!("unsupported capability {rpc_type:?}")],
            })
        }
    }

    /// Load the metadata, a missing volume is `VolumeNotFound`
    async fn load(&self, volume_id: &str) -> DateraResult<VolMetadata> {
        self.attacher
            .metadata()
            .load(volume_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    VolumeNotFound {
                        volume_id: volume_id.to_owned(),
                        context: vec![e.to_string()],
                    }
                } else {
                    e
                }
            })
    }

    /// Handle `node_stage_volume`
    async fn node_stage_volume(
        &self,
        req: &NodeStageVolumeRequest,
    ) -> DateraResult<NodeStageVolumeResponse> {
        self.validate_request_capability(NodeServiceCapability::StageUnstageVolume)?;
        require(&req.volume_id, "volume ID")?;
        require(&req.staging_target_path, "staging target path")?;
        let cap = req.volume_capability.as_ref().ok_or_else(|| ArgumentInvalid {
            context: vec!["volume capability missing in request".to_owned()],
        })?;
        let vol_id = req.volume_id.as_str();

        let mut meta = self.load(vol_id).await?;
        meta.register_volume_capability(cap)?;
        self.attacher.metadata().save(vol_id, &meta).await?;

        self.attacher.register_acl(vol_id).await?;
        if !meta.ip_pool.is_empty() {
            self.attacher.register_ip_pool(vol_id, &meta.ip_pool).await?;
        }
        self.attacher.login(vol_id, &req.secrets).await?;
        if meta.is_block() {
            info!("block volume {} staged", vol_id);
            return Ok(NodeStageVolumeResponse {});
        }
        self.attacher.format(vol_id).await?;
        self.attacher.mount(vol_id, &req.staging_target_path).await?;
        info!("volume {} staged at {}", vol_id, req.staging_target_path);
        Ok(NodeStageVolumeResponse {})
    }

    /// Handle `node_unstage_volume`. Every step is attempted, failures are
    /// logged and the call still succeeds.
    async fn node_unstage_volume(
        &self,
        req: &NodeUnstageVolumeRequest,
    ) -> DateraResult<NodeUnstageVolumeResponse> {
        self.validate_request_capability(NodeServiceCapability::StageUnstageVolume)?;
        require(&req.volume_id, "volume ID")?;
        require(&req.staging_target_path, "staging target path")?;
        let vol_id = req.volume_id.as_str();

        let meta = match self.load(vol_id).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("skip unstaging volume {}, the error is: {}", vol_id, e);
                return Ok(NodeUnstageVolumeResponse {});
            }
        };
        if let Err(e) = self
            .attacher
            .unmount(vol_id, &req.staging_target_path)
            .await
        {
            error!("failed to unmount volume {}, the error is: {}", vol_id, e);
        }
        if let Err(e) = self.attacher.logout(vol_id).await {
            error!("failed to log out of volume {}, the error is: {}", vol_id, e);
        }
        if let Err(e) = self.attacher.unregister_acl(vol_id).await {
            error!("failed to unregister ACL of volume {}, the error is: {}", vol_id, e);
        }
        let cleared = self
            .attacher
            .metadata()
            .update(vol_id, |m| {
                m.mount_path.clear();
                m.device_path.clear();
            })
            .await;
        if let Err(e) = cleared {
            error!("failed to clear paths of volume {}, the error is: {}", vol_id, e);
        }
        if meta.delete_on_unmount {
            match self.volumes.delete(vol_id).await {
                Ok(()) => info!("deleted volume {} on unstage", vol_id),
                Err(e) => error!("failed to delete volume {}, the error is: {}", vol_id, e),
            }
        }
        info!("volume {} unstaged", vol_id);
        Ok(NodeUnstageVolumeResponse {})
    }

    /// Handle `node_publish_volume`
    async fn node_publish_volume(
        &self,
        req: &NodePublishVolumeRequest,
    ) -> DateraResult<NodePublishVolumeResponse> {
        require(&req.volume_id, "volume ID")?;
        require(&req.target_path, "target path")?;
        if req.volume_capability.is_none() {
            return Err(ArgumentInvalid {
                context: vec!["volume capability missing in request".to_owned()],
            });
        }
        let vol_id = req.volume_id.as_str();
        let meta = self.load(vol_id).await?;
        if !meta.is_block() {
            require(&req.staging_target_path, "staging target path")?;
        }
        self.attacher
            .bind_mount(vol_id, &req.target_path, req.readonly)
            .await?;

        let ctx = &req.volume_context;
        let res = self
            .attacher
            .metadata()
            .update(vol_id, |m| {
                for (key, field) in [
                    (POD_NAME, &mut m.pod_name),
                    (POD_NAMESPACE, &mut m.pod_namespace),
                    (POD_UID, &mut m.pod_uid),
                    (SERVICE_ACCOUNT, &mut m.service_account),
                ] {
                    if let Some(value) = ctx.get(key) {
                        field.clone_from(value);
                    }
                }
            })
            .await;
        if let Err(e) = res {
            warn!("failed to record workload of volume {}, the error is: {}", vol_id, e);
        }
        info!("volume {} published at {}", vol_id, req.target_path);
        Ok(NodePublishVolumeResponse {})
    }

    /// Handle `node_unpublish_volume`
    async fn node_unpublish_volume(
        &self,
        req: &NodeUnpublishVolumeRequest,
    ) -> DateraResult<NodeUnpublishVolumeResponse> {
        require(&req.volume_id, "volume ID")?;
        require(&req.target_path, "target path")?;
        let vol_id = req.volume_id.as_str();
        match self.load(vol_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!("volume {} is gone, nothing to unpublish", vol_id);
                return Ok(NodeUnpublishVolumeResponse {});
            }
            Err(e) => return Err(e),
        }
        if let Err(e) = self.attacher.unbind(vol_id, &req.target_path).await {
            warn!(
                "failed to unbind volume {} from {}, the error is: {}",
                vol_id, req.target_path, e
            );
        }
        let target = req.target_path.as_str();
        if let Err(e) = self
            .attacher
            .metadata()
            .update(vol_id, |m| {
                m.bind_mounts.remove(target);
                m.clear_workload();
            })
            .await
        {
            warn!("failed to clear workload of volume {}, the error is: {}", vol_id, e);
        }
        info!("volume {} unpublished from {}", vol_id, req.target_path);
        Ok(NodeUnpublishVolumeResponse {})
    }

    /// Handle `node_get_volume_stats`
    async fn node_get_volume_stats(
        &self,
        req: &NodeGetVolumeStatsRequest,
    ) -> DateraResult<NodeGetVolumeStatsResponse> {
        self.validate_request_capability(NodeServiceCapability::GetVolumeStats)?;
        require(&req.volume_id, "volume ID")?;
        require(&req.volume_path, "volume path")?;
        let vol = self.volumes.get(&req.volume_id).await.map_err(|e| {
            if e.is_not_found() {
                VolumeNotFound {
                    volume_id: req.volume_id.clone(),
                    context: vec![e.to_string()],
                }
            } else {
                e
            }
        })?;
        let total = util::gib_to_bytes(vol.size_gib);
        let used = util::gib_to_bytes(vol.used_gib);
        Ok(NodeGetVolumeStatsResponse {
            usage: vec![VolumeUsage {
                available: total.saturating_sub(used),
                total,
                used,
                unit: VolumeUsageUnit::Bytes,
            }],
        })
    }

    /// Handle `node_expand_volume`
    async fn node_expand_volume(
        &self,
        req: &NodeExpandVolumeRequest,
    ) -> DateraResult<NodeExpandVolumeResponse> {
        self.validate_request_capability(NodeServiceCapability::ExpandVolume)?;
        require(&req.volume_id, "volume ID")?;
        require(&req.volume_path, "volume path")?;
        let meta = self.load(&req.volume_id).await?;
        self.attacher.rescan().await?;
        let mount_path = if meta.mount_path.is_empty() {
            req.volume_path.as_str()
        } else {
            meta.mount_path.as_str()
        };
        self.attacher.grow_filesystem(&meta, mount_path).await?;
        info!("volume {} expanded", req.volume_id);
        Ok(NodeExpandVolumeResponse {
            capacity_bytes: req
                .capacity_range
                .as_ref()
                .map_or(0, |r| r.required_bytes),
        })
    }
}

#[async_trait]
impl Node for NodeImpl {
    async fn node_stage_volume(
        &self,
        req: NodeStageVolumeRequest,
    ) -> Result<NodeStageVolumeResponse, Status> {
        debug!("node_stage_volume request: {:?}", req);
        let method = "node_stage_volume";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .node_stage_volume(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn node_unstage_volume(
        &self,
        req: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, Status> {
        debug!("node_unstage_volume request: {:?}", req);
        let method = "node_unstage_volume";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .node_unstage_volume(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn node_publish_volume(
        &self,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status> {
        debug!("node_publish_volume request: {:?}", req);
        let method = "node_publish_volume";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .node_publish_volume(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn node_unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status> {
        debug!("node_unpublish_volume request: {:?}", req);
        let method = "node_unpublish_volume";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .node_unpublish_volume(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, Status> {
        debug!("node_get_volume_stats request: {:?}", req);
        let method = "node_get_volume_stats";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .node_get_volume_stats(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn node_expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, Status> {
        debug!("node_expand_volume request: {:?}", req);
        let method = "node_expand_volume";
        let _guard = self
            .inner
            .inflight
            .enter(COMPONENT, method, &req)
            .map_err(|e| util::into_status(method, e))?;
        self.inner
            .node_expand_volume(&req)
            .await
            .map_err(|e| util::into_status(method, e))
    }

    async fn node_get_capabilities(
        &self,
        req: NodeGetCapabilitiesRequest,
    ) -> Result<NodeGetCapabilitiesResponse, Status> {
        debug!("node_get_capabilities request: {:?}", req);
        Ok(NodeGetCapabilitiesResponse {
            capabilities: self.inner.caps.clone(),
        })
    }

    async fn node_get_info(&self, req: NodeGetInfoRequest) -> Result<NodeGetInfoResponse, Status> {
        debug!("node_get_info request: {:?}", req);
        Ok(NodeGetInfoResponse {
            node_id: self.inner.node_id.clone(),
            max_volumes_per_node: self.inner.max_volumes_per_node,
            accessible_topology: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use tonic::Code;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::Backend;
    use crate::csi::attach::HostPaths;
    use crate::csi::controller::ControllerImpl;
    use crate::csi::meta_data::MetadataStore;
    use crate::csi::proto::csi::{
        AccessMode, CapacityRange, CreateVolumeRequest, DeleteVolumeRequest, VolumeCapability,
    };
    use crate::csi::proto::csi_grpc::Controller;
    use crate::csi::snapshot::SnapshotManager;
    use crate::exec::mock::FakeHost;
    use crate::exec::Executor;

    const GIB: i64 = 1 << 30;

    struct Cluster {
        backend: Arc<MemoryBackend>,
        host: Arc<FakeHost>,
        controller: ControllerImpl,
        node: NodeImpl,
    }

    fn cluster() -> Cluster {
        let backend = Arc::new(MemoryBackend::new());
        let host = Arc::new(FakeHost::new());
        let dyn_backend: Arc<dyn Backend> = Arc::<MemoryBackend>::clone(&backend);
        let exec: Arc<dyn Executor> = Arc::<FakeHost>::clone(&host);
        let store = Arc::new(MetadataStore::new(Arc::clone(&dyn_backend), false));
        let volumes = Arc::new(VolumeManager::new(
            Arc::clone(&dyn_backend),
            Arc::clone(&store),
            false,
        ));
        let paths = HostPaths {
            initiator_file: host.initiator_file(),
            by_path_dir: host.by_path_dir(),
            sys_block_dir: host.sys_block_dir(),
            proc_mounts: host.proc_mounts(),
        };
        let attacher = Attacher::new(
            Arc::clone(&dyn_backend),
            exec,
            Arc::clone(&store),
            paths,
            true,
            3,
        )
        .with_retry_interval(Duration::from_millis(1));
        let snapshots =
            SnapshotManager::with_polling(Arc::clone(&dyn_backend), Duration::from_millis(1), 5);
        Cluster {
            controller: ControllerImpl::new(Arc::clone(&volumes), snapshots, store),
            node: NodeImpl::new("node-1".to_owned(), 256, attacher, volumes),
            backend,
            host,
        }
    }

    fn mount_cap() -> VolumeCapability {
        VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter)
    }

    async fn create(c: &Cluster, name: &str, params: &[(&str, &str)]) -> String {
        c.controller
            .create_volume(CreateVolumeRequest {
                name: name.to_owned(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 10 * GIB,
                    limit_bytes: 0,
                }),
                volume_capabilities: vec![mount_cap()],
                parameters: params
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
                ..CreateVolumeRequest::default()
            })
            .await
            .unwrap()
            .volume
            .unwrap()
            .volume_id
    }

    fn stage_req(c: &Cluster, vol_id: &str) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: vol_id.to_owned(),
            staging_target_path: c.host.mount_dir("staging").to_string_lossy().into_owned(),
            volume_capability: Some(mount_cap()),
            ..NodeStageVolumeRequest::default()
        }
    }

    fn unstage_req(c: &Cluster, vol_id: &str) -> NodeUnstageVolumeRequest {
        NodeUnstageVolumeRequest {
            volume_id: vol_id.to_owned(),
            staging_target_path: c.host.mount_dir("staging").to_string_lossy().into_owned(),
        }
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let c = cluster();
        let vol_id = create(&c, "v1", &[]).await;
        let staging = c.host.mount_dir("staging");
        let target = c.host.mount_dir("m");

        c.node.node_stage_volume(stage_req(&c, &vol_id)).await.unwrap();
        assert!(c.host.is_mounted(&staging));
        assert_eq!(c.backend.acl(&vol_id).len(), 1);

        let publish = NodePublishVolumeRequest {
            volume_id: vol_id.clone(),
            staging_target_path: staging.to_string_lossy().into_owned(),
            target_path: target.to_string_lossy().into_owned(),
            volume_capability: Some(mount_cap()),
            volume_context: BTreeMap::from([
                (POD_NAME.to_owned(), "web-0".to_owned()),
                (POD_NAMESPACE.to_owned(), "default".to_owned()),
            ]),
            ..NodePublishVolumeRequest::default()
        };
        c.node.node_publish_volume(publish).await.unwrap();
        assert!(c.host.is_mounted(&target));
        let meta = c.backend.metadata(&vol_id).unwrap();
        assert_eq!(meta.get("pod_name").map(String::as_str), Some("web-0"));
        assert_eq!(
            meta.get("bind_mount").map(String::as_str),
            Some(target.to_str().unwrap())
        );

        c.node
            .node_unpublish_volume(NodeUnpublishVolumeRequest {
                volume_id: vol_id.clone(),
                target_path: target.to_string_lossy().into_owned(),
            })
            .await
            .unwrap();
        assert!(!c.host.is_mounted(&target));

        c.node.node_unstage_volume(unstage_req(&c, &vol_id)).await.unwrap();
        assert!(!c.host.is_mounted(&staging));
        assert!(c.backend.acl(&vol_id).is_empty());

        let meta = c.backend.metadata(&vol_id).unwrap();
        for key in ["mount_path", "device_path", "bind_mount", "pod_name"] {
            assert_eq!(meta.get(key).map(String::as_str), Some(""), "{key} left in {meta:?}");
        }

        c.controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: vol_id.clone(),
                ..DeleteVolumeRequest::default()
            })
            .await
            .unwrap();
        assert!(!c.backend.contains(&vol_id));
        assert!(c.host.mounts().is_empty());
    }

    #[tokio::test]
    async fn test_stage_twice_formats_once() {
        let c = cluster();
        let vol_id = create(&c, "v1", &[]).await;
        c.node.node_stage_volume(stage_req(&c, &vol_id)).await.unwrap();
        c.node.node_stage_volume(stage_req(&c, &vol_id)).await.unwrap();
        assert_eq!(c.host.count("mkfs.ext4"), 1);
        assert_eq!(c.host.mounts().len(), 1);
        assert_eq!(c.backend.counters().set_acl_policy, 1);
    }

    #[tokio::test]
    async fn test_unstage_survives_umount_failure() {
        let c = cluster();
        let vol_id = create(&c, "v1", &[]).await;
        c.node.node_stage_volume(stage_req(&c, &vol_id)).await.unwrap();
        c.host.fail(&["umount"], 1, "umount: target is busy");

        c.node.node_unstage_volume(unstage_req(&c, &vol_id)).await.unwrap();
        assert_eq!(c.host.count_with("iscsiadm", "--logout"), 2);
        assert!(c.backend.acl(&vol_id).is_empty());
        let meta = c.backend.metadata(&vol_id).unwrap();
        assert_eq!(meta.get("device_path").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_unpublish_survives_busy_target() {
        let c = cluster();
        let vol_id = create(&c, "v1", &[]).await;
        let staging = c.host.mount_dir("staging");
        let target = c.host.mount_dir("m");
        c.node.node_stage_volume(stage_req(&c, &vol_id)).await.unwrap();
        c.node
            .node_publish_volume(NodePublishVolumeRequest {
                volume_id: vol_id.clone(),
                staging_target_path: staging.to_string_lossy().into_owned(),
                target_path: target.to_string_lossy().into_owned(),
                volume_capability: Some(mount_cap()),
                ..NodePublishVolumeRequest::default()
            })
            .await
            .unwrap();

        c.host.fail(&["umount"], 1, "umount: target is busy");
        c.node
            .node_unpublish_volume(NodeUnpublishVolumeRequest {
                volume_id: vol_id.clone(),
                target_path: target.to_string_lossy().into_owned(),
            })
            .await
            .unwrap();
        let meta = c.backend.metadata(&vol_id).unwrap();
        assert_eq!(meta.get("bind_mount").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_unstage_delete_on_unmount() {
        let c = cluster();
        let vol_id = create(&c, "v1", &[("delete_on_unmount", "true")]).await;
        c.node.node_stage_volume(stage_req(&c, &vol_id)).await.unwrap();
        c.node.node_unstage_volume(unstage_req(&c, &vol_id)).await.unwrap();
        assert!(!c.backend.contains(&vol_id));
        // The volume is gone, unstage stays successful
        c.node.node_unstage_volume(unstage_req(&c, &vol_id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_login_failure() {
        let c = cluster();
        let vol_id = create(&c, "v1", &[]).await;
        c.host.fail(&["iscsiadm"], 10, "iscsiadm: cannot make connection");
        let status = c
            .node
            .node_stage_volume(stage_req(&c, &vol_id))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(c.host.count("mkfs.ext4"), 0);
    }

    #[tokio::test]
    async fn test_stage_invalid() {
        let c = cluster();
        let vol_id = create(&c, "v1", &[]).await;
        let mut req = stage_req(&c, &vol_id);
        req.volume_capability = None;
        let status = c.node.node_stage_volume(req).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = c
            .node
            .node_stage_volume(stage_req(&c, "CSI-nope"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_block_volume() {
        let c = cluster();
        let vol_id = create(&c, "raw", &[]).await;
        let block = VolumeCapability::block(AccessMode::SingleNodeWriter);
        let mut stage = stage_req(&c, &vol_id);
        stage.volume_capability = Some(block.clone());
        c.node.node_stage_volume(stage).await.unwrap();
        assert_eq!(c.host.count("mkfs.ext4"), 0);

        let target = c.host.mount_dir("pods/raw-dev");
        c.node
            .node_publish_volume(NodePublishVolumeRequest {
                volume_id: vol_id.clone(),
                target_path: target.to_string_lossy().into_owned(),
                volume_capability: Some(block),
                ..NodePublishVolumeRequest::default()
            })
            .await
            .unwrap();
        assert!(target.is_file());
        assert!(c.host.is_mounted(&target));
    }

    #[tokio::test]
    async fn test_stats_expand_and_info() {
        let c = cluster();
        let vol_id = create(&c, "v1", &[]).await;
        c.backend.set_capacity_in_use(&vol_id, 4);
        let stats = c
            .node
            .node_get_volume_stats(NodeGetVolumeStatsRequest {
                volume_id: vol_id.clone(),
                volume_path: "/pods/v1".to_owned(),
                staging_target_path: String::new(),
            })
            .await
            .unwrap();
        let usage = stats.usage.first().unwrap();
        assert_eq!(usage.total, 10 * GIB);
        assert_eq!(usage.used, 4 * GIB);
        assert_eq!(usage.available, 6 * GIB);

        c.node.node_stage_volume(stage_req(&c, &vol_id)).await.unwrap();
        let resp = c
            .node
            .node_expand_volume(NodeExpandVolumeRequest {
                volume_id: vol_id.clone(),
                volume_path: "/pods/v1".to_owned(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 20 * GIB,
                    limit_bytes: 0,
                }),
                ..NodeExpandVolumeRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.capacity_bytes, 20 * GIB);
        assert_eq!(c.host.count_with("iscsiadm", "--rescan"), 1);
        assert_eq!(c.host.count("resize2fs"), 1);

        let info = c.node.node_get_info(NodeGetInfoRequest::default()).await.unwrap();
        assert_eq!(info.node_id, "node-1");
        assert_eq!(info.max_volumes_per_node, 256);
    }
}
