//! The implementation for CSI identity service

use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;
use tracing::debug;

use super::heartbeat::Health;
use super::proto::csi::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, PluginServiceType, ProbeRequest, ProbeResponse,
    VolumeExpansionType,
};
use super::proto::csi_grpc::Identity;
use super::util;
use crate::backend::Backend;
use crate::common::error::DateraError;

/// for `IdentityService` implmentation
#[derive(Clone, Debug)]
pub struct IdentityImpl {
    /// The name of the CSI plugin
    plugin_name: String,
    /// The version of the CSI plugin
    version: String,
    /// The backend
    backend: Arc<dyn Backend>,
    /// Backend health shared with the heartbeat
    health: Arc<Health>,
}

impl IdentityImpl {
    /// Create `IdentityImpl`
    pub fn new(
        plugin_name: String,
        version: String,
        backend: Arc<dyn Backend>,
        health: Arc<Health>,
    ) -> Self {
        debug_assert!(!plugin_name.is_empty(), "driver name cannot be empty");
        debug_assert!(!version.is_empty(), "version cannot be empty");
        Self {
            plugin_name,
            version,
            backend,
            health,
        }
    }
}

#[async_trait]
impl Identity for IdentityImpl {
    async fn get_plugin_info(
        &self,
        req: GetPluginInfoRequest,
    ) -> Result<GetPluginInfoResponse, Status> {
        debug!("get_plugin_info request: {:?}", req);

        let mut manifest = self.health.manifest();
        if manifest.is_empty() {
            manifest = self
                .health
                .check(self.backend.as_ref())
                .await
                .map_err(|e| {
                    util::into_status(
                        "get_plugin_info",
                        DateraError::BackendUnavailable {
                            context: vec![e.to_string()],
                        },
                    )
                })?;
        }
        let build = manifest.get("build_version").cloned().unwrap_or_default();
        Ok(GetPluginInfoResponse {
            name: self.plugin_name.clone(),
            vendor_version: format!("{};{}", self.version, build),
            manifest,
        })
    }

    async fn get_plugin_capabilities(
        &self,
        req: GetPluginCapabilitiesRequest,
    ) -> Result<GetPluginCapabilitiesResponse, Status> {
        debug!("get_plugin_capabilities request: {:?}", req);

        Ok(GetPluginCapabilitiesResponse {
            capabilities: vec![
                PluginCapability::Service(PluginServiceType::ControllerService),
                PluginCapability::VolumeExpansion(VolumeExpansionType::Online),
                PluginCapability::VolumeExpansion(VolumeExpansionType::Offline),
            ],
        })
    }

    async fn probe(&self, req: ProbeRequest) -> Result<ProbeResponse, Status> {
        debug!("probe request: {:?}", req);

        Ok(ProbeResponse {
            ready: Some(self.health.is_healthy()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn identity(backend: &Arc<MemoryBackend>) -> IdentityImpl {
        IdentityImpl::new(
            util::CSI_PLUGIN_NAME.to_owned(),
            util::CSI_PLUGIN_VERSION.to_owned(),
            Arc::<MemoryBackend>::clone(backend),
            Arc::new(Health::new()),
        )
    }

    #[tokio::test]
    async fn test_plugin_info_fetches_manifest() {
        let backend = Arc::new(MemoryBackend::new());
        let ident = identity(&backend);
        let info = ident
            .get_plugin_info(GetPluginInfoRequest::default())
            .await
            .unwrap();
        assert_eq!(info.name, "dsp.csi.daterainc.io");
        assert_eq!(
            info.vendor_version,
            format!("{};3.3.5", util::CSI_PLUGIN_VERSION)
        );
        assert_eq!(info.manifest.get("uuid").map(String::as_str), Some("3a5c4e3d-0d5f-4c8e-9a77-1c1fdc8b2c8e"));

        let probe = ident.probe(ProbeRequest::default()).await.unwrap();
        assert_eq!(probe.ready, Some(true));
    }

    #[tokio::test]
    async fn test_backend_down() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_system_down();
        let ident = identity(&backend);
        let status = ident
            .get_plugin_info(GetPluginInfoRequest::default())
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        let probe = ident.probe(ProbeRequest::default()).await.unwrap();
        assert_eq!(probe.ready, Some(false));
    }

    #[tokio::test]
    async fn test_capabilities() {
        let backend = Arc::new(MemoryBackend::new());
        let caps = identity(&backend)
            .get_plugin_capabilities(GetPluginCapabilitiesRequest::default())
            .await
            .unwrap()
            .capabilities;
        assert_eq!(caps.len(), 3);
        assert!(caps.contains(&PluginCapability::Service(PluginServiceType::ControllerService)));
    }
}
