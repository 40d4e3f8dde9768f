//! Volume lifecycle: create, delete, resize and list app instances

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use super::meta_data::MetadataStore;
use super::params::VolumeParams;
use super::util;
use crate::backend::types::{
    AppInstance, AppInstanceCreate, PathRef, PerformancePolicy, StorageInstanceCreate,
    VolumeCreate, CREATE_MODE, STORAGE_INSTANCE_NAME, VOLUME_NAME,
};
use crate::backend::Backend;
use crate::common::error::DateraError::{
    ArgumentInvalid, VolumeAlreadyExist, VolumeHasSnapshots,
};
use crate::common::error::{Context, DateraResult};

/// Where a new volume gets its content and layout from.
/// Exactly one source applies, in this order of precedence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeSource {
    /// An app template, which also owns the QoS
    Template {
        /// Template name
        name: String,
    },
    /// Copy of another volume
    CloneVolume {
        /// Backend path of the source volume
        path: String,
    },
    /// Copy of a snapshot
    CloneSnapshot {
        /// Backend path of the snapshot
        path: String,
    },
    /// Empty volume with explicit layout
    Fresh,
}

impl VolumeSource {
    /// Pick the source by precedence, empty strings mean unset
    #[must_use]
    pub fn select(template: &str, clone_volume: &str, clone_snapshot: &str) -> Self {
        if !template.is_empty() {
            Self::Template {
                name: template.to_owned(),
            }
        } else if !clone_volume.is_empty() {
            Self::CloneVolume {
                path: clone_volume.to_owned(),
            }
        } else if !clone_snapshot.is_empty() {
            Self::CloneSnapshot {
                path: clone_snapshot.to_owned(),
            }
        } else {
            Self::Fresh
        }
    }
}

/// Everything needed to create a volume
#[derive(Clone, Debug)]
pub struct VolumeOptions {
    /// Size to provision in GiB
    pub size_gib: u64,
    /// Smallest acceptable size of an existing volume, 0 for any
    pub required_gib: u64,
    /// Largest acceptable size of an existing volume, 0 for any
    pub limit_gib: u64,
    /// Parsed parameters
    pub params: VolumeParams,
    /// Provisioning source
    pub source: VolumeSource,
}

/// A volume as the driver sees it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Volume {
    /// App instance name
    pub name: String,
    /// Size in GiB
    pub size_gib: u64,
    /// Used capacity in GiB
    pub used_gib: u64,
    /// Replica count
    pub replica_count: u32,
    /// Placement mode
    pub placement_mode: String,
    /// Template it came from, empty for none
    pub template: String,
    /// Portal addresses
    pub target_addresses: Vec<String>,
    /// Target IQN
    pub target_name: String,
    /// Initiator paths on the ACL
    pub initiators: Vec<String>,
    /// QoS limits
    pub qos: PerformancePolicy,
    /// QoS limits by name
    pub qos_map: BTreeMap<String, u64>,
    /// `online` or `offline`
    pub admin_state: String,
    /// Backend path of the volume
    pub path: String,
}

impl Volume {
    /// Convert an app instance, it must carry a storage instance with a volume
    pub fn from_app_instance(ai: &AppInstance, qos: PerformancePolicy) -> DateraResult<Self> {
        let si = ai.storage_instance().ok_or_else(|| ArgumentInvalid {
            context: vec![format!("app instance {} has no storage instance", ai.name)],
        })?;
        let vol = ai.volume().ok_or_else(|| ArgumentInvalid {
            context: vec![format!("app instance {} has no volume", ai.name)],
        })?;
        Ok(Self {
            name: ai.name.clone(),
            size_gib: vol.size,
            used_gib: vol.capacity_in_use,
            replica_count: vol.replica_count,
            placement_mode: vol.placement_mode.clone(),
            template: ai
                .app_template
                .as_ref()
                .map(|t| t.path.clone())
                .unwrap_or_default(),
            target_addresses: si.access.ips.clone(),
            target_name: si.access.iqn.clone(),
            initiators: si
                .acl_policy
                .initiators
                .iter()
                .map(|i| i.path.clone())
                .collect(),
            qos,
            qos_map: qos.to_map(),
            admin_state: ai.admin_state.clone(),
            path: vol.path.clone(),
        })
    }
}

/// Compute the QoS of a fresh volume from the parameters
#[must_use]
pub fn qos_for(params: &VolumeParams, size_gib: u64) -> PerformancePolicy {
    let iops = |max| util::dynamic_limit(params.iops_per_gb, size_gib, max);
    let bandwidth = |max| util::dynamic_limit(params.bandwidth_per_gb, size_gib, max);
    PerformancePolicy {
        read_iops_max: iops(params.qos.read_iops_max),
        write_iops_max: iops(params.qos.write_iops_max),
        total_iops_max: iops(params.qos.total_iops_max),
        read_bandwidth_max: bandwidth(params.qos.read_bandwidth_max),
        write_bandwidth_max: bandwidth(params.qos.write_bandwidth_max),
        total_bandwidth_max: bandwidth(params.qos.total_bandwidth_max),
    }
}

/// Creates, deletes, resizes and lists volumes
#[derive(Debug)]
pub struct VolumeManager {
    /// The backend
    backend: Arc<dyn Backend>,
    /// Volume metadata
    metadata: Arc<MetadataStore>,
    /// Force replica count 1
    replica_override: bool,
}

impl VolumeManager {
    /// Create `VolumeManager`
    pub fn new(
        backend: Arc<dyn Backend>,
        metadata: Arc<MetadataStore>,
        replica_override: bool,
    ) -> Self {
        Self {
            backend,
            metadata,
            replica_override,
        }
    }

    /// The metadata store
    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Create a volume, an existing one with a compatible size is returned
    /// unchanged.
    pub async fn create(&self, name: &str, opts: &VolumeOptions) -> DateraResult<Volume> {
        match self.get(name).await {
            Ok(existing) => {
                let too_small = opts.required_gib > 0 && existing.size_gib < opts.required_gib;
                let too_large = opts.limit_gib > 0 && existing.size_gib > opts.limit_gib;
                if too_small || too_large {
                    return Err(VolumeAlreadyExist {
                        volume_id: name.to_owned(),
                        context: vec![format!(
                            "existing size {}GiB is not within [{}, {}]GiB",
                            existing.size_gib, opts.required_gib, opts.limit_gib
                        )],
                    });
                }
                info!("volume {} already exists, returning it", name);
                let qos = self.apply_qos(name, opts, existing.size_gib, existing.qos).await?;
                return Ok(Volume {
                    qos,
                    qos_map: qos.to_map(),
                    ..existing
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let req = self.build_create(name, opts);
        debug!("create app instance: {:?}", req);
        let ai = self
            .backend
            .create_app_instance(&req)
            .await
            .with_context(|| format!("failed to create volume {name}"))?;
        info!("created volume {} from {:?}", name, opts.source);

        let qos = self
            .apply_qos(name, opts, opts.size_gib, PerformancePolicy::default())
            .await?;
        Volume::from_app_instance(&ai, qos)
    }

    /// Set the QoS a fresh volume asks for unless `current` already matches.
    /// Templates and clones keep what they carry.
    async fn apply_qos(
        &self,
        name: &str,
        opts: &VolumeOptions,
        size_gib: u64,
        current: PerformancePolicy,
    ) -> DateraResult<PerformancePolicy> {
        if opts.source != VolumeSource::Fresh {
            return Ok(current);
        }
        let policy = qos_for(&opts.params, size_gib);
        if policy == current || policy == PerformancePolicy::default() {
            return Ok(current);
        }
        debug!("set QoS of volume {}: {:?}", name, policy);
        self.backend
            .create_performance_policy(name, &policy)
            .await
            .with_context(|| format!("failed to set QoS of volume {name}"))
    }

    /// The create body for a source
    fn build_create(&self, name: &str, opts: &VolumeOptions) -> AppInstanceCreate {
        let base = AppInstanceCreate {
            name: name.to_owned(),
            create_mode: CREATE_MODE.to_owned(),
            ..AppInstanceCreate::default()
        };
        match opts.source {
            VolumeSource::Template { name: ref template } => {
                let template = template.trim_matches('/');
                let template_override = (!opts.params.disable_template_override).then(|| {
                    json!({
                        "storage_instances": {
                            STORAGE_INSTANCE_NAME: {
                                "volumes": {
                                    VOLUME_NAME: { "size": opts.size_gib.to_string() }
                                }
                            }
                        }
                    })
                });
                AppInstanceCreate {
                    app_template: Some(PathRef::new(format!("/app_templates/{template}"))),
                    template_override,
                    ..base
                }
            }
            VolumeSource::CloneVolume { ref path } => AppInstanceCreate {
                clone_volume_src: Some(PathRef::new(path.clone())),
                ..base
            },
            VolumeSource::CloneSnapshot { ref path } => AppInstanceCreate {
                clone_snapshot_src: Some(PathRef::new(path.clone())),
                ..base
            },
            VolumeSource::Fresh => {
                let replica_count = if self.replica_override {
                    1
                } else {
                    opts.params.replica_count
                };
                AppInstanceCreate {
                    storage_instances: vec![StorageInstanceCreate {
                        name: STORAGE_INSTANCE_NAME.to_owned(),
                        ip_pool: PathRef::new(format!(
                            "/access_network_ip_pools/{}",
                            opts.params.ip_pool
                        )),
                        volumes: vec![VolumeCreate {
                            name: VOLUME_NAME.to_owned(),
                            size: opts.size_gib,
                            replica_count,
                            placement_mode: opts.params.placement_mode.clone(),
                            placement_policy: PathRef::new(format!(
                                "/placement_policies/{}",
                                opts.params.placement_policy
                            )),
                        }],
                    }],
                    ..base
                }
            }
        }
    }

    /// Delete a volume, a missing one is already deleted.
    /// Volumes with snapshots are refused.
    pub async fn delete(&self, name: &str) -> DateraResult<()> {
        match self.backend.get_app_instance(name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!("volume {} is already deleted", name);
                return Ok(());
            }
            Err(e) => return Err(e.add_context(format!("failed to get volume {name}"))),
        }
        let snapshots = self
            .backend
            .list_snapshots(name)
            .await
            .with_context(|| format!("failed to list snapshots of volume {name}"))?;
        if !snapshots.is_empty() {
            return Err(VolumeHasSnapshots {
                volume_id: name.to_owned(),
                context: vec![format!("{} snapshots left", snapshots.len())],
            });
        }
        self.backend
            .set_admin_state(name, "offline", true)
            .await
            .with_context(|| format!("failed to offline volume {name}"))?;
        match self.backend.delete_app_instance(name, true).await {
            Ok(()) => {
                info!("deleted volume {}", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.add_context(format!("failed to delete volume {name}"))),
        }
    }

    /// Set a new size and reload the volume
    pub async fn resize(&self, name: &str, size_gib: u64) -> DateraResult<Volume> {
        self.backend
            .set_volume_size(name, size_gib)
            .await
            .with_context(|| format!("failed to resize volume {name} to {size_gib}GiB"))?;
        info!("resized volume {} to {}GiB", name, size_gib);
        self.get(name).await
    }

    /// Get a volume
    pub async fn get(&self, name: &str) -> DateraResult<Volume> {
        let ai = self.backend.get_app_instance(name).await?;
        let qos = self
            .backend
            .get_performance_policy(name)
            .await
            .unwrap_or_default();
        Volume::from_app_instance(&ai, qos)
    }

    /// List a page of volumes, `max` of 0 means all from `offset`.
    /// Entries that do not convert are skipped. The second value is the
    /// number of backend entries the page consumed, skipped ones included.
    pub async fn list(&self, max: usize, offset: usize) -> DateraResult<(Vec<Volume>, usize)> {
        let ais = self
            .backend
            .list_app_instances(max, offset)
            .await
            .add_context("failed to list volumes")?;
        let vols = ais
            .iter()
            .filter_map(|ai| match Volume::from_app_instance(ai, PerformancePolicy::default()) {
                Ok(vol) => Some(vol),
                Err(e) => {
                    warn!("skip app instance {}, the error is: {}", ai.name, e);
                    None
                }
            })
            .collect();
        Ok((vols, ais.len()))
    }

    /// Capacity in bytes available to one volume with these parameters
    pub async fn capacity(&self, params: &VolumeParams) -> DateraResult<i64> {
        let system = self
            .backend
            .get_system()
            .await
            .add_context("failed to get system capacity")?;
        let total = if params.placement_mode == "all_flash" {
            system.all_flash_total_capacity
        } else {
            system.total_capacity
        };
        let replica = if self.replica_override {
            1
        } else {
            u64::from(params.replica_count.max(1))
        };
        Ok(i64::try_from(total.checked_div(replica).unwrap_or(total)).unwrap_or(i64::MAX))
    }
}
