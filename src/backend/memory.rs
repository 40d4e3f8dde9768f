//! A control plane kept in memory for tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use clippy_utilities::OverflowArithmetic;
use parking_lot::Mutex;

use super::types::{
    Access, AclPolicy, AppInstance, AppInstanceCreate, Initiator, IpPool, PathRef,
    PerformancePolicy, SnapshotCreate, SnapshotResource, StorageInstance, System,
    VolumeResource, app_instance_path, storage_instance_path, volume_path,
    STORAGE_INSTANCE_NAME, VOLUME_NAME,
};
use super::{Backend, Metadata};
use crate::common::error::{ApiError, DateraResult};

/// Portals every fake target is exposed on
pub const PORTALS: [&str; 2] = ["172.28.119.1", "172.29.119.1"];
/// Size of an instance created from a template without override
const TEMPLATE_SIZE: u64 = 16;

/// One app instance and everything hanging off it
#[derive(Debug, Default)]
struct MemoryApp {
    /// The resource itself
    ai: AppInstance,
    /// Metadata map
    metadata: Metadata,
    /// QoS
    policy: PerformancePolicy,
    /// Snapshots in creation order
    snapshots: Vec<SnapshotResource>,
    /// Remaining polls before a snapshot turns `available`
    pending: HashMap<String, u32>,
}

/// Calls worth asserting on
#[derive(Clone, Debug, Default)]
pub struct Counters {
    /// `create_app_instance` calls
    pub create_app_instance: usize,
    /// `create_snapshot` calls that made a new snapshot
    pub create_snapshot: usize,
    /// `create_performance_policy` calls
    pub create_performance_policy: usize,
    /// `set_metadata` calls
    pub set_metadata: usize,
    /// `set_acl_policy` calls
    pub set_acl_policy: usize,
    /// `delete_app_instance` calls
    pub delete_app_instance: usize,
}

/// A "persistent" control plane in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    /// App instances by name
    apps: Mutex<BTreeMap<String, MemoryApp>>,
    /// Initiators by IQN
    initiators: Mutex<HashMap<String, Initiator>>,
    /// Known IP pools
    ip_pools: Mutex<Vec<String>>,
    /// Call counters
    counters: Mutex<Counters>,
    /// Polls a new snapshot stays `creating`
    snapshot_polls: Mutex<u32>,
    /// Next snapshot timestamp
    clock: Mutex<u64>,
    /// Failing metadata writes
    fail_set_metadata: Mutex<bool>,
    /// Failing performance policy writes
    fail_policy: Mutex<bool>,
    /// Names whose listing is refused
    broken_snapshot_lists: Mutex<Vec<String>>,
    /// Uploaded archives
    uploads: Mutex<Vec<PathBuf>>,
    /// System answered by `get_system`, `None` means unreachable
    system: Mutex<Option<System>>,
}

impl MemoryBackend {
    /// Creates a backend with the `default` IP pool and a healthy system
    #[must_use]
    pub fn new() -> Self {
        let backend = Self::default();
        backend.ip_pools.lock().push("default".to_owned());
        *backend.system.lock() = Some(System {
            name: "cluster-1".to_owned(),
            uuid: "3a5c4e3d-0d5f-4c8e-9a77-1c1fdc8b2c8e".to_owned(),
            build_version: "3.3.5".to_owned(),
            sw_version: "3.3.5".to_owned(),
            health: "ok".to_owned(),
            op_state: "running".to_owned(),
            timezone: "UTC".to_owned(),
            total_capacity: 300 * (1 << 30),
            all_flash_total_capacity: 120 * (1 << 30),
            ..System::default()
        });
        backend
    }

    /// Snapshots stay `creating` for `polls` reads
    pub fn set_snapshot_polls(&self, polls: u32) {
        *self.snapshot_polls.lock() = polls;
    }

    /// Make every metadata write fail
    pub fn set_fail_metadata(&self, fail: bool) {
        *self.fail_set_metadata.lock() = fail;
    }

    /// Make every performance policy write fail
    pub fn set_fail_policy(&self, fail: bool) {
        *self.fail_policy.lock() = fail;
    }

    /// Make snapshot listing of `name` fail
    pub fn break_snapshot_list(&self, name: &str) {
        self.broken_snapshot_lists.lock().push(name.to_owned());
    }

    /// Make `get_system` fail
    pub fn set_system_down(&self) {
        *self.system.lock() = None;
    }

    /// Current call counters
    pub fn counters(&self) -> Counters {
        self.counters.lock().clone()
    }

    /// Whether the instance exists
    pub fn contains(&self, name: &str) -> bool {
        self.apps.lock().contains_key(name)
    }

    /// Copy of the stored metadata
    pub fn metadata(&self, name: &str) -> Option<Metadata> {
        self.apps.lock().get(name).map(|app| app.metadata.clone())
    }

    /// Copy of the stored QoS
    pub fn policy(&self, name: &str) -> Option<PerformancePolicy> {
        self.apps.lock().get(name).map(|app| app.policy)
    }

    /// Number of snapshots of an instance
    pub fn snapshot_count(&self, name: &str) -> usize {
        self.apps.lock().get(name).map_or(0, |app| app.snapshots.len())
    }

    /// Archives uploaded so far
    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().clone()
    }

    /// Initiators on the ACL of an instance
    pub fn acl(&self, name: &str) -> Vec<String> {
        self.apps.lock().get(name).map_or_else(Vec::new, |app| {
            app.ai
                .storage_instance()
                .map_or_else(Vec::new, |si| {
                    si.acl_policy
                        .initiators
                        .iter()
                        .map(|i| i.path.clone())
                        .collect()
                })
        })
    }

    /// Set the used capacity of the volume
    pub fn set_capacity_in_use(&self, name: &str, used: u64) {
        if let Some(app) = self.apps.lock().get_mut(name) {
            if let Some(vol) = volume_mut(&mut app.ai) {
                vol.capacity_in_use = used;
            }
        }
    }

    /// Insert a ready made instance, bypassing the counters
    pub fn insert_app_instance(&self, ai: AppInstance) {
        let name = ai.name.clone();
        self.apps.lock().insert(
            name,
            MemoryApp {
                ai,
                ..MemoryApp::default()
            },
        );
    }

    /// Next snapshot timestamp, fixed width so it sorts as text
    fn tick(&self) -> String {
        let mut clock = self.clock.lock();
        *clock = clock.overflow_add(1);
        format!("{}.{:09}", 1_600_000_000_u64.overflow_add(*clock), *clock)
    }

    /// Find the size of the volume a path points into
    fn size_of_path(apps: &BTreeMap<String, MemoryApp>, path: &str) -> Option<u64> {
        apps.values()
            .find(|app| path.starts_with(&app.ai.path))
            .and_then(|app| app.ai.volume().map(|v| v.size))
    }
}

/// Build a not found business error
fn not_found(what: &str) -> crate::common::error::DateraError {
    ApiError::not_found(&format!("{what} not found")).into()
}

/// The first volume of an instance, mutably
fn volume_mut(ai: &mut AppInstance) -> Option<&mut VolumeResource> {
    ai.storage_instances
        .first_mut()
        .and_then(|si| si.volumes.first_mut())
}

/// Build the instance the backend would return for a create request
fn build_app_instance(name: &str, size: u64, replica: u32, placement: &str, template: Option<PathRef>) -> AppInstance {
    let path = app_instance_path(name);
    let si_path = storage_instance_path(name);
    AppInstance {
        name: name.to_owned(),
        admin_state: "online".to_owned(),
        repair_priority: "high".to_owned(),
        app_template: template,
        storage_instances: vec![StorageInstance {
            name: STORAGE_INSTANCE_NAME.to_owned(),
            op_state: "available".to_owned(),
            access: Access {
                ips: PORTALS.iter().map(|p| (*p).to_owned()).collect(),
                iqn: format!("iqn.2013-05.com.daterainc:tc:01:sn:{name}"),
            },
            acl_policy: AclPolicy::default(),
            ip_pool: Some(PathRef::new("/access_network_ip_pools/default")),
            volumes: vec![VolumeResource {
                name: VOLUME_NAME.to_owned(),
                size,
                capacity_in_use: 0,
                replica_count: replica,
                placement_mode: placement.to_owned(),
                placement_policy: None,
                path: volume_path(name),
            }],
            path: si_path,
        }],
        path,
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_app_instance(&self, name: &str) -> DateraResult<AppInstance> {
        self.apps
            .lock()
            .get(name)
            .map(|app| app.ai.clone())
            .ok_or_else(|| not_found(name))
    }

    async fn create_app_instance(&self, req: &AppInstanceCreate) -> DateraResult<AppInstance> {
        let mut apps = self.apps.lock();
        if apps.contains_key(&req.name) {
            return Err(ApiError::new("ConflictError", 0, "app instance exists").into());
        }
        let ai = if let Some(ref template) = req.app_template {
            let size = req
                .template_override
                .as_ref()
                .and_then(|o| {
                    o["storage_instances"][STORAGE_INSTANCE_NAME]["volumes"][VOLUME_NAME]["size"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                })
                .unwrap_or(TEMPLATE_SIZE);
            build_app_instance(&req.name, size, 3, "hybrid", Some(template.clone()))
        } else if let Some(ref src) = req.clone_volume_src {
            let size = Self::size_of_path(&apps, &src.path).ok_or_else(|| not_found(&src.path))?;
            build_app_instance(&req.name, size, 3, "hybrid", None)
        } else if let Some(ref src) = req.clone_snapshot_src {
            let exists = apps
                .values()
                .any(|app| app.snapshots.iter().any(|s| s.path == src.path));
            if !exists {
                return Err(not_found(&src.path));
            }
            let size = Self::size_of_path(&apps, &src.path).ok_or_else(|| not_found(&src.path))?;
            build_app_instance(&req.name, size, 3, "hybrid", None)
        } else {
            let vol = req
                .storage_instances
                .first()
                .and_then(|si| si.volumes.first())
                .ok_or_else(|| ApiError::new("ValidationFailedError", 0, "no volume"))?;
            build_app_instance(
                &req.name,
                vol.size,
                vol.replica_count,
                &vol.placement_mode,
                None,
            )
        };
        apps.insert(
            req.name.clone(),
            MemoryApp {
                ai: ai.clone(),
                ..MemoryApp::default()
            },
        );
        let mut counters = self.counters.lock();
        counters.create_app_instance = counters.create_app_instance.overflow_add(1);
        Ok(ai)
    }

    async fn set_admin_state(&self, name: &str, state: &str, _force: bool) -> DateraResult<()> {
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        app.ai.admin_state = state.to_owned();
        Ok(())
    }

    async fn delete_app_instance(&self, name: &str, _force: bool) -> DateraResult<()> {
        let mut apps = self.apps.lock();
        let app = apps.get(name).ok_or_else(|| not_found(name))?;
        if app.ai.admin_state != "offline" {
            return Err(ApiError::new("InvalidRequestError", 1, "app instance is online").into());
        }
        apps.remove(name);
        let mut counters = self.counters.lock();
        counters.delete_app_instance = counters.delete_app_instance.overflow_add(1);
        Ok(())
    }

    async fn list_app_instances(
        &self,
        limit: usize,
        offset: usize,
    ) -> DateraResult<Vec<AppInstance>> {
        let apps = self.apps.lock();
        let iter = apps.values().skip(offset).map(|app| app.ai.clone());
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    async fn get_metadata(&self, name: &str) -> DateraResult<Metadata> {
        self.apps
            .lock()
            .get(name)
            .map(|app| app.metadata.clone())
            .ok_or_else(|| not_found(name))
    }

    async fn set_metadata(&self, name: &str, metadata: &Metadata) -> DateraResult<Metadata> {
        if *self.fail_set_metadata.lock() {
            return Err(ApiError::new("InternalError", 0, "metadata store down").into());
        }
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        app.metadata = metadata.clone();
        let mut counters = self.counters.lock();
        counters.set_metadata = counters.set_metadata.overflow_add(1);
        Ok(app.metadata.clone())
    }

    async fn set_volume_size(&self, name: &str, size: u64) -> DateraResult<()> {
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        let vol = volume_mut(&mut app.ai).ok_or_else(|| not_found(VOLUME_NAME))?;
        if size < vol.size {
            return Err(ApiError::new("ValidationFailedError", 0, "volume can not shrink").into());
        }
        vol.size = size;
        Ok(())
    }

    async fn get_performance_policy(&self, name: &str) -> DateraResult<PerformancePolicy> {
        self.apps
            .lock()
            .get(name)
            .map(|app| app.policy)
            .ok_or_else(|| not_found(name))
    }

    async fn create_performance_policy(
        &self,
        name: &str,
        policy: &PerformancePolicy,
    ) -> DateraResult<PerformancePolicy> {
        if *self.fail_policy.lock() {
            return Err(ApiError::new("InternalError", 0, "policy service down").into());
        }
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        app.policy = *policy;
        let mut counters = self.counters.lock();
        counters.create_performance_policy = counters.create_performance_policy.overflow_add(1);
        Ok(app.policy)
    }

    async fn list_snapshots(&self, name: &str) -> DateraResult<Vec<SnapshotResource>> {
        if self.broken_snapshot_lists.lock().iter().any(|n| n == name) {
            return Err(ApiError::new("InternalError", 0, "snapshot listing failed").into());
        }
        self.apps
            .lock()
            .get(name)
            .map(|app| app.snapshots.clone())
            .ok_or_else(|| not_found(name))
    }

    async fn create_snapshot(
        &self,
        name: &str,
        req: &SnapshotCreate,
    ) -> DateraResult<SnapshotResource> {
        let ts = self.tick();
        let polls = *self.snapshot_polls.lock();
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        if app.snapshots.iter().any(|s| s.uuid == req.uuid) {
            return Err(ApiError::duplicate("snapshot uuid already in use").into());
        }
        let snapshot = SnapshotResource {
            path: format!("{}/snapshots/{ts}", volume_path(name)),
            uuid: req.uuid.clone(),
            utc_ts: ts.clone(),
            op_state: if polls == 0 { "available" } else { "creating" }.to_owned(),
        };
        if polls > 0 {
            app.pending.insert(ts, polls);
        }
        app.snapshots.push(snapshot.clone());
        let mut counters = self.counters.lock();
        counters.create_snapshot = counters.create_snapshot.overflow_add(1);
        Ok(snapshot)
    }

    async fn get_snapshot(&self, name: &str, utc_ts: &str) -> DateraResult<SnapshotResource> {
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        let ready = match app.pending.get_mut(utc_ts) {
            Some(left) => {
                *left = left.overflow_sub(1);
                *left == 0
            }
            None => false,
        };
        if ready {
            app.pending.remove(utc_ts);
        }
        let snapshot = app
            .snapshots
            .iter_mut()
            .find(|s| s.utc_ts == utc_ts)
            .ok_or_else(|| not_found(utc_ts))?;
        if ready {
            snapshot.op_state = "available".to_owned();
        }
        Ok(snapshot.clone())
    }

    async fn delete_snapshot(&self, name: &str, utc_ts: &str) -> DateraResult<()> {
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        let before = app.snapshots.len();
        app.snapshots.retain(|s| s.utc_ts != utc_ts);
        if app.snapshots.len() == before {
            return Err(not_found(utc_ts));
        }
        Ok(())
    }

    async fn get_acl_policy(&self, name: &str) -> DateraResult<AclPolicy> {
        let apps = self.apps.lock();
        let app = apps.get(name).ok_or_else(|| not_found(name))?;
        app.ai
            .storage_instance()
            .map(|si| si.acl_policy.clone())
            .ok_or_else(|| not_found(STORAGE_INSTANCE_NAME))
    }

    async fn set_acl_policy(&self, name: &str, acl: &AclPolicy) -> DateraResult<AclPolicy> {
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        let si = app
            .ai
            .storage_instances
            .first_mut()
            .ok_or_else(|| not_found(STORAGE_INSTANCE_NAME))?;
        si.acl_policy = acl.clone();
        let mut counters = self.counters.lock();
        counters.set_acl_policy = counters.set_acl_policy.overflow_add(1);
        Ok(si.acl_policy.clone())
    }

    async fn get_initiator(&self, iqn: &str) -> DateraResult<Initiator> {
        self.initiators
            .lock()
            .get(iqn)
            .cloned()
            .ok_or_else(|| not_found(iqn))
    }

    async fn create_initiator(
        &self,
        iqn: &str,
        name: &str,
        _force: bool,
    ) -> DateraResult<Initiator> {
        let init = Initiator {
            id: iqn.to_owned(),
            name: name.to_owned(),
            path: format!("/initiators/{iqn}"),
        };
        self.initiators.lock().insert(iqn.to_owned(), init.clone());
        Ok(init)
    }

    async fn get_ip_pool(&self, pool: &str) -> DateraResult<IpPool> {
        if self.ip_pools.lock().iter().any(|p| p == pool) {
            Ok(IpPool {
                name: pool.to_owned(),
                path: format!("/access_network_ip_pools/{pool}"),
            })
        } else {
            Err(not_found(pool))
        }
    }

    async fn set_ip_pool(&self, name: &str, pool_path: &str) -> DateraResult<()> {
        let mut apps = self.apps.lock();
        let app = apps.get_mut(name).ok_or_else(|| not_found(name))?;
        let si = app
            .ai
            .storage_instances
            .first_mut()
            .ok_or_else(|| not_found(STORAGE_INSTANCE_NAME))?;
        si.ip_pool = Some(PathRef::new(pool_path));
        Ok(())
    }

    async fn get_system(&self) -> DateraResult<System> {
        self.system
            .lock()
            .clone()
            .ok_or_else(|| ApiError::new("ConnectionError", 0, "system unreachable").into())
    }

    async fn upload_logs(&self, archive: &Path) -> DateraResult<()> {
        if !archive.exists() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
        }
        self.uploads.lock().push(archive.to_owned());
        Ok(())
    }
}
