//! Client of the backend storage control plane

pub mod http;
#[cfg(test)]
pub mod memory;
pub mod types;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;

use crate::common::error::DateraResult;
use types::{
    AclPolicy, AppInstance, AppInstanceCreate, Initiator, IpPool, PerformancePolicy,
    SnapshotCreate, SnapshotResource, System,
};

/// The string map the backend keeps for each app instance
pub type Metadata = BTreeMap<String, String>;

/// Operations on the backend resources the driver manages.
///
/// Every call yields the value, a business error (`DateraError::ApiErr`)
/// or a transport error. App instances, their volume, snapshots, ACL
/// and IP pool are all addressed by the app instance name.
#[async_trait]
pub trait Backend: Debug + Send + Sync {
    /// Get an app instance
    async fn get_app_instance(&self, name: &str) -> DateraResult<AppInstance>;
    /// Create an app instance
    async fn create_app_instance(&self, req: &AppInstanceCreate) -> DateraResult<AppInstance>;
    /// Set `admin_state` of an app instance
    async fn set_admin_state(&self, name: &str, state: &str, force: bool) -> DateraResult<()>;
    /// Delete an app instance
    async fn delete_app_instance(&self, name: &str, force: bool) -> DateraResult<()>;
    /// List app instances, a `limit` of 0 lists everything from `offset`
    async fn list_app_instances(&self, limit: usize, offset: usize)
        -> DateraResult<Vec<AppInstance>>;

    /// Get the metadata map
    async fn get_metadata(&self, name: &str) -> DateraResult<Metadata>;
    /// Replace the metadata map
    async fn set_metadata(&self, name: &str, metadata: &Metadata) -> DateraResult<Metadata>;

    /// Set the volume size in GiB
    async fn set_volume_size(&self, name: &str, size: u64) -> DateraResult<()>;
    /// Get the QoS of the volume
    async fn get_performance_policy(&self, name: &str) -> DateraResult<PerformancePolicy>;
    /// Create the QoS of the volume
    async fn create_performance_policy(
        &self,
        name: &str,
        policy: &PerformancePolicy,
    ) -> DateraResult<PerformancePolicy>;

    /// List snapshots of the volume
    async fn list_snapshots(&self, name: &str) -> DateraResult<Vec<SnapshotResource>>;
    /// Create a snapshot of the volume
    async fn create_snapshot(
        &self,
        name: &str,
        req: &SnapshotCreate,
    ) -> DateraResult<SnapshotResource>;
    /// Get a snapshot by its timestamp id
    async fn get_snapshot(&self, name: &str, utc_ts: &str) -> DateraResult<SnapshotResource>;
    /// Delete a snapshot by its timestamp id
    async fn delete_snapshot(&self, name: &str, utc_ts: &str) -> DateraResult<()>;

    /// Get the ACL of the storage instance
    async fn get_acl_policy(&self, name: &str) -> DateraResult<AclPolicy>;
    /// Replace the ACL of the storage instance
    async fn set_acl_policy(&self, name: &str, acl: &AclPolicy) -> DateraResult<AclPolicy>;

    /// Get an initiator by IQN
    async fn get_initiator(&self, iqn: &str) -> DateraResult<Initiator>;
    /// Create an initiator
    async fn create_initiator(&self, iqn: &str, name: &str, force: bool)
        -> DateraResult<Initiator>;

    /// Get an IP pool by name
    async fn get_ip_pool(&self, pool: &str) -> DateraResult<IpPool>;
    /// Point the storage instance at an IP pool path
    async fn set_ip_pool(&self, name: &str, pool_path: &str) -> DateraResult<()>;

    /// Get the cluster description
    async fn get_system(&self) -> DateraResult<System>;
    /// Upload a log archive
    async fn upload_logs(&self, archive: &Path) -> DateraResult<()>;
}
