//! The metadata map the backend keeps per volume, used as the driver's
//! only durable state

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use super::proto::csi::{AccessType, VolumeCapability};
use super::util;
use crate::backend::{Backend, Metadata};
use crate::common::error::DateraError::ArgumentInvalid;
use crate::common::error::{Context, DateraResult};

/// Longest display name kept
const MAX_DISPLAY_NAME_LEN: usize = 100;
/// Separator of the bind mount paths
const BIND_MOUNT_SEPARATOR: char = ',';

/// Display name given by the orchestrator
pub const KEY_DISPLAY_NAME: &str = "display_name";
/// `mount` or `block`
pub const KEY_ACCESS_TYPE: &str = "access_type";
/// Requested access mode
pub const KEY_ACCESS_MODE: &str = "access_mode";
/// Filesystem type
pub const KEY_FS_TYPE: &str = "fs_type";
/// mkfs arguments
pub const KEY_FS_ARGS: &str = "fs_args";
/// Mount flags, comma separated
pub const KEY_MOUNT_FLAGS: &str = "m_flags";
/// Local device path
pub const KEY_DEVICE_PATH: &str = "device_path";
/// Staging mount path
pub const KEY_MOUNT_PATH: &str = "mount_path";
/// `true` once formatted
pub const KEY_FORMATTED: &str = "formatted";
/// Bind mount paths, comma separated
pub const KEY_BIND_MOUNT: &str = "bind_mount";
/// `true` to delete the volume on unstage
pub const KEY_DELETE_ON_UNMOUNT: &str = "delete_on_unmount";
/// IP pool the target is exposed on
pub const KEY_IP_POOL: &str = "ip_pool";
/// `true` to log in to a single random portal
pub const KEY_ROUND_ROBIN: &str = "round_robin";
/// Pod using the volume
pub const KEY_POD_NAME: &str = "pod_name";
/// Namespace of the pod
pub const KEY_POD_NAMESPACE: &str = "pod_namespace";
/// Uid of the pod
pub const KEY_POD_UID: &str = "pod_uid";
/// Service account of the pod
pub const KEY_SERVICE_ACCOUNT: &str = "service_account";

/// Access type value of a mount volume
pub const ACCESS_TYPE_MOUNT: &str = "mount";
/// Access type value of a raw block volume
pub const ACCESS_TYPE_BLOCK: &str = "block";

/// Typed view of the volume metadata map
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolMetadata {
    /// Display name, at most 100 chars
    pub display_name: String,
    /// `mount` or `block`
    pub access_type: String,
    /// Access mode name
    pub access_mode: String,
    /// Filesystem type
    pub fs_type: String,
    /// mkfs arguments
    pub fs_args: String,
    /// Mount flags
    pub m_flags: String,
    /// Local device path
    pub device_path: String,
    /// Staging mount path
    pub mount_path: String,
    /// Whether the device carries the filesystem
    pub formatted: bool,
    /// Bind mount targets
    pub bind_mounts: BTreeSet<String>,
    /// Delete the volume on unstage
    pub delete_on_unmount: bool,
    /// IP pool name
    pub ip_pool: String,
    /// Log in to one random portal
    pub round_robin: bool,
    /// Pod name
    pub pod_name: String,
    /// Pod namespace
    pub pod_namespace: String,
    /// Pod uid
    pub pod_uid: String,
    /// Pod service account
    pub service_account: String,
    /// Keys not modelled above, e.g. the parameter echo
    pub extra: BTreeMap<String, String>,
}

/// `"true"` is true, anything else false
fn parse_flag(value: Option<String>) -> bool {
    value.map_or(false, |v| v == "true")
}

impl VolMetadata {
    /// Rehydrate from the stored map
    #[must_use]
    pub fn from_map(mut map: Metadata) -> Self {
        let mut take = |key: &str| map.remove(key).unwrap_or_default();
        let display_name = take(KEY_DISPLAY_NAME);
        let access_type = take(KEY_ACCESS_TYPE);
        let access_mode = take(KEY_ACCESS_MODE);
        let fs_type = take(KEY_FS_TYPE);
        let fs_args = take(KEY_FS_ARGS);
        let m_flags = take(KEY_MOUNT_FLAGS);
        let device_path = take(KEY_DEVICE_PATH);
        let mount_path = take(KEY_MOUNT_PATH);
        let ip_pool = take(KEY_IP_POOL);
        let pod_name = take(KEY_POD_NAME);
        let pod_namespace = take(KEY_POD_NAMESPACE);
        let pod_uid = take(KEY_POD_UID);
        let service_account = take(KEY_SERVICE_ACCOUNT);
        let bind_mounts = take(KEY_BIND_MOUNT)
            .split(BIND_MOUNT_SEPARATOR)
            .filter(|p| !p.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        Self {
            display_name,
            access_type,
            access_mode,
            fs_type,
            fs_args,
            m_flags,
            device_path,
            mount_path,
            formatted: parse_flag(map.remove(KEY_FORMATTED)),
            bind_mounts,
            delete_on_unmount: parse_flag(map.remove(KEY_DELETE_ON_UNMOUNT)),
            ip_pool,
            round_robin: parse_flag(map.remove(KEY_ROUND_ROBIN)),
            pod_name,
            pod_namespace,
            pod_uid,
            service_account,
            extra: map,
        }
    }

    /// Serialize into the full map to store. Every known key is written,
    /// a cleared field as `""`, so a merging store drops stale values too.
    #[must_use]
    pub fn to_map(&self) -> Metadata {
        let mut map = self.extra.clone();
        let bind_mount = self
            .bind_mounts
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let fields = [
            (KEY_DISPLAY_NAME, self.display_name.as_str()),
            (KEY_ACCESS_TYPE, self.access_type.as_str()),
            (KEY_ACCESS_MODE, self.access_mode.as_str()),
            (KEY_FS_TYPE, self.fs_type.as_str()),
            (KEY_FS_ARGS, self.fs_args.as_str()),
            (KEY_MOUNT_FLAGS, self.m_flags.as_str()),
            (KEY_DEVICE_PATH, self.device_path.as_str()),
            (KEY_MOUNT_PATH, self.mount_path.as_str()),
            (KEY_BIND_MOUNT, bind_mount.as_str()),
            (KEY_IP_POOL, self.ip_pool.as_str()),
            (KEY_POD_NAME, self.pod_name.as_str()),
            (KEY_POD_NAMESPACE, self.pod_namespace.as_str()),
            (KEY_POD_UID, self.pod_uid.as_str()),
            (KEY_SERVICE_ACCOUNT, self.service_account.as_str()),
        ];
        for (key, value) in fields {
            map.insert(key.to_owned(), value.to_owned());
        }
        for (key, flag) in [
            (KEY_FORMATTED, self.formatted),
            (KEY_DELETE_ON_UNMOUNT, self.delete_on_unmount),
            (KEY_ROUND_ROBIN, self.round_robin),
        ] {
            map.insert(key.to_owned(), flag.to_string());
        }
        map
    }

    /// Set the display name, cut at 100 chars
    pub fn set_display_name(&mut self, name: &str) {
        self.display_name = name.chars().take(MAX_DISPLAY_NAME_LEN).collect();
    }

    /// Record a requested capability. Mount volumes must use a supported
    /// filesystem, an empty one means ext4.
    pub fn register_volume_capability(&mut self, cap: &VolumeCapability) -> DateraResult<()> {
        if let Some(mode) = cap.access_mode {
            self.access_mode = mode.as_str_name().to_owned();
        }
        match cap.access_type {
            Some(AccessType::Block) => {
                self.access_type = ACCESS_TYPE_BLOCK.to_owned();
            }
            Some(AccessType::Mount(ref mount)) => {
                let fs_type = if mount.fs_type.is_empty() {
                    util::SUPPORTED_FS[0]
                } else {
                    mount.fs_type.as_str()
                };
                if !util::SUPPORTED_FS.contains(&fs_type) {
                    return Err(ArgumentInvalid {
                        context: vec![format!("filesystem {fs_type} is not supported")],
                    });
                }
                self.access_type = ACCESS_TYPE_MOUNT.to_owned();
                self.fs_type = fs_type.to_owned();
                self.m_flags = mount.mount_flags.join(",");
            }
            None => {
                return Err(ArgumentInvalid {
                    context: vec!["volume capability has no access type".to_owned()],
                });
            }
        }
        Ok(())
    }

    /// Whether the volume is used as a raw block device
    #[must_use]
    pub fn is_block(&self) -> bool {
        self.access_type == ACCESS_TYPE_BLOCK
    }

    /// Mount flags as a list
    #[must_use]
    pub fn mount_flags(&self) -> Vec<String> {
        self.m_flags
            .split(',')
            .filter(|f| !f.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }

    /// mkfs arguments, the filesystem default when none were given
    #[must_use]
    pub fn effective_fs_args(&self) -> String {
        if self.fs_args.is_empty() {
            util::default_fs_args(&self.fs_type).to_owned()
        } else {
            self.fs_args.clone()
        }
    }

    /// Drop the workload identity
    pub fn clear_workload(&mut self) {
        self.pod_name.clear();
        self.pod_namespace.clear();
        self.pod_uid.clear();
        self.service_account.clear();
    }
}

/// Reads and writes volume metadata on the backend
#[derive(Debug)]
pub struct MetadataStore {
    /// The backend
    backend: Arc<dyn Backend>,
    /// Log the serialized size on every write
    debug_size: bool,
}

impl MetadataStore {
    /// Create `MetadataStore`
    pub fn new(backend: Arc<dyn Backend>, debug_size: bool) -> Self {
        Self {
            backend,
            debug_size,
        }
    }

    /// The raw stored map
    pub async fn get_raw(&self, name: &str) -> DateraResult<Metadata> {
        self.backend
            .get_metadata(name)
            .await
            .with_context(|| format!("failed to get metadata of volume {name}"))
    }

    /// Load the typed metadata
    pub async fn load(&self, name: &str) -> DateraResult<VolMetadata> {
        Ok(VolMetadata::from_map(self.get_raw(name).await?))
    }

    /// Replace the stored map
    pub async fn save_raw(&self, name: &str, map: &Metadata) -> DateraResult<Metadata> {
        if self.debug_size {
            let mut merged = self.get_raw(name).await.unwrap_or_default();
            merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            let serialized = serde_json::to_string(&merged)?;
            info!(
                "metadata of volume {} is {} bytes, {} chars",
                name,
                serialized.len(),
                serialized.chars().count()
            );
        }
        debug!("set metadata of volume {}: {:?}", name, map);
        self.backend
            .set_metadata(name, map)
            .await
            .with_context(|| format!("failed to set metadata of volume {name}"))
    }

    /// Replace the stored map with the typed metadata
    pub async fn save(&self, name: &str, meta: &VolMetadata) -> DateraResult<()> {
        self.save_raw(name, &meta.to_map()).await.map(|_| ())
    }

    /// Load, change and store the metadata in one full replace
    pub async fn update<F>(&self, name: &str, f: F) -> DateraResult<VolMetadata>
    where
        F: FnOnce(&mut VolMetadata) + Send,
    {
        let mut meta = self.load(name).await?;
        f(&mut meta);
        self.save(name, &meta).await?;
        Ok(meta)
    }
}
