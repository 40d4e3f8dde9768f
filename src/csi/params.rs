//! Storage class parameters of volumes and snapshots

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::backend::types::PerformancePolicy;
use crate::common::error::DateraError::ArgumentInvalid;
use crate::common::error::DateraResult;

/// Parameter names recognized on volume creation
mod key {
    pub(super) const IOPS_PER_GB: &str = "iops_per_gb";
    pub(super) const BANDWIDTH_PER_GB: &str = "bandwidth_per_gb";
    pub(super) const PLACEMENT_MODE: &str = "placement_mode";
    pub(super) const PLACEMENT_POLICY: &str = "placement_policy";
    pub(super) const ROUND_ROBIN: &str = "round_robin";
    pub(super) const REPLICA_COUNT: &str = "replica_count";
    pub(super) const IP_POOL: &str = "ip_pool";
    pub(super) const TEMPLATE: &str = "template";
    pub(super) const DISABLE_TEMPLATE_OVERRIDE: &str = "disable_template_override";
    pub(super) const READ_IOPS_MAX: &str = "read_iops_max";
    pub(super) const WRITE_IOPS_MAX: &str = "write_iops_max";
    pub(super) const TOTAL_IOPS_MAX: &str = "total_iops_max";
    pub(super) const READ_BANDWIDTH_MAX: &str = "read_bandwidth_max";
    pub(super) const WRITE_BANDWIDTH_MAX: &str = "write_bandwidth_max";
    pub(super) const TOTAL_BANDWIDTH_MAX: &str = "total_bandwidth_max";
    pub(super) const DELETE_ON_UNMOUNT: &str = "delete_on_unmount";
    pub(super) const FS_ARGS: &str = "fs_args";
    pub(super) const CLONE_VOLUME_SRC: &str = "clone_volume_src";
    pub(super) const REMOTE_PROVIDER_UUID: &str = "remote_provider_uuid";
    pub(super) const SNAPSHOT_TYPE: &str = "type";
}

/// Workload identity parameters copied into the volume metadata
pub const PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
/// Namespace of the claim
pub const PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
/// Name of the persistent volume
pub const PV_NAME: &str = "csi.storage.k8s.io/pv/name";
/// Pod name passed on publish
pub const POD_NAME: &str = "csi.storage.k8s.io/pod.name";
/// Pod namespace passed on publish
pub const POD_NAMESPACE: &str = "csi.storage.k8s.io/pod.namespace";
/// Pod uid passed on publish
pub const POD_UID: &str = "csi.storage.k8s.io/pod.uid";
/// Service account passed on publish
pub const SERVICE_ACCOUNT: &str = "csi.storage.k8s.io/serviceAccount.name";

/// Parsed volume parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeParams {
    /// IOPS granted per GiB
    pub iops_per_gb: u64,
    /// Bandwidth granted per GiB
    pub bandwidth_per_gb: u64,
    /// `hybrid`, `single_flash` or `all_flash`
    pub placement_mode: String,
    /// Placement policy name
    pub placement_policy: String,
    /// Log in to one random portal
    pub round_robin: bool,
    /// Replica count
    pub replica_count: u32,
    /// IP pool name
    pub ip_pool: String,
    /// Template name, empty for none
    pub template: String,
    /// Do not send the template size override
    pub disable_template_override: bool,
    /// Explicit QoS maximums
    pub qos: PerformancePolicy,
    /// Delete the volume on unstage
    pub delete_on_unmount: bool,
    /// mkfs arguments
    pub fs_args: String,
    /// Backend volume path to clone
    pub clone_volume_src: String,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            iops_per_gb: 0,
            bandwidth_per_gb: 0,
            placement_mode: "hybrid".to_owned(),
            placement_policy: "default".to_owned(),
            round_robin: false,
            replica_count: 3,
            ip_pool: "default".to_owned(),
            template: String::new(),
            disable_template_override: false,
            qos: PerformancePolicy::default(),
            delete_on_unmount: false,
            fs_args: String::new(),
            clone_volume_src: String::new(),
        }
    }
}

/// Parse `params[name]` when present
fn parse_value<T>(params: &BTreeMap<String, String>, name: &str, target: &mut T) -> DateraResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = params.get(name) {
        *target = raw.trim().parse().map_err(|e| ArgumentInvalid {
            context: vec![format!("parameter {name}={raw} is invalid, the error is: {e}")],
        })?;
    }
    Ok(())
}

/// Copy `params[name]` when present
fn copy_value(params: &BTreeMap<String, String>, name: &str, target: &mut String) {
    if let Some(raw) = params.get(name) {
        *target = raw.clone();
    }
}

impl VolumeParams {
    /// Parse the parameters, unknown keys are ignored
    pub fn parse(params: &BTreeMap<String, String>) -> DateraResult<Self> {
        let mut p = Self::default();
        parse_value(params, key::IOPS_PER_GB, &mut p.iops_per_gb)?;
        parse_value(params, key::BANDWIDTH_PER_GB, &mut p.bandwidth_per_gb)?;
        copy_value(params, key::PLACEMENT_MODE, &mut p.placement_mode);
        copy_value(params, key::PLACEMENT_POLICY, &mut p.placement_policy);
        parse_value(params, key::ROUND_ROBIN, &mut p.round_robin)?;
        parse_value(params, key::REPLICA_COUNT, &mut p.replica_count)?;
        copy_value(params, key::IP_POOL, &mut p.ip_pool);
        copy_value(params, key::TEMPLATE, &mut p.template);
        parse_value(
            params,
            key::DISABLE_TEMPLATE_OVERRIDE,
            &mut p.disable_template_override,
        )?;
        parse_value(params, key::READ_IOPS_MAX, &mut p.qos.read_iops_max)?;
        parse_value(params, key::WRITE_IOPS_MAX, &mut p.qos.write_iops_max)?;
        parse_value(params, key::TOTAL_IOPS_MAX, &mut p.qos.total_iops_max)?;
        parse_value(params, key::READ_BANDWIDTH_MAX, &mut p.qos.read_bandwidth_max)?;
        parse_value(params, key::WRITE_BANDWIDTH_MAX, &mut p.qos.write_bandwidth_max)?;
        parse_value(params, key::TOTAL_BANDWIDTH_MAX, &mut p.qos.total_bandwidth_max)?;
        parse_value(params, key::DELETE_ON_UNMOUNT, &mut p.delete_on_unmount)?;
        copy_value(params, key::FS_ARGS, &mut p.fs_args);
        copy_value(params, key::CLONE_VOLUME_SRC, &mut p.clone_volume_src);
        if p.replica_count == 0 {
            return Err(ArgumentInvalid {
                context: vec!["parameter replica_count must be positive".to_owned()],
            });
        }
        Ok(p)
    }

    /// Template name without surrounding slashes
    #[must_use]
    pub fn template_name(&self) -> &str {
        self.template.trim_matches('/')
    }

    /// Echo of the parsed set, stored with the volume metadata
    #[must_use]
    pub fn to_map(&self, size_gib: u64) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = [
            ("size", size_gib.to_string()),
            ("replica", self.replica_count.to_string()),
            ("placement", self.placement_mode.clone()),
            ("placement_policy", self.placement_policy.clone()),
            ("template", self.template.clone()),
            ("iops_per_gb", self.iops_per_gb.to_string()),
            ("bandwidth_per_gb", self.bandwidth_per_gb.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
        map.extend(
            self.qos
                .to_map()
                .into_iter()
                .map(|(k, v)| (k, v.to_string())),
        );
        map
    }
}

/// Parsed snapshot parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotParams {
    /// Remote provider the snapshot goes to, empty for local
    pub remote_provider_uuid: String,
    /// Snapshot type
    pub snapshot_type: String,
}

impl Default for SnapshotParams {
    fn default() -> Self {
        Self {
            remote_provider_uuid: String::new(),
            snapshot_type: "local".to_owned(),
        }
    }
}

impl SnapshotParams {
    /// Parse the parameters, unknown keys are ignored
    #[must_use]
    pub fn parse(params: &BTreeMap<String, String>) -> Self {
        let mut p = Self::default();
        copy_value(params, key::REMOTE_PROVIDER_UUID, &mut p.remote_provider_uuid);
        copy_value(params, key::SNAPSHOT_TYPE, &mut p.snapshot_type);
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let p = VolumeParams::parse(&BTreeMap::new()).unwrap();
        assert_eq!(p, VolumeParams::default());
        assert_eq!(p.replica_count, 3);
        assert_eq!(p.placement_mode, "hybrid");
        assert_eq!(p.ip_pool, "default");
    }

    #[test]
    fn test_parse() {
        let p = VolumeParams::parse(&params(&[
            ("iops_per_gb", "100"),
            ("replica_count", "2"),
            ("round_robin", "true"),
            ("template", "/tmpl-1/"),
            ("total_iops_max", "500"),
            ("delete_on_unmount", "true"),
            ("unrelated", "x"),
        ]))
        .unwrap();
        assert_eq!(p.iops_per_gb, 100);
        assert_eq!(p.replica_count, 2);
        assert!(p.round_robin && p.delete_on_unmount);
        assert_eq!(p.template_name(), "tmpl-1");
        assert_eq!(p.qos.total_iops_max, 500);

        let echo = p.to_map(10);
        assert_eq!(echo.get("size").map(String::as_str), Some("10"));
        assert_eq!(echo.get("total_iops_max").map(String::as_str), Some("500"));
    }

    #[test]
    fn test_invalid_values() {
        for bad in [
            ("iops_per_gb", "lots"),
            ("round_robin", "yes"),
            ("replica_count", "-1"),
            ("replica_count", "0"),
        ] {
            let err = VolumeParams::parse(&params(&[bad])).unwrap_err();
            assert!(matches!(err, ArgumentInvalid { .. }), "{bad:?}");
        }
    }

    #[test]
    fn test_snapshot_params() {
        let p = SnapshotParams::parse(&BTreeMap::new());
        assert_eq!(p.snapshot_type, "local");
        let p = SnapshotParams::parse(&params(&[("remote_provider_uuid", "abc")]));
        assert_eq!(p.remote_provider_uuid, "abc");
    }
}
