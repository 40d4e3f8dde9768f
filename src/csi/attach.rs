//! Node side state machine of a volume:
//! ACL registered, logged in, formatted, mounted, bind mounted.
//!
//! Every step reloads the volume metadata before acting and stores what it
//! changed before returning, so a retry from another process sees it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clippy_utilities::OverflowArithmetic;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use super::meta_data::{MetadataStore, VolMetadata};
use super::proto::csi::Secrets;
use crate::backend::types::{AclPolicy, Initiator, PathRef};
use crate::backend::Backend;
use crate::common::error::DateraError::{ArgumentInvalid, CommandErr, MountErr, UmountErr};
use crate::common::error::{Context, DateraError, DateraResult};
use crate::common::util;
use crate::exec::Executor;

/// iSCSI portal port
const ISCSI_PORT: u16 = 3260;
/// Polls waiting for the device node after login
const DEVICE_POLLS: u32 = 10;
/// Interval between retries and polls
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Prefix of the CHAP settings passed as secrets
const CHAP_PREFIX: &str = "node.session.auth.";
/// mkfs refusal that retrying will not fix
const MKFS_REFUSED: &str = "will not make a filesystem here";

/// Host locations the attacher reads
#[derive(Clone, Debug)]
pub struct HostPaths {
    /// iSCSI initiator name file
    pub initiator_file: PathBuf,
    /// `/dev/disk/by-path`
    pub by_path_dir: PathBuf,
    /// `/sys/block`
    pub sys_block_dir: PathBuf,
    /// `/proc/mounts`
    pub proc_mounts: PathBuf,
}

impl HostPaths {
    /// The locations on a real host
    #[must_use]
    pub fn system(initiator_file: PathBuf) -> Self {
        Self {
            initiator_file,
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            sys_block_dir: PathBuf::from("/sys/block"),
            proc_mounts: PathBuf::from("/proc/mounts"),
        }
    }
}

/// Whether a failed command only reports the state we want
fn benign(err: &DateraError, markers: &[&str]) -> bool {
    match *err {
        CommandErr { ref output, .. } => markers.iter().any(|m| output.contains(m)),
        _ => false,
    }
}

/// Attaches volumes to this host
#[derive(Debug)]
pub struct Attacher {
    /// The backend
    backend: Arc<dyn Backend>,
    /// Runs host commands
    exec: Arc<dyn Executor>,
    /// Volume metadata
    metadata: Arc<MetadataStore>,
    /// Host locations
    paths: HostPaths,
    /// Log in to every portal
    multipath: bool,
    /// mkfs attempts
    format_attempts: u32,
    /// Interval between retries and polls
    retry_interval: Duration,
}

impl Attacher {
    /// Create `Attacher`
    pub fn new(
        backend: Arc<dyn Backend>,
        exec: Arc<dyn Executor>,
        metadata: Arc<MetadataStore>,
        paths: HostPaths,
        multipath: bool,
        format_attempts: u32,
    ) -> Self {
        Self {
            backend,
            exec,
            metadata,
            paths,
            multipath,
            format_attempts: format_attempts.max(1),
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Change the interval between retries and polls
    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// The metadata store
    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// IQN of this host from the initiator name file
    pub async fn client_iqn(&self) -> DateraResult<String> {
        let content = tokio::fs::read_to_string(&self.paths.initiator_file)
            .await
            .with_context(|| format!("failed to read {:?}", self.paths.initiator_file))?;
        content
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("InitiatorName"))
            .find_map(|l| l.split_once('=').map(|(_, iqn)| iqn.trim().to_owned()))
            .filter(|iqn| !iqn.is_empty())
            .ok_or_else(|| ArgumentInvalid {
                context: vec![format!(
                    "no initiator name in {:?}",
                    self.paths.initiator_file
                )],
            })
    }

    /// The backend initiator of this host, created when missing
    pub async fn create_get_initiator(&self) -> DateraResult<Initiator> {
        let iqn = self.client_iqn().await?;
        match self.backend.get_initiator(&iqn).await {
            Ok(init) => Ok(init),
            Err(e) if e.is_not_found() => {
                let name = util::gen_name("");
                info!("creating initiator {} named {}", iqn, name);
                self.backend
                    .create_initiator(&iqn, &name, true)
                    .await
                    .with_context(|| format!("failed to create initiator {iqn}"))
            }
            Err(e) => Err(e.add_context(format!("failed to get initiator {iqn}"))),
        }
    }

    /// Put this host on the ACL of the volume
    pub async fn register_acl(&self, name: &str) -> DateraResult<()> {
        let init = self.create_get_initiator().await?;
        let mut acl = self
            .backend
            .get_acl_policy(name)
            .await
            .with_context(|| format!("failed to get ACL of volume {name}"))?;
        if acl.initiators.iter().any(|i| i.path == init.path) {
            debug!("initiator {} already on ACL of volume {}", init.path, name);
            return Ok(());
        }
        acl.initiators.push(PathRef::new(init.path.clone()));
        self.backend
            .set_acl_policy(name, &acl)
            .await
            .with_context(|| format!("failed to set ACL of volume {name}"))?;
        info!("registered initiator {} on volume {}", init.path, name);
        Ok(())
    }

    /// Remove this host from the ACL of the volume
    pub async fn unregister_acl(&self, name: &str) -> DateraResult<()> {
        let iqn = self.client_iqn().await?;
        let init = match self.backend.get_initiator(&iqn).await {
            Ok(init) => init,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.add_context(format!("failed to get initiator {iqn}"))),
        };
        let acl = self
            .backend
            .get_acl_policy(name)
            .await
            .with_context(|| format!("failed to get ACL of volume {name}"))?;
        let kept: Vec<PathRef> = acl
            .initiators
            .iter()
            .filter(|i| i.path != init.path)
            .cloned()
            .collect();
        if kept.len() == acl.initiators.len() {
            return Ok(());
        }
        self.backend
            .set_acl_policy(name, &AclPolicy { initiators: kept })
            .await
            .with_context(|| format!("failed to set ACL of volume {name}"))?;
        info!("unregistered initiator {} from volume {}", init.path, name);
        Ok(())
    }

    /// Expose the volume target on an IP pool
    pub async fn register_ip_pool(&self, name: &str, pool: &str) -> DateraResult<()> {
        let pool = self
            .backend
            .get_ip_pool(pool)
            .await
            .with_context(|| format!("failed to get IP pool {pool}"))?;
        self.backend
            .set_ip_pool(name, &pool.path)
            .await
            .with_context(|| format!("failed to set IP pool of volume {name}"))
    }

    /// Run `iscsiadm` against one portal
    async fn iscsiadm(&self, iqn: &str, portal: &str, args: &[&str]) -> DateraResult<String> {
        let mut argv = vec!["iscsiadm", "-m", "node", "-T", iqn, "-p", portal];
        argv.extend_from_slice(args);
        self.exec.exec(&argv).await
    }

    /// Portals to log in to
    fn select_portals(&self, ips: &[String], round_robin: bool) -> Vec<String> {
        let chosen: Vec<&String> = if round_robin {
            ips.choose(&mut rand::thread_rng()).into_iter().collect()
        } else if self.multipath {
            ips.iter().collect()
        } else {
            ips.first().into_iter().collect()
        };
        chosen
            .into_iter()
            .map(|ip| format!("{ip}:{ISCSI_PORT}"))
            .collect()
    }

    /// Log in to one portal
    async fn login_portal(&self, iqn: &str, portal: &str, secrets: &Secrets) -> DateraResult<()> {
        self.iscsiadm(iqn, portal, &["-o", "new"]).await?;
        if !secrets.is_empty() {
            self.iscsiadm(
                iqn,
                portal,
                &["-o", "update", "-n", "node.session.auth.authmethod", "-v", "CHAP"],
            )
            .await?;
            for (key, value) in secrets.0.iter().filter(|(k, _)| k.starts_with(CHAP_PREFIX)) {
                self.iscsiadm(iqn, portal, &["-o", "update", "-n", key, "-v", value])
                    .await?;
            }
        }
        match self.iscsiadm(iqn, portal, &["--login"]).await {
            Ok(_) => Ok(()),
            Err(e) if benign(&e, &["already present"]) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Wait for a device node to show up
    async fn wait_device(&self, device: &Path) -> bool {
        for _ in 0..DEVICE_POLLS {
            if tokio::fs::metadata(device).await.is_ok() {
                return true;
            }
            tokio::time::sleep(self.retry_interval).await;
        }
        false
    }

    /// The device mapper holder of a disk, if any
    async fn dm_holder(&self, device: &Path) -> Option<PathBuf> {
        let real = tokio::fs::canonicalize(device).await.ok()?;
        let disk = real.file_name()?.to_owned();
        let holders = self.paths.sys_block_dir.join(disk).join("holders");
        let mut entries = tokio::fs::read_dir(holders).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let holder = entry.file_name().to_string_lossy().into_owned();
            if holder.starts_with("dm-") {
                return Some(PathBuf::from("/dev").join(holder));
            }
        }
        None
    }

    /// Log in to the volume target and record the device path
    pub async fn login(&self, name: &str, secrets: &Secrets) -> DateraResult<String> {
        let meta = self.metadata.load(name).await?;
        let ai = self
            .backend
            .get_app_instance(name)
            .await
            .with_context(|| format!("failed to get volume {name}"))?;
        let access = ai
            .storage_instance()
            .map(|si| si.access.clone())
            .unwrap_or_default();
        if access.iqn.is_empty() || access.ips.is_empty() {
            return Err(ArgumentInvalid {
                context: vec![format!("volume {name} has no target access")],
            });
        }
        let portals = self.select_portals(&access.ips, meta.round_robin);
        let mut devices = Vec::with_capacity(portals.len());
        let mut last_err = None;
        for portal in &portals {
            if let Err(e) = self.login_portal(&access.iqn, portal, secrets).await {
                warn!("failed to log in to {} of volume {}, the error is: {}", portal, name, e);
                last_err = Some(e);
                continue;
            }
            let device = self
                .paths
                .by_path_dir
                .join(format!("ip-{portal}-iscsi-{}-lun-0", access.iqn));
            if self.wait_device(&device).await {
                devices.push(device);
            } else {
                warn!("device {:?} did not show up", device);
            }
        }
        let first = match devices.first() {
            Some(first) => first.clone(),
            None => {
                return Err(last_err
                    .unwrap_or_else(|| CommandErr {
                        command: "iscsiadm --login".to_owned(),
                        output: "no device appeared".to_owned(),
                        context: vec![],
                    })
                    .add_context(format!("failed to log in to volume {name}")));
            }
        };
        let device = if portals.len() > 1 {
            self.dm_holder(&first).await.unwrap_or(first)
        } else {
            first
        };
        let device = device.to_string_lossy().into_owned();
        self.metadata
            .update(name, |m| m.device_path = device.clone())
            .await?;
        info!("volume {} logged in as {}", name, device);
        Ok(device)
    }

    /// Log out of every portal of the volume target
    pub async fn logout(&self, name: &str) -> DateraResult<()> {
        let ai = self
            .backend
            .get_app_instance(name)
            .await
            .with_context(|| format!("failed to get volume {name}"))?;
        let access = ai
            .storage_instance()
            .map(|si| si.access.clone())
            .unwrap_or_default();
        let mut result = Ok(());
        for ip in &access.ips {
            let portal = format!("{ip}:{ISCSI_PORT}");
            let steps: [(&[&str], &[&str]); 2] = [
                (&["--logout"], &["No matching sessions"]),
                (&["-o", "delete"], &["No records found"]),
            ];
            for (args, markers) in steps {
                match self.iscsiadm(&access.iqn, &portal, args).await {
                    Ok(_) => {}
                    Err(e) if benign(&e, markers) => {}
                    Err(e) => {
                        warn!("iscsiadm {:?} on {} failed, the error is: {}", args, portal, e);
                        result = Err(e);
                    }
                }
            }
        }
        if result.is_ok() {
            info!("volume {} logged out", name);
        }
        result
    }

    /// Rescan the sessions so a grown volume shows its new size
    pub async fn rescan(&self) -> DateraResult<()> {
        self.exec
            .exec(&["iscsiadm", "-m", "session", "--rescan"])
            .await
            .map(|_| ())
    }

    /// Whether `target` is a mount point
    pub async fn is_mounted(&self, target: &str) -> DateraResult<bool> {
        self.mount_table_has(|_, t| t == target).await
    }

    /// Whether a mount table entry satisfies `pred(source, target)`
    async fn mount_table_has<F>(&self, pred: F) -> DateraResult<bool>
    where
        F: Fn(&str, &str) -> bool + Send,
    {
        let table = tokio::fs::read_to_string(&self.paths.proc_mounts)
            .await
            .with_context(|| format!("failed to read {:?}", self.paths.proc_mounts))?;
        Ok(table.lines().any(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(source), Some(target)) => pred(source, target),
                _ => false,
            }
        }))
    }

    /// Filesystem already on the device, if any
    async fn existing_filesystem(&self, device: &str) -> DateraResult<Option<String>> {
        let out = self
            .exec
            .exec(&["lsblk", "-n", "-o", "FSTYPE", device])
            .await?;
        let fs = out.trim();
        Ok((!fs.is_empty()).then(|| fs.to_owned()))
    }

    /// Device node behind the by-path link, as it shows in the mount table
    async fn resolve_device(&self, device_path: &str) -> DateraResult<String> {
        Ok(self
            .exec
            .exec(&["readlink", "-f", device_path])
            .await?
            .trim()
            .to_owned())
    }

    /// Put a filesystem on the device unless it already has one
    pub async fn format(&self, name: &str) -> DateraResult<()> {
        let mut meta = self.metadata.load(name).await?;
        if meta.is_block() || meta.formatted {
            debug!("volume {} needs no format", name);
            return Ok(());
        }
        let device = meta.device_path.clone();
        if device.is_empty() {
            return Err(ArgumentInvalid {
                context: vec![format!("volume {name} is not logged in")],
            });
        }
        if let Some(fs) = self.existing_filesystem(&device).await? {
            info!("device {} of volume {} already has {}", device, name, fs);
            meta.fs_type = fs;
            meta.formatted = true;
            return self.metadata.save(name, &meta).await;
        }
        let real = self.resolve_device(&device).await?;
        if self
            .mount_table_has(|src, _| src == real || src == device)
            .await?
        {
            info!("device {} of volume {} is mounted, not formatting", real, name);
            meta.formatted = true;
            return self.metadata.save(name, &meta).await;
        }

        let fs_args = meta.effective_fs_args();
        let program = format!("mkfs.{}", meta.fs_type);
        let mut argv: Vec<&str> = vec![program.as_str()];
        argv.extend(fs_args.split_whitespace());
        argv.push(&device);
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.overflow_add(1);
            match self.exec.exec(&argv).await {
                Ok(_) => break,
                Err(e) if benign(&e, &[MKFS_REFUSED]) => return Err(e),
                Err(e) if attempt >= self.format_attempts => {
                    return Err(e.add_context(format!(
                        "failed to format volume {name} after {attempt} attempts"
                    )));
                }
                Err(e) => {
                    debug!("format attempt {} of volume {} failed: {}", attempt, name, e);
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
        meta.fs_args = fs_args;
        meta.formatted = true;
        self.metadata.save(name, &meta).await?;
        info!("formatted volume {} with {}", name, meta.fs_type);
        Ok(())
    }

    /// Mount the device on the staging path
    pub async fn mount(&self, name: &str, target: &str) -> DateraResult<()> {
        let mut meta = self.metadata.load(name).await?;
        if self.is_mounted(target).await? {
            if meta.mount_path != target {
                info!("adopting existing mount of volume {} at {}", name, target);
                meta.mount_path = target.to_owned();
                self.metadata.save(name, &meta).await?;
            }
            debug!("volume {} already mounted at {}", name, target);
            return Ok(());
        }
        if meta.device_path.is_empty() {
            return Err(ArgumentInvalid {
                context: vec![format!("volume {name} is not logged in")],
            });
        }
        tokio::fs::create_dir_all(target)
            .await
            .with_context(|| format!("failed to create mount point {target}"))?;
        let real = self.resolve_device(&meta.device_path).await?;
        let opts = meta.m_flags.clone();
        let mut argv = vec!["mount", "-t", meta.fs_type.as_str()];
        if !opts.is_empty() {
            argv.extend(["-o", opts.as_str()]);
        }
        argv.extend([real.as_str(), target]);
        self.exec.exec(&argv).await.map_err(|e| MountErr {
            from: PathBuf::from(&real),
            target: PathBuf::from(target),
            context: vec![e.to_string()],
        })?;
        meta.mount_path = target.to_owned();
        self.metadata.save(name, &meta).await?;
        info!("mounted volume {} at {}", name, target);
        Ok(())
    }

    /// Bind the staged volume onto `target`, raw block volumes bind the
    /// device node onto a file
    pub async fn bind_mount(&self, name: &str, target: &str, readonly: bool) -> DateraResult<()> {
        let mut meta = self.metadata.load(name).await?;
        if self.is_mounted(target).await? {
            if meta.bind_mounts.insert(target.to_owned()) {
                info!("adopting existing bind mount of volume {} at {}", name, target);
                self.metadata.save(name, &meta).await?;
            }
            debug!("volume {} already bound at {}", name, target);
            return Ok(());
        }
        let source = if meta.is_block() {
            meta.device_path.clone()
        } else {
            meta.mount_path.clone()
        };
        if source.is_empty() {
            return Err(ArgumentInvalid {
                context: vec![format!("volume {name} is not staged")],
            });
        }
        if meta.is_block() {
            if let Some(parent) = Path::new(target).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {parent:?}"))?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(target)
                .await
                .with_context(|| format!("failed to create block target {target}"))?;
        } else {
            tokio::fs::create_dir_all(target)
                .await
                .with_context(|| format!("failed to create mount point {target}"))?;
        }
        let bind_err = |e: DateraError| MountErr {
            from: PathBuf::from(&source),
            target: PathBuf::from(target),
            context: vec![e.to_string()],
        };
        self.exec
            .exec(&["mount", "--bind", &source, target])
            .await
            .map_err(bind_err)?;
        if readonly {
            self.exec
                .exec(&["mount", "-o", "remount,bind,ro", target])
                .await
                .map_err(bind_err)?;
        }
        meta.bind_mounts.insert(target.to_owned());
        self.metadata.save(name, &meta).await?;
        info!("bound volume {} at {}", name, target);
        Ok(())
    }

    /// Undo a bind mount, an unknown path is a no-op
    pub async fn unbind(&self, name: &str, target: &str) -> DateraResult<()> {
        let mut meta = self.metadata.load(name).await?;
        if !meta.bind_mounts.contains(target) {
            debug!("{} is not a bind mount of volume {}", target, name);
            return Ok(());
        }
        self.umount(target).await?;
        remove_target(target).await;
        meta.bind_mounts.remove(target);
        self.metadata.save(name, &meta).await?;
        info!("unbound volume {} from {}", name, target);
        Ok(())
    }

    /// Unmount the staging path. `fallback` is used when nothing is recorded.
    /// The directory is removed once the umount succeeded.
    pub async fn unmount(&self, name: &str, fallback: &str) -> DateraResult<()> {
        let mut meta = self.metadata.load(name).await?;
        let target = if meta.mount_path.is_empty() {
            if fallback.is_empty() || !self.is_mounted(fallback).await? {
                return Ok(());
            }
            fallback.to_owned()
        } else {
            meta.mount_path.clone()
        };
        self.umount(&target).await?;
        if let Err(e) = tokio::fs::remove_dir(&target).await {
            debug!("failed to remove {}, the error is: {}", target, e);
        }
        meta.mount_path.clear();
        self.metadata.save(name, &meta).await?;
        info!("unmounted volume {} from {}", name, target);
        Ok(())
    }

    /// `umount`, a target that is not mounted is fine
    async fn umount(&self, target: &str) -> DateraResult<()> {
        match self.exec.exec(&["umount", target]).await {
            Ok(_) => Ok(()),
            Err(e) if benign(&e, &["not mounted"]) => Ok(()),
            Err(e) => Err(UmountErr {
                target: PathBuf::from(target),
                context: vec![e.to_string()],
            }),
        }
    }

    /// Grow the filesystem to the device size
    pub async fn grow_filesystem(&self, meta: &VolMetadata, volume_path: &str) -> DateraResult<()> {
        if meta.is_block() {
            return Ok(());
        }
        let argv = match meta.fs_type.as_str() {
            "xfs" => vec!["xfs_growfs", volume_path],
            _ => vec!["resize2fs", meta.device_path.as_str()],
        };
        self.exec.exec(&argv).await.map(|_| ())
    }
}

/// Remove a bind target, a directory or a file
async fn remove_target(target: &str) {
    let removed = match tokio::fs::metadata(target).await {
        Ok(m) if m.is_dir() => tokio::fs::remove_dir(target).await,
        Ok(_) => tokio::fs::remove_file(target).await,
        Err(_) => return,
    };
    if let Err(e) = removed {
        debug!("failed to remove {}, the error is: {}", target, e);
    }
}
