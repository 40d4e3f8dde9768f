//! A scripted host for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use clippy_utilities::OverflowArithmetic;
use parking_lot::Mutex;
use tempfile::TempDir;

use super::{redact, Executor};
use crate::common::error::{DateraError, DateraResult};

/// A failure injected for commands starting with `prefix`
#[derive(Debug)]
struct FailRule {
    /// Leading arguments to match
    prefix: Vec<String>,
    /// Failures left
    times: u32,
    /// Output reported with the failure
    output: String,
}

/// Fake host with its own mount table and device directory.
#[derive(Debug)]
pub struct FakeHost {
    /// Holds the fake filesystem
    root: TempDir,
    /// Every argv run
    calls: Mutex<Vec<Vec<String>>>,
    /// Filesystem per device
    filesystems: Mutex<HashMap<String, String>>,
    /// Injected failures
    rules: Mutex<Vec<FailRule>>,
}

impl FakeHost {
    /// Creates a host under a fresh temporary directory
    #[must_use]
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("by-path")).unwrap();
        std::fs::create_dir_all(root.path().join("sys-block")).unwrap();
        std::fs::create_dir_all(root.path().join("mnt")).unwrap();
        std::fs::write(root.path().join("mounts"), "").unwrap();
        std::fs::write(
            root.path().join("initiatorname.iscsi"),
            "InitiatorName=iqn.1993-08.org.debian:01:fakehost\n",
        )
        .unwrap();
        Self {
            root,
            calls: Mutex::new(Vec::new()),
            filesystems: Mutex::new(HashMap::new()),
            rules: Mutex::new(Vec::new()),
        }
    }

    /// Root of the fake filesystem
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Fake `/dev/disk/by-path`
    pub fn by_path_dir(&self) -> PathBuf {
        self.root().join("by-path")
    }

    /// Fake `/sys/block`
    pub fn sys_block_dir(&self) -> PathBuf {
        self.root().join("sys-block")
    }

    /// Fake `/proc/mounts`
    pub fn proc_mounts(&self) -> PathBuf {
        self.root().join("mounts")
    }

    /// Fake initiator name file
    pub fn initiator_file(&self) -> PathBuf {
        self.root().join("initiatorname.iscsi")
    }

    /// A directory usable as mount target
    pub fn mount_dir(&self, name: &str) -> PathBuf {
        self.root().join("mnt").join(name)
    }

    /// Fail the next `times` commands starting with `prefix`
    pub fn fail(&self, prefix: &[&str], times: u32, output: &str) {
        self.rules.lock().push(FailRule {
            prefix: prefix.iter().map(|s| (*s).to_owned()).collect(),
            times,
            output: output.to_owned(),
        });
    }

    /// Pretend `device` already carries a filesystem
    pub fn set_filesystem(&self, device: &str, fs_type: &str) {
        self.filesystems
            .lock()
            .insert(device.to_owned(), fs_type.to_owned());
    }

    /// Every argv run so far
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Number of calls whose program is `program`
    pub fn count(&self, program: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|argv| argv.first().map_or(false, |p| p == program))
            .count()
    }

    /// Number of calls containing `arg`
    pub fn count_with(&self, program: &str, arg: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|argv| {
                argv.first().map_or(false, |p| p == program) && argv.iter().any(|a| a == arg)
            })
            .count()
    }

    /// Lines of the fake mount table
    pub fn mounts(&self) -> Vec<String> {
        std::fs::read_to_string(self.proc_mounts())
            .unwrap()
            .lines()
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Whether `target` is mounted
    pub fn is_mounted(&self, target: &Path) -> bool {
        let target = target.to_string_lossy();
        self.mounts()
            .iter()
            .any(|l| l.split_whitespace().nth(1) == Some(target.as_ref()))
    }

    /// Consume a matching failure rule
    fn take_failure(&self, argv: &[String]) -> Option<String> {
        let mut rules = self.rules.lock();
        let rule = rules.iter_mut().find(|r| {
            r.times > 0 && argv.len() >= r.prefix.len() && argv.iter().zip(&r.prefix).all(|(a, p)| a == p)
        })?;
        rule.times = rule.times.overflow_sub(1);
        Some(rule.output.clone())
    }

    /// Append a line to the mount table
    pub fn add_mount(&self, source: &str, target: &str, fs_type: &str, opts: &str) {
        let mut table = std::fs::read_to_string(self.proc_mounts()).unwrap();
        table.push_str(&format!("{source} {target} {fs_type} {opts} 0 0\n"));
        std::fs::write(self.proc_mounts(), table).unwrap();
    }

    /// Handle `mount`
    fn mount(&self, argv: &[String]) -> Result<String, String> {
        let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
        if args.first() == Some(&"--bind") {
            let (src, dst) = (args.get(1).copied().unwrap_or(""), args.get(2).copied().unwrap_or(""));
            if !Path::new(src).exists() || !Path::new(dst).exists() {
                return Err(format!("mount: special device {src} does not exist"));
            }
            self.add_mount(src, dst, "none", "rw,bind");
            return Ok(String::new());
        }
        if args.first() == Some(&"-o") && args.get(1).map_or(false, |o| o.starts_with("remount")) {
            return Ok(String::new());
        }
        let mut fs_type = "auto";
        let mut opts = "rw";
        let mut positional = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "-t" => fs_type = iter.next().copied().unwrap_or("auto"),
                "-o" => opts = iter.next().copied().unwrap_or("rw"),
                other => positional.push(other),
            }
        }
        let (dev, dst) = match positional.as_slice() {
            [dev, dst] => (*dev, *dst),
            _ => return Err("mount: bad usage".to_owned()),
        };
        if !Path::new(dst).is_dir() {
            return Err(format!("mount: mount point {dst} does not exist"));
        }
        self.add_mount(dev, dst, fs_type, opts);
        Ok(String::new())
    }

    /// Handle `umount`
    fn umount(&self, argv: &[String]) -> Result<String, String> {
        let target = argv.last().cloned().unwrap_or_default();
        let table = std::fs::read_to_string(self.proc_mounts()).unwrap();
        let mut removed = false;
        let kept: Vec<&str> = table
            .lines()
            .filter(|l| {
                let hit = !removed && l.split_whitespace().nth(1) == Some(target.as_str());
                removed = removed || hit;
                !hit
            })
            .collect();
        if !removed {
            return Err(format!("umount: {target}: not mounted."));
        }
        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        std::fs::write(self.proc_mounts(), out).unwrap();
        Ok(String::new())
    }

    /// Handle `iscsiadm`
    fn iscsiadm(&self, argv: &[String]) -> Result<String, String> {
        if argv.iter().any(|a| a == "--login") {
            let iqn = arg_after(argv, "-T").unwrap_or_default();
            let portal = arg_after(argv, "-p").unwrap_or_default();
            let dev = self
                .by_path_dir()
                .join(format!("ip-{portal}-iscsi-{iqn}-lun-0"));
            std::fs::write(dev, "").unwrap();
        }
        Ok(String::new())
    }

    /// Dispatch a command
    fn dispatch(&self, argv: &[String]) -> Result<String, String> {
        let program = argv.first().map(String::as_str).unwrap_or_default();
        match program {
            "mkfs.ext4" | "mkfs.xfs" => {
                let dev = argv.last().cloned().unwrap_or_default();
                let fs = program.trim_start_matches("mkfs.").to_owned();
                self.filesystems.lock().insert(dev, fs);
                Ok(String::new())
            }
            "lsblk" => {
                let dev = argv.last().cloned().unwrap_or_default();
                Ok(self
                    .filesystems
                    .lock()
                    .get(&dev)
                    .map_or_else(|| "\n".to_owned(), |fs| format!("{fs}\n")))
            }
            "readlink" => Ok(format!("{}\n", argv.last().cloned().unwrap_or_default())),
            "mount" => self.mount(argv),
            "umount" => self.umount(argv),
            "iscsiadm" => self.iscsiadm(argv),
            "resize2fs" | "xfs_growfs" | "logrotate" => Ok(String::new()),
            other => Err(format!("{other}: command not found")),
        }
    }
}

/// The argument following `flag`
fn arg_after(argv: &[String], flag: &str) -> Option<String> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i.overflow_add(1)))
        .cloned()
}

#[async_trait]
impl Executor for FakeHost {
    async fn run(&self, argv: &[String]) -> DateraResult<String> {
        self.calls.lock().push(argv.to_vec());
        let result = match self.take_failure(argv) {
            Some(output) => Err(output),
            None => self.dispatch(argv),
        };
        result.map_err(|output| DateraError::CommandErr {
            command: redact(argv),
            output,
            context: vec![],
        })
    }
}
