//! Periodic backend health check and log push

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::backend::types::System;
use crate::backend::Backend;
use crate::common::error::{Context, DateraResult};
use crate::exec::Executor;

/// Delay before the first log push
const LOGPUSH_FIRST_DELAY: Duration = Duration::from_secs(10);

/// Backend health as seen by the last check
#[derive(Debug, Default)]
pub struct Health {
    /// Whether the last check reached the backend
    healthy: AtomicBool,
    /// Manifest cached from the last successful check
    manifest: RwLock<BTreeMap<String, String>>,
}

/// Manifest reported by the identity service
fn manifest_of(sys: &System) -> BTreeMap<String, String> {
    [
        ("build_version", sys.build_version.clone()),
        ("callhome_enabled", sys.callhome_enabled.to_string()),
        ("compression_enabled", sys.compression_enabled.to_string()),
        ("health", sys.health.clone()),
        ("l3_enabled", sys.l3_enabled.to_string()),
        ("name", sys.name.clone()),
        ("op_state", sys.op_state.clone()),
        ("sw_version", sys.sw_version.clone()),
        ("timezone", sys.timezone.clone()),
        ("uuid", sys.uuid.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v))
    .collect()
}

impl Health {
    /// Create `Health`, unhealthy until the first check
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the last check reached the backend
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// The cached manifest, empty before the first successful check
    pub fn manifest(&self) -> BTreeMap<String, String> {
        self.manifest.read().clone()
    }

    /// Fetch the backend system and update the state
    pub async fn check(&self, backend: &dyn Backend) -> DateraResult<BTreeMap<String, String>> {
        match backend.get_system().await {
            Ok(sys) => {
                let manifest = manifest_of(&sys);
                *self.manifest.write() = manifest.clone();
                self.healthy.store(true, Ordering::Release);
                debug!("backend {} is healthy", sys.name);
                Ok(manifest)
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                Err(e.add_context("backend health check failed"))
            }
        }
    }
}

/// Check the backend health every `interval`
pub async fn run_heartbeat(backend: Arc<dyn Backend>, health: Arc<Health>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = health.check(backend.as_ref()).await {
            error!("heartbeat failed, the error is: {}", e);
        }
    }
}

/// Rotates the driver log and uploads the archive to the backend
#[derive(Debug)]
pub struct LogPusher {
    /// The backend
    backend: Arc<dyn Backend>,
    /// Runs logrotate
    exec: Arc<dyn Executor>,
    /// Logrotate rule
    rule: PathBuf,
    /// Archive produced by the rule
    archive: PathBuf,
}

impl LogPusher {
    /// Create `LogPusher`
    pub fn new(
        backend: Arc<dyn Backend>,
        exec: Arc<dyn Executor>,
        rule: PathBuf,
        archive: PathBuf,
    ) -> Self {
        Self {
            backend,
            exec,
            rule,
            archive,
        }
    }

    /// Rotate, upload and remove the archive once
    pub async fn push(&self) -> DateraResult<()> {
        let rule = self.rule.to_string_lossy();
        self.exec.exec(&["logrotate", "-f", &rule]).await?;
        self.backend
            .upload_logs(&self.archive)
            .await
            .with_context(|| format!("failed to upload {:?}", self.archive))?;
        tokio::fs::remove_file(&self.archive)
            .await
            .with_context(|| format!("failed to remove {:?}", self.archive))?;
        info!("pushed logs {:?}", self.archive);
        Ok(())
    }

    /// Push the logs every `interval`, failures are logged
    pub async fn run(self, interval: Duration) {
        tokio::time::sleep(LOGPUSH_FIRST_DELAY).await;
        loop {
            if let Err(e) = self.push().await {
                warn!("log push failed, the error is: {}", e);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::exec::mock::FakeHost;

    #[tokio::test]
    async fn test_health_check() {
        let backend = MemoryBackend::new();
        let health = Health::new();
        assert!(!health.is_healthy());
        assert!(health.manifest().is_empty());

        let manifest = health.check(&backend).await.unwrap();
        assert!(health.is_healthy());
        assert_eq!(manifest.get("build_version").map(String::as_str), Some("3.3.5"));
        assert_eq!(manifest.len(), 10);

        backend.set_system_down();
        assert!(health.check(&backend).await.is_err());
        assert!(!health.is_healthy());
        // The manifest outlives an outage
        assert_eq!(health.manifest().get("name").map(String::as_str), Some("cluster-1"));
    }

    #[tokio::test]
    async fn test_log_push() {
        let backend = Arc::new(MemoryBackend::new());
        let host = Arc::new(FakeHost::new());
        let archive = host.root().join("driver.log.1.gz");
        let pusher = LogPusher::new(
            Arc::<MemoryBackend>::clone(&backend),
            Arc::<FakeHost>::clone(&host),
            PathBuf::from("/etc/logrotate.d/driver-logrotate"),
            archive.clone(),
        );
        // No archive produced
        assert!(pusher.push().await.is_err());
        assert!(backend.uploads().is_empty());

        std::fs::write(&archive, "log").unwrap();
        pusher.push().await.unwrap();
        assert_eq!(backend.uploads(), vec![archive.clone()]);
        assert!(!archive.exists());
        assert_eq!(host.count_with("logrotate", "-f"), 2);
    }
}
