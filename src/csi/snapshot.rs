//! Snapshot identity, creation and listing

use std::sync::Arc;
use std::time::Duration;

use clippy_utilities::OverflowArithmetic;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::util;
use crate::backend::types::{SnapshotCreate, SnapshotResource};
use crate::backend::Backend;
use crate::common::error::DateraError::{ArgumentInvalid, SnapshotNotFound, SnapshotNotReady};
use crate::common::error::{Context, DateraResult};

/// Namespace of the snapshot uuids, must never change
const SNAPSHOT_NAMESPACE: Uuid = Uuid::from_u128(0x7079_EAEC_2660_4A35_9A48_9C47_204C_01A9);
/// Separator of the composite snapshot id
const ID_SEPARATOR: char = ':';
/// State of a usable snapshot
const STATE_AVAILABLE: &str = "available";
/// Volumes whose snapshots are listed at once
const MAX_CONCURRENT_LISTS: usize = 16;
/// Interval between availability polls
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Availability polls before giving up
const POLL_ATTEMPTS: u32 = 30;

/// Uuid the backend snapshot carries for an orchestrator name
#[must_use]
pub fn snapshot_uuid(name: &str) -> String {
    Uuid::new_v5(&SNAPSHOT_NAMESPACE, name.as_bytes()).to_string()
}

/// Build the id exposed to the orchestrator
#[must_use]
pub fn make_snapshot_id(volume: &str, snapshot: &str) -> String {
    format!("{volume}{ID_SEPARATOR}{snapshot}")
}

/// Split a composite id into volume name and backend snapshot id
pub fn parse_snapshot_id(id: &str) -> DateraResult<(String, String)> {
    let parts: Vec<&str> = id.split(ID_SEPARATOR).collect();
    match parts.as_slice() {
        [volume, snapshot] if !volume.is_empty() && !snapshot.is_empty() => {
            Ok(((*volume).to_owned(), (*snapshot).to_owned()))
        }
        _ => Err(ArgumentInvalid {
            context: vec![format!("snapshot ID={id} is malformed")],
        }),
    }
}

/// A snapshot as the driver sees it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Source volume name
    pub volume: String,
    /// Backend id, the creation timestamp
    pub id: String,
    /// Uuid derived from the name
    pub uuid: String,
    /// Backend path
    pub path: String,
    /// `creating`, `available` or another state
    pub status: String,
    /// Size of the source volume in GiB
    pub size_gib: u64,
}

impl Snapshot {
    /// Build from a backend resource
    #[must_use]
    pub fn from_resource(volume: &str, size_gib: u64, res: SnapshotResource) -> Self {
        Self {
            volume: volume.to_owned(),
            id: res.utc_ts,
            uuid: res.uuid,
            path: res.path,
            status: res.op_state,
            size_gib,
        }
    }

    /// The id exposed to the orchestrator
    #[must_use]
    pub fn composite_id(&self) -> String {
        make_snapshot_id(&self.volume, &self.id)
    }

    /// Whether the snapshot can be used
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == STATE_AVAILABLE
    }
}

/// Creates, deletes and lists snapshots
#[derive(Debug)]
pub struct SnapshotManager {
    /// The backend
    backend: Arc<dyn Backend>,
    /// Interval between availability polls
    poll_interval: Duration,
    /// Availability polls before giving up
    poll_attempts: u32,
}

impl SnapshotManager {
    /// Create `SnapshotManager`
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_polling(backend, POLL_INTERVAL, POLL_ATTEMPTS)
    }

    /// Create `SnapshotManager` with custom polling
    pub fn with_polling(backend: Arc<dyn Backend>, poll_interval: Duration, poll_attempts: u32) -> Self {
        Self {
            backend,
            poll_interval,
            poll_attempts,
        }
    }

    /// Size of a volume in GiB
    async fn volume_size(&self, volume: &str) -> DateraResult<u64> {
        let ai = self.backend.get_app_instance(volume).await?;
        Ok(ai.volume().map_or(0, |v| v.size))
    }

    /// Create a snapshot named `name` of `volume`. Repeating the call
    /// returns the snapshot created first.
    pub async fn create(
        &self,
        volume: &str,
        name: &str,
        remote_provider: &str,
    ) -> DateraResult<Snapshot> {
        let size = self.volume_size(volume).await?;
        let uuid = snapshot_uuid(name);
        let req = SnapshotCreate {
            uuid: uuid.clone(),
            remote_provider: remote_provider.to_owned(),
        };
        let snapshot = match self.backend.create_snapshot(volume, &req).await {
            Ok(res) => {
                info!("created snapshot {} of volume {}", res.utc_ts, volume);
                Snapshot::from_resource(volume, size, res)
            }
            Err(e) if e.is_duplicate() => {
                info!(
                    "snapshot {} of volume {} already exists, looking it up",
                    name, volume
                );
                self.find_by_uuid(volume, &uuid, size).await?
            }
            Err(e) => {
                return Err(e.add_context(format!("failed to snapshot volume {volume}")));
            }
        };
        self.wait_available(snapshot).await
    }

    /// The snapshot of `volume` carrying `uuid`
    async fn find_by_uuid(&self, volume: &str, uuid: &str, size: u64) -> DateraResult<Snapshot> {
        let snapshots = self
            .backend
            .list_snapshots(volume)
            .await
            .with_context(|| format!("failed to list snapshots of volume {volume}"))?;
        snapshots
            .into_iter()
            .find(|s| s.uuid == uuid)
            .map(|res| Snapshot::from_resource(volume, size, res))
            .ok_or_else(|| SnapshotNotFound {
                snapshot_id: uuid.to_owned(),
                context: vec![format!("no snapshot of volume {volume} has uuid {uuid}")],
            })
    }

    /// Poll until the snapshot is available. Timing out is
    /// `SnapshotNotReady`, the snapshot itself is kept.
    pub async fn wait_available(&self, mut snapshot: Snapshot) -> DateraResult<Snapshot> {
        let mut attempt: u32 = 0;
        while !snapshot.is_available() {
            if attempt >= self.poll_attempts {
                return Err(SnapshotNotReady {
                    snapshot_id: snapshot.composite_id(),
                    context: vec![format!("still {} after {attempt} polls", snapshot.status)],
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            let res = self
                .backend
                .get_snapshot(&snapshot.volume, &snapshot.id)
                .await
                .with_context(|| format!("failed to poll snapshot {}", snapshot.composite_id()))?;
            debug!("snapshot {} is {}", snapshot.composite_id(), res.op_state);
            snapshot.status = res.op_state;
            attempt = attempt.overflow_add(1);
        }
        Ok(snapshot)
    }

    /// Delete a snapshot by composite id. A missing snapshot and backend
    /// failures are logged, only a malformed id is an error.
    pub async fn delete(&self, id: &str) -> DateraResult<()> {
        let (volume, snapshot) = parse_snapshot_id(id)?;
        match self.backend.delete_snapshot(&volume, &snapshot).await {
            Ok(()) => info!("deleted snapshot {}", id),
            Err(e) if e.is_not_found() => info!("snapshot {} is already deleted", id),
            Err(e) => warn!("failed to delete snapshot {}, the error is: {}", id, e),
        }
        Ok(())
    }

    /// Backend path of a snapshot, exactly one must match
    pub async fn path_from_id(&self, id: &str) -> DateraResult<String> {
        let (volume, snapshot) = parse_snapshot_id(id)?;
        let snapshots = self
            .backend
            .list_snapshots(&volume)
            .await
            .with_context(|| format!("failed to list snapshots of volume {volume}"))?;
        let found: Vec<_> = snapshots.into_iter().filter(|s| s.utc_ts == snapshot).collect();
        match found.as_slice() {
            [only] => Ok(only.path.clone()),
            _ => Err(SnapshotNotFound {
                snapshot_id: id.to_owned(),
                context: vec![format!("{} snapshots match", found.len())],
            }),
        }
    }

    /// Snapshots of one volume, a missing volume has none
    async fn list_volume(&self, volume: &str) -> DateraResult<Vec<Snapshot>> {
        let size = match self.volume_size(volume).await {
            Ok(size) => size,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let snapshots = self
            .backend
            .list_snapshots(volume)
            .await
            .with_context(|| format!("failed to list snapshots of volume {volume}"))?;
        Ok(snapshots
            .into_iter()
            .map(|res| Snapshot::from_resource(volume, size, res))
            .collect())
    }

    /// Snapshots of every volume, gathered concurrently. Volumes whose
    /// listing fails are skipped.
    async fn list_all(&self) -> DateraResult<Vec<Snapshot>> {
        let ais = self
            .backend
            .list_app_instances(0, 0)
            .await
            .add_context("failed to list volumes")?;
        let concurrency = ais.len().clamp(1, MAX_CONCURRENT_LISTS);
        let per_volume: Vec<Vec<Snapshot>> = stream::iter(ais)
            .map(|ai| async move {
                let size = ai.volume().map_or(0, |v| v.size);
                match self.backend.list_snapshots(&ai.name).await {
                    Ok(snapshots) => snapshots
                        .into_iter()
                        .map(|res| Snapshot::from_resource(&ai.name, size, res))
                        .collect(),
                    Err(e) => {
                        warn!(
                            "skip snapshots of volume {}, the error is: {}",
                            ai.name, e
                        );
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        Ok(per_volume.into_iter().flatten().collect())
    }

    /// List a page of snapshots sorted by id.
    /// A `snapshot_id` filter that does not parse is ignored.
    pub async fn list(
        &self,
        source_volume: &str,
        snapshot_id: &str,
        start: usize,
        max: usize,
    ) -> DateraResult<(Vec<Snapshot>, usize)> {
        let filter = if snapshot_id.is_empty() {
            None
        } else {
            match parse_snapshot_id(snapshot_id) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!("ignore snapshot filter {}, the error is: {}", snapshot_id, e);
                    None
                }
            }
        };
        let mut snapshots = match filter {
            Some((volume, id)) => {
                let mut found = self.list_volume(&volume).await?;
                found.retain(|s| s.id == id);
                if !source_volume.is_empty() {
                    found.retain(|s| s.volume == source_volume);
                }
                found
            }
            None if !source_volume.is_empty() => self.list_volume(source_volume).await?,
            None => self.list_all().await?,
        };
        snapshots.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.volume.cmp(&b.volume)));
        Ok(util::paginate(snapshots, start, max))
    }
}
