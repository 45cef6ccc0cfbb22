//! The appliance client: validated command composition, pooled execution,
//! retry with jittered backoff, and typed results.

use std::time::Duration;

use rand::Rng;
use tracing::{instrument, warn};

use crate::command::{self, CreateVolumeOptions};
use crate::error::{classify_failure, failure_message, Error};
use crate::parser::{parse_detail, Record};
use crate::pool::{SessionPool, SshConfig};
use crate::validate;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Client configuration: transport settings plus the base path all volume
/// files must live under.
#[derive(Debug, Clone)]
pub struct RdsConfig {
    /// SSH transport settings.
    pub ssh: SshConfig,
    /// Appliance directory holding volume backing files, e.g. `raid1/csi`.
    pub base_path: String,
}

/// A disk entry on the appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Slot name; equal to the volume ID.
    pub slot: String,
    /// Backing file path.
    pub file_path: String,
    /// Size of the backing file in bytes.
    pub size_bytes: u64,
    /// NQN the namespace is exported under, when exported.
    pub nqn: Option<String>,
    /// NVMe/TCP listener port, when exported.
    pub nvme_port: Option<u16>,
}

/// A snapshot of a volume's backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Snapshot ID, `<sourceVolumeID>@<name>`.
    pub id: String,
    /// Volume the snapshot was taken from.
    pub source_slot: String,
    /// Path of the snapshot file.
    pub file_path: String,
    /// Size of the snapshot file in bytes.
    pub size_bytes: u64,
}

/// Capacity of the storage backing the volume base path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Total bytes.
    pub total_bytes: u64,
    /// Free bytes.
    pub free_bytes: u64,
}

/// Control-plane client for the appliance.
pub struct RdsClient {
    pool: SessionPool,
    base_path: String,
}

impl RdsClient {
    /// Creates a client. No connection is made until [`connect`](Self::connect)
    /// or the first command.
    pub fn new(config: RdsConfig) -> Self {
        RdsClient {
            pool: SessionPool::new(config.ssh),
            base_path: config.base_path.trim_end_matches('/').to_string(),
        }
    }

    /// The configured volume base path.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// The backing-file path for a volume ID.
    pub fn volume_file_path(&self, volume_id: &str) -> String {
        format!("{}/{}.img", self.base_path, volume_id)
    }

    fn snapshot_file_path(&self, source: &str, name: &str) -> String {
        format!("{}/{}@{}.img", self.base_path, source, name)
    }

    /// Opens the initial sessions.
    pub async fn connect(&self) -> Result<(), Error> {
        self.pool.connect().await
    }

    /// Closes all pooled sessions.
    pub async fn close(&self) {
        self.pool.close().await
    }

    /// Whether the last transport interaction succeeded.
    pub fn is_connected(&self) -> bool {
        self.pool.is_connected()
    }

    // Runs one command with retry on transport failures only. Classified
    // appliance errors return immediately.
    async fn run(&self, command: String) -> Result<String, Error> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.pool.exec(&command).await {
                Ok(output) => {
                    if let Some(message) = failure_message(&output) {
                        return Err(classify_failure(message));
                    }
                    return Ok(output);
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "appliance command failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates a file-backed, NVMe/TCP-exported disk and returns its state.
    #[instrument(level = "debug", skip(self, opts), fields(slot = %opts.slot))]
    pub async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<VolumeInfo, Error> {
        validate::validate_volume_id(&opts.slot)?;
        validate::validate_file_path(&opts.file_path, &self.base_path)?;

        self.run(command::disk_add(opts)).await?;

        self.get_volume(&opts.slot).await?.ok_or_else(|| {
            Error::Internal(format!(
                "volume {} not visible after a successful add",
                opts.slot
            ))
        })
    }

    /// Looks up one disk entry by slot. `None` when it does not exist.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_volume(&self, slot: &str) -> Result<Option<VolumeInfo>, Error> {
        validate::validate_volume_id(slot)?;
        let output = self.run(command::disk_print_detail(Some(slot))).await?;
        Ok(parse_detail(&output)
            .iter()
            .find(|r| r.get("slot") == Some(slot))
            .and_then(volume_from_record))
    }

    /// Lists all driver-owned disk entries.
    pub async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, Error> {
        let output = self.run(command::disk_print_detail(None)).await?;
        Ok(parse_detail(&output)
            .iter()
            .filter(|r| {
                r.get("slot").map_or(false, |s| s.starts_with("pvc-"))
                    && r.get("type") == Some("file")
            })
            .filter_map(volume_from_record)
            .collect())
    }

    /// Removes a disk entry. Removing an absent slot is success.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_volume(&self, slot: &str) -> Result<(), Error> {
        validate::validate_volume_id(slot)?;
        match self.run(command::disk_remove(slot)).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Removes a file under the base path. Removing an absent file is success.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_file(&self, path: &str) -> Result<(), Error> {
        validate::validate_file_path(path, &self.base_path)?;
        match self.run(command::file_remove(path)).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Grows a volume's backing file.
    #[instrument(level = "debug", skip(self))]
    pub async fn resize_volume(&self, slot: &str, new_size: u64) -> Result<(), Error> {
        validate::validate_volume_id(slot)?;
        self.run(command::disk_resize(slot, new_size)).await?;
        Ok(())
    }

    /// Reads total and free capacity of the disk holding the base path.
    pub async fn get_capacity(&self) -> Result<Capacity, Error> {
        // The base path's first component is the parent disk's slot.
        let parent = self
            .base_path
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Internal("volume base path has no parent slot".into()))?;
        let output = self
            .run(format!("/disk print detail where slot=\"{}\"", parent))
            .await?;
        let records = parse_detail(&output);
        let record = records
            .iter()
            .find(|r| r.get("slot") == Some(parent))
            .ok_or_else(|| {
                Error::NotFound(format!("parent disk {} not found on appliance", parent))
            })?;
        let total_bytes = record
            .get_u64("size")
            .ok_or_else(|| Error::Internal("parent disk reports no size".into()))?;
        let free_bytes = record.get_u64("free").unwrap_or(0);
        Ok(Capacity {
            total_bytes,
            free_bytes,
        })
    }

    /// Snapshots a volume by copying its backing file. Idempotent on the
    /// `(source, name)` pair.
    #[instrument(level = "debug", skip(self))]
    pub async fn create_snapshot(
        &self,
        source_slot: &str,
        name: &str,
    ) -> Result<SnapshotInfo, Error> {
        validate::validate_volume_id(source_slot)?;
        validate::validate_snapshot_name(name)?;

        let id = format!("{}@{}", source_slot, name);
        if let Some(existing) = self.get_snapshot(&id).await? {
            return Ok(existing);
        }

        let source_path = self.volume_file_path(source_slot);
        let snapshot_path = self.snapshot_file_path(source_slot, name);
        self.run(command::file_copy(&source_path, &snapshot_path))
            .await?;

        self.get_snapshot(&id).await?.ok_or_else(|| {
            Error::Internal(format!("snapshot {} not visible after copy", id))
        })
    }

    /// Looks up a snapshot by ID. `None` when it does not exist.
    pub async fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotInfo>, Error> {
        let (source, name) = split_snapshot_id(id)?;
        let path = self.snapshot_file_path(&source, &name);
        let output = self.run(command::file_print_detail(&path)).await?;
        Ok(parse_detail(&output)
            .iter()
            .find(|r| r.get("name") == Some(path.as_str()))
            .map(|r| SnapshotInfo {
                id: id.to_string(),
                source_slot: source.clone(),
                file_path: path.clone(),
                size_bytes: r.get_u64("size").unwrap_or(0),
            }))
    }

    /// Lists all snapshots under the base path, optionally filtered by
    /// source volume.
    pub async fn list_snapshots(
        &self,
        source_slot: Option<&str>,
    ) -> Result<Vec<SnapshotInfo>, Error> {
        let output = self.run("/file print detail".to_string()).await?;
        let prefix = format!("{}/", self.base_path);
        Ok(parse_detail(&output)
            .iter()
            .filter_map(|r| snapshot_from_file_record(r, &prefix))
            .filter(|s| source_slot.map_or(true, |src| s.source_slot == src))
            .collect())
    }

    /// Deletes a snapshot file. Deleting an absent snapshot is success.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_snapshot(&self, id: &str) -> Result<(), Error> {
        let (source, name) = split_snapshot_id(id)?;
        let path = self.snapshot_file_path(&source, &name);
        match self.run(command::file_remove(&path)).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn volume_from_record(record: &Record) -> Option<VolumeInfo> {
    let slot = record.get("slot")?.to_string();
    let file_path = record.get("file-path")?.to_string();
    let size_bytes = record
        .get_u64("file-size")
        .or_else(|| record.get_u64("size"))?;
    let exported = record.get_bool("nvme-tcp-export").unwrap_or(false);
    Some(VolumeInfo {
        slot,
        file_path,
        size_bytes,
        nqn: exported
            .then(|| record.get("nvme-tcp-server-nqn").map(str::to_string))
            .flatten(),
        nvme_port: exported
            .then(|| {
                record
                    .get_u64("nvme-tcp-server-port")
                    .and_then(|p| u16::try_from(p).ok())
            })
            .flatten(),
    })
}

fn snapshot_from_file_record(record: &Record, base_prefix: &str) -> Option<SnapshotInfo> {
    let name = record.get("name")?;
    let relative = name.strip_prefix(base_prefix)?;
    let stem = relative.strip_suffix(".img")?;
    let (source, snap) = stem.split_once('@')?;
    if validate::validate_volume_id(source).is_err() {
        return None;
    }
    Some(SnapshotInfo {
        id: format!("{}@{}", source, snap),
        source_slot: source.to_string(),
        file_path: name.to_string(),
        size_bytes: record.get_u64("size").unwrap_or(0),
    })
}

fn split_snapshot_id(id: &str) -> Result<(String, String), Error> {
    let (source, name) = id
        .split_once('@')
        .ok_or_else(|| Error::InvalidArgument(format!("malformed snapshot ID {:?}", id)))?;
    validate::validate_volume_id(source)?;
    validate::validate_snapshot_name(name)?;
    Ok((source.to_string(), name.to_string()))
}

// Exponential backoff with ±10% jitter: 1s, 2s, 4s, ... before each retry.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as u64 * (1u64 << (attempt - 1).min(8));
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_millis((base as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_detail;

    #[test]
    fn backoff_grows_and_stays_within_jitter_bounds() {
        for attempt in 1..=3 {
            let expected = 1000u64 << (attempt - 1);
            for _ in 0..50 {
                let d = backoff_delay(attempt).as_millis() as u64;
                assert!(d >= expected * 9 / 10, "attempt {}: {} too small", attempt, d);
                assert!(d <= expected * 11 / 10 + 1, "attempt {}: {} too large", attempt, d);
            }
        }
    }

    #[test]
    fn volume_record_mapping() {
        let output = " 0    slot=\"pvc-1a\" type=\"file\" file-path=raid1/csi/pvc-1a.img\n      file-size=1 073 741 824 nvme-tcp-export=yes nvme-tcp-server-port=4420\n      nvme-tcp-server-nqn=\"nqn.2000-02.com.mikrotik:pvc-1a\"\n";
        let records = parse_detail(output);
        let info = volume_from_record(&records[0]).unwrap();
        assert_eq!(info.slot, "pvc-1a");
        assert_eq!(info.size_bytes, 1 << 30);
        assert_eq!(
            info.nqn.as_deref(),
            Some("nqn.2000-02.com.mikrotik:pvc-1a")
        );
        assert_eq!(info.nvme_port, Some(4420));
    }

    #[test]
    fn unexported_volume_has_no_target_details() {
        let output = " 0    slot=\"pvc-1a\" type=\"file\" file-path=raid1/csi/pvc-1a.img\n      file-size=1073741824 nvme-tcp-export=no nvme-tcp-server-port=4420\n";
        let records = parse_detail(output);
        let info = volume_from_record(&records[0]).unwrap();
        assert_eq!(info.nqn, None);
        assert_eq!(info.nvme_port, None);
    }

    #[test]
    fn snapshot_ids_round_trip() {
        let (source, name) = split_snapshot_id("pvc-1a@snapshot-42").unwrap();
        assert_eq!(source, "pvc-1a");
        assert_eq!(name, "snapshot-42");

        assert!(split_snapshot_id("pvc-1a").is_err());
        assert!(split_snapshot_id("vol-1@snap").is_err());
        assert!(split_snapshot_id("pvc-1a@bad;name").is_err());
    }

    #[test]
    fn snapshot_file_records_are_filtered_by_shape() {
        let output = concat!(
            " 0    name=\"raid1/csi/pvc-1a@snapshot-42.img\" size=1073741824 type=\"file\"\n",
            " 1    name=\"raid1/csi/pvc-1a.img\" size=1073741824 type=\"file\"\n",
            " 2    name=\"raid1/other/pvc-2b@snapshot-1.img\" size=1 type=\"file\"\n",
        );
        let records = parse_detail(output);
        let snapshots: Vec<_> = records
            .iter()
            .filter_map(|r| snapshot_from_file_record(r, "raid1/csi/"))
            .collect();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "pvc-1a@snapshot-42");
        assert_eq!(snapshots[0].source_slot, "pvc-1a");
    }
}
