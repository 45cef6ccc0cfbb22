//! The capability-bounded interface the CSI surface uses to talk to the
//! appliance. [`RdsClient`] is the production implementation; tests swap in
//! doubles.

use async_trait::async_trait;
use rds_client::{Capacity, CreateVolumeOptions, Error, RdsClient, SnapshotInfo, VolumeInfo};

/// Appliance operations the Controller and Identity services need.
#[async_trait]
pub trait Appliance: Send + Sync {
    /// Opens the control-plane connection.
    async fn connect(&self) -> Result<(), Error>;
    /// Whether the last control-plane interaction succeeded.
    fn is_connected(&self) -> bool;
    /// The backing-file path for a volume ID.
    fn volume_file_path(&self, volume_id: &str) -> String;

    /// Creates an exported volume.
    async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<VolumeInfo, Error>;
    /// Looks up a volume by slot.
    async fn get_volume(&self, slot: &str) -> Result<Option<VolumeInfo>, Error>;
    /// Lists driver-owned volumes.
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, Error>;
    /// Removes a volume's disk entry.
    async fn delete_volume(&self, slot: &str) -> Result<(), Error>;
    /// Removes a backing file.
    async fn delete_file(&self, path: &str) -> Result<(), Error>;
    /// Grows a volume's backing file.
    async fn resize_volume(&self, slot: &str, new_size: u64) -> Result<(), Error>;
    /// Total and free capacity behind the volume base path.
    async fn get_capacity(&self) -> Result<Capacity, Error>;

    /// Snapshots a volume's backing file.
    async fn create_snapshot(&self, source_slot: &str, name: &str) -> Result<SnapshotInfo, Error>;
    /// Looks up a snapshot by ID.
    async fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotInfo>, Error>;
    /// Lists snapshots, optionally for one source volume.
    async fn list_snapshots(&self, source_slot: Option<&str>)
        -> Result<Vec<SnapshotInfo>, Error>;
    /// Deletes a snapshot.
    async fn delete_snapshot(&self, id: &str) -> Result<(), Error>;
}

#[async_trait]
impl Appliance for RdsClient {
    async fn connect(&self) -> Result<(), Error> {
        RdsClient::connect(self).await
    }

    fn is_connected(&self) -> bool {
        RdsClient::is_connected(self)
    }

    fn volume_file_path(&self, volume_id: &str) -> String {
        RdsClient::volume_file_path(self, volume_id)
    }

    async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<VolumeInfo, Error> {
        RdsClient::create_volume(self, opts).await
    }

    async fn get_volume(&self, slot: &str) -> Result<Option<VolumeInfo>, Error> {
        RdsClient::get_volume(self, slot).await
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, Error> {
        RdsClient::list_volumes(self).await
    }

    async fn delete_volume(&self, slot: &str) -> Result<(), Error> {
        RdsClient::delete_volume(self, slot).await
    }

    async fn delete_file(&self, path: &str) -> Result<(), Error> {
        RdsClient::delete_file(self, path).await
    }

    async fn resize_volume(&self, slot: &str, new_size: u64) -> Result<(), Error> {
        RdsClient::resize_volume(self, slot, new_size).await
    }

    async fn get_capacity(&self) -> Result<Capacity, Error> {
        RdsClient::get_capacity(self).await
    }

    async fn create_snapshot(&self, source_slot: &str, name: &str) -> Result<SnapshotInfo, Error> {
        RdsClient::create_snapshot(self, source_slot, name).await
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotInfo>, Error> {
        RdsClient::get_snapshot(self, id).await
    }

    async fn list_snapshots(
        &self,
        source_slot: Option<&str>,
    ) -> Result<Vec<SnapshotInfo>, Error> {
        RdsClient::list_snapshots(self, source_slot).await
    }

    async fn delete_snapshot(&self, id: &str) -> Result<(), Error> {
        RdsClient::delete_snapshot(self, id).await
    }
}
