//! The CSI Controller service: volume lifecycle against the appliance plus
//! attachment tracking with the live-migration grace period.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_csi::v1_3_0::controller_service_capability::rpc::Type as RpcType;
use k8s_csi::v1_3_0::controller_service_capability::{Rpc, Type};
use k8s_csi::v1_3_0::list_snapshots_response::Entry as SnapshotEntry;
use k8s_csi::v1_3_0::list_volumes_response::{Entry as VolumeEntry, VolumeStatus};
use k8s_csi::v1_3_0::validate_volume_capabilities_response::Confirmed;
use k8s_csi::v1_3_0::volume_capability::access_mode::Mode;
use k8s_csi::v1_3_0::volume_capability::AccessType;
use k8s_csi::v1_3_0::{
    controller_get_volume_response, controller_server::Controller, CapacityRange,
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse, ControllerGetCapabilitiesRequest,
    ControllerGetCapabilitiesResponse, ControllerGetVolumeRequest, ControllerGetVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest,
    ListVolumesResponse, Snapshot, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeCapability, VolumeCondition,
};
use rds_client::{validate, CreateVolumeOptions, VolumeInfo};
use tracing::{info, instrument};

use crate::appliance::Appliance;
use crate::attachment::AttachmentManager;
use crate::error::DriverError;
use crate::events::{EventRecorder, EventReason};
use crate::metrics;

const GIB: u64 = 1 << 30;
/// Smallest volume the appliance will export sensibly.
pub const MIN_VOLUME_SIZE: u64 = GIB;
/// Largest supported backing file.
pub const MAX_VOLUME_SIZE: u64 = 16 * (1 << 40);

const SUPPORTED_FS: &[&str] = &["ext3", "ext4", "xfs"];

/// Controller-side settings.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Address nodes reach the NVMe/TCP target on.
    pub target_address: String,
    /// Port for new exports.
    pub default_nvme_port: u16,
    /// Detach grace period for live-migration handoff.
    pub grace_period: Duration,
    /// Accept MULTI_NODE_MULTI_WRITER capabilities.
    pub enable_multi_node_writer: bool,
}

/// The Controller service.
pub struct ControllerService {
    rds: Arc<dyn Appliance>,
    attachments: Arc<AttachmentManager>,
    events: EventRecorder,
    settings: ControllerSettings,
}

impl ControllerService {
    /// Wires the service to its collaborators.
    pub fn new(
        rds: Arc<dyn Appliance>,
        attachments: Arc<AttachmentManager>,
        events: EventRecorder,
        settings: ControllerSettings,
    ) -> Self {
        ControllerService {
            rds,
            attachments,
            events,
            settings,
        }
    }

    fn volume_context(&self, info: &VolumeInfo, fs_type: &str) -> BTreeMap<String, String> {
        let mut context = BTreeMap::new();
        context.insert(
            "nqn".to_string(),
            info.nqn
                .clone()
                .unwrap_or_else(|| format!("{}{}", validate::NQN_PREFIX, info.slot)),
        );
        context.insert("address".to_string(), self.settings.target_address.clone());
        context.insert(
            "port".to_string(),
            info.nvme_port
                .unwrap_or(self.settings.default_nvme_port)
                .to_string(),
        );
        context.insert("fsType".to_string(), fs_type.to_string());
        context
    }

    fn csi_volume(&self, info: &VolumeInfo, fs_type: &str) -> Volume {
        Volume {
            volume_id: info.slot.clone(),
            capacity_bytes: info.size_bytes as i64,
            volume_context: self.volume_context(info, fs_type),
            ..Default::default()
        }
    }
}

// Derives the provisioned size from the capacity range and checks the
// documented bounds.
fn required_size(range: Option<&CapacityRange>) -> Result<u64, DriverError> {
    let (required, limit) = match range {
        Some(range) => (range.required_bytes.max(0) as u64, range.limit_bytes.max(0) as u64),
        None => (0, 0),
    };
    let size = if required > 0 {
        required
    } else if limit > 0 {
        limit.min(MIN_VOLUME_SIZE)
    } else {
        MIN_VOLUME_SIZE
    };
    if size < MIN_VOLUME_SIZE {
        return Err(DriverError::OutOfRange(format!(
            "requested size {} is below the 1 GiB minimum",
            size
        )));
    }
    if size > MAX_VOLUME_SIZE {
        return Err(DriverError::OutOfRange(format!(
            "requested size {} exceeds the 16 TiB maximum",
            size
        )));
    }
    if limit > 0 && size > limit {
        return Err(DriverError::OutOfRange(format!(
            "required size {} exceeds the limit {}",
            size, limit
        )));
    }
    Ok(size)
}

fn validate_capabilities(
    capabilities: &[VolumeCapability],
    multi_node_writer: bool,
) -> Result<(), DriverError> {
    if capabilities.is_empty() {
        return Err(DriverError::InvalidArgument(
            "no volume capabilities requested".into(),
        ));
    }
    for capability in capabilities {
        if let Some(AccessType::Block(_)) = capability.access_type {
            return Err(DriverError::InvalidArgument(
                "raw block volumes are not supported".into(),
            ));
        }
        let mode = capability
            .access_mode
            .as_ref()
            .map(|m| m.mode)
            .unwrap_or_default();
        let accepted = match Mode::from_i32(mode) {
            Some(Mode::SingleNodeWriter) | Some(Mode::SingleNodeReaderOnly) => true,
            Some(Mode::MultiNodeMultiWriter) => multi_node_writer,
            _ => false,
        };
        if !accepted {
            return Err(DriverError::InvalidArgument(format!(
                "access mode {:?} is not supported",
                Mode::from_i32(mode)
            )));
        }
    }
    Ok(())
}

fn fs_type_from(
    parameters: &BTreeMap<String, String>,
    capabilities: &[VolumeCapability],
) -> Result<String, DriverError> {
    let from_caps = capabilities.iter().find_map(|c| match &c.access_type {
        Some(AccessType::Mount(mount)) if !mount.fs_type.is_empty() => {
            Some(mount.fs_type.clone())
        }
        _ => None,
    });
    let fs_type = parameters
        .get("csi.storage.k8s.io/fstype")
        .or_else(|| parameters.get("fsType"))
        .cloned()
        .or(from_caps)
        .unwrap_or_else(|| "ext4".to_string());
    if !SUPPORTED_FS.contains(&fs_type.as_str()) {
        return Err(DriverError::InvalidArgument(format!(
            "filesystem {:?} is not supported",
            fs_type
        )));
    }
    Ok(fs_type)
}

fn controller_capability(rpc: RpcType) -> ControllerServiceCapability {
    ControllerServiceCapability {
        r#type: Some(Type::Rpc(Rpc { r#type: rpc as i32 })),
    }
}

#[async_trait::async_trait]
impl Controller for ControllerService {
    #[instrument(level = "info", skip(self, request))]
    async fn create_volume(
        &self,
        request: tonic::Request<CreateVolumeRequest>,
    ) -> Result<tonic::Response<CreateVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.name).map_err(DriverError::from)?;
        validate_capabilities(&req.volume_capabilities, self.settings.enable_multi_node_writer)?;
        let size = required_size(req.capacity_range.as_ref())?;
        let fs_type = fs_type_from(&req.parameters, &req.volume_capabilities)?;
        if req.volume_content_source.is_some() {
            return Err(tonic::Status::unimplemented(
                "creating volumes from an existing source is not supported",
            ));
        }

        if let Some(existing) = self
            .rds
            .get_volume(&req.name)
            .await
            .map_err(DriverError::from)?
        {
            if existing.size_bytes == size {
                info!(volume_id = %req.name, "volume already exists with matching size");
                return Ok(tonic::Response::new(CreateVolumeResponse {
                    volume: Some(self.csi_volume(&existing, &fs_type)),
                }));
            }
            return Err(DriverError::AlreadyExists(format!(
                "volume {} exists with size {}, requested {}",
                req.name, existing.size_bytes, size
            ))
            .into());
        }

        let opts = CreateVolumeOptions {
            slot: req.name.clone(),
            file_path: self.rds.volume_file_path(&req.name),
            size_bytes: size,
            nvme_port: self.settings.default_nvme_port,
        };
        let info = self
            .rds
            .create_volume(&opts)
            .await
            .map_err(DriverError::from)?;
        info!(volume_id = %req.name, size, "volume created");

        Ok(tonic::Response::new(CreateVolumeResponse {
            volume: Some(self.csi_volume(&info, &fs_type)),
        }))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn delete_volume(
        &self,
        request: tonic::Request<DeleteVolumeRequest>,
    ) -> Result<tonic::Response<DeleteVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;

        let info = match self
            .rds
            .get_volume(&req.volume_id)
            .await
            .map_err(DriverError::from)?
        {
            Some(info) => info,
            None => {
                info!(volume_id = %req.volume_id, "volume already gone");
                return Ok(tonic::Response::new(DeleteVolumeResponse {}));
            }
        };

        self.rds
            .delete_volume(&req.volume_id)
            .await
            .map_err(DriverError::from)?;
        self.rds
            .delete_file(&info.file_path)
            .await
            .map_err(DriverError::from)?;
        info!(volume_id = %req.volume_id, "volume deleted");
        Ok(tonic::Response::new(DeleteVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn controller_publish_volume(
        &self,
        request: tonic::Request<ControllerPublishVolumeRequest>,
    ) -> Result<tonic::Response<ControllerPublishVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        if req.node_id.is_empty() {
            return Err(DriverError::InvalidArgument("node ID is required".into()).into());
        }
        if let Some(capability) = &req.volume_capability {
            validate_capabilities(
                std::slice::from_ref(capability),
                self.settings.enable_multi_node_writer,
            )?;
        }

        let info = self
            .rds
            .get_volume(&req.volume_id)
            .await
            .map_err(DriverError::from)?
            .ok_or_else(|| {
                DriverError::NotFound(format!("volume {} not found", req.volume_id))
            })?;

        match self.attachments.get(&req.volume_id).await {
            Some(existing) if existing.node_id == req.node_id => {
                info!(volume_id = %req.volume_id, node_id = %req.node_id, "already attached here");
            }
            Some(existing) => {
                self.events
                    .post_for_volume(
                        &req.volume_id,
                        EventReason::AttachmentConflict,
                        &format!(
                            "publish to {} rejected: attached to {}",
                            req.node_id, existing.node_id
                        ),
                    )
                    .await;
                return Err(DriverError::FailedPrecondition(format!(
                    "volume {} is attached to node {}",
                    req.volume_id, existing.node_id
                ))
                .into());
            }
            None => {
                // A detach a moment ago makes this a live-migration
                // handoff to the same storage target.
                if self
                    .attachments
                    .is_within_grace_period(&req.volume_id, self.settings.grace_period)
                    .await
                {
                    metrics::GRACE_PERIOD_HANDOFF_TOTAL.inc();
                    info!(
                        volume_id = %req.volume_id,
                        node_id = %req.node_id,
                        "cross-node attach within grace period, treating as handoff"
                    );
                    self.attachments.clear_detach_timestamp(&req.volume_id).await;
                }
                let timer = metrics::ATTACH_DURATION_SECONDS.start_timer();
                self.attachments.track(&req.volume_id, &req.node_id).await?;
                timer.observe_duration();
                metrics::VOLUME_ATTACH_TOTAL.inc();
                self.events
                    .post_for_volume(
                        &req.volume_id,
                        EventReason::VolumeAttached,
                        &format!("volume attached to node {}", req.node_id),
                    )
                    .await;
            }
        }

        let mut publish_context = BTreeMap::new();
        publish_context.insert(
            "nqn".to_string(),
            info.nqn
                .clone()
                .unwrap_or_else(|| format!("{}{}", validate::NQN_PREFIX, info.slot)),
        );
        publish_context.insert("address".to_string(), self.settings.target_address.clone());
        publish_context.insert(
            "port".to_string(),
            info.nvme_port
                .unwrap_or(self.settings.default_nvme_port)
                .to_string(),
        );
        Ok(tonic::Response::new(ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn controller_unpublish_volume(
        &self,
        request: tonic::Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<tonic::Response<ControllerUnpublishVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;

        self.attachments.untrack(&req.volume_id).await?;
        metrics::VOLUME_DETACH_TOTAL.inc();
        self.events
            .post_for_volume(
                &req.volume_id,
                EventReason::VolumeDetached,
                &format!("volume detached from node {}", req.node_id),
            )
            .await;
        Ok(tonic::Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: tonic::Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<tonic::Response<ValidateVolumeCapabilitiesResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        self.rds
            .get_volume(&req.volume_id)
            .await
            .map_err(DriverError::from)?
            .ok_or_else(|| {
                DriverError::NotFound(format!("volume {} not found", req.volume_id))
            })?;

        match validate_capabilities(
            &req.volume_capabilities,
            self.settings.enable_multi_node_writer,
        ) {
            Ok(()) => Ok(tonic::Response::new(ValidateVolumeCapabilitiesResponse {
                confirmed: Some(Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                }),
                message: String::new(),
            })),
            Err(e) => Ok(tonic::Response::new(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: e.to_string(),
            })),
        }
    }

    async fn list_volumes(
        &self,
        _request: tonic::Request<ListVolumesRequest>,
    ) -> Result<tonic::Response<ListVolumesResponse>, tonic::Status> {
        let volumes = self.rds.list_volumes().await.map_err(DriverError::from)?;
        let mut entries = Vec::with_capacity(volumes.len());
        for info in &volumes {
            let published = self
                .attachments
                .get(&info.slot)
                .await
                .map(|a| vec![a.node_id])
                .unwrap_or_default();
            entries.push(VolumeEntry {
                volume: Some(self.csi_volume(info, "ext4")),
                status: Some(VolumeStatus {
                    published_node_ids: published,
                    volume_condition: Some(VolumeCondition {
                        abnormal: false,
                        message: "healthy".to_string(),
                    }),
                }),
            });
        }
        Ok(tonic::Response::new(ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn get_capacity(
        &self,
        _request: tonic::Request<GetCapacityRequest>,
    ) -> Result<tonic::Response<GetCapacityResponse>, tonic::Status> {
        let capacity = self.rds.get_capacity().await.map_err(DriverError::from)?;
        Ok(tonic::Response::new(GetCapacityResponse {
            available_capacity: capacity.free_bytes as i64,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: tonic::Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<tonic::Response<ControllerGetCapabilitiesResponse>, tonic::Status> {
        Ok(tonic::Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![
                controller_capability(RpcType::CreateDeleteVolume),
                controller_capability(RpcType::PublishUnpublishVolume),
                controller_capability(RpcType::GetCapacity),
                controller_capability(RpcType::CreateDeleteSnapshot),
                controller_capability(RpcType::ListSnapshots),
                controller_capability(RpcType::ExpandVolume),
                controller_capability(RpcType::ListVolumes),
                controller_capability(RpcType::GetVolume),
                controller_capability(RpcType::VolumeCondition),
            ],
        }))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn create_snapshot(
        &self,
        request: tonic::Request<CreateSnapshotRequest>,
    ) -> Result<tonic::Response<CreateSnapshotResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.source_volume_id).map_err(DriverError::from)?;
        validate::validate_snapshot_name(&req.name).map_err(DriverError::from)?;

        let info = self
            .rds
            .create_snapshot(&req.source_volume_id, &req.name)
            .await
            .map_err(DriverError::from)?;

        Ok(tonic::Response::new(CreateSnapshotResponse {
            snapshot: Some(Snapshot {
                snapshot_id: info.id,
                source_volume_id: info.source_slot,
                size_bytes: info.size_bytes as i64,
                creation_time: Some(prost_types::Timestamp {
                    seconds: chrono::Utc::now().timestamp(),
                    nanos: 0,
                }),
                ready_to_use: true,
            }),
        }))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn delete_snapshot(
        &self,
        request: tonic::Request<DeleteSnapshotRequest>,
    ) -> Result<tonic::Response<DeleteSnapshotResponse>, tonic::Status> {
        let req = request.into_inner();
        // A snapshot ID that never matched our format cannot exist; deleting
        // it is success.
        if req.snapshot_id.split_once('@').is_none() {
            return Ok(tonic::Response::new(DeleteSnapshotResponse {}));
        }
        self.rds
            .delete_snapshot(&req.snapshot_id)
            .await
            .map_err(DriverError::from)?;
        Ok(tonic::Response::new(DeleteSnapshotResponse {}))
    }

    async fn list_snapshots(
        &self,
        request: tonic::Request<ListSnapshotsRequest>,
    ) -> Result<tonic::Response<ListSnapshotsResponse>, tonic::Status> {
        let req = request.into_inner();

        let snapshots = if !req.snapshot_id.is_empty() {
            match self.rds.get_snapshot(&req.snapshot_id).await {
                Ok(Some(info)) => vec![info],
                Ok(None) | Err(rds_client::Error::InvalidArgument(_)) => Vec::new(),
                Err(e) => return Err(tonic::Status::from(DriverError::from(e))),
            }
        } else {
            let source = (!req.source_volume_id.is_empty()).then(|| req.source_volume_id.as_str());
            self.rds
                .list_snapshots(source)
                .await
                .map_err(DriverError::from)?
        };

        Ok(tonic::Response::new(ListSnapshotsResponse {
            entries: snapshots
                .into_iter()
                .map(|info| SnapshotEntry {
                    snapshot: Some(Snapshot {
                        snapshot_id: info.id,
                        source_volume_id: info.source_slot,
                        size_bytes: info.size_bytes as i64,
                        creation_time: None,
                        ready_to_use: true,
                    }),
                })
                .collect(),
            next_token: String::new(),
        }))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn controller_expand_volume(
        &self,
        request: tonic::Request<ControllerExpandVolumeRequest>,
    ) -> Result<tonic::Response<ControllerExpandVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        let size = required_size(req.capacity_range.as_ref())?;

        let info = self
            .rds
            .get_volume(&req.volume_id)
            .await
            .map_err(DriverError::from)?
            .ok_or_else(|| {
                DriverError::NotFound(format!("volume {} not found", req.volume_id))
            })?;

        if info.size_bytes >= size {
            return Ok(tonic::Response::new(ControllerExpandVolumeResponse {
                capacity_bytes: info.size_bytes as i64,
                node_expansion_required: true,
            }));
        }

        self.rds
            .resize_volume(&req.volume_id, size)
            .await
            .map_err(DriverError::from)?;
        info!(volume_id = %req.volume_id, size, "volume expanded");
        Ok(tonic::Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: size as i64,
            node_expansion_required: true,
        }))
    }

    async fn controller_get_volume(
        &self,
        request: tonic::Request<ControllerGetVolumeRequest>,
    ) -> Result<tonic::Response<ControllerGetVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        let info = self
            .rds
            .get_volume(&req.volume_id)
            .await
            .map_err(DriverError::from)?
            .ok_or_else(|| {
                DriverError::NotFound(format!("volume {} not found", req.volume_id))
            })?;

        let published = self
            .attachments
            .get(&req.volume_id)
            .await
            .map(|a| vec![a.node_id])
            .unwrap_or_default();

        Ok(tonic::Response::new(ControllerGetVolumeResponse {
            volume: Some(self.csi_volume(&info, "ext4")),
            status: Some(controller_get_volume_response::VolumeStatus {
                published_node_ids: published,
                volume_condition: Some(VolumeCondition {
                    abnormal: false,
                    message: "healthy".to_string(),
                }),
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::test_utils::{not_found_json, scripted_kube_service, Scripted};
    use http::StatusCode;
    use k8s_csi::v1_3_0::volume_capability::{AccessMode, MountVolume};
    use rds_client::{Capacity, Error as RdsError, SnapshotInfo};
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    const VOLUME: &str = "pvc-1a2b3c";

    #[derive(Default)]
    struct MockAppliance {
        volumes: Mutex<HashMap<String, VolumeInfo>>,
        snapshots: Mutex<HashMap<String, SnapshotInfo>>,
        out_of_space: bool,
        create_calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl Appliance for MockAppliance {
        async fn connect(&self) -> Result<(), RdsError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn volume_file_path(&self, volume_id: &str) -> String {
            format!("raid1/csi/{}.img", volume_id)
        }

        async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<VolumeInfo, RdsError> {
            self.create_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.out_of_space {
                return Err(RdsError::ResourceExhausted(
                    "not enough space on raid1".into(),
                ));
            }
            let info = VolumeInfo {
                slot: opts.slot.clone(),
                file_path: opts.file_path.clone(),
                size_bytes: opts.size_bytes,
                nqn: Some(opts.nqn()),
                nvme_port: Some(opts.nvme_port),
            };
            self.volumes
                .lock()
                .await
                .insert(opts.slot.clone(), info.clone());
            Ok(info)
        }

        async fn get_volume(&self, slot: &str) -> Result<Option<VolumeInfo>, RdsError> {
            Ok(self.volumes.lock().await.get(slot).cloned())
        }

        async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, RdsError> {
            Ok(self.volumes.lock().await.values().cloned().collect())
        }

        async fn delete_volume(&self, slot: &str) -> Result<(), RdsError> {
            self.volumes.lock().await.remove(slot);
            Ok(())
        }

        async fn delete_file(&self, _path: &str) -> Result<(), RdsError> {
            Ok(())
        }

        async fn resize_volume(&self, slot: &str, new_size: u64) -> Result<(), RdsError> {
            match self.volumes.lock().await.get_mut(slot) {
                Some(info) => {
                    info.size_bytes = new_size;
                    Ok(())
                }
                None => Err(RdsError::NotFound("no such item".into())),
            }
        }

        async fn get_capacity(&self) -> Result<Capacity, RdsError> {
            Ok(Capacity {
                total_bytes: 100 * GIB,
                free_bytes: 40 * GIB,
            })
        }

        async fn create_snapshot(
            &self,
            source_slot: &str,
            name: &str,
        ) -> Result<SnapshotInfo, RdsError> {
            let info = SnapshotInfo {
                id: format!("{}@{}", source_slot, name),
                source_slot: source_slot.to_string(),
                file_path: format!("raid1/csi/{}@{}.img", source_slot, name),
                size_bytes: GIB,
            };
            self.snapshots
                .lock()
                .await
                .insert(info.id.clone(), info.clone());
            Ok(info)
        }

        async fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotInfo>, RdsError> {
            Ok(self.snapshots.lock().await.get(id).cloned())
        }

        async fn list_snapshots(
            &self,
            source_slot: Option<&str>,
        ) -> Result<Vec<SnapshotInfo>, RdsError> {
            Ok(self
                .snapshots
                .lock()
                .await
                .values()
                .filter(|s| source_slot.map_or(true, |src| s.source_slot == src))
                .cloned()
                .collect())
        }

        async fn delete_snapshot(&self, id: &str) -> Result<(), RdsError> {
            self.snapshots.lock().await.remove(id);
            Ok(())
        }
    }

    fn single_writer_cap() -> VolumeCapability {
        VolumeCapability {
            access_mode: Some(AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            })),
        }
    }

    fn create_request(name: &str, required: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: required,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![single_writer_cap()],
            ..Default::default()
        }
    }

    async fn service_with(
        appliance: Arc<MockAppliance>,
        scripted_404s: usize,
        multi_node_writer: bool,
    ) -> (ControllerService, Arc<AttachmentManager>) {
        let script = (0..scripted_404s)
            .map(|_| Scripted {
                status: StatusCode::NOT_FOUND,
                body: not_found_json("x"),
            })
            .collect();
        let (client, _handle) = scripted_kube_service(script).await;
        let attachments = Arc::new(AttachmentManager::new(client.clone()));
        let service = ControllerService::new(
            appliance,
            attachments.clone(),
            EventRecorder::new(client),
            ControllerSettings {
                target_address: "192.168.88.2".to_string(),
                default_nvme_port: 4420,
                grace_period: Duration::from_secs(10),
                enable_multi_node_writer: multi_node_writer,
            },
        );
        (service, attachments)
    }

    #[test]
    fn size_bounds() {
        let range = |required, limit| {
            Some(CapacityRange {
                required_bytes: required,
                limit_bytes: limit,
            })
        };
        assert_eq!(required_size(None).unwrap(), GIB);
        assert_eq!(required_size(range(GIB as i64, 0).as_ref()).unwrap(), GIB);
        assert!(matches!(
            required_size(range(GIB as i64 - 1, 0).as_ref()),
            Err(DriverError::OutOfRange(_))
        ));
        assert!(matches!(
            required_size(range(MAX_VOLUME_SIZE as i64 + 1, 0).as_ref()),
            Err(DriverError::OutOfRange(_))
        ));
        assert_eq!(
            required_size(range(MAX_VOLUME_SIZE as i64, 0).as_ref()).unwrap(),
            MAX_VOLUME_SIZE
        );
        assert!(matches!(
            required_size(range(4 * GIB as i64, 2 * GIB as i64).as_ref()),
            Err(DriverError::OutOfRange(_))
        ));
    }

    #[test]
    fn capability_policy() {
        assert!(validate_capabilities(&[], false).is_err());
        assert!(validate_capabilities(&[single_writer_cap()], false).is_ok());

        let multi = VolumeCapability {
            access_mode: Some(AccessMode {
                mode: Mode::MultiNodeMultiWriter as i32,
            }),
            access_type: None,
        };
        assert!(validate_capabilities(std::slice::from_ref(&multi), false).is_err());
        assert!(validate_capabilities(std::slice::from_ref(&multi), true).is_ok());

        let block = VolumeCapability {
            access_mode: Some(AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
            access_type: Some(AccessType::Block(
                k8s_csi::v1_3_0::volume_capability::BlockVolume {},
            )),
        };
        assert!(validate_capabilities(std::slice::from_ref(&block), false).is_err());
    }

    #[tokio::test]
    async fn create_is_idempotent_and_checks_size() {
        let appliance = Arc::new(MockAppliance::default());
        let (service, _) = service_with(appliance.clone(), 0, false).await;

        let first = service
            .create_volume(tonic::Request::new(create_request(VOLUME, GIB as i64)))
            .await
            .unwrap()
            .into_inner();
        let volume = first.volume.unwrap();
        assert_eq!(volume.volume_id, VOLUME);
        assert_eq!(
            volume.volume_context.get("nqn").unwrap(),
            &format!("nqn.2000-02.com.mikrotik:{}", VOLUME)
        );
        assert_eq!(volume.volume_context.get("address").unwrap(), "192.168.88.2");
        assert_eq!(volume.volume_context.get("port").unwrap(), "4420");
        assert_eq!(volume.volume_context.get("fsType").unwrap(), "ext4");

        // Same request again: success, identical context, no second create.
        let second = service
            .create_volume(tonic::Request::new(create_request(VOLUME, GIB as i64)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(second.volume.unwrap().volume_context, volume.volume_context);
        assert_eq!(
            appliance
                .create_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        // Same name, different size: AlreadyExists.
        let err = service
            .create_volume(tonic::Request::new(create_request(VOLUME, 2 * GIB as i64)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
    }

    #[tokio::test]
    async fn invalid_names_never_reach_the_appliance() {
        let appliance = Arc::new(MockAppliance::default());
        let (service, _) = service_with(appliance.clone(), 0, false).await;

        let err = service
            .create_volume(tonic::Request::new(create_request(
                "vol-1; /disk remove",
                GIB as i64,
            )))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(
            appliance
                .create_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn out_of_range_sizes_are_rejected() {
        let appliance = Arc::new(MockAppliance::default());
        let (service, _) = service_with(appliance, 0, false).await;

        let err = service
            .create_volume(tonic::Request::new(create_request(VOLUME, GIB as i64 - 1)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);

        let err = service
            .create_volume(tonic::Request::new(create_request(
                VOLUME,
                MAX_VOLUME_SIZE as i64 + 1,
            )))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);
    }

    #[tokio::test]
    async fn full_appliance_surfaces_resource_exhausted() {
        let appliance = Arc::new(MockAppliance {
            out_of_space: true,
            ..Default::default()
        });
        let (service, _) = service_with(appliance.clone(), 0, false).await;

        let err = service
            .create_volume(tonic::Request::new(create_request(
                "pvc-ddd",
                12 * (1 << 40),
            )))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
        // No slot was created.
        assert!(appliance.get_volume("pvc-ddd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let appliance = Arc::new(MockAppliance::default());
        let (service, _) = service_with(appliance.clone(), 0, false).await;
        appliance
            .create_volume(&CreateVolumeOptions {
                slot: VOLUME.into(),
                file_path: "raid1/csi/v.img".into(),
                size_bytes: GIB,
                nvme_port: 4420,
            })
            .await
            .unwrap();

        let req = DeleteVolumeRequest {
            volume_id: VOLUME.to_string(),
            ..Default::default()
        };
        service
            .delete_volume(tonic::Request::new(req.clone()))
            .await
            .unwrap();
        service.delete_volume(tonic::Request::new(req)).await.unwrap();
        assert!(appliance.get_volume(VOLUME).await.unwrap().is_none());
    }

    async fn seeded_service(
        scripted_404s: usize,
    ) -> (ControllerService, Arc<AttachmentManager>, Arc<MockAppliance>) {
        let appliance = Arc::new(MockAppliance::default());
        appliance
            .create_volume(&CreateVolumeOptions {
                slot: VOLUME.into(),
                file_path: "raid1/csi/v.img".into(),
                size_bytes: GIB,
                nvme_port: 4420,
            })
            .await
            .unwrap();
        let (service, attachments) = service_with(appliance.clone(), scripted_404s, false).await;
        (service, attachments, appliance)
    }

    fn publish_request(node: &str) -> ControllerPublishVolumeRequest {
        ControllerPublishVolumeRequest {
            volume_id: VOLUME.to_string(),
            node_id: node.to_string(),
            volume_capability: Some(single_writer_cap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_tracks_and_is_idempotent() {
        let (service, attachments, _) = seeded_service(4).await;

        let response = service
            .controller_publish_volume(tonic::Request::new(publish_request("node-a")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.publish_context.get("nqn").unwrap(),
            &format!("nqn.2000-02.com.mikrotik:{}", VOLUME)
        );
        assert_eq!(attachments.get(VOLUME).await.unwrap().node_id, "node-a");

        // Publishing to the same node again succeeds without re-tracking.
        service
            .controller_publish_volume(tonic::Request::new(publish_request("node-a")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cross_node_publish_without_grace_is_a_conflict() {
        let (service, attachments, _) = seeded_service(4).await;

        service
            .controller_publish_volume(tonic::Request::new(publish_request("node-a")))
            .await
            .unwrap();
        let err = service
            .controller_publish_volume(tonic::Request::new(publish_request("node-b")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        assert_eq!(attachments.get(VOLUME).await.unwrap().node_id, "node-a");
    }

    #[tokio::test]
    async fn live_migration_handoff_within_grace() {
        let before = metrics::GRACE_PERIOD_HANDOFF_TOTAL.get();
        let (service, attachments, _) = seeded_service(8).await;

        service
            .controller_publish_volume(tonic::Request::new(publish_request("node-a")))
            .await
            .unwrap();
        service
            .controller_unpublish_volume(tonic::Request::new(ControllerUnpublishVolumeRequest {
                volume_id: VOLUME.to_string(),
                node_id: "node-a".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        // Within the 10s grace period: publish to another node succeeds.
        service
            .controller_publish_volume(tonic::Request::new(publish_request("node-b")))
            .await
            .unwrap();
        assert_eq!(attachments.get(VOLUME).await.unwrap().node_id, "node-b");
        assert_eq!(metrics::GRACE_PERIOD_HANDOFF_TOTAL.get(), before + 1);
    }

    #[tokio::test]
    async fn expand_grows_and_is_idempotent() {
        let (service, _, appliance) = seeded_service(0).await;

        let expand = |size: i64| ControllerExpandVolumeRequest {
            volume_id: VOLUME.to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: size,
                limit_bytes: 0,
            }),
            ..Default::default()
        };

        let response = service
            .controller_expand_volume(tonic::Request::new(expand(2 * GIB as i64)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.capacity_bytes, 2 * GIB as i64);
        assert!(response.node_expansion_required);
        assert_eq!(
            appliance.get_volume(VOLUME).await.unwrap().unwrap().size_bytes,
            2 * GIB
        );

        // Shrinking below the current size is answered with the current size.
        let response = service
            .controller_expand_volume(tonic::Request::new(expand(GIB as i64)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.capacity_bytes, 2 * GIB as i64);
    }

    #[tokio::test]
    async fn snapshot_lifecycle() {
        let (service, _, _) = seeded_service(0).await;

        let created = service
            .create_snapshot(tonic::Request::new(CreateSnapshotRequest {
                source_volume_id: VOLUME.to_string(),
                name: "snapshot-42".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner()
            .snapshot
            .unwrap();
        assert_eq!(created.snapshot_id, format!("{}@snapshot-42", VOLUME));
        assert!(created.ready_to_use);

        let listed = service
            .list_snapshots(tonic::Request::new(ListSnapshotsRequest {
                source_volume_id: VOLUME.to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.entries.len(), 1);

        service
            .delete_snapshot(tonic::Request::new(DeleteSnapshotRequest {
                snapshot_id: created.snapshot_id,
                ..Default::default()
            }))
            .await
            .unwrap();

        // Unknown-format IDs cannot exist; deletion is success.
        service
            .delete_snapshot(tonic::Request::new(DeleteSnapshotRequest {
                snapshot_id: "garbage".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn capacity_reports_free_bytes() {
        let (service, _, _) = seeded_service(0).await;
        let response = service
            .get_capacity(tonic::Request::new(GetCapacityRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.available_capacity, 40 * GIB as i64);
    }
}
