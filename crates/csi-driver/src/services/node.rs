//! The CSI Node service: staging NVMe namespaces into mounts, bind-mounting
//! them into pods, and answering volume stats with a condition verdict.
//!
//! Stale mounts are checked on every access path: staging (with recovery),
//! publish (with recovery and a PVC event on failure), and stats (read-only
//! triage, never recovery).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_csi::v1_3_0::node_service_capability::rpc::Type as RpcType;
use k8s_csi::v1_3_0::node_service_capability::{Rpc, Type};
use k8s_csi::v1_3_0::volume_capability::AccessType;
use k8s_csi::v1_3_0::{
    node_server::Node, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse,
    NodePublishVolumeRequest, NodePublishVolumeResponse, NodeServiceCapability,
    NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest,
    NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology,
    VolumeCapability, VolumeCondition, VolumeUsage,
};
use rds_client::validate;
use tracing::{debug, info, instrument, warn};

use crate::error::DriverError;
use crate::events::{EventRecorder, EventReason};
use crate::metrics;
use crate::mount::{Mounter, StaleReason};
use crate::nvme::{Connector, NvmeTarget};
use crate::nqn_for_volume;

const DEFAULT_FS: &str = "ext4";
const MAX_VOLUMES_PER_NODE: i64 = 128;

/// The Node service.
pub struct NodeService {
    connector: Arc<dyn Connector>,
    mounter: Arc<dyn Mounter>,
    events: EventRecorder,
    node_id: String,
}

impl NodeService {
    /// Wires the service to its collaborators.
    pub fn new(
        connector: Arc<dyn Connector>,
        mounter: Arc<dyn Mounter>,
        events: EventRecorder,
        node_id: impl Into<String>,
    ) -> Self {
        NodeService {
            connector,
            mounter,
            events,
            node_id: node_id.into(),
        }
    }
}

// Extracts and validates the NVMe target from the volume context, falling
// back to the publish context for each key.
fn target_from_context(
    volume_id: &str,
    volume_context: &BTreeMap<String, String>,
    publish_context: &BTreeMap<String, String>,
) -> Result<NvmeTarget, DriverError> {
    let get = |key: &str| {
        volume_context
            .get(key)
            .or_else(|| publish_context.get(key))
            .cloned()
            .ok_or_else(|| {
                DriverError::InvalidArgument(format!("volume context is missing {:?}", key))
            })
    };

    let nqn = get("nqn")?;
    validate::validate_nqn(&nqn, volume_id)?;
    let address = get("address")?;
    validate::validate_address(&address)?;
    let port = get("port")?;
    let port: u32 = port.parse().map_err(|_| {
        DriverError::InvalidArgument(format!("port {:?} is not a number", port))
    })?;
    let port = validate::validate_port(port)?;

    Ok(NvmeTarget { nqn, address, port })
}

fn mount_spec(capability: Option<&VolumeCapability>) -> (Option<String>, Vec<String>) {
    match capability.and_then(|c| c.access_type.as_ref()) {
        Some(AccessType::Mount(mount)) => (
            (!mount.fs_type.is_empty()).then(|| mount.fs_type.clone()),
            mount.mount_flags.clone(),
        ),
        _ => (None, Vec::new()),
    }
}

fn fs_type_for(
    capability: Option<&VolumeCapability>,
    volume_context: &BTreeMap<String, String>,
) -> String {
    let (from_cap, _) = mount_spec(capability);
    from_cap
        .or_else(|| volume_context.get("fsType").cloned())
        .unwrap_or_else(|| DEFAULT_FS.to_string())
}

// Disk and inode usage for a mounted path, via statvfs.
async fn fs_usage(path: PathBuf) -> Result<Vec<VolumeUsage>, DriverError> {
    let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
        .await
        .map_err(|e| DriverError::Internal(format!("statvfs task failed: {}", e)))?
        .map_err(|e| DriverError::Internal(format!("statvfs failed: {}", e)))?;

    let fragment = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * fragment;
    let available = stat.blocks_available() as u64 * fragment;
    let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * fragment;
    let inodes = stat.files() as u64;
    let inodes_free = stat.files_available() as u64;

    Ok(vec![
        VolumeUsage {
            unit: k8s_csi::v1_3_0::volume_usage::Unit::Bytes as i32,
            total: total as i64,
            available: available as i64,
            used: used as i64,
        },
        VolumeUsage {
            unit: k8s_csi::v1_3_0::volume_usage::Unit::Inodes as i32,
            total: inodes as i64,
            available: inodes_free as i64,
            used: inodes.saturating_sub(stat.files_free() as u64) as i64,
        },
    ])
}

fn node_capability(rpc: RpcType) -> NodeServiceCapability {
    NodeServiceCapability {
        r#type: Some(Type::Rpc(Rpc { r#type: rpc as i32 })),
    }
}

#[async_trait::async_trait]
impl Node for NodeService {
    #[instrument(level = "info", skip(self, request))]
    async fn node_stage_volume(
        &self,
        request: tonic::Request<NodeStageVolumeRequest>,
    ) -> Result<tonic::Response<NodeStageVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        if req.staging_target_path.is_empty() {
            return Err(
                DriverError::InvalidArgument("staging target path is required".into()).into(),
            );
        }
        let target =
            target_from_context(&req.volume_id, &req.volume_context, &req.publish_context)?;
        let fs_type = fs_type_for(req.volume_capability.as_ref(), &req.volume_context);
        let (_, mount_flags) = mount_spec(req.volume_capability.as_ref());
        let staging = Path::new(&req.staging_target_path);

        info!(
            volume_id = %req.volume_id,
            staging = %staging.display(),
            fs_type = %fs_type,
            "staging volume"
        );

        let device = match self.connector.connect(&target).await {
            Ok(device) => device,
            Err(e) => {
                self.events
                    .post_for_volume(
                        &req.volume_id,
                        EventReason::ConnectionFailure,
                        &format!("connecting to NVMe target failed: {}", e),
                    )
                    .await;
                return Err(e.into());
            }
        };

        if self
            .mounter
            .is_likely_mount_point(staging)
            .map_err(tonic::Status::from)?
        {
            match self.mounter.is_mount_stale(staging, &target.nqn).await {
                Ok(None) => {
                    debug!(volume_id = %req.volume_id, "already staged and healthy");
                    return Ok(tonic::Response::new(NodeStageVolumeResponse {}));
                }
                Ok(Some(reason)) => {
                    metrics::STALE_MOUNT_DETECTED_TOTAL.inc();
                    warn!(volume_id = %req.volume_id, %reason, "staged mount is stale, recovering");
                    self.events
                        .post_for_volume(
                            &req.volume_id,
                            EventReason::StaleMountDetected,
                            &format!("staged mount is stale: {}", reason),
                        )
                        .await;
                    if let Err(e) = self
                        .mounter
                        .recover_mount(staging, &target.nqn, &fs_type, &mount_flags)
                        .await
                    {
                        self.events
                            .post_for_volume(
                                &req.volume_id,
                                EventReason::RecoveryFailed,
                                &format!("stale mount recovery failed: {}", e),
                            )
                            .await;
                        return Err(e.into());
                    }
                    self.events
                        .post_for_volume(
                            &req.volume_id,
                            EventReason::ConnectionRecovery,
                            "stale mount replaced with the current device",
                        )
                        .await;
                    return Ok(tonic::Response::new(NodeStageVolumeResponse {}));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let staged: Result<(), DriverError> = async {
            self.mounter.format(&device, &fs_type).await?;
            self.mounter
                .mount(&device, staging, &fs_type, &mount_flags)
                .await
        }
        .await;

        if let Err(e) = staged {
            self.events
                .post_for_volume(
                    &req.volume_id,
                    EventReason::MountFailure,
                    &format!("staging mount failed: {}", e),
                )
                .await;
            // Roll the connection back so a retry starts clean.
            if let Err(cleanup) = self.connector.disconnect(&target.nqn).await {
                warn!(volume_id = %req.volume_id, error = %cleanup, "disconnect after failed stage also failed");
            }
            return Err(e.into());
        }

        info!(volume_id = %req.volume_id, device = %device.display(), "volume staged");
        Ok(tonic::Response::new(NodeStageVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn node_unstage_volume(
        &self,
        request: tonic::Request<NodeUnstageVolumeRequest>,
    ) -> Result<tonic::Response<NodeUnstageVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        if req.staging_target_path.is_empty() {
            return Err(
                DriverError::InvalidArgument("staging target path is required".into()).into(),
            );
        }

        self.mounter
            .unmount(Path::new(&req.staging_target_path))
            .await
            .map_err(tonic::Status::from)?;
        self.connector
            .disconnect(&nqn_for_volume(&req.volume_id))
            .await
            .map_err(tonic::Status::from)?;

        info!(volume_id = %req.volume_id, "volume unstaged");
        Ok(tonic::Response::new(NodeUnstageVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn node_publish_volume(
        &self,
        request: tonic::Request<NodePublishVolumeRequest>,
    ) -> Result<tonic::Response<NodePublishVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        if req.target_path.is_empty() || req.staging_target_path.is_empty() {
            return Err(DriverError::InvalidArgument(
                "target and staging paths are required".into(),
            )
            .into());
        }
        let staging = Path::new(&req.staging_target_path);
        let target = Path::new(&req.target_path);
        let nqn = req
            .volume_context
            .get("nqn")
            .cloned()
            .unwrap_or_else(|| nqn_for_volume(&req.volume_id));
        let fs_type = fs_type_for(req.volume_capability.as_ref(), &req.volume_context);
        let (_, mount_flags) = mount_spec(req.volume_capability.as_ref());

        if !self
            .mounter
            .is_likely_mount_point(staging)
            .map_err(tonic::Status::from)?
        {
            return Err(DriverError::FailedPrecondition(format!(
                "volume {} is not staged at {}",
                req.volume_id,
                staging.display()
            ))
            .into());
        }

        match self.mounter.is_mount_stale(staging, &nqn).await {
            Ok(None) => {}
            Ok(Some(reason)) => {
                metrics::STALE_MOUNT_DETECTED_TOTAL.inc();
                warn!(volume_id = %req.volume_id, %reason, "staged mount stale at publish, recovering");
                self.events
                    .post_for_volume(
                        &req.volume_id,
                        EventReason::StaleMountDetected,
                        &format!("staged mount is stale: {}", reason),
                    )
                    .await;
                if let Err(e) = self
                    .mounter
                    .recover_mount(staging, &nqn, &fs_type, &mount_flags)
                    .await
                {
                    self.events
                        .post_for_volume(
                            &req.volume_id,
                            EventReason::RecoveryFailed,
                            &format!("stale mount recovery failed: {}", e),
                        )
                        .await;
                    return Err(DriverError::Internal(format!(
                        "staged mount for {} is stale and recovery failed: {}",
                        req.volume_id, e
                    ))
                    .into());
                }
            }
            // The health check itself failing does not block publish; the
            // bind mount will surface a truly broken mount.
            Err(e) => debug!(volume_id = %req.volume_id, error = %e, "staleness check inconclusive"),
        }

        if self
            .mounter
            .is_likely_mount_point(target)
            .map_err(tonic::Status::from)?
        {
            debug!(volume_id = %req.volume_id, "already published");
            return Ok(tonic::Response::new(NodePublishVolumeResponse {}));
        }

        if let Err(e) = self.mounter.bind_mount(staging, target, req.readonly).await {
            self.events
                .post_for_volume(
                    &req.volume_id,
                    EventReason::MountFailure,
                    &format!("publishing bind mount failed: {}", e),
                )
                .await;
            return Err(e.into());
        }

        info!(volume_id = %req.volume_id, target = %target.display(), "volume published");
        Ok(tonic::Response::new(NodePublishVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn node_unpublish_volume(
        &self,
        request: tonic::Request<NodeUnpublishVolumeRequest>,
    ) -> Result<tonic::Response<NodeUnpublishVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        if req.target_path.is_empty() {
            return Err(DriverError::InvalidArgument("target path is required".into()).into());
        }

        self.mounter
            .unmount(Path::new(&req.target_path))
            .await
            .map_err(tonic::Status::from)?;
        info!(volume_id = %req.volume_id, "volume unpublished");
        Ok(tonic::Response::new(NodeUnpublishVolumeResponse {}))
    }

    /// Always returns a `VolumeCondition`. Staleness is computed read-only
    /// here; recovery belongs to the stage and publish paths.
    async fn node_get_volume_stats(
        &self,
        request: tonic::Request<NodeGetVolumeStatsRequest>,
    ) -> Result<tonic::Response<NodeGetVolumeStatsResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        if req.volume_path.is_empty() {
            return Err(DriverError::InvalidArgument("volume path is required".into()).into());
        }
        let path = Path::new(&req.volume_path);

        let condition = match self
            .mounter
            .is_mount_stale(path, &nqn_for_volume(&req.volume_id))
            .await
        {
            Ok(None) => VolumeCondition {
                abnormal: false,
                message: "healthy".to_string(),
            },
            Ok(Some(reason)) => {
                metrics::STALE_MOUNT_DETECTED_TOTAL.inc();
                VolumeCondition {
                    abnormal: true,
                    message: reason.to_string(),
                }
            }
            Err(e) => {
                debug!(volume_id = %req.volume_id, error = %e, "health check inconclusive");
                VolumeCondition {
                    abnormal: false,
                    message: "inconclusive".to_string(),
                }
            }
        };

        let usage = match fs_usage(path.to_path_buf()).await {
            Ok(usage) => usage,
            Err(e) => {
                debug!(volume_id = %req.volume_id, error = %e, "usage collection failed");
                Vec::new()
            }
        };

        Ok(tonic::Response::new(NodeGetVolumeStatsResponse {
            usage,
            volume_condition: Some(condition),
        }))
    }

    #[instrument(level = "info", skip(self, request))]
    async fn node_expand_volume(
        &self,
        request: tonic::Request<NodeExpandVolumeRequest>,
    ) -> Result<tonic::Response<NodeExpandVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        validate::validate_volume_id(&req.volume_id).map_err(DriverError::from)?;
        if req.volume_path.is_empty() {
            return Err(DriverError::InvalidArgument("volume path is required".into()).into());
        }
        let path = Path::new(&req.volume_path);

        self.mounter
            .expand_filesystem(path)
            .await
            .map_err(tonic::Status::from)?;

        let capacity = match fs_usage(path.to_path_buf()).await {
            Ok(usage) => usage
                .iter()
                .find(|u| u.unit == k8s_csi::v1_3_0::volume_usage::Unit::Bytes as i32)
                .map(|u| u.total)
                .unwrap_or_default(),
            Err(_) => req
                .capacity_range
                .map(|range| range.required_bytes)
                .unwrap_or_default(),
        };

        info!(volume_id = %req.volume_id, capacity, "filesystem expanded");
        Ok(tonic::Response::new(NodeExpandVolumeResponse {
            capacity_bytes: capacity,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: tonic::Request<NodeGetCapabilitiesRequest>,
    ) -> Result<tonic::Response<NodeGetCapabilitiesResponse>, tonic::Status> {
        Ok(tonic::Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![
                node_capability(RpcType::StageUnstageVolume),
                node_capability(RpcType::GetVolumeStats),
                node_capability(RpcType::ExpandVolume),
                node_capability(RpcType::VolumeCondition),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: tonic::Request<NodeGetInfoRequest>,
    ) -> Result<tonic::Response<NodeGetInfoResponse>, tonic::Status> {
        let mut segments = BTreeMap::new();
        segments.insert(
            format!("{}/node", crate::DRIVER_NAME),
            self.node_id.clone(),
        );
        Ok(tonic::Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            accessible_topology: Some(Topology { segments }),
        }))
    }
}
