//! Posting Kubernetes Events to the PVC behind a volume.
//!
//! Events are strictly best-effort: a failure to post is logged and never
//! surfaces into the operation that triggered it. The reason vocabulary is
//! small and stable so dashboards can match on it.

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, PersistentVolume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use tracing::{debug, warn};

const COMPONENT: &str = "rds-csi-driver";

/// The fixed set of event reasons the driver emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    /// A mount or format operation failed.
    MountFailure,
    /// Stale-mount recovery gave up.
    RecoveryFailed,
    /// A staged mount was found stale.
    StaleMountDetected,
    /// Connecting to the NVMe target failed.
    ConnectionFailure,
    /// An orphaned connection was torn down and re-established.
    ConnectionRecovery,
    /// A publish was rejected because the volume is attached elsewhere.
    AttachmentConflict,
    /// The volume was attached to a node.
    VolumeAttached,
    /// The volume was detached from a node.
    VolumeDetached,
    /// The reconciler cleared an attachment on a deleted node.
    StaleAttachmentCleared,
}

impl EventReason {
    /// The reason string as it appears on the Event object.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::MountFailure => "MountFailure",
            EventReason::RecoveryFailed => "RecoveryFailed",
            EventReason::StaleMountDetected => "StaleMountDetected",
            EventReason::ConnectionFailure => "ConnectionFailure",
            EventReason::ConnectionRecovery => "ConnectionRecovery",
            EventReason::AttachmentConflict => "AttachmentConflict",
            EventReason::VolumeAttached => "VolumeAttached",
            EventReason::VolumeDetached => "VolumeDetached",
            EventReason::StaleAttachmentCleared => "StaleAttachmentCleared",
        }
    }

    // Lifecycle notifications are Normal; everything else is a Warning.
    fn event_type(&self) -> &'static str {
        match self {
            EventReason::VolumeAttached | EventReason::VolumeDetached => "Normal",
            _ => "Warning",
        }
    }
}

/// Posts events against the PVC referenced by a volume's PV.
#[derive(Clone)]
pub struct EventRecorder {
    client: kube::Client,
}

impl EventRecorder {
    /// A recorder using the given client.
    pub fn new(client: kube::Client) -> Self {
        EventRecorder { client }
    }

    /// Follows `PV(volume_id).spec.claimRef` to the PVC and posts there.
    /// Any failure along the way is logged and swallowed.
    pub async fn post_for_volume(&self, volume_id: &str, reason: EventReason, message: &str) {
        let pv_api: Api<PersistentVolume> = Api::all(self.client.clone());
        let claim = match pv_api.get(volume_id).await {
            Ok(pv) => pv.spec.and_then(|spec| spec.claim_ref),
            Err(e) => {
                debug!(volume_id, error = %e, "cannot resolve PV for event, dropping");
                return;
            }
        };
        let claim = match claim {
            Some(claim) => claim,
            None => {
                debug!(volume_id, "PV has no claimRef, dropping event");
                return;
            }
        };
        let (namespace, name) = match (claim.namespace.clone(), claim.name.clone()) {
            (Some(namespace), Some(name)) => (namespace, name),
            _ => return,
        };
        self.post_for_pvc(&namespace, &name, claim, reason, message)
            .await;
    }

    async fn post_for_pvc(
        &self,
        namespace: &str,
        name: &str,
        reference: ObjectReference,
        reason: EventReason,
        message: &str,
    ) {
        let now = Time(Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", name)),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            involved_object: reference,
            reason: Some(reason.as_str().to_string()),
            message: Some(message.to_string()),
            type_: Some(reason.event_type().to_string()),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(COMPONENT.to_string()),
                ..Default::default()
            }),
            reporting_component: Some(COMPONENT.to_string()),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &event).await {
            Ok(_) => debug!(namespace, name, reason = reason.as_str(), "event posted"),
            Err(e) => warn!(
                namespace,
                name,
                reason = reason.as_str(),
                error = %e,
                "posting event failed"
            ),
        }
    }
}
