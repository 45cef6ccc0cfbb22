//! The attachment table: which volume is attached to which node.
//!
//! The in-memory table is authoritative. Every mutation happens under a
//! per-volume lock and is mirrored to the bound `PersistentVolume` as a
//! JSON annotation, written get-modify-replace with conflict retry. The
//! annotation is an advisory record for crash recovery and debugging; a
//! missing PV is logged and tolerated, any other API failure fails the
//! operation (fail-closed — only the reconciler fails open).
//!
//! Detaching leaves a per-volume timestamp behind. A cross-node attach that
//! lands within the grace period of that timestamp is a live-migration
//! handoff, not a conflict.

pub mod reconciler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::{Api, ListParams, PostParams};
use kube::error::ErrorResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::DriverError;

/// Annotation key the attachment record is written under.
pub const ATTACHMENT_ANNOTATION: &str = "csi.rds.mikrotik.com/attachment";

const CONFLICT_RETRIES: u32 = 4;

/// One attachment record. Serialized into the PV annotation; unknown JSON
/// fields are ignored on read so the schema can grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentState {
    /// Node the volume is attached to.
    #[serde(rename = "nodeID")]
    pub node_id: String,
    /// When the attachment was tracked.
    #[serde(rename = "attachedAt")]
    pub attached_at: DateTime<Utc>,
    /// Set when the volume detached; present only in the persisted record.
    #[serde(
        rename = "detachedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub detached_at: Option<DateTime<Utc>>,
}

/// Tracks attachments, serializes per-volume mutations, and persists the
/// table to PV annotations.
pub struct AttachmentManager {
    client: kube::Client,
    table: Mutex<HashMap<String, AttachmentState>>,
    detach_timestamps: Mutex<HashMap<String, DateTime<Utc>>>,
    volume_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AttachmentManager {
    /// A manager persisting against the given Kubernetes client.
    pub fn new(client: kube::Client) -> Self {
        AttachmentManager {
            client,
            table: Mutex::new(HashMap::new()),
            detach_timestamps: Mutex::new(HashMap::new()),
            volume_locks: Mutex::new(HashMap::new()),
        }
    }

    // Locks are created on demand and intentionally never pruned while the
    // volume can still be operated on; the map is bounded by volume count.
    async fn volume_lock(&self, volume_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.volume_locks.lock().await;
        locks
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Records that `volume_id` is attached to `node_id` and persists the
    /// record. Re-tracking the same node is idempotent; a different node is
    /// a conflict the caller must resolve first (grace-period handoff).
    #[instrument(level = "info", skip(self))]
    pub async fn track(&self, volume_id: &str, node_id: &str) -> Result<(), DriverError> {
        let lock = self.volume_lock(volume_id).await;
        let _guard = lock.lock().await;

        let state = {
            let mut table = self.table.lock().await;
            match table.get(volume_id) {
                Some(existing) if existing.node_id == node_id => existing.clone(),
                Some(existing) => {
                    return Err(DriverError::FailedPrecondition(format!(
                        "volume {} is attached to node {}",
                        volume_id, existing.node_id
                    )));
                }
                None => {
                    let state = AttachmentState {
                        node_id: node_id.to_string(),
                        attached_at: Utc::now(),
                        detached_at: None,
                    };
                    table.insert(volume_id.to_string(), state.clone());
                    state
                }
            }
        };
        self.detach_timestamps.lock().await.remove(volume_id);

        self.persist(volume_id, &state).await?;
        info!(volume_id, node_id, "attachment tracked");
        Ok(())
    }

    /// Removes the attachment, stamps the detach time, and persists the
    /// detached record. Untracking an unknown volume is success.
    #[instrument(level = "info", skip(self))]
    pub async fn untrack(&self, volume_id: &str) -> Result<(), DriverError> {
        let lock = self.volume_lock(volume_id).await;
        let _guard = lock.lock().await;

        let removed = self.table.lock().await.remove(volume_id);
        let mut state = match removed {
            Some(state) => state,
            None => {
                debug!(volume_id, "untrack of unknown volume, nothing to do");
                return Ok(());
            }
        };

        let now = Utc::now();
        self.detach_timestamps
            .lock()
            .await
            .insert(volume_id.to_string(), now);
        state.detached_at = Some(now);

        self.persist(volume_id, &state).await?;
        info!(volume_id, node_id = %state.node_id, "attachment cleared");
        Ok(())
    }

    /// The current attachment of a volume, if any.
    pub async fn get(&self, volume_id: &str) -> Option<AttachmentState> {
        self.table.lock().await.get(volume_id).cloned()
    }

    /// A snapshot of the whole table.
    pub async fn list(&self) -> HashMap<String, AttachmentState> {
        self.table.lock().await.clone()
    }

    /// Whether `volume_id` detached less than `grace` ago.
    pub async fn is_within_grace_period(&self, volume_id: &str, grace: Duration) -> bool {
        let timestamps = self.detach_timestamps.lock().await;
        match timestamps.get(volume_id) {
            Some(detached_at) => {
                let elapsed = Utc::now().signed_duration_since(*detached_at);
                match chrono::Duration::from_std(grace) {
                    Ok(grace) => elapsed < grace,
                    Err(_) => false,
                }
            }
            None => false,
        }
    }

    /// Forgets the detach timestamp, ending any grace window.
    pub async fn clear_detach_timestamp(&self, volume_id: &str) {
        self.detach_timestamps.lock().await.remove(volume_id);
    }

    /// Rebuilds the in-memory table from PV annotations. Called once at
    /// startup in controller mode so a restarted controller keeps enforcing
    /// single-node access.
    pub async fn restore(&self) -> Result<usize, DriverError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let pvs = api.list(&ListParams::default()).await.map_err(|e| {
            DriverError::Unavailable(format!("listing PersistentVolumes failed: {}", e))
        })?;

        let mut restored = 0;
        for pv in pvs.items {
            let name = match pv.metadata.name.as_deref() {
                Some(name) => name,
                None => continue,
            };
            let payload = pv
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ATTACHMENT_ANNOTATION));
            let payload = match payload {
                Some(payload) => payload,
                None => continue,
            };
            let state: AttachmentState = match serde_json::from_str(payload) {
                Ok(state) => state,
                Err(e) => {
                    warn!(volume_id = name, error = %e, "ignoring unreadable attachment annotation");
                    continue;
                }
            };
            match state.detached_at {
                None => {
                    self.table
                        .lock()
                        .await
                        .insert(name.to_string(), state);
                    restored += 1;
                }
                Some(detached_at) => {
                    self.detach_timestamps
                        .lock()
                        .await
                        .insert(name.to_string(), detached_at);
                }
            }
        }
        if restored > 0 {
            info!(restored, "attachments restored from PV annotations");
        }
        Ok(restored)
    }

    // Get-modify-replace with conflict retry. The in-memory table has
    // already been updated when this runs; a non-NotFound API failure still
    // fails the overall operation.
    async fn persist(&self, volume_id: &str, state: &AttachmentState) -> Result<(), DriverError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let payload = serde_json::to_string(state)
            .map_err(|e| DriverError::Internal(format!("serializing attachment failed: {}", e)))?;

        for attempt in 1..=CONFLICT_RETRIES {
            let mut pv = match api.get(volume_id).await {
                Ok(pv) => pv,
                Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                    warn!(volume_id, "PV gone, skipping attachment persistence");
                    return Ok(());
                }
                Err(e) => {
                    return Err(DriverError::Unavailable(format!(
                        "reading PV {} failed: {}",
                        volume_id, e
                    )))
                }
            };

            pv.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(ATTACHMENT_ANNOTATION.to_string(), payload.clone());

            match api.replace(volume_id, &PostParams::default(), &pv).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ErrorResponse { code: 409, .. }))
                    if attempt < CONFLICT_RETRIES =>
                {
                    debug!(volume_id, attempt, "annotation write conflict, retrying");
                }
                Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                    warn!(volume_id, "PV gone, skipping attachment persistence");
                    return Ok(());
                }
                Err(e) => {
                    return Err(DriverError::Unavailable(format!(
                        "updating PV {} annotation failed: {}",
                        volume_id, e
                    )))
                }
            }
        }
        Err(DriverError::Unavailable(format!(
            "annotation write for {} conflicted {} times",
            volume_id, CONFLICT_RETRIES
        )))
    }
}
