//! Periodic reconciliation of the attachment table against cluster reality.
//!
//! Each tick cross-checks every attachment's node against the Kubernetes
//! API and clears records whose node no longer exists. The reconciler fails
//! open: a transient API error skips the volume for this tick, and nothing
//! is ever cleared because the API was merely unreachable.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::error::ErrorResponse;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::attachment::AttachmentManager;
use crate::events::{EventReason, EventRecorder};
use crate::metrics;

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Detach grace period; a volume inside it is skipped for the tick.
    pub grace_period: Duration,
}

/// The background task clearing attachments on deleted nodes.
pub struct AttachmentReconciler {
    manager: Arc<AttachmentManager>,
    client: kube::Client,
    events: EventRecorder,
    config: ReconcilerConfig,
    shutdown: Notify,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AttachmentReconciler {
    /// Creates a stopped reconciler.
    pub fn new(
        manager: Arc<AttachmentManager>,
        client: kube::Client,
        events: EventRecorder,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(AttachmentReconciler {
            manager,
            client,
            events,
            config,
            shutdown: Notify::new(),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the reconcile loop. Calling it twice replaces nothing; the
    /// second call is ignored if a worker is already running.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let this = self.clone();
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            // The first tick of a tokio interval fires immediately; the
            // loop below should wait a full period first.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.reconcile_once().await,
                    _ = this.shutdown.notified() => break,
                }
            }
            debug!("attachment reconciler stopped");
        }));
        info!(interval = ?self.config.interval, "attachment reconciler started");
    }

    /// Stops the loop and waits for the worker. Idempotent and safe to call
    /// concurrently with `start`.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub(crate) async fn reconcile_once(&self) {
        let nodes: Api<Node> = Api::all(self.client.clone());
        for (volume_id, state) in self.manager.list().await {
            match nodes.get(&state.node_id).await {
                Ok(_) => continue,
                Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {}
                Err(e) => {
                    // Fail open: this volume is skipped for the tick.
                    warn!(
                        volume_id = %volume_id,
                        node_id = %state.node_id,
                        error = %e,
                        "node lookup failed, skipping volume this tick"
                    );
                    continue;
                }
            }

            if self
                .manager
                .is_within_grace_period(&volume_id, self.config.grace_period)
                .await
            {
                debug!(volume_id = %volume_id, "within grace period, skipping this tick");
                continue;
            }

            match self.manager.untrack(&volume_id).await {
                Ok(()) => {
                    metrics::STALE_CLEARED_TOTAL.inc();
                    info!(
                        volume_id = %volume_id,
                        node_id = %state.node_id,
                        "cleared attachment for deleted node"
                    );
                    self.events
                        .post_for_volume(
                            &volume_id,
                            EventReason::StaleAttachmentCleared,
                            &format!(
                                "attachment to deleted node {} cleared",
                                state.node_id
                            ),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(volume_id = %volume_id, error = %e, "clearing stale attachment failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::test_utils::{not_found_json, pv_json, scripted_kube_service, Scripted};
    use crate::attachment::AttachmentState;
    use http::StatusCode;

    const VOLUME: &str = "pvc-ccc";

    fn node_json(name: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": name}
        })
    }

    fn server_error_json() -> serde_json::Value {
        serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "etcd is down",
            "reason": "InternalError",
            "code": 500
        })
    }

    async fn seeded_manager(client: kube::Client, node: &str) -> Arc<AttachmentManager> {
        let manager = Arc::new(AttachmentManager::new(client));
        manager.table.lock().await.insert(
            VOLUME.to_string(),
            AttachmentState {
                node_id: node.to_string(),
                attached_at: chrono::Utc::now(),
                detached_at: None,
            },
        );
        manager
    }

    fn reconciler(
        manager: Arc<AttachmentManager>,
        client: kube::Client,
        grace: Duration,
    ) -> Arc<AttachmentReconciler> {
        AttachmentReconciler::new(
            manager,
            client.clone(),
            EventRecorder::new(client),
            ReconcilerConfig {
                interval: Duration::from_secs(300),
                grace_period: grace,
            },
        )
    }

    #[tokio::test]
    async fn clears_attachment_on_deleted_node() {
        let before = metrics::STALE_CLEARED_TOTAL.get();
        let (client, _handle) = scripted_kube_service(vec![
            // Node lookup: gone
            Scripted {
                status: StatusCode::NOT_FOUND,
                body: not_found_json("node-x"),
            },
            // untrack persistence: PV gone too, tolerated
            Scripted {
                status: StatusCode::NOT_FOUND,
                body: not_found_json(VOLUME),
            },
            // event lookup: PV gone, event dropped
            Scripted {
                status: StatusCode::NOT_FOUND,
                body: not_found_json(VOLUME),
            },
        ])
        .await;
        let manager = seeded_manager(client.clone(), "node-x").await;
        let r = reconciler(manager.clone(), client, Duration::from_secs(30));

        r.reconcile_once().await;

        assert!(manager.get(VOLUME).await.is_none());
        assert_eq!(metrics::STALE_CLEARED_TOTAL.get(), before + 1);
    }

    #[tokio::test]
    async fn keeps_attachment_when_node_exists() {
        let (client, _handle) = scripted_kube_service(vec![Scripted {
            status: StatusCode::OK,
            body: node_json("node-a"),
        }])
        .await;
        let manager = seeded_manager(client.clone(), "node-a").await;
        let r = reconciler(manager.clone(), client, Duration::from_secs(30));

        r.reconcile_once().await;
        assert!(manager.get(VOLUME).await.is_some());
    }

    #[tokio::test]
    async fn fails_open_on_transient_api_errors() {
        let (client, _handle) = scripted_kube_service(vec![Scripted {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: server_error_json(),
        }])
        .await;
        let manager = seeded_manager(client.clone(), "node-a").await;
        let r = reconciler(manager.clone(), client, Duration::from_secs(30));

        r.reconcile_once().await;
        // Never cleared due to API unavailability.
        assert!(manager.get(VOLUME).await.is_some());
    }

    #[tokio::test]
    async fn respects_the_grace_period() {
        let (client, _handle) = scripted_kube_service(vec![Scripted {
            status: StatusCode::NOT_FOUND,
            body: not_found_json("node-x"),
        }])
        .await;
        let manager = seeded_manager(client.clone(), "node-x").await;
        manager
            .detach_timestamps
            .lock()
            .await
            .insert(VOLUME.to_string(), chrono::Utc::now());
        let r = reconciler(manager.clone(), client, Duration::from_secs(60));

        r.reconcile_once().await;
        assert!(manager.get(VOLUME).await.is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_concurrent_safe() {
        let (client, _handle) = scripted_kube_service(vec![]).await;
        let manager = Arc::new(AttachmentManager::new(client.clone()));
        let r = reconciler(manager, client, Duration::from_secs(30));

        r.start().await;
        r.start().await; // second start is a no-op

        let (a, b) = tokio::join!(r.stop(), r.stop());
        let _ = (a, b);
        // A third stop after the worker is gone is fine too.
        r.stop().await;
        assert!(r.worker.lock().await.is_none());
    }

    #[tokio::test]
    async fn empty_pv_annotations_do_not_confuse_restore_path() {
        // reconcile over an empty table does not touch the API
        let (client, handle) = scripted_kube_service(vec![Scripted {
            status: StatusCode::OK,
            body: pv_json("unused", serde_json::json!({})),
        }])
        .await;
        let manager = Arc::new(AttachmentManager::new(client.clone()));
        let r = reconciler(manager, client, Duration::from_secs(30));
        r.reconcile_once().await;
        drop(r);
        handle.abort();
        let _ = handle.await;
    }
}
